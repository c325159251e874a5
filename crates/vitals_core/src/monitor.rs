//! Contexto de monitoramento: dono explícito da sessão, da conexão e do
//! histórico, com os comandos expostos à camada de UI.
//!
//! Ordem de locks: `connection` antes de `state`. A thread de leitura só
//! toma `state`, então fechar a conexão nunca pode segurar `state`.

use crate::config::{AppConfig, PipelineConfig};
use crate::connection::{ConnectionManager, LineHandler, LoopExit};
use crate::history::RingBuffer;
use crate::parser::parse_line;
use crate::sanitize::sanitize;
use crate::session::{Gate, Phase, SessionMachine, StateError, Transition};
use crate::store::{SessionStore, StoreError};
use crate::throttle::{QueuedSink, SharedThrottle, Throttle, ThrottledSink, spawn_forwarder};
use crate::transport::{Transport, TransportError};
use crate::types::{NewSession, PortTarget, Reading, Session};
use chrono::Utc;
use crossbeam_channel::{Receiver, Sender, bounded};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Linha enviada ao dispositivo para iniciar a medição.
pub const START_COMMAND: &str = "1";
/// Linha enviada ao dispositivo para parar a medição.
pub const STOP_COMMAND: &str = "0";

const EVENT_QUEUE: usize = 256;

/// Erros dos comandos; o `Display` é o texto mostrado ao operador.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Selecione um paciente")]
    MissingPatient,

    #[error("Não foi possível iniciar o envio de dados: {0}")]
    Forwarder(String),
}

/// Eventos emitidos pela thread de leitura.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Leitura válida aceita e guardada no histórico.
    ReadingAccepted(Reading),
    /// O dispositivo iniciou o monitoramento (botão físico).
    StartedFromDevice,
    /// O dispositivo encerrou o stream.
    ConnectionLost,
    /// Erro de leitura; a conexão foi considerada perdida.
    ReadFailed(String),
}

/// Fotografia do estado para a UI.
#[derive(Debug, Clone)]
pub struct MonitorStatus {
    pub phase: Phase,
    pub connected: bool,
    pub monitoring: bool,
    pub started_from_device: bool,
    pub session: Option<Session>,
    pub device: Option<PortTarget>,
    pub readings: usize,
    pub latest: Option<Reading>,
    pub last_error: Option<String>,
}

/// Estado compartilhado entre comandos e thread de leitura.
struct Pipeline {
    machine: SessionMachine,
    history: RingBuffer<Reading>,
    last_error: Option<String>,
}

fn lock(state: &Mutex<Pipeline>) -> MutexGuard<'_, Pipeline> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// ──────────────────────────────────────────────
// Ingestão (roda na thread de leitura)
// ──────────────────────────────────────────────

struct Ingest {
    state: Arc<Mutex<Pipeline>>,
    sink: ThrottledSink<QueuedSink>,
    events: Sender<MonitorEvent>,
}

impl Ingest {
    fn emit(&self, event: MonitorEvent) {
        if self.events.try_send(event).is_err() {
            trace!("Fila de eventos cheia, descartando evento");
        }
    }
}

impl LineHandler for Ingest {
    fn on_line(&mut self, line: &str) {
        let Some(reading) = parse_line(line) else {
            if !line.trim().is_empty() {
                trace!("Linha ignorada: {line:?}");
            }
            return;
        };
        let sanitized = sanitize(&reading);

        let (auto_started, session_id) = {
            let mut state = lock(&self.state);
            match state.machine.on_reading() {
                Gate::Drop => {
                    trace!("Leitura fora de monitoramento ({})", state.machine.phase());
                    return;
                }
                Gate::Accept { auto_started } => {
                    state.history.push(reading.clone());
                    (auto_started, state.machine.session_id().map(str::to_owned))
                }
            }
        };

        if auto_started {
            info!("Monitoramento iniciado pelo dispositivo");
            self.emit(MonitorEvent::StartedFromDevice);
        }
        if sanitized.was_clamped() {
            debug!(
                "Leitura limitada: pulso {} → {}, SpO₂ {} → {}",
                reading.pulse, sanitized.pulse, reading.oxygen_saturation, sanitized.oxygen_saturation
            );
        }
        self.emit(MonitorEvent::ReadingAccepted(reading));

        if let Some(id) = session_id {
            self.sink.offer(&sanitized, &id, Instant::now());
        }
    }

    fn on_exit(&mut self, exit: &LoopExit) {
        {
            let mut state = lock(&self.state);
            state.machine.disconnected();
            if let LoopExit::Failed(e) = exit {
                state.last_error = Some(e.to_string());
            }
        }
        match exit {
            LoopExit::Cancelled => {}
            LoopExit::EndOfStream => {
                warn!("Dispositivo encerrou o stream");
                self.emit(MonitorEvent::ConnectionLost);
            }
            LoopExit::Failed(e) => {
                error!("{e}");
                self.emit(MonitorEvent::ReadFailed(e.to_string()));
            }
        }
        info!(
            "Envio encerrado: {} leituras enviadas, {} falhas",
            self.sink.forwarded(),
            self.sink.failed()
        );
    }
}

// ──────────────────────────────────────────────
// Monitor
// ──────────────────────────────────────────────

/// Contexto de uma estação de monitoramento.
///
/// Todos os comandos recebem `&self`; o monitor pode ser compartilhado
/// entre a thread de console e a de eventos.
pub struct Monitor {
    transport: Arc<dyn Transport>,
    store: Arc<dyn SessionStore>,
    pipeline: PipelineConfig,
    baud_rate: u32,
    state: Arc<Mutex<Pipeline>>,
    connection: Mutex<ConnectionManager>,
    /// Gate de envio da sessão; sobrevive a reconexões, zerado no reset.
    throttle: SharedThrottle,
    /// Thread de envio da conexão atual.
    forwarder: Mutex<Option<JoinHandle<()>>>,
    events_tx: Sender<MonitorEvent>,
    events_rx: Receiver<MonitorEvent>,
}

impl Monitor {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn SessionStore>, config: &AppConfig) -> Self {
        let (events_tx, events_rx) = bounded(EVENT_QUEUE);
        Self {
            transport,
            store,
            pipeline: config.pipeline.clone(),
            baud_rate: config.serial.baud_rate,
            state: Arc::new(Mutex::new(Pipeline {
                machine: SessionMachine::new(),
                history: RingBuffer::new(config.pipeline.history_capacity),
                last_error: None,
            })),
            connection: Mutex::new(ConnectionManager::new()),
            throttle: Arc::new(Mutex::new(Throttle::new(config.pipeline.forward_interval()))),
            forwarder: Mutex::new(None),
            events_tx,
            events_rx,
        }
    }

    fn state(&self) -> MutexGuard<'_, Pipeline> {
        lock(&self.state)
    }

    fn connection(&self) -> MutexGuard<'_, ConnectionManager> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Espera a thread de envio esvaziar a fila. Só depois de fechar a
    /// conexão, que é dona do único sender.
    fn join_forwarder(&self) {
        let handle = self
            .forwarder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Thread de envio terminou com pânico");
            }
        }
    }

    /// Registra o erro para a UI e o devolve.
    fn fail<E: Into<MonitorError>>(&self, err: E) -> MonitorError {
        let err = err.into();
        self.state().last_error = Some(err.to_string());
        err
    }

    // ── Consultas ──

    pub fn phase(&self) -> Phase {
        self.state().machine.phase()
    }

    pub fn is_connected(&self) -> bool {
        self.state().machine.is_connected()
    }

    pub fn is_monitoring(&self) -> bool {
        self.state().machine.is_monitoring()
    }

    pub fn started_from_device(&self) -> bool {
        self.state().machine.started_from_device()
    }

    pub fn session(&self) -> Option<Session> {
        self.state().machine.session().cloned()
    }

    pub fn device(&self) -> Option<PortTarget> {
        self.state().machine.device().cloned()
    }

    /// Cópia do histórico, do mais antigo ao mais recente.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.state().history.snapshot()
    }

    pub fn latest(&self) -> Option<Reading> {
        self.state().history.latest().cloned()
    }

    pub fn recent(&self, n: usize) -> Vec<Reading> {
        self.state().history.recent(n)
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.state();
        MonitorStatus {
            phase: state.machine.phase(),
            connected: state.machine.is_connected(),
            monitoring: state.machine.is_monitoring(),
            started_from_device: state.machine.started_from_device(),
            session: state.machine.session().cloned(),
            device: state.machine.device().cloned(),
            readings: state.history.len(),
            latest: state.history.latest().cloned(),
            last_error: state.last_error.clone(),
        }
    }

    /// Channel de eventos. Os receivers competem entre si: use um só.
    pub fn subscribe(&self) -> Receiver<MonitorEvent> {
        self.events_rx.clone()
    }

    // ── Comandos ──

    /// Portas já autorizadas.
    pub fn list_devices(&self) -> Result<Vec<PortTarget>, MonitorError> {
        if !self.transport.is_available() {
            return Err(self.fail(TransportError::Unavailable));
        }
        self.transport.list_authorized().map_err(|e| self.fail(e))
    }

    /// Pede uma nova porta ao transporte e a seleciona.
    pub fn request_device(&self) -> Result<PortTarget, MonitorError> {
        if !self.transport.is_available() {
            return Err(self.fail(TransportError::Unavailable));
        }
        let target = self.transport.request().map_err(|e| self.fail(e))?;
        self.select_device(target.clone())?;
        Ok(target)
    }

    pub fn select_device(&self, target: PortTarget) -> Result<(), MonitorError> {
        let mut state = self.state();
        match state.machine.select_device(target) {
            Ok(_) => {
                state.last_error = None;
                Ok(())
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
                Err(e.into())
            }
        }
    }

    /// Cria a sessão no store. Recusado se já houver uma sessão ou outra
    /// criação em andamento.
    pub fn create_session(&self, patient_id: &str) -> Result<Session, MonitorError> {
        let patient_id = patient_id.trim();
        if patient_id.is_empty() {
            return Err(self.fail(MonitorError::MissingPatient));
        }
        let reserved = self.state().machine.begin_create();
        reserved.map_err(|e| self.fail(e))?;

        let created = self.store.create(&NewSession {
            patient_id: patient_id.to_owned(),
        });

        let mut state = self.state();
        let session = match created {
            Ok(session) => session,
            Err(e) => {
                state.machine.abort_create();
                state.last_error = Some(e.to_string());
                return Err(e.into());
            }
        };
        state.machine.attach_session(session.clone())?;
        state.last_error = None;
        info!("Sessão {} criada para paciente {}", session.id, patient_id);
        Ok(session)
    }

    /// Abre a porta selecionada e inicia a leitura.
    pub fn connect(&self) -> Result<(), MonitorError> {
        let mut connection = self.connection();
        // Conexão que caiu sozinha: a thread está saindo, só falta recolher
        if connection.is_open() && !self.state().machine.is_connected() {
            connection.close();
            self.join_forwarder();
        }

        let mut state = self.state();
        let checked = state.machine.can_connect().cloned();
        let target = match checked {
            Ok(target) => target,
            Err(e) => {
                state.last_error = Some(e.to_string());
                return Err(e.into());
            }
        };

        let (sink, forwarder) = spawn_forwarder(self.store.clone(), self.pipeline.forward_queue)
            .map_err(|e| MonitorError::Forwarder(e.to_string()))?;
        let handler = Ingest {
            state: self.state.clone(),
            sink: ThrottledSink::with_throttle(sink, self.throttle.clone()),
            events: self.events_tx.clone(),
        };

        // A thread de leitura espera `state` ser liberado: nenhuma leitura é
        // processada antes de a fase virar Connected.
        if let Err(e) = connection.open(&*self.transport, &target, self.baud_rate, handler) {
            // O handler já foi descartado: a thread de envio sai sozinha
            if forwarder.join().is_err() {
                warn!("Thread de envio terminou com pânico");
            }
            state.last_error = Some(e.to_string());
            return Err(e.into());
        }
        *self.forwarder.lock().unwrap_or_else(PoisonError::into_inner) = Some(forwarder);
        state.machine.connected()?;
        state.last_error = None;
        Ok(())
    }

    /// Fecha a porta e espera as leituras já amostradas chegarem ao store.
    /// Não interrompe o monitoramento.
    pub fn disconnect(&self) -> Result<(), MonitorError> {
        let closed = {
            let mut connection = self.connection();
            let closed = connection.close();
            self.join_forwarder();
            closed
        };
        let transition = self.state().machine.disconnected();
        if closed || transition == Transition::Changed {
            info!("Desconectado");
        }
        Ok(())
    }

    /// Envia o comando de início. No-op se já monitorando.
    pub fn start_monitoring(&self) -> Result<(), MonitorError> {
        let connection = self.connection();
        let mut state = self.state();

        match state.machine.check_start() {
            Ok(Transition::Unchanged) => return Ok(()),
            Ok(Transition::Changed) => {}
            Err(e) => {
                state.last_error = Some(e.to_string());
                return Err(e.into());
            }
        }
        if let Err(e) = connection.write_line(START_COMMAND) {
            state.last_error = Some(e.to_string());
            return Err(e.into());
        }
        state.machine.request_start()?;
        state.last_error = None;
        info!("Monitoramento iniciado");
        Ok(())
    }

    /// Envia o comando de parada e encerra a sessão.
    ///
    /// A sessão é marcada como encerrada antes da resposta do store; uma
    /// falha no fechamento remoto é registrada e ignorada.
    pub fn stop_monitoring(&self) -> Result<(), MonitorError> {
        let session_id = {
            let connection = self.connection();
            let mut state = self.state();

            match state.machine.check_stop() {
                Ok(Transition::Unchanged) => return Ok(()),
                Ok(Transition::Changed) => {}
                Err(e) => {
                    state.last_error = Some(e.to_string());
                    return Err(e.into());
                }
            }

            // Conexão que caiu sozinha ainda tem handle até ser recolhida
            if state.machine.is_connected() && connection.is_open() {
                if let Err(e) = connection.write_line(STOP_COMMAND) {
                    state.last_error = Some(e.to_string());
                    return Err(e.into());
                }
            } else {
                warn!("Porta fechada: comando de parada não enviado");
            }

            state.machine.request_stop(Utc::now())?;
            state.last_error = None;
            state.machine.session_id().map(str::to_owned)
        };
        info!("Monitoramento finalizado");

        if let Some(id) = session_id {
            match self.store.close(&id) {
                Ok(confirmed) => self.state().machine.confirm_session(confirmed),
                Err(e) => warn!("Falha ao encerrar sessão {id} no servidor: {e}"),
            }
        }
        Ok(())
    }

    /// Volta ao estado inicial: fecha a porta, limpa histórico, sessão e
    /// dispositivo. Recusado durante o monitoramento.
    pub fn reset(&self) -> Result<(), MonitorError> {
        if self.is_monitoring() {
            return Err(self.fail(StateError::MonitoringActive));
        }
        self.disconnect()?;

        let mut state = self.state();
        state.machine.reset()?;
        state.history.clear();
        self.throttle.lock().unwrap_or_else(PoisonError::into_inner).clear();
        state.last_error = None;
        info!("Monitor reiniciado");
        Ok(())
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
