//! Ciclo de vida da conexão: abertura, thread de leitura e fechamento.
//!
//! No máximo uma [`ConnectionHandle`] existe por vez. A thread de leitura é
//! cancelada de forma cooperativa: a flag é checada antes e depois de cada
//! leitura bloqueante, e [`PortControl::cancel_read`] desbloqueia uma
//! leitura já suspensa.

use crate::framer::{LineFramer, Utf8Decoder};
use crate::transport::{PortControl, PortHalves, Transport, TransportError};
use crate::types::PortTarget;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Tamanho do buffer de leitura da porta.
const READ_BUFFER_SIZE: usize = 1024;

/// Como o loop de leitura terminou.
#[derive(Debug)]
pub enum LoopExit {
    /// Cancelado por `close()`.
    Cancelled,
    /// O transporte sinalizou fim do stream.
    EndOfStream,
    /// Erro de leitura; a conexão é tratada como perdida.
    Failed(TransportError),
}

/// Recebe as linhas produzidas pela thread de leitura.
pub trait LineHandler: Send + 'static {
    fn on_line(&mut self, line: &str);

    /// Chamado uma única vez, na própria thread de leitura, ao sair do loop.
    fn on_exit(&mut self, exit: &LoopExit);
}

// ──────────────────────────────────────────────
// Handle
// ──────────────────────────────────────────────

/// Posse exclusiva de uma porta aberta.
pub struct ConnectionHandle {
    target: PortTarget,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    control: Box<dyn PortControl>,
    cancel: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

impl ConnectionHandle {
    fn start<H: LineHandler>(
        target: PortTarget,
        halves: PortHalves,
        handler: H,
    ) -> Result<Self, TransportError> {
        let PortHalves {
            reader,
            writer,
            control,
        } = halves;
        let cancel = Arc::new(AtomicBool::new(false));

        let flag = cancel.clone();
        let spawned = std::thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || read_loop(reader, &flag, handler));

        let reader = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                // Sem thread não há conexão: não deixa a porta aberta
                if let Err(close_err) = control.close() {
                    warn!("Falha ao fechar porta após erro: {close_err}");
                }
                return Err(TransportError::NotReadable(e.to_string()));
            }
        };

        Ok(Self {
            target,
            writer: Mutex::new(Some(writer)),
            control,
            cancel,
            reader: Some(reader),
            closed: false,
        })
    }

    pub fn target(&self) -> &PortTarget {
        &self.target
    }

    /// `true` depois que a thread de leitura saiu do loop.
    pub fn is_finished(&self) -> bool {
        self.reader.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Escreve uma linha, adicionando `\n` se faltar.
    pub fn write_line(&self, line: &str) -> Result<(), TransportError> {
        let mut guard = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let writer = guard
            .as_mut()
            .ok_or_else(|| TransportError::NotWritable("conexão fechada".into()))?;

        let mut payload = line.to_owned();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }
        writer.write_all(payload.as_bytes()).map_err(TransportError::Write)?;
        writer.flush().map_err(TransportError::Write)
    }

    /// Fecha tudo, em ordem: writer → leitura pendente → porta → thread.
    ///
    /// Cada passo é independente: uma falha é registrada e o próximo passo
    /// roda mesmo assim. Chamadas repetidas não fazem nada.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let writer = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.flush() {
                warn!("Falha ao liberar writer: {e}");
            }
        }

        self.cancel.store(true, Ordering::SeqCst);
        if let Err(e) = self.control.cancel_read() {
            warn!("Falha ao cancelar leitura pendente: {e}");
        }

        if let Err(e) = self.control.close() {
            warn!("Falha ao fechar porta {}: {e}", self.target.name);
        }

        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("Thread de leitura terminou com pânico");
            }
        }

        info!("Conexão com {} encerrada", self.target.name);
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

// ──────────────────────────────────────────────
// Loop de leitura
// ──────────────────────────────────────────────

fn read_loop<H: LineHandler>(mut reader: Box<dyn Read + Send>, cancel: &AtomicBool, mut handler: H) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let mut decoder = Utf8Decoder::new();
    let mut framer = LineFramer::new();

    let exit = loop {
        if cancel.load(Ordering::SeqCst) {
            break LoopExit::Cancelled;
        }
        let result = reader.read(&mut buf);
        // Um erro depois do cancelamento é consequência do close(), não falha
        if cancel.load(Ordering::SeqCst) {
            break LoopExit::Cancelled;
        }

        match result {
            Ok(0) => break LoopExit::EndOfStream,
            Ok(n) => {
                let text = decoder.decode(&buf[..n]);
                for line in framer.push(&text) {
                    handler.on_line(&line);
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) => {}
            Err(e) => break LoopExit::Failed(TransportError::Read(e)),
        }
    };

    if matches!(exit, LoopExit::EndOfStream) {
        let rest = decoder.finish();
        let mut lines = framer.push(&rest);
        lines.extend(framer.finish());
        for line in lines {
            handler.on_line(&line);
        }
    }

    debug!("Loop de leitura encerrado: {exit:?}");
    handler.on_exit(&exit);
}

// ──────────────────────────────────────────────
// Gerenciador
// ──────────────────────────────────────────────

/// Dono da única conexão permitida.
#[derive(Default)]
pub struct ConnectionManager {
    handle: Option<ConnectionHandle>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Abre a porta e inicia a thread de leitura.
    ///
    /// Uma conexão cuja thread já terminou (stream encerrado ou erro) é
    /// recolhida antes; uma conexão viva impede a abertura.
    pub fn open<H: LineHandler>(
        &mut self,
        transport: &dyn Transport,
        target: &PortTarget,
        baud_rate: u32,
        handler: H,
    ) -> Result<(), TransportError> {
        self.reap_finished();
        if self.handle.is_some() {
            return Err(TransportError::AlreadyOpen);
        }
        if !transport.is_available() {
            return Err(TransportError::Unavailable);
        }

        info!("Abrindo {} a {} baud", target.name, baud_rate);
        let halves = transport.open(target, baud_rate)?;
        self.handle = Some(ConnectionHandle::start(target.clone(), halves, handler)?);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    pub fn write_line(&self, line: &str) -> Result<(), TransportError> {
        self.handle
            .as_ref()
            .ok_or_else(|| TransportError::NotWritable("conexão fechada".into()))?
            .write_line(line)
    }

    /// Fecha a conexão atual. Retorna `false` se não havia conexão.
    pub fn close(&mut self) -> bool {
        match self.handle.take() {
            Some(mut handle) => {
                handle.close();
                true
            }
            None => false,
        }
    }

    fn reap_finished(&mut self) {
        if self.handle.as_ref().is_some_and(ConnectionHandle::is_finished) {
            debug!("Recolhendo conexão encerrada");
            self.close();
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
