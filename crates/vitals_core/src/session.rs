//! Máquina de estados da sessão de monitoramento.
//!
//! ```text
//! Idle ─► DeviceSelected ─► Connected ─► Monitoring ─► Stopped
//!              ▲                │            │
//!              └── Disconnected ◄┘            │ (conexão e monitoramento
//!                                             │  são independentes)
//! ```
//!
//! `Connected → Monitoring` tem dois gatilhos: o comando explícito de início
//! ou a primeira leitura válida vinda do dispositivo (botão físico). O que
//! ocorrer primeiro vale; o outro vira no-op.

use crate::types::{PortTarget, Session};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fase atual da sessão.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    DeviceSelected,
    Connected,
    Monitoring,
    Stopped,
    /// Conexão caiu ou foi fechada; o dispositivo continua selecionado.
    Disconnected,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Phase::Idle => "ocioso",
            Phase::DeviceSelected => "dispositivo selecionado",
            Phase::Connected => "conectado",
            Phase::Monitoring => "monitorando",
            Phase::Stopped => "finalizado",
            Phase::Disconnected => "desconectado",
        };
        f.write_str(label)
    }
}

/// Resultado de uma transição aceita.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed,
    /// Reentrada idempotente (ex: iniciar quando já monitorando).
    Unchanged,
}

/// O que fazer com uma leitura recebida.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Leitura aceita. `auto_started` indica que ela promoveu a fase.
    Accept { auto_started: bool },
    Drop,
}

/// Transições recusadas.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("Monitoramento em andamento; finalize antes")]
    MonitoringActive,

    #[error("Já existe uma sessão ativa; reinicie para criar outra")]
    SessionAlreadyHeld,

    #[error("Criação de sessão em andamento")]
    SessionPending,

    #[error("Nenhuma sessão criada")]
    NoSession,

    #[error("Nenhum dispositivo selecionado")]
    NoDevice,

    #[error("Dispositivo já conectado")]
    AlreadyConnected,

    #[error("Dispositivo não conectado")]
    NotConnected,

    #[error("Monitoramento não iniciado")]
    NotMonitoring,

    #[error("Sessão já finalizada")]
    SessionEnded,
}

/// Estado explícito da sessão: fase + dados associados.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    phase: Phase,
    session: Option<Session>,
    device: Option<PortTarget>,
    /// Criação em curso no store; reserva o lugar da sessão.
    creating: bool,
    connected: bool,
    started_from_device: bool,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    pub fn new() -> Self {
        Self {
            phase: Phase::Idle,
            session: None,
            device: None,
            creating: false,
            connected: false,
            started_from_device: false,
        }
    }

    // ── Consultas ──

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.id.as_str())
    }

    pub fn device(&self) -> Option<&PortTarget> {
        self.device.as_ref()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_monitoring(&self) -> bool {
        self.phase == Phase::Monitoring
    }

    pub fn started_from_device(&self) -> bool {
        self.started_from_device
    }

    // ── Transições ──

    /// Seleciona o alvo de conexão. Só com a porta fechada e fora de
    /// monitoramento.
    pub fn select_device(&mut self, target: PortTarget) -> Result<Transition, StateError> {
        match self.phase {
            Phase::Monitoring => return Err(StateError::MonitoringActive),
            Phase::Stopped => return Err(StateError::SessionEnded),
            Phase::Connected => return Err(StateError::AlreadyConnected),
            Phase::Idle | Phase::DeviceSelected | Phase::Disconnected => {}
        }
        if self.device.as_ref() == Some(&target) && self.phase == Phase::DeviceSelected {
            return Ok(Transition::Unchanged);
        }
        self.device = Some(target);
        self.phase = Phase::DeviceSelected;
        Ok(Transition::Changed)
    }

    /// Associa a sessão recém-criada no store e libera a reserva.
    pub fn attach_session(&mut self, session: Session) -> Result<Transition, StateError> {
        if self.session.is_some() {
            return Err(StateError::SessionAlreadyHeld);
        }
        self.creating = false;
        self.session = Some(session);
        Ok(Transition::Changed)
    }

    /// Verifica se uma sessão pode ser criada agora.
    pub fn can_create_session(&self) -> Result<(), StateError> {
        if self.session.is_some() {
            return Err(StateError::SessionAlreadyHeld);
        }
        if self.creating {
            return Err(StateError::SessionPending);
        }
        Ok(())
    }

    /// Reserva a criação antes da chamada ao store: uma segunda criação
    /// concorrente é recusada até [`attach_session`](Self::attach_session)
    /// ou [`abort_create`](Self::abort_create).
    pub fn begin_create(&mut self) -> Result<(), StateError> {
        self.can_create_session()?;
        self.creating = true;
        Ok(())
    }

    /// O store recusou a criação; libera a reserva.
    pub fn abort_create(&mut self) {
        self.creating = false;
    }

    /// Verifica as pré-condições de abertura da porta.
    pub fn can_connect(&self) -> Result<&PortTarget, StateError> {
        if self.connected {
            return Err(StateError::AlreadyConnected);
        }
        if self.session.is_none() {
            return Err(StateError::NoSession);
        }
        self.device.as_ref().ok_or(StateError::NoDevice)
    }

    /// A porta foi aberta com sucesso.
    pub fn connected(&mut self) -> Result<Transition, StateError> {
        self.can_connect()?;
        self.connected = true;
        if matches!(self.phase, Phase::DeviceSelected | Phase::Disconnected) {
            self.phase = Phase::Connected;
        }
        Ok(Transition::Changed)
    }

    /// A porta foi fechada (pelo operador ou por erro de leitura).
    ///
    /// Durante o monitoramento a fase não muda: a ingestão só para porque
    /// não chegam mais linhas.
    pub fn disconnected(&mut self) -> Transition {
        if !self.connected {
            return Transition::Unchanged;
        }
        self.connected = false;
        if self.phase == Phase::Connected {
            self.phase = Phase::Disconnected;
        }
        Transition::Changed
    }

    /// Verifica se o comando de início deve ser enviado ao dispositivo.
    /// `Ok(Unchanged)` significa que já está monitorando.
    pub fn check_start(&self) -> Result<Transition, StateError> {
        if self.session.is_none() {
            return Err(StateError::NoSession);
        }
        match self.phase {
            Phase::Monitoring => Ok(Transition::Unchanged),
            Phase::Stopped => Err(StateError::SessionEnded),
            _ if !self.connected => Err(StateError::NotConnected),
            _ => Ok(Transition::Changed),
        }
    }

    /// Início pelo operador.
    pub fn request_start(&mut self) -> Result<Transition, StateError> {
        let transition = self.check_start()?;
        if transition == Transition::Changed {
            self.phase = Phase::Monitoring;
            self.started_from_device = false;
        }
        Ok(transition)
    }

    /// Uma leitura válida chegou do dispositivo.
    pub fn on_reading(&mut self) -> Gate {
        match self.phase {
            Phase::Monitoring => Gate::Accept {
                auto_started: false,
            },
            Phase::Connected if self.session.is_some() => {
                self.phase = Phase::Monitoring;
                self.started_from_device = true;
                Gate::Accept { auto_started: true }
            }
            _ => Gate::Drop,
        }
    }

    /// Verifica se o comando de parada deve ser enviado.
    pub fn check_stop(&self) -> Result<Transition, StateError> {
        match self.phase {
            Phase::Monitoring => Ok(Transition::Changed),
            Phase::Stopped => Ok(Transition::Unchanged),
            _ => Err(StateError::NotMonitoring),
        }
    }

    /// Finaliza o monitoramento e marca a sessão como encerrada em `now`,
    /// antes da confirmação do store.
    pub fn request_stop(&mut self, now: DateTime<Utc>) -> Result<Transition, StateError> {
        let transition = self.check_stop()?;
        if transition == Transition::Changed {
            self.phase = Phase::Stopped;
            if let Some(session) = self.session.as_mut() {
                session.ended_at = Some(now);
            }
        }
        Ok(transition)
    }

    /// Substitui a sessão local pela versão confirmada pelo store.
    pub fn confirm_session(&mut self, confirmed: Session) {
        if let Some(session) = self.session.as_mut() {
            if session.id == confirmed.id {
                session.ended_at = confirmed.ended_at.or(session.ended_at);
            }
        }
    }

    /// Volta a `Idle`. Recusado durante o monitoramento.
    ///
    /// Quem chama é responsável por fechar a conexão antes.
    pub fn reset(&mut self) -> Result<Transition, StateError> {
        if self.is_monitoring() {
            return Err(StateError::MonitoringActive);
        }
        *self = Self::new();
        Ok(Transition::Changed)
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session {
            id: "s-1".into(),
            patient_id: "p-1".into(),
            started_at: Utc::now(),
            ended_at: None,
            records: Vec::new(),
        }
    }

    fn connected_machine() -> SessionMachine {
        let mut m = SessionMachine::new();
        m.attach_session(session()).unwrap();
        m.select_device(PortTarget::new("/dev/ttyUSB0")).unwrap();
        m.connected().unwrap();
        m
    }

    #[test]
    fn happy_path() {
        let mut m = SessionMachine::new();
        assert_eq!(m.phase(), Phase::Idle);
        m.attach_session(session()).unwrap();
        m.select_device(PortTarget::new("COM3")).unwrap();
        assert_eq!(m.phase(), Phase::DeviceSelected);
        m.connected().unwrap();
        assert_eq!(m.phase(), Phase::Connected);
        assert_eq!(m.request_start(), Ok(Transition::Changed));
        assert!(m.is_monitoring());
        assert!(!m.started_from_device());
        let now = Utc::now();
        assert_eq!(m.request_stop(now), Ok(Transition::Changed));
        assert_eq!(m.phase(), Phase::Stopped);
        assert!(!m.is_monitoring());
        assert_eq!(m.session().unwrap().ended_at, Some(now));
    }

    #[test]
    fn reading_in_connected_starts_from_device() {
        let mut m = connected_machine();
        assert_eq!(m.on_reading(), Gate::Accept { auto_started: true });
        assert_eq!(m.phase(), Phase::Monitoring);
        assert!(m.started_from_device());

        // Início explícito depois vira no-op e não apaga a origem
        assert_eq!(m.request_start(), Ok(Transition::Unchanged));
        assert!(m.started_from_device());
        assert_eq!(m.on_reading(), Gate::Accept { auto_started: false });
    }

    #[test]
    fn explicit_start_then_reading_is_not_device_start() {
        let mut m = connected_machine();
        m.request_start().unwrap();
        assert_eq!(m.on_reading(), Gate::Accept { auto_started: false });
        assert!(!m.started_from_device());
    }

    #[test]
    fn readings_outside_monitoring_are_dropped() {
        let mut m = SessionMachine::new();
        assert_eq!(m.on_reading(), Gate::Drop);

        let mut m = connected_machine();
        m.request_start().unwrap();
        m.request_stop(Utc::now()).unwrap();
        assert_eq!(m.on_reading(), Gate::Drop);
        assert_eq!(m.phase(), Phase::Stopped);
    }

    #[test]
    fn connect_requires_session_and_device() {
        let mut m = SessionMachine::new();
        m.select_device(PortTarget::new("COM3")).unwrap();
        assert_eq!(m.connected(), Err(StateError::NoSession));

        let mut m = SessionMachine::new();
        m.attach_session(session()).unwrap();
        assert_eq!(m.connected(), Err(StateError::NoDevice));

        let mut m = connected_machine();
        assert_eq!(m.connected(), Err(StateError::AlreadyConnected));
    }

    #[test]
    fn start_requires_connection() {
        let mut m = SessionMachine::new();
        m.attach_session(session()).unwrap();
        m.select_device(PortTarget::new("COM3")).unwrap();
        assert_eq!(m.request_start(), Err(StateError::NotConnected));
        assert_eq!(SessionMachine::new().request_start(), Err(StateError::NoSession));
    }

    #[test]
    fn disconnect_returns_to_selectable_state() {
        let mut m = connected_machine();
        assert_eq!(m.disconnected(), Transition::Changed);
        assert_eq!(m.phase(), Phase::Disconnected);
        assert_eq!(m.device().unwrap().name, "/dev/ttyUSB0");
        assert_eq!(m.disconnected(), Transition::Unchanged);

        // Reconectar a partir de Disconnected
        m.connected().unwrap();
        assert_eq!(m.phase(), Phase::Connected);
    }

    #[test]
    fn disconnect_while_monitoring_keeps_monitoring() {
        let mut m = connected_machine();
        m.request_start().unwrap();
        m.disconnected();
        assert!(m.is_monitoring());
        assert!(!m.is_connected());
        // Parar continua possível
        assert_eq!(m.request_stop(Utc::now()), Ok(Transition::Changed));
    }

    #[test]
    fn stop_is_idempotent_after_stopped() {
        let mut m = connected_machine();
        assert_eq!(m.request_stop(Utc::now()), Err(StateError::NotMonitoring));
        m.request_start().unwrap();
        m.request_stop(Utc::now()).unwrap();
        assert_eq!(m.request_stop(Utc::now()), Ok(Transition::Unchanged));
        assert_eq!(m.request_start(), Err(StateError::SessionEnded));
    }

    #[test]
    fn second_session_is_rejected() {
        let mut m = SessionMachine::new();
        m.attach_session(session()).unwrap();
        assert_eq!(m.can_create_session(), Err(StateError::SessionAlreadyHeld));
        assert_eq!(m.attach_session(session()), Err(StateError::SessionAlreadyHeld));
    }

    #[test]
    fn creation_is_reserved_until_attached_or_aborted() {
        let mut m = SessionMachine::new();
        m.begin_create().unwrap();
        assert_eq!(m.begin_create(), Err(StateError::SessionPending));
        assert_eq!(m.can_create_session(), Err(StateError::SessionPending));

        m.abort_create();
        m.begin_create().unwrap();
        m.attach_session(session()).unwrap();
        assert_eq!(m.begin_create(), Err(StateError::SessionAlreadyHeld));

        m.reset().unwrap();
        assert!(m.begin_create().is_ok());
    }

    #[test]
    fn device_can_be_selected_with_or_without_session() {
        let mut m = SessionMachine::new();
        assert_eq!(m.select_device(PortTarget::new("COM3")), Ok(Transition::Changed));
        assert_eq!(m.phase(), Phase::DeviceSelected);
        assert!(m.session().is_none());
        assert_eq!(m.select_device(PortTarget::new("COM3")), Ok(Transition::Unchanged));

        m.attach_session(session()).unwrap();
        assert_eq!(m.select_device(PortTarget::new("COM4")), Ok(Transition::Changed));
        assert_eq!(m.device().unwrap().name, "COM4");
        assert_eq!(m.phase(), Phase::DeviceSelected);
    }

    #[test]
    fn device_cannot_change_while_connected_or_monitoring() {
        let mut m = connected_machine();
        assert_eq!(
            m.select_device(PortTarget::new("COM4")),
            Err(StateError::AlreadyConnected)
        );
        m.request_start().unwrap();
        m.disconnected();
        assert_eq!(
            m.select_device(PortTarget::new("COM4")),
            Err(StateError::MonitoringActive)
        );
    }

    #[test]
    fn reset_rejected_while_monitoring() {
        let mut m = connected_machine();
        m.request_start().unwrap();
        assert_eq!(m.reset(), Err(StateError::MonitoringActive));
        assert!(m.session().is_some());
    }

    #[test]
    fn reset_clears_everything() {
        let mut m = connected_machine();
        m.on_reading();
        m.request_stop(Utc::now()).unwrap();
        m.disconnected();
        assert_eq!(m.reset(), Ok(Transition::Changed));
        assert_eq!(m.phase(), Phase::Idle);
        assert!(m.session().is_none());
        assert!(m.device().is_none());
        assert!(!m.started_from_device());
        assert!(!m.is_connected());
    }

    #[test]
    fn confirm_session_keeps_optimistic_end_if_store_omits_it() {
        let mut m = connected_machine();
        m.request_start().unwrap();
        let optimistic = Utc::now();
        m.request_stop(optimistic).unwrap();

        let mut confirmed = session();
        confirmed.ended_at = None;
        m.confirm_session(confirmed);
        assert_eq!(m.session().unwrap().ended_at, Some(optimistic));
    }
}
