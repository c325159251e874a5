//! # Vitals Core
//!
//! Pipeline de telemetria de sinais vitais: bytes da porta serial viram
//! linhas, linhas viram leituras, leituras alimentam o histórico e são
//! enviadas (amostradas) ao backend de sessões.
//!
//! ## Módulos
//! - [`framer`] – Decodificação UTF-8 incremental e enquadramento de linhas
//! - [`parser`] – Linha → [`Reading`] (JSON ou delimitado)
//! - [`sanitize`] – Limites clínicos antes de persistir
//! - [`history`] – Buffer circular das últimas leituras
//! - [`session`] – Máquina de estados da sessão
//! - [`throttle`] – Amostragem e envio ao store
//! - [`transport`] / [`connection`] – Porta serial e thread de leitura
//! - [`store`] – Contrato do backend de sessões
//! - [`monitor`] – Contexto que amarra tudo para a UI
//! - [`config`] – Configuração unificada via TOML

pub mod types;
pub mod framer;
pub mod parser;
pub mod sanitize;
pub mod history;
pub mod session;
pub mod store;
pub mod throttle;
pub mod transport;
pub mod connection;
pub mod monitor;
pub mod config;

#[cfg(test)]
mod testing;

// Re-exports convenientes
pub use types::{PortKind, PortTarget, Reading, SanitizedReading, Session, SessionData, SessionRecord};
pub use parser::parse_line;
pub use sanitize::sanitize;
pub use session::{Phase, StateError};
pub use store::{SessionStore, StoreError};
pub use transport::{PortControl, PortHalves, Transport, TransportError};
pub use monitor::{Monitor, MonitorError, MonitorEvent, MonitorStatus};
pub use config::AppConfig;
