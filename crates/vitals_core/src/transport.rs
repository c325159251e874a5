//! Contrato do transporte de bytes (porta serial).
//!
//! O core não conhece a porta concreta: recebe metades de leitura e escrita
//! independentes mais um controle para cancelar/fechar.

use crate::types::PortTarget;
use std::io::{Read, Write};

/// Baud rate padrão do firmware de monitoramento.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Erros do transporte.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Porta serial não disponível neste ambiente")]
    Unavailable,

    #[error("Nenhum dispositivo escolhido")]
    RequestDismissed,

    #[error("Não foi possível abrir {port}: {reason}")]
    OpenFailed { port: String, reason: String },

    #[error("A porta não é legível: {0}")]
    NotReadable(String),

    #[error("A porta não é gravável: {0}")]
    NotWritable(String),

    #[error("Erro lendo dados do dispositivo: {0}")]
    Read(#[source] std::io::Error),

    #[error("Erro enviando comando ao dispositivo: {0}")]
    Write(#[source] std::io::Error),

    #[error("Erro fechando a porta: {0}")]
    Close(String),

    #[error("Já existe uma conexão aberta")]
    AlreadyOpen,
}

/// Controle fora de banda da porta aberta.
pub trait PortControl: Send + Sync {
    /// Desbloqueia uma leitura pendente, se o transporte suportar.
    fn cancel_read(&self) -> Result<(), TransportError>;

    /// Fecha a porta. Chamadas repetidas não devem falhar.
    fn close(&self) -> Result<(), TransportError>;
}

/// Metades independentes de uma porta aberta.
///
/// A leitura pode retornar `TimedOut`/`WouldBlock` quando não há dados;
/// `Ok(0)` indica fim do stream.
pub struct PortHalves {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub control: Box<dyn PortControl>,
}

/// Fonte de portas: listagem, pedido de nova porta e abertura.
pub trait Transport: Send + Sync {
    /// `false` quando o ambiente não tem suporte a porta serial.
    fn is_available(&self) -> bool {
        true
    }

    /// Portas já autorizadas/presentes.
    fn list_authorized(&self) -> Result<Vec<PortTarget>, TransportError>;

    /// Pede uma nova porta (em UI, exige gesto do usuário).
    fn request(&self) -> Result<PortTarget, TransportError>;

    fn open(&self, target: &PortTarget, baud_rate: u32) -> Result<PortHalves, TransportError>;
}
