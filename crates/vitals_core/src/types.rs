//! Definição de tipos/structs do domínio de monitoramento.
//!
//! Os nomes serializados seguem o backend (camelCase): `oxygenSaturation`,
//! `lungCapacity`, `patientId`, `startedAt`...

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ──────────────────────────────────────────────
// Leituras
// ──────────────────────────────────────────────

/// Leitura decodificada de uma linha do dispositivo.
///
/// O `timestamp` é atribuído no momento da decodificação; o relógio do
/// dispositivo não é confiável.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    /// Pulso (bpm)
    pub pulse: f64,
    /// SpO₂ (%)
    pub oxygen_saturation: f64,
    /// Capacidade pulmonar (valor clínico, sem unidade fixa)
    pub lung_capacity: f64,
}

/// Leitura com pulso e SpO₂ limitados às faixas clínicas.
///
/// `lung_capacity` passa sem alteração.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedReading {
    pub timestamp: DateTime<Utc>,
    pub pulse: f64,
    pub oxygen_saturation: f64,
    pub lung_capacity: f64,
    /// `true` se pulso ou SpO₂ foram alterados pelo clamp.
    #[serde(skip)]
    pub clamped: bool,
}

impl SanitizedReading {
    pub fn was_clamped(&self) -> bool {
        self.clamped
    }

    /// Corpo enviado ao backend em `POST /sessions/{id}/data`.
    pub fn to_session_data(&self) -> SessionData {
        SessionData {
            pulse: self.pulse,
            oxygen_saturation: self.oxygen_saturation,
            lung_capacity: self.lung_capacity,
        }
    }
}

// ──────────────────────────────────────────────
// Sessão
// ──────────────────────────────────────────────

/// Sessão de monitoramento, mantida pelo store externo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub patient_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    /// Registros persistidos (só vem preenchido nas listagens)
    #[serde(default)]
    pub records: Vec<SessionRecord>,
}

impl Session {
    pub fn is_ended(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Registro persistido de uma leitura amostrada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub pulse: f64,
    pub oxygen_saturation: f64,
    pub lung_capacity: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Corpo de criação de sessão.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSession {
    pub patient_id: String,
}

/// Corpo de envio de dados de uma sessão.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub pulse: f64,
    pub oxygen_saturation: f64,
    pub lung_capacity: f64,
}

// ──────────────────────────────────────────────
// Transporte
// ──────────────────────────────────────────────

/// Tipo de porta reportado pelo transporte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PortKind {
    Usb,
    Bluetooth,
    Pci,
    #[default]
    Unknown,
}

/// Alvo de conexão autorizado (ex: `/dev/ttyUSB0`, `COM3`).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PortTarget {
    pub name: String,
    pub kind: PortKind,
    /// Descrição livre (fabricante/produto), vazia se desconhecida
    pub description: String,
}

impl PortTarget {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for PortTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.description.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({})", self.name, self.description)
        }
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_data_uses_backend_field_names() {
        let data = SessionData {
            pulse: 72.0,
            oxygen_saturation: 98.0,
            lung_capacity: 3.2,
        };
        let json = serde_json::to_value(data).unwrap();
        assert_eq!(json["pulse"], 72.0);
        assert_eq!(json["oxygenSaturation"], 98.0);
        assert_eq!(json["lungCapacity"], 3.2);
    }

    #[test]
    fn session_without_optional_fields_deserializes() {
        let json = r#"{"id":"s-1","startedAt":"2024-05-01T10:00:00Z"}"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.id, "s-1");
        assert!(!session.is_ended());
        assert!(session.records.is_empty());
    }

    #[test]
    fn port_target_display() {
        let mut target = PortTarget::new("/dev/ttyUSB0");
        assert_eq!(target.to_string(), "/dev/ttyUSB0");
        target.description = "CP2102".into();
        assert_eq!(target.to_string(), "/dev/ttyUSB0 (CP2102)");
    }
}
