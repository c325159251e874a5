//! Fronteira de persistência de sessões.
//!
//! O pipeline não persiste nada: fala com um store externo através de
//! [`SessionStore`]. O binário usa um cliente HTTP; testes e execuções
//! offline usam [`InMemorySessionStore`].

use crate::types::{NewSession, Session, SessionData, SessionRecord};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Erros do store de sessões.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("Servidor de sessões inacessível: {0}")]
    Unreachable(String),

    #[error("Sessão não encontrada: {0}")]
    NotFound(String),

    #[error("Operação recusada: {0}")]
    Conflict(String),

    #[error("Requisição rejeitada (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Resposta inválida do servidor: {0}")]
    Decode(String),
}

/// Contrato do store externo de sessões.
pub trait SessionStore: Send + Sync {
    fn create(&self, new: &NewSession) -> Result<Session, StoreError>;
    fn add_data(&self, session_id: &str, data: &SessionData) -> Result<SessionRecord, StoreError>;
    fn close(&self, session_id: &str) -> Result<Session, StoreError>;
    fn list_all(&self) -> Result<Vec<Session>, StoreError>;
    fn list_by_patient(&self, patient_id: &str) -> Result<Vec<Session>, StoreError>;
}

/// Ordena o histórico de um paciente: sessões da mais recente para a mais
/// antiga, registros de cada sessão em ordem cronológica.
pub fn sort_patient_history(mut sessions: Vec<Session>) -> Vec<Session> {
    sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    for session in &mut sessions {
        session.records.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
    }
    sessions
}

// ──────────────────────────────────────────────
// Store em memória
// ──────────────────────────────────────────────

/// Store em memória, thread-safe. Recusa uma segunda sessão aberta para o
/// mesmo paciente e dados em sessão encerrada.
#[derive(Debug)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    next_id: AtomicU64,
    online: AtomicBool,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            online: AtomicBool::new(true),
        }
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simula queda do backend: com `false`, toda chamada falha com
    /// [`StoreError::Unreachable`].
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Cópia de uma sessão, com registros.
    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.lock().get(session_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unreachable("store offline".into()))
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, new: &NewSession) -> Result<Session, StoreError> {
        self.check_online()?;
        if new.patient_id.trim().is_empty() {
            return Err(StoreError::Rejected {
                status: 400,
                message: "patientId obrigatório".into(),
            });
        }

        let mut sessions = self.lock();
        if sessions
            .values()
            .any(|s| s.patient_id == new.patient_id && !s.is_ended())
        {
            return Err(StoreError::Conflict(format!(
                "paciente {} já possui sessão aberta",
                new.patient_id
            )));
        }

        let session = Session {
            id: self.next_id("s"),
            patient_id: new.patient_id.clone(),
            started_at: Utc::now(),
            ended_at: None,
            records: Vec::new(),
        };
        sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    fn add_data(&self, session_id: &str, data: &SessionData) -> Result<SessionRecord, StoreError> {
        self.check_online()?;
        let record_id = self.next_id("r");
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.into()))?;
        if session.is_ended() {
            return Err(StoreError::Conflict(format!("sessão {session_id} encerrada")));
        }

        let record = SessionRecord {
            id: record_id,
            pulse: data.pulse,
            oxygen_saturation: data.oxygen_saturation,
            lung_capacity: data.lung_capacity,
            recorded_at: Utc::now(),
        };
        session.records.push(record.clone());
        Ok(record)
    }

    fn close(&self, session_id: &str) -> Result<Session, StoreError> {
        self.check_online()?;
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.into()))?;
        if session.ended_at.is_none() {
            session.ended_at = Some(Utc::now());
        }
        Ok(session.clone())
    }

    fn list_all(&self) -> Result<Vec<Session>, StoreError> {
        self.check_online()?;
        let mut all: Vec<Session> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn list_by_patient(&self, patient_id: &str) -> Result<Vec<Session>, StoreError> {
        self.check_online()?;
        let sessions = self
            .lock()
            .values()
            .filter(|s| s.patient_id == patient_id)
            .cloned()
            .collect();
        Ok(sort_patient_history(sessions))
    }
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────
