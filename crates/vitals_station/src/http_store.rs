//! Cliente HTTP do backend de sessões.

use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use vitals_core::config::StoreConfig;
use vitals_core::store::{SessionStore, StoreError};
use vitals_core::types::{NewSession, Session, SessionData, SessionRecord};

pub struct HttpSessionStore {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpSessionStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| StoreError::Unreachable(format!("URL inválida {}: {e}", config.base_url)))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::Unreachable(format!("URL inválida {}", config.base_url)));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| StoreError::Unreachable(e.to_string()))?;

        Ok(Self {
            client,
            base,
            token: (!config.token.is_empty()).then(|| config.token.clone()),
        })
    }

    /// Monta `{base}/seg1/seg2…`, escapando cada segmento.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Unreachable(format!("URL inválida {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StoreError> {
        let request = match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        };
        let response = request.send().map_err(|e| StoreError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(status_error(status, body));
        }
        response.json::<T>().map_err(|e| StoreError::Decode(e.to_string()))
    }
}

/// Traduz uma resposta de erro do backend.
fn status_error(status: StatusCode, body: String) -> StoreError {
    let message = extract_message(&body).unwrap_or(body);
    match status {
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::CONFLICT => StoreError::Conflict(message),
        _ => StoreError::Rejected {
            status: status.as_u16(),
            message,
        },
    }
}

/// Backends REST costumam responder `{"message": "..."}` (às vezes lista).
fn extract_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("message")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Array(items) => Some(
            items
                .iter()
                .filter_map(serde_json::Value::as_str)
                .collect::<Vec<_>>()
                .join("; "),
        ),
        _ => None,
    }
}

impl SessionStore for HttpSessionStore {
    fn create(&self, new: &NewSession) -> Result<Session, StoreError> {
        let url = self.endpoint(&["sessions"])?;
        debug!("POST {url}");
        self.send(self.client.post(url).json(new))
    }

    fn add_data(&self, session_id: &str, data: &SessionData) -> Result<SessionRecord, StoreError> {
        let url = self.endpoint(&["sessions", session_id, "data"])?;
        self.send(self.client.post(url).json(data))
    }

    fn close(&self, session_id: &str) -> Result<Session, StoreError> {
        let url = self.endpoint(&["sessions", session_id, "close"])?;
        debug!("PATCH {url}");
        self.send(self.client.patch(url))
    }

    fn list_all(&self) -> Result<Vec<Session>, StoreError> {
        let url = self.endpoint(&["sessions"])?;
        self.send(self.client.get(url))
    }

    fn list_by_patient(&self, patient_id: &str) -> Result<Vec<Session>, StoreError> {
        let url = self.endpoint(&["sessions", "by-patient", patient_id])?;
        self.send(self.client.get(url))
    }
}
