//! Envio amostrado de leituras para o store de sessões.
//!
//! O histórico local recebe todas as leituras; o backend recebe no máximo uma
//! por intervalo (1 Hz por padrão). Falhas de envio são registradas e
//! descartadas: sem retry, sem bloquear a leitura serial.

use crate::store::{SessionStore, StoreError};
use crate::types::{SanitizedReading, SessionData};
use crossbeam_channel::{Sender, TrySendError, bounded};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Intervalo padrão entre envios.
pub const DEFAULT_FORWARD_INTERVAL: Duration = Duration::from_millis(1000);

/// Erros de envio. Nunca chegam ao loop de leitura.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Fila de envio cheia, leitura descartada")]
    QueueFull,

    #[error("Forwarder encerrado")]
    Disconnected,
}

/// Destino das leituras amostradas.
pub trait ReadingSink: Send {
    fn forward(&self, session_id: &str, data: &SessionData) -> Result<(), SinkError>;
}

// ──────────────────────────────────────────────
// Gate de tempo
// ──────────────────────────────────────────────

/// Gate monotônico: libera no máximo uma passagem por `interval`.
#[derive(Debug, Clone)]
pub struct Throttle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    /// `true` se `now` está a pelo menos `interval` do último envio.
    /// A primeira chamada sempre passa.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    pub fn last_sent(&self) -> Option<Instant> {
        self.last_sent
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Esquece o último envio: a próxima passagem é liberada.
    pub fn clear(&mut self) {
        self.last_sent = None;
    }
}

/// Gate compartilhado entre as conexões sucessivas de uma sessão.
pub type SharedThrottle = Arc<Mutex<Throttle>>;

// ──────────────────────────────────────────────
// Sink com throttle
// ──────────────────────────────────────────────

/// Resultado de oferecer uma leitura ao sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Forwarded,
    Throttled,
    /// Envio tentado e falhou; a falha já foi registrada.
    Failed,
}

/// Aplica o [`Throttle`] antes de repassar ao sink interno.
///
/// O sink pertence ao loop de leitura; o gate pode ser compartilhado para
/// sobreviver a uma reconexão.
pub struct ThrottledSink<S> {
    sink: S,
    throttle: SharedThrottle,
    forwarded: u64,
    failed: u64,
}

impl<S: ReadingSink> ThrottledSink<S> {
    pub fn new(sink: S, interval: Duration) -> Self {
        Self::with_throttle(sink, Arc::new(Mutex::new(Throttle::new(interval))))
    }

    /// Usa um gate já existente (ex: o do monitor, entre reconexões).
    pub fn with_throttle(sink: S, throttle: SharedThrottle) -> Self {
        Self {
            sink,
            throttle,
            forwarded: 0,
            failed: 0,
        }
    }

    pub fn offer(&mut self, reading: &SanitizedReading, session_id: &str, now: Instant) -> Offer {
        // O slot é consumido antes do envio: uma falha não gera nova tentativa
        let acquired = self
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_acquire(now);
        if !acquired {
            return Offer::Throttled;
        }

        match self.sink.forward(session_id, &reading.to_session_data()) {
            Ok(()) => {
                self.forwarded += 1;
                Offer::Forwarded
            }
            Err(e) => {
                self.failed += 1;
                warn!("Envio da leitura falhou (descartada): {e}");
                Offer::Failed
            }
        }
    }

    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    pub fn failed(&self) -> u64 {
        self.failed
    }
}

// ──────────────────────────────────────────────
// Sinks concretos
// ──────────────────────────────────────────────

/// Envia direto ao store, na thread de quem chama.
pub struct StoreSink {
    store: Arc<dyn SessionStore>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

impl ReadingSink for StoreSink {
    fn forward(&self, session_id: &str, data: &SessionData) -> Result<(), SinkError> {
        self.store.add_data(session_id, data)?;
        Ok(())
    }
}

/// Leitura amostrada aguardando envio.
#[derive(Debug, Clone)]
pub struct ForwardJob {
    pub session_id: String,
    pub data: SessionData,
}

/// Entrega leituras a uma thread de envio dedicada via channel limitado.
///
/// `try_send` nunca bloqueia: se o backend está lento e a fila enche, a
/// leitura é descartada.
#[derive(Clone)]
pub struct QueuedSink {
    tx: Sender<ForwardJob>,
}

impl ReadingSink for QueuedSink {
    fn forward(&self, session_id: &str, data: &SessionData) -> Result<(), SinkError> {
        let job = ForwardJob {
            session_id: session_id.to_owned(),
            data: *data,
        };
        self.tx.try_send(job).map_err(|e| match e {
            TrySendError::Full(_) => SinkError::QueueFull,
            TrySendError::Disconnected(_) => SinkError::Disconnected,
        })
    }
}

/// Inicia a thread de envio. Ela termina quando todos os [`QueuedSink`]
/// forem descartados.
pub fn spawn_forwarder(
    store: Arc<dyn SessionStore>,
    queue_size: usize,
) -> std::io::Result<(QueuedSink, JoinHandle<()>)> {
    let (tx, rx) = bounded::<ForwardJob>(queue_size.max(1));

    let handle = std::thread::Builder::new()
        .name("session-forwarder".into())
        .spawn(move || {
            for job in rx {
                match store.add_data(&job.session_id, &job.data) {
                    Ok(record) => debug!("Leitura persistida: {} (sessão {})", record.id, job.session_id),
                    // Ruído de rede aceitável
                    Err(e) => warn!("Falha ao persistir leitura da sessão {}: {e}", job.session_id),
                }
            }
            info!("Forwarder encerrado");
        })?;

    Ok((QueuedSink { tx }, handle))
}

// ──────────────────────────────────────────────
// Testes
// ──────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySessionStore;
    use crate::types::NewSession;
    use chrono::Utc;

    /// Sink que registra o instante de cada envio.
    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Arc<Mutex<Vec<(String, SessionData)>>>,
    }

    impl ReadingSink for RecordingSink {
        fn forward(&self, session_id: &str, data: &SessionData) -> Result<(), SinkError> {
            self.calls.lock().unwrap().push((session_id.to_owned(), *data));
            Ok(())
        }
    }

    struct FailingSink;

    impl ReadingSink for FailingSink {
        fn forward(&self, _: &str, _: &SessionData) -> Result<(), SinkError> {
            Err(StoreError::Unreachable("connection refused".into()).into())
        }
    }

    fn reading(pulse: f64) -> SanitizedReading {
        SanitizedReading {
            timestamp: Utc::now(),
            pulse,
            oxygen_saturation: 97.0,
            lung_capacity: 3.1,
            clamped: false,
        }
    }

    #[test]
    fn first_acquire_always_passes() {
        let mut throttle = Throttle::new(Duration::from_secs(1));
        assert!(throttle.try_acquire(Instant::now()));
    }

    #[test]
    fn ten_ms_readings_for_five_seconds_forward_at_most_five() {
        let sink = RecordingSink::default();
        let mut throttled = ThrottledSink::new(sink.clone(), DEFAULT_FORWARD_INTERVAL);
        let t0 = Instant::now();

        let mut sent_at = Vec::new();
        for i in 0..500u64 {
            let now = t0 + Duration::from_millis(i * 10);
            if throttled.offer(&reading(70.0), "s-1", now) == Offer::Forwarded {
                sent_at.push(now);
            }
        }

        assert!(sent_at.len() <= 5, "enviados: {}", sent_at.len());
        assert_eq!(sink.calls.lock().unwrap().len(), sent_at.len());
        for pair in sent_at.windows(2) {
            assert!(pair[1] - pair[0] >= DEFAULT_FORWARD_INTERVAL);
        }
        assert_eq!(throttled.forwarded(), sent_at.len() as u64);
    }

    #[test]
    fn forwards_sanitized_values_with_session_id() {
        let sink = RecordingSink::default();
        let mut throttled = ThrottledSink::new(sink.clone(), DEFAULT_FORWARD_INTERVAL);
        throttled.offer(&reading(88.0), "s-42", Instant::now());

        let calls = sink.calls.lock().unwrap();
        assert_eq!(calls[0].0, "s-42");
        assert_eq!(calls[0].1.pulse, 88.0);
        assert_eq!(calls[0].1.lung_capacity, 3.1);
    }

    #[test]
    fn failures_are_swallowed_and_not_retried() {
        let mut throttled = ThrottledSink::new(FailingSink, DEFAULT_FORWARD_INTERVAL);
        let t0 = Instant::now();

        assert_eq!(throttled.offer(&reading(70.0), "s-1", t0), Offer::Failed);
        // Dentro do mesmo intervalo: sem nova tentativa
        assert_eq!(
            throttled.offer(&reading(70.0), "s-1", t0 + Duration::from_millis(10)),
            Offer::Throttled
        );
        assert_eq!(
            throttled.offer(&reading(70.0), "s-1", t0 + Duration::from_millis(1000)),
            Offer::Failed
        );
        assert_eq!(throttled.failed(), 2);
        assert_eq!(throttled.forwarded(), 0);
    }

    #[test]
    fn shared_gate_survives_a_new_sink() {
        let gate: SharedThrottle = Arc::new(Mutex::new(Throttle::new(DEFAULT_FORWARD_INTERVAL)));
        let sink = RecordingSink::default();
        let t0 = Instant::now();

        let mut first = ThrottledSink::with_throttle(sink.clone(), gate.clone());
        assert_eq!(first.offer(&reading(70.0), "s-1", t0), Offer::Forwarded);
        drop(first);

        // Nova conexão 100ms depois: mesmo gate, continua bloqueado
        let mut second = ThrottledSink::with_throttle(sink.clone(), gate.clone());
        let later = t0 + Duration::from_millis(100);
        assert_eq!(second.offer(&reading(71.0), "s-1", later), Offer::Throttled);
        assert_eq!(
            second.offer(&reading(72.0), "s-1", t0 + DEFAULT_FORWARD_INTERVAL),
            Offer::Forwarded
        );

        gate.lock().unwrap().clear();
        assert_eq!(
            second.offer(&reading(73.0), "s-1", t0 + DEFAULT_FORWARD_INTERVAL + Duration::from_millis(1)),
            Offer::Forwarded
        );
        assert_eq!(sink.calls.lock().unwrap().len(), 3);
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let (tx, _rx) = bounded(1);
        let sink = QueuedSink { tx };
        let data = reading(70.0).to_session_data();
        assert!(sink.forward("s-1", &data).is_ok());
        assert!(matches!(sink.forward("s-1", &data), Err(SinkError::QueueFull)));
    }

    #[test]
    fn closed_queue_reports_disconnected() {
        let (tx, rx) = bounded(1);
        drop(rx);
        let sink = QueuedSink { tx };
        assert!(matches!(
            sink.forward("s-1", &reading(70.0).to_session_data()),
            Err(SinkError::Disconnected)
        ));
    }

    #[test]
    fn forwarder_thread_persists_and_exits() {
        let store = Arc::new(InMemorySessionStore::new());
        let session = store
            .create(&NewSession {
                patient_id: "p-1".into(),
            })
            .unwrap();

        let (sink, handle) = spawn_forwarder(store.clone(), 8).unwrap();
        sink.forward(&session.id, &reading(71.0).to_session_data()).unwrap();
        sink.forward(&session.id, &reading(72.0).to_session_data()).unwrap();
        drop(sink);
        handle.join().unwrap();

        let stored = store.get(&session.id).unwrap();
        let pulses: Vec<f64> = stored.records.iter().map(|r| r.pulse).collect();
        assert_eq!(pulses, vec![71.0, 72.0]);
    }

    #[test]
    fn store_sink_surfaces_store_errors() {
        let store = Arc::new(InMemorySessionStore::new());
        let sink = StoreSink::new(store);
        assert!(matches!(
            sink.forward("missing", &reading(70.0).to_session_data()),
            Err(SinkError::Store(StoreError::NotFound(_)))
        ));
    }
}
