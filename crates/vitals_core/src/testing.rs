//! Transporte roteirizado para testes: um "dispositivo" alimentado por
//! channel no lugar da porta serial.

use crate::transport::{PortControl, PortHalves, Transport, TransportError};
use crate::types::PortTarget;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::io::{self, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

enum Chunk {
    Data(Vec<u8>),
    Fail(ErrorKind),
    Wake,
    Eof,
}

/// Lado "dispositivo" de uma porta roteirizada.
#[derive(Clone)]
pub(crate) struct FakeDevice {
    tx: Sender<Chunk>,
    written: Arc<Mutex<Vec<u8>>>,
    closed: Arc<AtomicBool>,
}

impl FakeDevice {
    pub fn send(&self, text: &str) {
        let _ = self.tx.send(Chunk::Data(text.as_bytes().to_vec()));
    }

    pub fn fail(&self, kind: ErrorKind) {
        let _ = self.tx.send(Chunk::Fail(kind));
    }

    pub fn eof(&self) {
        let _ = self.tx.send(Chunk::Eof);
    }

    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.written.lock().unwrap()).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

struct FakeReader {
    rx: Receiver<Chunk>,
    leftover: Vec<u8>,
}

impl Read for FakeReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.leftover.is_empty() {
            match self.rx.recv() {
                Ok(Chunk::Data(bytes)) => self.leftover = bytes,
                Ok(Chunk::Fail(kind)) => return Err(io::Error::new(kind, "scripted")),
                Ok(Chunk::Wake) => return Err(ErrorKind::Interrupted.into()),
                Ok(Chunk::Eof) | Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }
}

struct FakeWriter {
    written: Arc<Mutex<Vec<u8>>>,
}

impl Write for FakeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FakeControl {
    tx: Sender<Chunk>,
    closed: Arc<AtomicBool>,
    fail_cancel: bool,
}

impl PortControl for FakeControl {
    fn cancel_read(&self) -> Result<(), TransportError> {
        let _ = self.tx.send(Chunk::Wake);
        if self.fail_cancel {
            return Err(TransportError::Close("cancel falhou".into()));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Transporte cujo dispositivo é controlado pelo teste.
pub(crate) struct ScriptedTransport {
    available: bool,
    fail_open: bool,
    fail_cancel: bool,
    ports: Vec<PortTarget>,
    device: Mutex<Option<FakeDevice>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            available: true,
            fail_open: false,
            fail_cancel: false,
            ports: vec![PortTarget::new("sim0"), PortTarget::new("sim1")],
            device: Mutex::new(None),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    pub fn with_failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn with_failing_cancel(mut self) -> Self {
        self.fail_cancel = true;
        self
    }

    /// Dispositivo da última porta aberta.
    pub fn device(&self) -> Option<FakeDevice> {
        self.device.lock().unwrap().clone()
    }
}

impl Transport for ScriptedTransport {
    fn is_available(&self) -> bool {
        self.available
    }

    fn list_authorized(&self) -> Result<Vec<PortTarget>, TransportError> {
        if !self.available {
            return Err(TransportError::Unavailable);
        }
        Ok(self.ports.clone())
    }

    fn request(&self) -> Result<PortTarget, TransportError> {
        if !self.available {
            return Err(TransportError::Unavailable);
        }
        self.ports.first().cloned().ok_or(TransportError::RequestDismissed)
    }

    fn open(&self, target: &PortTarget, _baud_rate: u32) -> Result<PortHalves, TransportError> {
        if self.fail_open {
            return Err(TransportError::OpenFailed {
                port: target.name.clone(),
                reason: "device busy".into(),
            });
        }

        let (tx, rx) = unbounded();
        let written = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));

        *self.device.lock().unwrap() = Some(FakeDevice {
            tx: tx.clone(),
            written: written.clone(),
            closed: closed.clone(),
        });

        Ok(PortHalves {
            reader: Box::new(FakeReader {
                rx,
                leftover: Vec::new(),
            }),
            writer: Box::new(FakeWriter { written }),
            control: Box::new(FakeControl {
                tx,
                closed,
                fail_cancel: self.fail_cancel,
            }),
        })
    }
}
