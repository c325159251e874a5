//! Transporte sobre porta serial real (crate `serialport`).
//!
//! A porta não tem cancelamento de leitura: a thread de leitura acorda a
//! cada `read_timeout` (erro `TimedOut`) e checa a flag de cancelamento.

use serialport::{SerialPort, SerialPortInfo, SerialPortType};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};
use vitals_core::transport::{PortControl, PortHalves, Transport, TransportError};
use vitals_core::types::{PortKind, PortTarget};

/// Intervalo máximo de uma leitura bloqueante.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

pub struct SerialTransport {
    /// Porta preferida (config/CLI); vazio = primeira USB.
    preferred: String,
    read_timeout: Duration,
}

impl SerialTransport {
    pub fn new(preferred: impl Into<String>) -> Self {
        Self {
            preferred: preferred.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

fn to_target(info: &SerialPortInfo) -> PortTarget {
    let (kind, description) = match &info.port_type {
        SerialPortType::UsbPort(usb) => {
            let mut parts = Vec::new();
            if let Some(manufacturer) = &usb.manufacturer {
                parts.push(manufacturer.clone());
            }
            if let Some(product) = &usb.product {
                parts.push(product.clone());
            }
            if parts.is_empty() {
                parts.push(format!("{:04x}:{:04x}", usb.vid, usb.pid));
            }
            (PortKind::Usb, parts.join(" "))
        }
        SerialPortType::BluetoothPort => (PortKind::Bluetooth, String::new()),
        SerialPortType::PciPort => (PortKind::Pci, String::new()),
        SerialPortType::Unknown => (PortKind::Unknown, String::new()),
    };
    PortTarget {
        name: info.port_name.clone(),
        kind,
        description,
    }
}

/// Escolhe a porta: a preferida se existir, senão a primeira USB, senão a
/// primeira da lista.
fn pick(ports: &[PortTarget], preferred: &str) -> Option<PortTarget> {
    if !preferred.is_empty() {
        return ports
            .iter()
            .find(|p| p.name == preferred)
            .cloned()
            .or_else(|| Some(PortTarget::new(preferred)));
    }
    ports
        .iter()
        .find(|p| p.kind == PortKind::Usb)
        .or_else(|| ports.first())
        .cloned()
}

impl Transport for SerialTransport {
    fn list_authorized(&self) -> Result<Vec<PortTarget>, TransportError> {
        let ports = serialport::available_ports().map_err(|e| TransportError::OpenFailed {
            port: "*".into(),
            reason: e.to_string(),
        })?;
        Ok(ports.iter().map(to_target).collect())
    }

    fn request(&self) -> Result<PortTarget, TransportError> {
        let ports = self.list_authorized()?;
        let target = pick(&ports, &self.preferred).ok_or(TransportError::RequestDismissed)?;
        debug!("Porta escolhida: {target}");
        Ok(target)
    }

    fn open(&self, target: &PortTarget, baud_rate: u32) -> Result<PortHalves, TransportError> {
        let open_failed = |e: serialport::Error| TransportError::OpenFailed {
            port: target.name.clone(),
            reason: e.to_string(),
        };

        let port = serialport::new(&target.name, baud_rate)
            .timeout(self.read_timeout)
            .open()
            .map_err(open_failed)?;
        let writer = port
            .try_clone()
            .map_err(|e| TransportError::NotWritable(e.to_string()))?;
        let control = port
            .try_clone()
            .map_err(|e| TransportError::NotReadable(e.to_string()))?;

        info!("Porta {} aberta", target.name);
        Ok(PortHalves {
            reader: Box::new(port),
            writer: Box::new(writer),
            control: Box::new(SerialControl {
                port: Mutex::new(Some(control)),
            }),
        })
    }
}

/// Mantém um clone da porta só para poder descartá-lo no fechamento.
struct SerialControl {
    port: Mutex<Option<Box<dyn SerialPort>>>,
}

impl PortControl for SerialControl {
    fn cancel_read(&self) -> Result<(), TransportError> {
        // Leitura acorda sozinha pelo timeout
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        let port = self.port.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(port) = port {
            port.clear(serialport::ClearBuffer::All)
                .map_err(|e| TransportError::Close(e.to_string()))?;
        }
        Ok(())
    }
}
