use std::io::{self, Read, Write};
use std::time::Duration;

use serde::Serialize;
use serialport::SerialPort;
use thiserror::Error;
use tracing::{debug, warn};

/// Read timeout applied to the port; the device answers a read request
/// well within this window or not at all.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Failure to establish the serial connection.
///
/// Never retried automatically — the caller decides whether to attempt a
/// new connect.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("serial device {0} not found")]
    DeviceNotFound(String),
    #[error("permission denied opening {0}")]
    PermissionDenied(String),
    #[error("failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
}

/// One entry from the system serial port enumeration
#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub port: String,
    pub description: String,
}

/// Raw line-oriented serial connection to the greenhouse controller.
///
/// Owns the underlying port handle; `close` drops it and is safe to call
/// any number of times.
pub struct SerialLink {
    port: Option<Box<dyn SerialPort>>,
    name: String,
}

impl SerialLink {
    /// Open the serial device at the given baud rate.
    ///
    /// The microcontroller resets when the port opens; callers must wait
    /// out a settle delay before the first exchange.
    pub fn open(port_name: &str, baud_rate: u32) -> Result<SerialLink, ConnectError> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| classify_open_error(port_name, e))?;
        debug!("Opened serial port {} at {} baud", port_name, baud_rate);
        Ok(SerialLink {
            port: Some(port),
            name: port_name.to_string(),
        })
    }

    /// Write the given bytes followed by a newline.
    pub fn write_line(&mut self, bytes: &[u8]) -> io::Result<()> {
        let port = self.port.as_mut().ok_or_else(closed_error)?;
        port.write_all(bytes)?;
        port.write_all(b"\n")?;
        port.flush()
    }

    /// Read one newline-terminated line if the device has sent anything.
    ///
    /// Returns Ok(None) when no bytes are pending, so the poll loop can
    /// skip a cycle without blocking on a silent device. Invalid UTF-8 is
    /// replaced rather than treated as an I/O failure; the caller's parse
    /// step decides what to do with the text.
    pub fn read_available_line(&mut self) -> io::Result<Option<String>> {
        let port = self.port.as_mut().ok_or_else(closed_error)?;
        let pending = port.bytes_to_read().map_err(io::Error::from)?;
        if pending == 0 {
            return Ok(None);
        }
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    if byte[0] == b'\n' {
                        break;
                    }
                    buf.push(byte[0]);
                }
                // A timeout mid-line means the device stopped talking;
                // hand back what arrived and let the parser judge it.
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e),
            }
        }
        Ok(Some(String::from_utf8_lossy(&buf).trim().to_string()))
    }

    /// Drop the port handle. Idempotent.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.name);
        }
    }

    #[allow(dead_code)]
    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "serial link is closed")
}

fn classify_open_error(port_name: &str, err: serialport::Error) -> ConnectError {
    match err.kind() {
        serialport::ErrorKind::NoDevice => ConnectError::DeviceNotFound(port_name.to_string()),
        serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
            ConnectError::DeviceNotFound(port_name.to_string())
        }
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => {
            ConnectError::PermissionDenied(port_name.to_string())
        }
        _ => ConnectError::Open {
            port: port_name.to_string(),
            source: err,
        },
    }
}

/// Enumerate the serial ports visible to the system.
///
/// Enumeration failure is logged and reported as an empty list; the web
/// layer has nothing useful to do with the error itself.
pub fn available_ports() -> Vec<PortInfo> {
    match serialport::available_ports() {
        Ok(ports) => ports
            .into_iter()
            .map(|p| PortInfo {
                port: p.port_name,
                description: describe_port_type(&p.port_type),
            })
            .collect(),
        Err(e) => {
            warn!("Failed to enumerate serial ports: {}", e);
            Vec::new()
        }
    }
}

fn describe_port_type(port_type: &serialport::SerialPortType) -> String {
    match port_type {
        serialport::SerialPortType::UsbPort(info) => info
            .product
            .clone()
            .unwrap_or_else(|| "USB serial device".to_string()),
        serialport::SerialPortType::PciPort => "PCI serial port".to_string(),
        serialport::SerialPortType::BluetoothPort => "Bluetooth serial port".to_string(),
        serialport::SerialPortType::Unknown => "Unknown serial port".to_string(),
    }
}
