use crate::types::{check_outbound, trim_line};
use crate::{LineTransport, PortInfo, PortLister, Result, TransportError, DEFAULT_BAUD};
use async_trait::async_trait;
use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort, SerialPortType};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Port-level read window. A read that sees no newline within it yields an
/// empty line; callers apply their own deadlines on top.
const READ_WINDOW: Duration = Duration::from_millis(100);

/// Newline-framed line protocol over a serial port (USB CDC on the testbed boards).
///
/// `serialport` is blocking, so every operation hops onto the blocking pool.
pub struct SerialLine {
    port_path: String,
    inner: Arc<Mutex<SerialInner>>,
}

struct SerialInner {
    path: String,
    port: Box<dyn SerialPort>,
    acc: Vec<u8>,
}

impl SerialLine {
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with(path, DEFAULT_BAUD)
    }

    pub fn open_with(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(READ_WINDOW)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(path.to_string()),
                _ => TransportError::Io(e.to_string()),
            })?;
        tracing::debug!(port = path, baud, "serial port opened");
        Ok(SerialLine {
            port_path: path.to_string(),
            inner: Arc::new(Mutex::new(SerialInner {
                path: path.to_string(),
                port,
                acc: Vec::with_capacity(64),
            })),
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SerialInner) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&mut inner.lock()))
            .await
            .map_err(|e| TransportError::Io(format!("blocking task failed: {e}")))?
    }
}

/// A vanished device shows up as one of these; anything else is plain I/O.
fn io_error(path: &str, e: std::io::Error) -> TransportError {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
            TransportError::Closed(path.to_string())
        }
        _ => TransportError::Io(e.to_string()),
    }
}

impl SerialInner {
    fn take_line(&mut self) -> Option<String> {
        let pos = self.acc.iter().position(|&b| b == b'\n')?;
        let raw = self.acc.drain(..=pos).collect::<Vec<u8>>();
        Some(trim_line(&String::from_utf8_lossy(&raw)).to_string())
    }
}

impl PortLister for SerialLine {
    fn list() -> Result<Vec<PortInfo>> {
        let mut out = Vec::new();
        for p in serialport::available_ports().map_err(|e| TransportError::Io(e.to_string()))? {
            let driver = match p.port_type {
                SerialPortType::UsbPort(_) => "usb-serial",
                _ => "serial",
            };
            out.push(PortInfo {
                name: p.port_name,
                driver: driver.to_string(),
            });
        }
        Ok(out)
    }
}

#[async_trait]
impl LineTransport for SerialLine {
    fn port_name(&self) -> &str {
        &self.port_path
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        check_outbound(line)?;
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.blocking(move |inner| {
            inner
                .port
                .write_all(&bytes)
                .and_then(|_| inner.port.flush())
                .map_err(|e| io_error(&inner.path, e))
        })
        .await
    }

    async fn read_line(&mut self) -> Result<String> {
        self.blocking(|inner| {
            if let Some(line) = inner.take_line() {
                return Ok(line);
            }
            let mut buf = [0u8; 128];
            loop {
                match inner.port.read(&mut buf) {
                    Ok(0) => return Ok(String::new()),
                    Ok(n) => {
                        inner.acc.extend_from_slice(&buf[..n]);
                        if let Some(line) = inner.take_line() {
                            return Ok(line);
                        }
                    }
                    // Partial bytes stay buffered for the next call
                    Err(e) if e.kind() == ErrorKind::TimedOut => return Ok(String::new()),
                    Err(e) => return Err(io_error(&inner.path, e)),
                }
            }
        })
        .await
    }

    async fn clear_input(&mut self) -> Result<()> {
        self.blocking(|inner| {
            inner.acc.clear();
            inner
                .port
                .clear(ClearBuffer::Input)
                .map_err(|e| TransportError::Io(e.to_string()))
        })
        .await
    }
}
