use crate::{PortInfo, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// A line-oriented, newline-terminated channel to one device port.
///
/// Implementations must not add framing beyond the newline. Deadlines are
/// applied by callers; a backend only has to return an empty string when a read
/// turns up no complete line within its own polling window.
#[async_trait]
pub trait LineTransport: Send {
    /// Name of the underlying port (e.g. `/dev/ttyUSB0`).
    fn port_name(&self) -> &str;

    /// Write one line; the backend appends the terminator.
    async fn write_line(&mut self, line: &str) -> Result<()>;

    /// Read one line with the terminator stripped. Empty when nothing arrived.
    async fn read_line(&mut self) -> Result<String>;

    /// Drop any buffered inbound bytes.
    async fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Transport handle shared between discovery and the per-device queue.
pub type SharedLine = Arc<tokio::sync::Mutex<Box<dyn LineTransport>>>;

/// Enumerate ports for backends that can list them.
pub trait PortLister {
    fn list() -> Result<Vec<PortInfo>>;
}
