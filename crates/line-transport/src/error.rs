use thiserror::Error;

pub type Result<T, E = TransportError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("port not found: {0}")]
    PortNotFound(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("link closed: {0}")]
    Closed(String),
    #[error("invalid line: {0}")]
    InvalidLine(&'static str),
}
