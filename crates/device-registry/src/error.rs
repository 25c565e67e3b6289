use crate::DeviceId;
use line_transport::TransportError;
use safety_guard::SafetyViolation;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = DeviceError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("{op} timed out after {after:?}")]
    ProtocolTimeout { op: String, after: Duration },
    #[error("unknown command `{command}`")]
    UnknownCommand { command: String },
    #[error(transparent)]
    SafetyBlocked(#[from] SafetyViolation),
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("device {0} is not connected")]
    Disconnected(DeviceId),
    #[error("discovery on {port} returned no commands")]
    DiscoveryFailed { port: String },
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("metrics: {0}")]
    Metrics(String),
}

impl DeviceError {
    /// Conditions reported to the operator rather than treated as failures.
    pub fn is_notification(&self) -> bool {
        matches!(self, DeviceError::Disconnected(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::ProtocolTimeout { .. })
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue for {0} is closed")]
    Closed(DeviceId),
    #[error("task on {0} aborted before settling")]
    TaskFailed(DeviceId),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("empty signature")]
    Empty,
    #[error("malformed signature `{0}`")]
    Malformed(String),
    #[error("arity out of range in `{0}`")]
    ArityOverflow(String),
}
