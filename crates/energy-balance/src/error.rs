use device_registry::{DeviceError, DeviceId};
use thiserror::Error;

pub type Result<T, E = BalanceError> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    #[error("no edge {from} -> {to}")]
    UnknownEdge { from: DeviceId, to: DeviceId },
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}
