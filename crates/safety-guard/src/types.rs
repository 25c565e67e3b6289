use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

/// Raised when the interlock refuses a command.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SafetyViolation {
    #[error("safe mode is engaged; mutating command `{command}` blocked")]
    Blocked { command: String },
}

/// Safety event for audit logging
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub event_type: SafetyEventType,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SafetyEventType {
    Engaged,
    Released,
    CommandBlocked,
}

impl std::fmt::Display for SafetyEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyEventType::Engaged => write!(f, "Engaged"),
            SafetyEventType::Released => write!(f, "Released"),
            SafetyEventType::CommandBlocked => write!(f, "CommandBlocked"),
        }
    }
}

impl SafetyEvent {
    pub(crate) fn now(event_type: SafetyEventType, message: String) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            event_type,
            message,
        }
    }
}
