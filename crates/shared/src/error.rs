use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientNetwork,
    StaleResponseDiscarded,
    ValidationRejection,
    ProtocolDecode,
    CapacityExceeded,
}

/// Clonable failure record carried inside broadcast events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl SyncFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("network request failed: {0}")]
    Network(String),
    #[error("server responded with status {status}")]
    Status { status: u16 },
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("failed to decode payload: {0}")]
    Decode(String),
    #[error("reconnection gave up after {attempts} attempts")]
    CapacityExceeded { attempts: u32 },
    #[error("channel is not connected")]
    NotConnected,
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Network(_) | Self::Status { .. } | Self::NotConnected => {
                ErrorKind::TransientNetwork
            }
            Self::Rejected { .. } | Self::Validation(_) | Self::Config(_) => {
                ErrorKind::ValidationRejection
            }
            Self::Decode(_) => ErrorKind::ProtocolDecode,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
        }
    }

    /// Maps an HTTP status to the taxonomy: 4xx is a rejection of the request
    /// itself, everything else is treated as transient.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        if (400..500).contains(&status) {
            Self::Rejected {
                status,
                message: body.into(),
            }
        } else {
            Self::Status { status }
        }
    }
}

impl From<&SyncError> for SyncFailure {
    fn from(value: &SyncError) -> Self {
        Self {
            kind: value.kind(),
            message: value.to_string(),
        }
    }
}

impl From<SyncError> for SyncFailure {
    fn from(value: SyncError) -> Self {
        Self::from(&value)
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::Decode(value.to_string())
    }
}
