use thiserror::Error;

use crate::types::Mode;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("encoded configuration is {size} bytes, storage holds at most {capacity}")]
    TooLarge { size: usize, capacity: usize },
    #[error("failed to encode configuration")]
    Encode(#[source] serde_json::Error),
    #[error("stored configuration is not readable")]
    Decode(#[source] serde_json::Error),
    #[error("storage backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("invalid `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("failed to persist configuration")]
    Persistence(#[from] StorageError),
    #[error("time source has not synchronized yet")]
    TimeUnavailable,
    #[error(
        "operation requires {} mode, device is in {} mode",
        required.as_str(),
        current.as_str()
    )]
    ModeMismatch { required: Mode, current: Mode },
}

impl ClockError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
