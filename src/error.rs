use std::time::Duration;

use thiserror::Error;

use crate::bus::BusError;

#[derive(Debug, Error)]
pub enum AlignmentError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Timed out after {waited:?} waiting for {expected} frames, got {received}")]
    Timeout {
        waited: Duration,
        expected: usize,
        received: usize,
    },

    #[error("Timed out after {0:?} waiting for pause acknowledgment")]
    PauseTimeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Transport error: {0}")]
    Transport(#[from] BusError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("Failed to install logger: {0}")]
    Logger(#[from] log::SetLoggerError),
}

impl AlignmentError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        AlignmentError::InvalidArgument(msg.into())
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            AlignmentError::InvalidArgument(_)
                | AlignmentError::Timeout { .. }
                | AlignmentError::PauseTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AlignmentError>;
