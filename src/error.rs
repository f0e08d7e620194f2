use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which sensor feed produced an event or error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SensorKind {
    Steps,
    Position,
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Steps => write!(f, "step counter"),
            SensorKind::Position => write!(f, "position"),
        }
    }
}

/// Run tracker error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackerError {
    #[error("Permission to read activity sensors was denied")]
    PermissionDenied,

    #[error("Sensor stream error ({sensor}): {message}")]
    SensorStream { sensor: SensorKind, message: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for TrackerError {
    fn from(err: std::io::Error) -> Self {
        TrackerError::Persistence(err.to_string())
    }
}

impl From<serde_json::Error> for TrackerError {
    fn from(err: serde_json::Error) -> Self {
        TrackerError::Persistence(err.to_string())
    }
}

/// Result type for tracker operations
pub type TResult<T> = Result<T, TrackerError>;
