use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineError;

/// Coarse failure taxonomy shared by every reasoning path.
///
/// Callers branch on this rather than on the concrete error: extraction and
/// chat surface every kind, the insight path degrades locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, auth, HTTP status or timeout failure.
    TransportError,
    /// The engine answered, but not in the shape the caller needs.
    MalformedResponse,
    /// The stream ended before its completion sentinel.
    StreamInterrupted,
    /// The caller cancelled the call.
    Aborted,
}

#[derive(Error, Debug)]
pub enum NexusError {
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Extraction failed: {cause}")]
    ExtractionFailed {
        kind: FailureKind,
        cause: String,
        /// Text streamed before the failure. Display only, never used for records.
        partial: Option<String>,
    },

    #[error("Session was reset while the operation was in flight")]
    SessionReset,

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl NexusError {
    /// Wrap an engine failure as an extraction failure, keeping any partial text.
    pub fn extraction(error: EngineError, partial: Option<String>) -> Self {
        Self::ExtractionFailed {
            kind: error.kind(),
            cause: error.to_string(),
            partial: partial.filter(|p| !p.is_empty()),
        }
    }

    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Engine(e) => Some(e.kind()),
            Self::ExtractionFailed { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
