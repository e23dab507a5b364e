//! Error types for tether-core operations.
//!
//! Only caller-facing failures surface as `SyncError`. Protocol noise and
//! corrupt files are logged and absorbed where they happen.

use std::path::PathBuf;

use tether_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    // ─────────────────────────────────────────────────────────────────────
    // Connection Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Not connected")]
    NotConnected,

    #[error("No response for request {correlation_id} within {waited_secs}s")]
    CorrelationTimeout {
        correlation_id: String,
        waited_secs: u64,
    },

    #[error("Request {0} was cancelled")]
    RequestCancelled(String),

    #[error("Server rejected request: {code}: {message}")]
    Remote { code: String, message: String },

    #[error("Sync engine has stopped")]
    EngineStopped,

    // ─────────────────────────────────────────────────────────────────────
    // Persistence Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Corrupt data quarantined: {original} -> {quarantined}")]
    PersistenceCorruption {
        original: PathBuf,
        quarantined: PathBuf,
    },

    #[error("Session metadata rejected for {project_id}: {reason}")]
    ValidationFailure { project_id: String, reason: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration / HTTP
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        SyncError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        SyncError::Json {
            context: context.into(),
            source,
        }
    }
}

impl From<SyncError> for String {
    fn from(err: SyncError) -> String {
        err.to_string()
    }
}
