//! DocRepl Error Types

use thiserror::Error;

/// Result type alias for DocRepl operations
pub type Result<T> = std::result::Result<T, Error>;

/// DocRepl error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Protocol errors: corrupt or unrecognized replicated data.
    // Fatal to the apply stream, never skipped.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Hash chain broken at position {position}: expected {expected}, got {actual}")]
    ChainBroken {
        position: u64,
        expected: i64,
        actual: i64,
    },

    // Oplog errors
    #[error("Oplog error: {0}")]
    Oplog(String),

    #[error("Oplog store missing: {0}. did you drop it? if so restart the node")]
    OplogMissing(String),

    #[error("Oplog store already exists: {0}")]
    OplogExists(String),

    // Transient source faults: reset the connection, retry next tick
    #[error("Transient source fault: {0}")]
    TransientSource(String),

    // Storage engine faults: fatal to the current operation
    #[error("Storage error: {0}")]
    Storage(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error is retryable without operator intervention
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientSource(_))
    }

    /// Check if this error must halt the replay stream it occurred on
    pub fn is_fatal_to_stream(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::ChainBroken { .. } | Error::Storage(_)
        )
    }
}
