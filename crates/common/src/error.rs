//! Error types for Fleetdeck

use thiserror::Error;

/// Result type alias using Fleetdeck Error
pub type Result<T> = std::result::Result<T, Error>;

/// Fleetdeck error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Target unreachable: {0}")]
    Unreachable(String),

    #[error("Already connected to {address}")]
    AlreadyConnected { address: String },

    #[error("Not found: {kind} {id}")]
    NotFound { kind: String, id: String },

    #[error("Failed to spawn client: {0}")]
    SpawnFailed(String),

    #[error("Window placement failed: {0}")]
    PlacementFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Command timed out after {seconds}s")]
    CommandTimeout { seconds: u64 },

    #[error("Unexpected tool output: {0}")]
    ParseFailure(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for the `NotFound` variant
    pub fn not_found(kind: &str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.to_string(),
            id: id.into(),
        }
    }
}
