//! Error types for the synchronization engine
//!
//! Only argument validation is surfaced to callers. Stale updates, malformed
//! peer messages and unreachable peers are resolved inside the engine and
//! never show up here.

use thiserror::Error;

/// Errors returned by the public `Link` and `SessionState` API
#[derive(Error, Debug)]
pub enum LinkError {
    /// Non-positive or non-finite tempo, quantum, beat or time value
    ///
    /// Carries a static description so it can be built on the audio thread
    /// without allocating.
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Failed to start a background thread
    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// The peer transport could not be created or used
    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Settings or configuration could not be read
    #[error("Configuration error: {0}")]
    Config(#[from] anyhow::Error),
}

/// Result type for engine operations
pub type LinkResult<T> = Result<T, LinkError>;
