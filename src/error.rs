//! Error types for p2data

use std::sync::Arc;
use thiserror::Error;

/// Result type alias for p2data operations
pub type Result<T> = std::result::Result<T, P2Error>;

/// Error types that can occur while reading containers or scoring genes
#[derive(Debug, Error)]
pub enum P2Error {
    /// I/O error of the underlying resource
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested range lies outside the resource, entry or dimension
    #[error("Invalid range {start}..{end} for length {len}")]
    InvalidRange {
        /// First position (inclusive)
        start: u64,
        /// Last position (exclusive)
        end: u64,
        /// Length of what was indexed
        len: u64,
    },

    /// Transport level network failure
    #[error("Network error: {0}")]
    Network(String),

    /// Non-success HTTP status
    #[error("HTTP error {status}: {url}")]
    Http {
        /// HTTP status code
        status: u16,
        /// URL that failed
        url: String,
    },

    /// Container or sparse sub-format violation. Fatal for the open.
    #[error("Format error: {0}")]
    Format(String),

    /// Unknown entry key, dictionary name, gene set or embedding
    #[error("Unknown {kind}: {name}")]
    NotFound {
        /// What was looked up (e.g. "entry", "column")
        kind: &'static str,
        /// The name that was not found
        name: String,
    },

    /// JSON decoding of an entry failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The container failed to load its header or index
    #[error("Container failed to open: {0}")]
    ContainerOpen(#[source] Arc<P2Error>),

    /// Protocol violation between coordinator and statistics engine
    #[error("Engine error: {0}")]
    Engine(String),

    /// Run was stopped by the coordinator
    #[error("Operation cancelled")]
    Cancelled,
}

impl P2Error {
    /// Shorthand for a `NotFound` error
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        P2Error::NotFound {
            kind,
            name: name.into(),
        }
    }
}

impl From<tokio::task::JoinError> for P2Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            P2Error::Cancelled
        } else {
            P2Error::Engine(format!("worker task panicked: {}", err))
        }
    }
}
