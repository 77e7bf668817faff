use thiserror::Error;

use crate::job::JobKind;

/// Failure of a single outbound request attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The request did not complete within the per-request timeout.
    #[error("request timed out after {0}ms")]
    Timeout(u64),

    /// Connection could not be established (refused, reset, proxy down).
    #[error("connection refused: {0}")]
    Refused(String),

    /// The origin answered with a non-success status.
    #[error("unexpected HTTP status {0}")]
    BadStatus(u16),

    /// The response arrived but could not be read.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Application-wide error types for nestfeed.
#[derive(Error, Debug)]
pub enum AppError {
    /// Outbound request failed after exhausting proxy retries.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The daily request budget is used up.
    #[error("Daily request quota of {limit} exhausted")]
    QuotaExceeded { limit: u32 },

    /// A fetched document could not be turned into a listing.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// A mutually exclusive job is already in flight.
    #[error("Cannot start {requested} job: {running} job already running")]
    ConcurrentJob { requested: JobKind, running: JobKind },

    /// Invalid or missing configuration.
    #[error("Config error: {0}")]
    ConfigError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The operation was cancelled by shutdown.
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error is transient and worth retrying on another proxy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Transport(_))
    }

    /// Returns true if the remaining items of a batch should not be attempted.
    pub fn aborts_batch(&self) -> bool {
        matches!(self, AppError::QuotaExceeded { .. } | AppError::Cancelled)
    }
}
