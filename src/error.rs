//! Error types for the audit engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, AuditError>;

/// Errors that can occur in audit engine operations
#[derive(Debug, Error)]
pub enum AuditError {
    /// Invalid engine configuration (rejected at startup, never clamped)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Durable store failure (disk, lock contention, transaction rollback)
    #[error("Storage error: {0}")]
    Store(#[from] sqlx::Error),

    /// Details payload could not be serialized or deserialized
    #[error("Details payload error: {0}")]
    Details(#[from] serde_json::Error),

    /// A stored row could not be mapped back to an entry
    #[error("Malformed stored entry: {0}")]
    Decode(String),

    /// Shutdown drain gave up with entries still pending
    #[error("Shutdown drain incomplete: {remaining} entries still pending")]
    DrainIncomplete { remaining: usize },
}

impl AuditError {
    /// Check if this error is transient and the failed batch worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, AuditError::Store(_))
    }
}
