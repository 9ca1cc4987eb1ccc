use thiserror::Error;

/// Failure classes for a single dispatch attempt against the server.
///
/// Stale writes and transport failures are recoverable and feed the retry
/// path; validation failures are dropped outright since retrying cannot fix
/// them; authorization failures are fatal to the session and never retried
/// by the sync layer.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The server holds a newer version for this item; reconcile, then retry
    #[error("stale write rejected by server")]
    StaleWrite,

    /// Network failure or timeout; the item is recycled for a later attempt
    #[error("transport failure: {0}")]
    Transport(String),

    /// Malformed item id or payload shape; the mutation is dropped
    #[error("validation failed: {0}")]
    Validation(String),

    /// The server refused the whole operation for this session
    #[error("authorization refused")]
    Unauthorized,

    /// The server answered with something the protocol does not allow
    #[error("unexpected server response: {0}")]
    Protocol(String),

    /// Local cache I/O failure; the in-memory state is still authoritative
    #[error("cache failure: {0}")]
    Cache(String),
}

impl SyncError {
    /// Whether the failed item should be put back on the dirty queue
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::StaleWrite | SyncError::Transport(_))
    }
}
