use serde::Serialize;

/// Stable classification of a pipeline failure, emitted as the `error_kind` log field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Cache or store miss. Expected; drives negative caching.
    NotFound,
    /// SessionStart replay. Logged, event dropped.
    DuplicateSession,
    /// SessionEnd that did not change the stored duration. Reported, not retried.
    DuplicateSessionEnd,
    /// Malformed event field. Logged, event dropped.
    Validation,
    /// Store or bus I/O failure. Retryable.
    Upstream,
    /// Multi-statement commit failed and was rolled back.
    Transaction,
    /// One or more session batches failed to flush.
    BatchFlush,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => codes::NOT_FOUND,
            ErrorKind::DuplicateSession => codes::DUPLICATE_SESSION,
            ErrorKind::DuplicateSessionEnd => codes::DUPLICATE_SESSION_END,
            ErrorKind::Validation => codes::VALIDATION,
            ErrorKind::Upstream => codes::UPSTREAM,
            ErrorKind::Transaction => codes::TRANSACTION,
            ErrorKind::BatchFlush => codes::BATCH_FLUSH,
        }
    }

    /// Whether redelivering the same event can succeed.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Upstream | ErrorKind::Transaction | ErrorKind::BatchFlush
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error codes used across the pipeline
pub mod codes {
    pub const NOT_FOUND: &str = "not_found";
    pub const DUPLICATE_SESSION: &str = "duplicate_session";
    pub const DUPLICATE_SESSION_END: &str = "duplicate_session_end";
    pub const VALIDATION: &str = "validation";
    pub const UPSTREAM: &str = "upstream";
    pub const TRANSACTION: &str = "transaction";
    pub const BATCH_FLUSH: &str = "batch_flush";
}
