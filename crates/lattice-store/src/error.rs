//! Datastore error taxonomy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object definition `{0}` not found")]
    NamespaceNotFound(String),

    #[error("caveat `{0}` not found")]
    CaveatNotFound(String),

    #[error("cursors are only available on sorted queries")]
    CursorsWithoutSorting,

    #[error("cursor requested before any rows were produced")]
    EmptyCursor,

    #[error("use of an iterator after close")]
    ClosedIterator,

    #[error("detected concurrent use of a read-write transaction")]
    ConcurrentTransactionUse,

    #[error("relationship already exists: {0}")]
    RelationshipExists(String),

    #[error("relationship not found: {0}")]
    RelationshipNotFound(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid revision for this datastore: {0}")]
    InvalidRevision(String),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("max retries exceeded after {attempts} attempts")]
    MaxRetries {
        attempts: u8,
        #[source]
        last: Box<StoreError>,
    },

    #[error("watch is not enabled on this datastore")]
    WatchDisabled,

    #[error("watch consumer fell behind by {0} revisions")]
    WatchLagged(u64),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("internal datastore error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether the enclosing transaction may be retried. Cancellation,
    /// deadlines, and constraint violations are never retryable.
    pub fn retryable(&self) -> bool {
        matches!(self, StoreError::Serialization(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_serialization_failures_are_retryable() {
        assert!(StoreError::Serialization("deadlock".to_string()).retryable());
        assert!(!StoreError::Cancelled.retryable());
        assert!(!StoreError::DeadlineExceeded.retryable());
        assert!(!StoreError::RelationshipExists("t".to_string()).retryable());
    }

    #[test]
    fn max_retries_preserves_cause() {
        let err = StoreError::MaxRetries {
            attempts: 3,
            last: Box::new(StoreError::Serialization("deadlock".to_string())),
        };
        let source = std::error::Error::source(&err).expect("cause preserved");
        assert!(source.to_string().contains("deadlock"));
    }
}
