use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the broker gateway.
///
/// `Unavailable`, `Timeout` and `Malformed` are transient fetch failures:
/// the affected pass is aborted and retried on the next cycle with no state
/// mutation. `Rejected` and `NotFound` are terminal for a single close
/// attempt and get cached by the closer.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum GatewayError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker request timed out")]
    Timeout,

    #[error("Malformed broker response: {0}")]
    Malformed(String),

    #[error("Close rejected by broker: {0}")]
    Rejected(String),

    #[error("Broker ticket not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Transient errors are retried on the next scheduler cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Unavailable(_) | GatewayError::Timeout | GatewayError::Malformed(_)
        )
    }
}

/// Errors from the persistence store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Failure of one account's reconciliation pass.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Snapshot fetch failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Expected-position load failed: {0}")]
    Store(#[from] StoreError),

    #[error("Sync task timed out after {0}s")]
    Timeout(u64),
}

/// Configuration validation errors. These are the only fatal errors in the
/// system: they abort at construction, never at runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} out of range: {value} (allowed {min}..={max})")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{name} must be positive, got {value}")]
    NotPositive { name: &'static str, value: f64 },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(GatewayError::Timeout.is_transient());
        assert!(GatewayError::Unavailable("down".into()).is_transient());
        assert!(!GatewayError::Rejected("market closed".into()).is_transient());
        assert!(!GatewayError::NotFound("42".into()).is_transient());
    }

    #[test]
    fn test_sync_error_from_gateway() {
        let err: SyncError = GatewayError::Timeout.into();
        assert!(matches!(err, SyncError::Gateway(GatewayError::Timeout)));
    }
}
