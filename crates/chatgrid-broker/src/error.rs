//! Broker error types.

use thiserror::Error;

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors from shared-store operations.
///
/// On `Unavailable` the caller must not assume the store changed; the
/// in-memory command being pushed stays with the caller for retry.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("shared store unavailable: {0}")]
    Unavailable(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}
