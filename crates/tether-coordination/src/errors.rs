//! Coordination error types.

use thiserror::Error;

/// Errors raised by the lease store and broadcaster.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// The durable store failed.
    #[error("lease storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// An envelope could not be encoded or decoded.
    #[error("broadcast envelope error: {0}")]
    Envelope(#[from] serde_json::Error),
}

/// Convenience alias for coordination results.
pub type Result<T> = std::result::Result<T, CoordinationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display() {
        let err = CoordinationError::from(rusqlite::Error::InvalidQuery);
        assert!(err.to_string().contains("lease storage error"));
    }
}
