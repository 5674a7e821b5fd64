//! Connection error types.

use thiserror::Error;

/// Errors raised while establishing the push connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The transport failed to connect.
    #[error("transport connect failed: {0}")]
    Connect(String),
}
