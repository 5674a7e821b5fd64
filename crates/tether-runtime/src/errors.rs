//! Runtime error types.

use thiserror::Error;

/// Errors from the HTTP API collaborators.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request failed at the transport level.
    #[error("api request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("api returned status {code}")]
    Status {
        /// HTTP status code.
        code: u16,
    },

    /// The response body did not match the expected shape.
    #[error("api response decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    /// The resume event stream broke mid-flight.
    #[error("resume stream error: {0}")]
    Stream(String),
}

/// Errors raised while recovering pending tasks.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The pending-tasks listing could not be fetched.
    #[error("{0}")]
    Api(#[from] ApiError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_display() {
        let err = ApiError::Status { code: 503 };
        assert_eq!(err.to_string(), "api returned status 503");
    }

    #[test]
    fn recovery_wraps_api() {
        let err = RecoveryError::from(ApiError::Stream("eof".into()));
        assert!(err.to_string().contains("resume stream error"));
    }
}
