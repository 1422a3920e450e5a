//! Error types for the Floodgate admission layer.

use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Invalid configuration, reported at construction time
    #[error("Configuration error: {0}")]
    Config(String),

    /// The named circuit breaker is open
    #[error("circuit breaker '{name}' is open")]
    BreakerOpen { name: String },

    /// The named circuit breaker is half-open and its trial quota is used up
    #[error("circuit breaker '{name}' half-open limit reached")]
    HalfOpenLimit { name: String },

    /// A rate limiter denied the request
    #[error("rate limited by '{limiter}', retry after {retry_after:?}")]
    RateLimited { limiter: String, retry_after: Duration },

    /// Counter store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FloodgateError {
    /// Whether this error is an admission denial rather than a fault.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            FloodgateError::BreakerOpen { .. }
                | FloodgateError::HalfOpenLimit { .. }
                | FloodgateError::RateLimited { .. }
        )
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejections_are_classified() {
        let open = FloodgateError::BreakerOpen {
            name: "global".to_string(),
        };
        assert!(open.is_rejection());
        assert_eq!(open.to_string(), "circuit breaker 'global' is open");

        let config = FloodgateError::Config("window must be positive".to_string());
        assert!(!config.is_rejection());
    }
}
