//! Error types for the Ratewall limiter.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid limit or service configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network, connection or timeout failure talking to the shared store.
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The store does not recognize the cached script reference.
    #[error("Rate limit script not loaded in store")]
    ScriptNotLoaded,

    /// The store returned something the atomic script can never produce.
    #[error("Rate limit anomaly: {0}")]
    Anomaly(String),

    /// The local key table is full and no idle keys could be swept.
    #[error("Local limiter at capacity ({max_keys} keys)")]
    LocalCapacity { max_keys: usize },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether this error means the primary store could not be used.
    ///
    /// These are the errors the hybrid limiter answers by failing over.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            LimiterError::BackendUnavailable(_) | LimiterError::ScriptNotLoaded
        )
    }
}

impl From<StoreError> for LimiterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NoScript => LimiterError::ScriptNotLoaded,
            StoreError::Unavailable(reason) => LimiterError::BackendUnavailable(reason),
            StoreError::Protocol(reason) => LimiterError::Anomaly(reason),
        }
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_map_to_limiter_errors() {
        assert!(matches!(
            LimiterError::from(StoreError::NoScript),
            LimiterError::ScriptNotLoaded
        ));
        assert!(matches!(
            LimiterError::from(StoreError::Unavailable("refused".into())),
            LimiterError::BackendUnavailable(_)
        ));
        assert!(matches!(
            LimiterError::from(StoreError::Protocol("bad reply".into())),
            LimiterError::Anomaly(_)
        ));
    }

    #[test]
    fn test_backend_failure_classification() {
        assert!(LimiterError::BackendUnavailable("timeout".into()).is_backend_failure());
        assert!(LimiterError::ScriptNotLoaded.is_backend_failure());
        assert!(!LimiterError::Anomaly("x".into()).is_backend_failure());
        assert!(!LimiterError::Config("x".into()).is_backend_failure());
        assert!(!LimiterError::LocalCapacity { max_keys: 1 }.is_backend_failure());
    }
}
