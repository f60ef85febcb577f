//! Error types for the feed relay.

use thiserror::Error;

/// Common error type for the feed relay.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Network or timeout failure while fetching a feed.
    ///
    /// Retried by the poller according to its backoff policy.
    #[error("transient fetch error: {0}")]
    FetchTransient(String),

    /// The feed is malformed or the URL is unusable.
    #[error("feed rejected: {0}")]
    FetchPermanent(String),

    /// The persistent store could not complete the operation.
    ///
    /// Errors from sqlx are converted into this variant.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A media reference could not be fetched or classified.
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    /// Index past the end of a subscriber's listing.
    #[error("index {index} out of range (subscribed to {len} feeds)")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of subscriptions.
        len: usize,
    },

    /// Delivery failed but may succeed later.
    #[error("delivery failed (transient): {0}")]
    DeliveryTransient(String),

    /// Delivery was refused and should not be retried.
    #[error("delivery failed: {0}")]
    DeliveryPermanent(String),

    /// Unknown preference name or value.
    #[error("invalid preference: {0}")]
    InvalidPreference(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RelayError::FetchTransient(_)
                | RelayError::DeliveryTransient(_)
                | RelayError::StoreUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(e: sqlx::Error) -> Self {
        RelayError::StoreUnavailable(e.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::FetchTransient(e.to_string())
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_out_of_range_display() {
        let err = RelayError::IndexOutOfRange { index: 4, len: 2 };
        assert_eq!(
            err.to_string(),
            "index 4 out of range (subscribed to 2 feeds)"
        );
    }

    #[test]
    fn test_fetch_permanent_display() {
        let err = RelayError::FetchPermanent("not a feed".to_string());
        assert_eq!(err.to_string(), "feed rejected: not a feed");
    }

    #[test]
    fn test_is_transient() {
        assert!(RelayError::FetchTransient("timeout".into()).is_transient());
        assert!(RelayError::DeliveryTransient("429".into()).is_transient());
        assert!(!RelayError::FetchPermanent("bad xml".into()).is_transient());
        assert!(!RelayError::DeliveryPermanent("blocked".into()).is_transient());
        assert!(!RelayError::MediaUnavailable("404".into()).is_transient());
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: RelayError = io_err.into();
        assert!(matches!(err, RelayError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_sqlx_error_conversion() {
        let err: RelayError = sqlx::Error::PoolClosed.into();
        assert!(matches!(err, RelayError::StoreUnavailable(_)));
    }
}
