//! Error types for the notifications domain.

use core_config::ConfigError;
use job_queue::QueueError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Request failed validation.
    #[error("Invalid input: {0}")]
    Validation(String),

    /// The domain store has no such event.
    #[error("Event not found: {0}")]
    EventNotFound(Uuid),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(Uuid),

    /// Rendered payload exceeds the delivery limit.
    #[error("Payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Redis-backed store error.
    #[error("Store error: {0}")]
    Store(String),

    /// Job queue error.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Outbound HTTP call failed (domain API, push gateway, webhook).
    #[error("HTTP error: {0}")]
    Http(String),

    /// Alert sink failed to deliver.
    #[error("Alert delivery failed: {0}")]
    AlertDelivery(String),

    /// An alert rule with this id already exists.
    #[error("Alert rule already exists: {0}")]
    DuplicateRule(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Store(err.to_string())
    }
}

impl From<reqwest::Error> for NotificationError {
    fn from(err: reqwest::Error) -> Self {
        NotificationError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Internal(format!("JSON serialization error: {}", err))
    }
}

impl From<validator::ValidationErrors> for NotificationError {
    fn from(err: validator::ValidationErrors) -> Self {
        NotificationError::Validation(err.to_string())
    }
}

impl From<lettre::error::Error> for NotificationError {
    fn from(err: lettre::error::Error) -> Self {
        NotificationError::AlertDelivery(format!("email build failed: {}", err))
    }
}

impl From<lettre::transport::smtp::Error> for NotificationError {
    fn from(err: lettre::transport::smtp::Error) -> Self {
        NotificationError::AlertDelivery(format!("SMTP error: {}", err))
    }
}

impl From<lettre::address::AddressError> for NotificationError {
    fn from(err: lettre::address::AddressError) -> Self {
        NotificationError::Config(format!("invalid email address: {}", err))
    }
}

impl From<ConfigError> for NotificationError {
    fn from(err: ConfigError) -> Self {
        NotificationError::Config(err.to_string())
    }
}

impl NotificationError {
    /// Map onto a queue error for the worker's retry policy.
    ///
    /// Missing events and oversized payloads can never succeed on retry.
    pub fn into_queue_error(self) -> QueueError {
        match self {
            NotificationError::Queue(err) => err,
            err @ (NotificationError::EventNotFound(_)
            | NotificationError::PayloadTooLarge { .. }
            | NotificationError::Validation(_)) => QueueError::permanent(err.to_string()),
            err => QueueError::transient(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use job_queue::ErrorCategory;

    #[test]
    fn test_into_queue_error_categories() {
        let missing = NotificationError::EventNotFound(Uuid::nil()).into_queue_error();
        assert_eq!(missing.category(), ErrorCategory::Permanent);

        let too_big = NotificationError::PayloadTooLarge {
            size: 5000,
            limit: 4096,
        }
        .into_queue_error();
        assert_eq!(too_big.category(), ErrorCategory::Permanent);

        let store = NotificationError::Store("connection refused".into()).into_queue_error();
        assert_eq!(store.category(), ErrorCategory::Transient);
    }

    #[test]
    fn test_queue_error_passes_through() {
        let err = NotificationError::from(QueueError::rate_limited("slow down"));
        assert_eq!(err.into_queue_error().category(), ErrorCategory::RateLimited);
    }
}
