//! Delivery transport boundary.
//!
//! A transport sends one payload to one subscription. Failures carry an
//! optional status code and a message, and are classified into
//! [`ErrorClass`] the same way regardless of the concrete transport.

mod http;

pub use http::HttpPushTransport;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use strum::{AsRefStr, Display};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::models::{DeliveryOutcome, DeliveryResult, PushPayload, PushSubscription};

/// Failure taxonomy for a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[derive(Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// 404/410: the endpoint is gone for good.
    InvalidEndpoint,
    /// 413: the payload is too big, retrying cannot help.
    PayloadTooLarge,
    /// 429.
    RateLimited,
    /// 5xx.
    TransportUnavailable,
    /// Any other 4xx.
    ClientError,
    Timeout,
    NetworkError,
    Unknown,
}

impl ErrorClass {
    /// Classify by status code first, then by message pattern.
    pub fn classify(status_code: Option<u16>, message: &str) -> Self {
        match status_code {
            Some(404 | 410) => ErrorClass::InvalidEndpoint,
            Some(413) => ErrorClass::PayloadTooLarge,
            Some(429) => ErrorClass::RateLimited,
            Some(500..=599) => ErrorClass::TransportUnavailable,
            Some(400..=499) => ErrorClass::ClientError,
            _ => Self::classify_message(message),
        }
    }

    fn classify_message(message: &str) -> Self {
        let message = message.to_lowercase();
        if message.contains("timeout") || message.contains("timed out") {
            ErrorClass::Timeout
        } else if ["network", "connection", "econnrefused", "econnreset", "dns"]
            .iter()
            .any(|p| message.contains(p))
        {
            ErrorClass::NetworkError
        } else {
            ErrorClass::Unknown
        }
    }

    /// Whether a later attempt might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::RateLimited
                | ErrorClass::TransportUnavailable
                | ErrorClass::Timeout
                | ErrorClass::NetworkError
        )
    }
}

/// A failed send.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct DeliveryError {
    pub status_code: Option<u16>,
    pub message: String,
}

impl DeliveryError {
    pub fn new(status_code: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status_code,
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        ErrorClass::classify(self.status_code, &self.message)
    }
}

/// A successful send.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliveryReceipt {
    pub status_code: Option<u16>,
    pub message_id: Option<String>,
}

/// Sends a payload to one subscription.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<DeliveryReceipt, DeliveryError>;

    /// Get the transport name for logging.
    fn name(&self) -> &'static str;
}

/// Fan-out settings for [`send_bulk`].
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Sends in flight at once.
    pub parallelism: usize,
    /// Upper bound for each individual send.
    pub timeout: Duration,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            parallelism: 20,
            timeout: Duration::from_secs(10),
        }
    }
}

/// One failed send inside a bulk operation.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkError {
    pub subscription_id: Uuid,
    pub endpoint: String,
    pub error: DeliveryError,
}

/// Aggregate of a bulk send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkSendResult {
    pub sent: usize,
    pub failed: usize,
    /// Endpoints that failed as [`ErrorClass::InvalidEndpoint`].
    pub invalid_endpoints: Vec<String>,
    pub errors: Vec<BulkError>,
    pub outcomes: Vec<DeliveryOutcome>,
}

/// Send `payload` to every subscription with bounded parallelism.
///
/// Sends are independent: a failure or timeout is recorded for that
/// subscription only.
pub async fn send_bulk(
    transport: &dyn DeliveryTransport,
    subscriptions: &[PushSubscription],
    payload: &PushPayload,
    job_id: &str,
    options: &BulkOptions,
) -> BulkSendResult {
    let sends: Vec<_> = subscriptions
        .iter()
        .map(|subscription| async move {
            let started = Instant::now();
            let result = match tokio::time::timeout(
                options.timeout,
                transport.send(subscription, payload),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DeliveryError::new(
                    None,
                    format!("send timed out after {}ms", options.timeout.as_millis()),
                )),
            };
            (subscription, result, started.elapsed())
        })
        .collect();

    let attempts: Vec<_> = stream::iter(sends)
        .buffer_unordered(options.parallelism.max(1))
        .collect()
        .await;

    let mut aggregate = BulkSendResult::default();
    for (subscription, result, elapsed) in attempts {
        let latency_ms = elapsed.as_millis() as u64;
        match result {
            Ok(receipt) => {
                aggregate.sent += 1;
                aggregate.outcomes.push(DeliveryOutcome {
                    subscription_id: subscription.id,
                    job_id: job_id.to_string(),
                    result: DeliveryResult::Sent,
                    error_class: None,
                    status_code: receipt.status_code,
                    latency_ms,
                });
            }
            Err(error) => {
                let class = error.class();
                aggregate.failed += 1;
                if class == ErrorClass::InvalidEndpoint {
                    aggregate.invalid_endpoints.push(subscription.endpoint.clone());
                }
                aggregate.outcomes.push(DeliveryOutcome {
                    subscription_id: subscription.id,
                    job_id: job_id.to_string(),
                    result: DeliveryResult::Failed,
                    error_class: Some(class),
                    status_code: error.status_code,
                    latency_ms,
                });
                aggregate.errors.push(BulkError {
                    subscription_id: subscription.id,
                    endpoint: subscription.endpoint.clone(),
                    error,
                });
            }
        }
    }

    debug!(
        transport = transport.name(),
        sent = aggregate.sent,
        failed = aggregate.failed,
        invalid = aggregate.invalid_endpoints.len(),
        "Bulk send finished"
    );
    aggregate
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::models::SubscriptionKeys;
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Mutex;

    pub fn subscription(endpoint: &str) -> PushSubscription {
        PushSubscription {
            id: Uuid::now_v7(),
            user_id: Uuid::now_v7(),
            endpoint: endpoint.to_string(),
            keys: SubscriptionKeys {
                p256dh: "k".into(),
                auth: "a".into(),
            },
            enabled: true,
            last_seen_at: Utc::now(),
            created_at: Utc::now(),
            disabled_at: None,
        }
    }

    /// Transport answering from a fixed endpoint -> status table.
    ///
    /// Unlisted endpoints succeed. Status 0 simulates a hang.
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub statuses: HashMap<String, u16>,
        pub sent: Mutex<Vec<String>>,
    }

    impl ScriptedTransport {
        pub fn failing(statuses: impl IntoIterator<Item = (String, u16)>) -> Self {
            Self {
                statuses: statuses.into_iter().collect(),
                sent: Mutex::new(Vec::new()),
            }
        }

        pub fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeliveryTransport for ScriptedTransport {
        async fn send(
            &self,
            subscription: &PushSubscription,
            _payload: &PushPayload,
        ) -> Result<DeliveryReceipt, DeliveryError> {
            match self.statuses.get(&subscription.endpoint) {
                Some(0) => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!("hung send should have timed out")
                }
                Some(status) => Err(DeliveryError::new(Some(*status), format!("status {}", status))),
                None => {
                    self.sent.lock().unwrap().push(subscription.endpoint.clone());
                    Ok(DeliveryReceipt {
                        status_code: Some(201),
                        message_id: None,
                    })
                }
            }
        }

        fn name(&self) -> &'static str {
            "scripted"
        }
    }
}
