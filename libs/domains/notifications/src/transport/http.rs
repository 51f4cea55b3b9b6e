//! Push gateway transport over HTTP.
//!
//! The gateway owns Web Push encryption and VAPID signing; this client only
//! hands it the subscription, the payload and a TTL.

use super::{DeliveryError, DeliveryReceipt, DeliveryTransport};
use crate::error::NotificationResult;
use crate::models::{PushPayload, PushSubscription, SubscriptionKeys};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

/// How long the push service may hold an undelivered message.
const DEFAULT_PUSH_TTL_SECS: u64 = 24 * 3600;

#[derive(Debug, Serialize)]
struct GatewaySubscription<'a> {
    endpoint: &'a str,
    keys: &'a SubscriptionKeys,
}

#[derive(Debug, Serialize)]
struct GatewayRequest<'a> {
    subscription: GatewaySubscription<'a>,
    payload: &'a PushPayload,
    ttl: u64,
}

/// Sends through a Web Push gateway at `{gateway_url}/send`.
pub struct HttpPushTransport {
    client: Client,
    gateway_url: String,
    token: Option<String>,
    ttl_secs: u64,
}

impl HttpPushTransport {
    pub fn new(
        gateway_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> NotificationResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            gateway_url: gateway_url.into().trim_end_matches('/').to_string(),
            token,
            ttl_secs: DEFAULT_PUSH_TTL_SECS,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_secs = ttl.as_secs();
        self
    }
}

fn request_error(err: reqwest::Error) -> DeliveryError {
    let status = err.status().map(|s| s.as_u16());
    let message = if err.is_timeout() {
        format!("gateway request timed out: {}", err)
    } else if err.is_connect() {
        format!("network error connecting to gateway: {}", err)
    } else {
        err.to_string()
    };
    DeliveryError::new(status, message)
}

#[async_trait]
impl DeliveryTransport for HttpPushTransport {
    async fn send(
        &self,
        subscription: &PushSubscription,
        payload: &PushPayload,
    ) -> Result<DeliveryReceipt, DeliveryError> {
        let request = GatewayRequest {
            subscription: GatewaySubscription {
                endpoint: &subscription.endpoint,
                keys: &subscription.keys,
            },
            payload,
            ttl: self.ttl_secs,
        };

        let mut builder = self
            .client
            .post(format!("{}/send", self.gateway_url))
            .json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(request_error)?;
        let status = response.status();
        let message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status.is_success() {
            debug!(
                subscription_id = %subscription.id,
                status = status.as_u16(),
                message_id = ?message_id,
                "Push accepted by gateway"
            );
            Ok(DeliveryReceipt {
                status_code: Some(status.as_u16()),
                message_id,
            })
        } else {
            let body = response.text().await.unwrap_or_default();
            warn!(
                subscription_id = %subscription.id,
                status = status.as_u16(),
                error = %body,
                "Push rejected by gateway"
            );
            let message = if body.is_empty() {
                status.to_string()
            } else {
                body
            };
            Err(DeliveryError::new(Some(status.as_u16()), message))
        }
    }

    fn name(&self) -> &'static str {
        "http_gateway"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ErrorClass;

    #[test]
    fn test_gateway_request_shape() {
        let keys = SubscriptionKeys {
            p256dh: "p".into(),
            auth: "a".into(),
        };
        let payload = PushPayload {
            title: "Show moved".into(),
            body: "Now at 21:00".into(),
            tag: Some("event-1".into()),
            data: serde_json::json!({ "url": "/events/1" }),
        };
        let request = GatewayRequest {
            subscription: GatewaySubscription {
                endpoint: "https://push.test/1",
                keys: &keys,
            },
            payload: &payload,
            ttl: 60,
        };

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["subscription"]["endpoint"], "https://push.test/1");
        assert_eq!(value["subscription"]["keys"]["auth"], "a");
        assert_eq!(value["payload"]["tag"], "event-1");
        assert_eq!(value["ttl"], 60);
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_network_error() {
        // Port 9 on loopback refuses connections.
        let transport =
            HttpPushTransport::new("http://127.0.0.1:9", None, Duration::from_secs(2)).unwrap();
        let sub = crate::transport::testing::subscription("https://push.test/x");
        let payload = PushPayload {
            title: "t".into(),
            body: "b".into(),
            tag: None,
            data: serde_json::Value::Null,
        };

        let err = transport.send(&sub, &payload).await.unwrap_err();
        assert!(err.status_code.is_none());
        assert_eq!(err.class(), ErrorClass::NetworkError);
    }

    #[test]
    fn test_builder_trims_url_and_sets_ttl() {
        let transport =
            HttpPushTransport::new("http://gateway.test/", None, Duration::from_secs(1))
                .unwrap()
                .with_ttl(Duration::from_secs(600));
        assert_eq!(transport.gateway_url, "http://gateway.test");
        assert_eq!(transport.ttl_secs, 600);
    }
}
