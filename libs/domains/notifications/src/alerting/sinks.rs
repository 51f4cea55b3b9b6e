//! Alert sinks and the background dispatch queue that feeds them.

use super::Alert;
use crate::error::{NotificationError, NotificationResult};
use async_trait::async_trait;
use core_config::{ConfigError, FromEnv, env_optional, env_or_default, env_parse};
use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Somewhere fired alerts are sent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> NotificationResult<()>;

    fn name(&self) -> &'static str;
}

// ============================================================================
// Webhook
// ============================================================================

/// POSTs the alert as JSON.
pub struct WebhookSink {
    client: Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> NotificationResult<Self> {
        Ok(Self {
            client: Client::builder().timeout(timeout).build()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn deliver(&self, alert: &Alert) -> NotificationResult<()> {
        let response = self.client.post(&self.url).json(alert).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::AlertDelivery(format!(
                "webhook returned {}: {}",
                status, body
            )));
        }
        debug!(alert_id = %alert.id, rule_id = %alert.rule_id, "Alert posted to webhook");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

// ============================================================================
// Email
// ============================================================================

/// SMTP settings for the alert mailer.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from_email: String,
    pub from_name: String,
    /// Optional for dev servers like Mailpit.
    pub username: Option<String>,
    pub password: Option<String>,
    /// False for local dev servers.
    pub use_tls: bool,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, port: u16, from_email: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            from_email: from_email.into(),
            from_name: "Notification Alerts".to_string(),
            username: None,
            password: None,
            use_tls: false,
        }
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.username = Some(username);
        self.password = Some(password);
        self
    }
}

impl FromEnv for SmtpConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let use_tls = env_or_default("SMTP_USE_TLS", "false");
        Ok(Self {
            host: env_or_default("SMTP_HOST", "localhost"),
            port: env_parse("SMTP_PORT", 1025)?,
            from_email: env_or_default("SMTP_FROM_EMAIL", "alerts@localhost"),
            from_name: env_or_default("SMTP_FROM_NAME", "Notification Alerts"),
            username: env_optional("SMTP_USERNAME"),
            password: env_optional("SMTP_PASSWORD"),
            use_tls: use_tls == "true" || use_tls == "1",
        })
    }
}

/// Mails alerts to a fixed recipient list.
pub struct EmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    recipients: Vec<Mailbox>,
}

impl EmailSink {
    pub fn new(config: &SmtpConfig, recipients: &[String]) -> NotificationResult<Self> {
        if recipients.is_empty() {
            return Err(NotificationError::Config(
                "alert email sink needs at least one recipient".to_string(),
            ));
        }
        let from: Mailbox = format!("{} <{}>", config.from_name, config.from_email).parse()?;
        let recipients = recipients
            .iter()
            .map(|r| r.parse::<Mailbox>())
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            transport: Self::build_transport(config)?,
            from,
            recipients,
        })
    }

    fn build_transport(
        config: &SmtpConfig,
    ) -> NotificationResult<AsyncSmtpTransport<Tokio1Executor>> {
        let credentials = match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                Some(Credentials::new(username.clone(), password.clone()))
            }
            _ => None,
        };

        let transport = if config.use_tls {
            let mut builder =
                AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?.port(config.port);
            if let Some(credentials) = credentials {
                builder = builder.credentials(credentials);
            }
            builder.build()
        } else {
            let mut builder =
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
                    .port(config.port);
            if let Some(credentials) = credentials {
                builder = builder.credentials(credentials);
            }
            builder.build()
        };
        Ok(transport)
    }

    fn build_message(&self, alert: &Alert) -> NotificationResult<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("[{}] {}", alert.severity, alert.rule_id));
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }

        let data = serde_json::to_string_pretty(&alert.data)?;
        let body = format!(
            "{}\n\nRule: {}\nSeverity: {}\nFired at: {}\n\n{}\n",
            alert.message,
            alert.rule_id,
            alert.severity,
            alert.timestamp.to_rfc3339(),
            data
        );
        Ok(builder.header(ContentType::TEXT_PLAIN).body(body)?)
    }
}

#[async_trait]
impl AlertSink for EmailSink {
    async fn deliver(&self, alert: &Alert) -> NotificationResult<()> {
        let message = self.build_message(alert)?;
        self.transport.send(message).await?;
        debug!(
            alert_id = %alert.id,
            recipients = self.recipients.len(),
            "Alert emailed"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "email"
    }
}

// ============================================================================
// Dispatch
// ============================================================================

/// Default depth of the dispatch queue.
pub const DEFAULT_DISPATCH_CAPACITY: usize = 100;

/// Hands alerts to a background task that delivers them to every sink.
///
/// Enqueueing never waits: when the queue is full the alert is dropped.
#[derive(Clone)]
pub struct AlertDispatcher {
    tx: mpsc::Sender<Alert>,
}

impl AlertDispatcher {
    /// Start the delivery task. It drains what is queued once `shutdown`
    /// flips to `true`, then exits.
    pub fn spawn(
        sinks: Vec<Arc<dyn AlertSink>>,
        capacity: usize,
        mut shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Alert>(capacity.max(1));

        let handle = tokio::spawn(async move {
            info!(sinks = sinks.len(), "Alert dispatcher started");
            loop {
                tokio::select! {
                    next = rx.recv() => match next {
                        Some(alert) => deliver_all(&sinks, &alert).await,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            rx.close();
                            while let Some(alert) = rx.recv().await {
                                deliver_all(&sinks, &alert).await;
                            }
                            break;
                        }
                    }
                }
            }
            info!("Alert dispatcher stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue an alert for delivery. Returns `false` if it was dropped.
    pub fn dispatch(&self, alert: Alert) -> bool {
        match self.tx.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                warn!(
                    alert_id = %alert.id,
                    rule_id = %alert.rule_id,
                    "Alert queue full, dropping alert"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                warn!(alert_id = %alert.id, "Alert dispatcher stopped, dropping alert");
                false
            }
        }
    }
}

async fn deliver_all(sinks: &[Arc<dyn AlertSink>], alert: &Alert) {
    for sink in sinks {
        if let Err(e) = sink.deliver(alert).await {
            warn!(
                sink = sink.name(),
                alert_id = %alert.id,
                error = %e,
                "Failed to deliver alert"
            );
        }
    }
}
