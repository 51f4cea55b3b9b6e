//! Runtime settings for the notification pipeline.

use core_config::{ConfigError, FromEnv, env_optional, env_or_default, env_parse};
use std::time::Duration;

/// Settings read from `NOTIFICATIONS_*` and related environment variables.
#[derive(Debug, Clone)]
pub struct NotificationSettings {
    /// Key prefix for the job queue and subscription keys.
    pub queue_prefix: String,
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub lease: Duration,
    pub shutdown_grace: Duration,
    /// Deliveries a job needs before it counts as done (capped at the target count).
    pub min_successful_deliveries: usize,
    pub send_parallelism: usize,
    pub send_timeout: Duration,
    pub targeting_cache_ttl: Duration,
    pub targeting_cache_capacity: usize,
    pub alert_interval: Duration,
    pub cleanup_interval: Duration,
    /// Finished jobs older than this are pruned by maintenance.
    pub job_retention: Duration,
    /// Disabled subscriptions older than this many days are deleted.
    pub disabled_retention_days: i64,
    /// Shared secret for the admin endpoints. Unset disables them.
    pub admin_token: Option<String>,
    pub alert_webhook_url: Option<String>,
    pub alert_email_to: Vec<String>,
    pub push_gateway_url: Option<String>,
    pub push_gateway_token: Option<String>,
    pub domain_api_url: Option<String>,
    pub domain_api_token: Option<String>,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            queue_prefix: "notifications".to_string(),
            worker_concurrency: 5,
            max_attempts: 3,
            lease: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            min_successful_deliveries: 1,
            send_parallelism: 20,
            send_timeout: Duration::from_millis(10_000),
            targeting_cache_ttl: Duration::from_secs(300),
            targeting_cache_capacity: 1000,
            alert_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
            job_retention: Duration::from_secs(7 * 24 * 3600),
            disabled_retention_days: 7,
            admin_token: None,
            alert_webhook_url: None,
            alert_email_to: Vec::new(),
            push_gateway_url: None,
            push_gateway_token: None,
            domain_api_url: None,
            domain_api_token: None,
        }
    }
}

impl FromEnv for NotificationSettings {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let settings = Self {
            queue_prefix: env_or_default("NOTIFICATIONS_QUEUE_PREFIX", &defaults.queue_prefix),
            worker_concurrency: env_parse(
                "NOTIFICATIONS_WORKER_CONCURRENCY",
                defaults.worker_concurrency,
            )?,
            max_attempts: env_parse("NOTIFICATIONS_MAX_ATTEMPTS", defaults.max_attempts)?,
            lease: Duration::from_secs(env_parse("NOTIFICATIONS_LEASE_SECS", 60)?),
            shutdown_grace: Duration::from_secs(env_parse(
                "NOTIFICATIONS_SHUTDOWN_GRACE_SECS",
                30,
            )?),
            min_successful_deliveries: env_parse(
                "NOTIFICATIONS_MIN_SUCCESSFUL",
                defaults.min_successful_deliveries,
            )?,
            send_parallelism: env_parse(
                "NOTIFICATIONS_SEND_PARALLELISM",
                defaults.send_parallelism,
            )?,
            send_timeout: Duration::from_millis(env_parse(
                "NOTIFICATIONS_SEND_TIMEOUT_MS",
                10_000,
            )?),
            targeting_cache_ttl: Duration::from_secs(env_parse(
                "NOTIFICATIONS_TARGETING_CACHE_TTL_SECS",
                300,
            )?),
            targeting_cache_capacity: env_parse(
                "NOTIFICATIONS_TARGETING_CACHE_CAPACITY",
                defaults.targeting_cache_capacity,
            )?,
            alert_interval: Duration::from_secs(env_parse(
                "NOTIFICATIONS_ALERT_INTERVAL_SECS",
                300,
            )?),
            cleanup_interval: Duration::from_secs(env_parse(
                "NOTIFICATIONS_CLEANUP_INTERVAL_SECS",
                3600,
            )?),
            job_retention: Duration::from_secs(
                env_parse::<u64>("NOTIFICATIONS_JOB_RETENTION_HOURS", 168)? * 3600,
            ),
            disabled_retention_days: env_parse(
                "NOTIFICATIONS_DISABLED_RETENTION_DAYS",
                defaults.disabled_retention_days,
            )?,
            admin_token: env_optional("NOTIFICATIONS_ADMIN_TOKEN"),
            alert_webhook_url: env_optional("NOTIFICATIONS_ALERT_WEBHOOK_URL"),
            alert_email_to: env_optional("NOTIFICATIONS_ALERT_EMAIL_TO")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            push_gateway_url: env_optional("PUSH_GATEWAY_URL"),
            push_gateway_token: env_optional("PUSH_GATEWAY_TOKEN"),
            domain_api_url: env_optional("DOMAIN_API_URL"),
            domain_api_token: env_optional("DOMAIN_API_TOKEN"),
        };

        settings.validate()?;
        Ok(settings)
    }
}

impl NotificationSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("NOTIFICATIONS_WORKER_CONCURRENCY", self.worker_concurrency),
            ("NOTIFICATIONS_SEND_PARALLELISM", self.send_parallelism),
            ("NOTIFICATIONS_TARGETING_CACHE_CAPACITY", self.targeting_cache_capacity),
            ("NOTIFICATIONS_MAX_ATTEMPTS", self.max_attempts as usize),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::ParseError {
                    key: key.to_string(),
                    details: "must be greater than zero".to_string(),
                });
            }
        }
        Ok(())
    }
}
