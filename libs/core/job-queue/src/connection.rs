//! Redis connection helpers with startup retry.

use redis::Client;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Retry policy for establishing the Redis connection.
#[derive(Debug, Clone)]
pub struct ConnectRetry {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ConnectRetry {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl ConnectRetry {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay before retry number `attempt` (1-based), with 50-100% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .initial_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
            .min(self.max_delay_ms);
        let factor = 0.5 + rand::random::<f64>() * 0.5;
        Duration::from_millis((exp as f64 * factor) as u64)
    }
}

/// Connect to Redis and verify the connection with PING.
///
/// The returned `ConnectionManager` reconnects on its own after failures.
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Connected to Redis");
    Ok(manager)
}

/// Connect to Redis, retrying with exponential backoff and jitter.
pub async fn connect_with_retry(
    url: &str,
    retry: ConnectRetry,
) -> redis::RedisResult<ConnectionManager> {
    let mut attempt = 0;
    loop {
        match connect(url).await {
            Ok(manager) => {
                if attempt > 0 {
                    debug!(attempt = %attempt, "Redis connection succeeded after retries");
                }
                return Ok(manager);
            }
            Err(e) => {
                attempt += 1;
                if attempt > retry.max_retries {
                    warn!(attempts = %attempt, error = %e, "Giving up connecting to Redis");
                    return Err(e);
                }
                let delay = retry.delay_for(attempt);
                warn!(
                    attempt = %attempt,
                    max_retries = %retry.max_retries,
                    retry_in_ms = %delay.as_millis(),
                    error = %e,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
