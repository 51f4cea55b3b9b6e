use crate::{ConfigError, FromEnv, env_parse, env_required};

/// Redis connection settings.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub uri: String,
    /// Connection attempts at startup before giving up.
    pub connect_retries: u32,
}

impl RedisConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connect_retries: 5,
        }
    }
}

impl FromEnv for RedisConfig {
    /// `REDIS_HOST` is required (full URL, e.g. `redis://localhost:6379`);
    /// `REDIS_CONNECT_RETRIES` defaults to 5.
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            uri: env_required("REDIS_HOST")?,
            connect_retries: env_parse("REDIS_CONNECT_RETRIES", 5)?,
        })
    }
}
