use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "PORT", default = "3300")]
    pub port: u16,

    #[envconfig(from = "STORE_URL", default = "redis://localhost:6379/")]
    pub store_url: String,

    #[envconfig(from = "STORE_KEY_PREFIX", default = "dripgate")]
    pub key_prefix: String,

    /// Shared secret expected in the x-webhook-secret header on every
    /// endpoint except the health probe.
    #[envconfig(from = "WEBHOOK_SECRET", default = "")]
    pub webhook_secret: String,

    #[envconfig(from = "MAX_BATCH_SIZE", default = "2000")]
    pub max_batch_size: usize,

    #[envconfig(from = "MAX_JOB_ATTEMPTS", default = "3")]
    pub max_job_attempts: u32,

    /// Used for completion estimates only; the worker owns the actual gate.
    #[envconfig(from = "DRIP_INTERVAL_MS", default = "10000")]
    pub drip_interval: EnvMsDuration,

    #[envconfig(from = "RATE_LIMIT_PER_MINUTE", default = "100")]
    pub rate_limit_per_minute: u32,

    #[envconfig(from = "BATCH_TTL_SECONDS", default = "172800")]
    pub batch_ttl_seconds: u64,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}
