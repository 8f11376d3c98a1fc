use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3301")]
    pub port: u16,

    #[envconfig(from = "STORE_URL", default = "redis://localhost:6379/")]
    pub store_url: String,

    #[envconfig(from = "STORE_KEY_PREFIX", default = "dripgate")]
    pub key_prefix: String,

    #[envconfig(from = "DOWNSTREAM_BASE_URL", default = "http://localhost:8000")]
    pub downstream_base_url: String,

    #[envconfig(from = "DOWNSTREAM_API_KEY", default = "")]
    pub downstream_api_key: String,

    #[envconfig(from = "DOWNSTREAM_TIMEOUT_MS", default = "60000")]
    pub downstream_timeout: EnvMsDuration,

    #[envconfig(from = "DOWNSTREAM_MAX_RETRIES", default = "3")]
    pub downstream_max_retries: u32,

    #[envconfig(from = "DRIP_INTERVAL_MS", default = "10000")]
    pub drip_interval: EnvMsDuration,

    #[envconfig(from = "POLL_INTERVAL_MS", default = "500")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "JOB_RETRY_BASE_MS", default = "5000")]
    pub job_retry_base: EnvMsDuration,

    #[envconfig(from = "LEASE_MS", default = "300000")]
    pub lease: EnvMsDuration,

    #[envconfig(from = "LEASE_RENEW_MS", default = "30000")]
    pub lease_renew: EnvMsDuration,

    #[envconfig(from = "RESULT_TTL_SECONDS", default = "86400")]
    pub result_ttl_seconds: u64,

    #[envconfig(from = "CALLBACK_TIMEOUT_MS", default = "10000")]
    pub callback_timeout: EnvMsDuration,

    #[envconfig(from = "CALLBACK_MAX_RETRIES", default = "3")]
    pub callback_max_retries: u32,

    #[envconfig(from = "CALLBACK_RETRY_DELAY_MS", default = "1000")]
    pub callback_retry_delay: EnvMsDuration,

    #[envconfig(from = "GRACE_PERIOD_MS", default = "30000")]
    pub grace_period: EnvMsDuration,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_ms_duration_parses_millis() {
        let parsed: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(parsed.0, time::Duration::from_millis(1500));

        assert!("ten".parse::<EnvMsDuration>().is_err());
    }
}
