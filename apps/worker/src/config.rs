use std::env;

use thiserror::Error;

/// Worker configuration, read from the environment once at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub db_url: Option<String>,
    pub lnd_socket: Option<String>,
    pub lnd_cert: Option<String>,
    pub lnd_macaroon: Option<String>,
    pub job_concurrency: usize,
    pub queue_poll_interval_ms: u64,
    pub job_retry_limit: u32,
    pub job_retry_delay_seconds: u64,
    pub payment_timeout_seconds: u64,
    pub check_withdrawal_delay_seconds: u64,
    pub subscribe_retry_base_ms: u64,
    pub subscribe_retry_max_ms: u64,
    pub subscribe_retry_jitter_ms: u64,
    pub bolt11_retention_days: i64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid SATBANK_JOB_CONCURRENCY: {0}")]
    InvalidJobConcurrency(String),
    #[error("invalid SATBANK_QUEUE_POLL_INTERVAL_MS: {0}")]
    InvalidQueuePollIntervalMs(String),
    #[error("invalid SATBANK_JOB_RETRY_LIMIT: {0}")]
    InvalidJobRetryLimit(String),
    #[error("invalid SATBANK_JOB_RETRY_DELAY_SECONDS: {0}")]
    InvalidJobRetryDelaySeconds(String),
    #[error("invalid SATBANK_PAYMENT_TIMEOUT_SECONDS: {0}")]
    InvalidPaymentTimeoutSeconds(String),
    #[error("invalid SATBANK_CHECK_WITHDRAWAL_DELAY_SECONDS: {0}")]
    InvalidCheckWithdrawalDelaySeconds(String),
    #[error("invalid SATBANK_SUBSCRIBE_RETRY_BASE_MS: {0}")]
    InvalidSubscribeRetryBaseMs(String),
    #[error("invalid SATBANK_SUBSCRIBE_RETRY_MAX_MS: {0}")]
    InvalidSubscribeRetryMaxMs(String),
    #[error("invalid SATBANK_SUBSCRIBE_RETRY_JITTER_MS: {0}")]
    InvalidSubscribeRetryJitterMs(String),
    #[error("invalid SATBANK_BOLT11_RETENTION_DAYS: {0}")]
    InvalidBolt11RetentionDays(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let service_name = lookup("SATBANK_SERVICE_NAME")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "satbank-worker".to_string());
        let db_url = optional(&lookup, "DB_URL").or_else(|| optional(&lookup, "DATABASE_URL"));
        let lnd_socket = optional(&lookup, "SATBANK_LND_SOCKET");
        let lnd_cert = optional(&lookup, "SATBANK_LND_CERT");
        let lnd_macaroon = optional(&lookup, "SATBANK_LND_MACAROON");

        let job_concurrency = parse_u64_setting(
            &lookup,
            "SATBANK_JOB_CONCURRENCY",
            4,
            1,
            64,
            ConfigError::InvalidJobConcurrency,
        )?;
        let job_concurrency = usize::try_from(job_concurrency)
            .map_err(|error| ConfigError::InvalidJobConcurrency(error.to_string()))?;
        let queue_poll_interval_ms = parse_u64_setting(
            &lookup,
            "SATBANK_QUEUE_POLL_INTERVAL_MS",
            1_000,
            50,
            60_000,
            ConfigError::InvalidQueuePollIntervalMs,
        )?;
        let job_retry_limit = parse_u64_setting(
            &lookup,
            "SATBANK_JOB_RETRY_LIMIT",
            21,
            0,
            100,
            ConfigError::InvalidJobRetryLimit,
        )?;
        let job_retry_limit = u32::try_from(job_retry_limit)
            .map_err(|error| ConfigError::InvalidJobRetryLimit(error.to_string()))?;
        let job_retry_delay_seconds = parse_u64_setting(
            &lookup,
            "SATBANK_JOB_RETRY_DELAY_SECONDS",
            30,
            1,
            3_600,
            ConfigError::InvalidJobRetryDelaySeconds,
        )?;
        let payment_timeout_seconds = parse_u64_setting(
            &lookup,
            "SATBANK_PAYMENT_TIMEOUT_SECONDS",
            600,
            30,
            3_600,
            ConfigError::InvalidPaymentTimeoutSeconds,
        )?;
        let check_withdrawal_delay_seconds = parse_u64_setting(
            &lookup,
            "SATBANK_CHECK_WITHDRAWAL_DELAY_SECONDS",
            10,
            0,
            3_600,
            ConfigError::InvalidCheckWithdrawalDelaySeconds,
        )?;
        let subscribe_retry_base_ms = parse_u64_setting(
            &lookup,
            "SATBANK_SUBSCRIBE_RETRY_BASE_MS",
            1_000,
            100,
            60_000,
            ConfigError::InvalidSubscribeRetryBaseMs,
        )?;
        let mut subscribe_retry_max_ms = parse_u64_setting(
            &lookup,
            "SATBANK_SUBSCRIBE_RETRY_MAX_MS",
            30_000,
            100,
            300_000,
            ConfigError::InvalidSubscribeRetryMaxMs,
        )?;
        if subscribe_retry_max_ms < subscribe_retry_base_ms {
            subscribe_retry_max_ms = subscribe_retry_base_ms;
        }
        let subscribe_retry_jitter_ms = parse_u64_setting(
            &lookup,
            "SATBANK_SUBSCRIBE_RETRY_JITTER_MS",
            250,
            0,
            10_000,
            ConfigError::InvalidSubscribeRetryJitterMs,
        )?;
        let bolt11_retention_days = parse_i64_setting(
            &lookup,
            "SATBANK_BOLT11_RETENTION_DAYS",
            10,
            1,
            365,
            ConfigError::InvalidBolt11RetentionDays,
        )?;

        Ok(Self {
            service_name,
            db_url,
            lnd_socket,
            lnd_cert,
            lnd_macaroon,
            job_concurrency,
            queue_poll_interval_ms,
            job_retry_limit,
            job_retry_delay_seconds,
            payment_timeout_seconds,
            check_withdrawal_delay_seconds,
            subscribe_retry_base_ms,
            subscribe_retry_max_ms,
            subscribe_retry_jitter_ms,
            bolt11_retention_days,
        })
    }
}

fn optional(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_u64_setting(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
    min: u64,
    max: u64,
    wrap: fn(String) -> ConfigError,
) -> Result<u64, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|error| wrap(error.to_string()))
            .map(|value| value.clamp(min, max)),
        None => Ok(default),
    }
}

fn parse_i64_setting(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: i64,
    min: i64,
    max: i64,
    wrap: fn(String) -> ConfigError,
) -> Result<i64, ConfigError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map_err(|error| wrap(error.to_string()))
            .map(|value| value.clamp(min, max)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{Config, ConfigError};

    #[test]
    fn defaults_apply_when_env_is_empty() {
        let config = Config::from_lookup(|_| None).expect("config parse");
        assert_eq!(config.service_name, "satbank-worker");
        assert_eq!(config.db_url, None);
        assert_eq!(config.lnd_socket, None);
        assert_eq!(config.job_concurrency, 4);
        assert_eq!(config.queue_poll_interval_ms, 1_000);
        assert_eq!(config.job_retry_limit, 21);
        assert_eq!(config.payment_timeout_seconds, 600);
        assert_eq!(config.check_withdrawal_delay_seconds, 10);
        assert_eq!(config.bolt11_retention_days, 10);
    }

    #[test]
    fn overrides_apply_and_clamp() {
        let values = HashMap::from([
            ("SATBANK_SERVICE_NAME", "satbank-worker-blue"),
            ("DB_URL", "postgres://localhost/satbank"),
            ("SATBANK_LND_SOCKET", " lnd.internal:8080 "),
            ("SATBANK_JOB_CONCURRENCY", "500"),
            ("SATBANK_QUEUE_POLL_INTERVAL_MS", "10"),
            ("SATBANK_JOB_RETRY_LIMIT", "3"),
            ("SATBANK_BOLT11_RETENTION_DAYS", "30"),
        ]);
        let config = Config::from_lookup(|key| values.get(key).map(ToString::to_string))
            .expect("config parse");
        assert_eq!(config.service_name, "satbank-worker-blue");
        assert_eq!(config.db_url.as_deref(), Some("postgres://localhost/satbank"));
        assert_eq!(config.lnd_socket.as_deref(), Some("lnd.internal:8080"));
        assert_eq!(config.job_concurrency, 64);
        assert_eq!(config.queue_poll_interval_ms, 50);
        assert_eq!(config.job_retry_limit, 3);
        assert_eq!(config.bolt11_retention_days, 30);
    }

    #[test]
    fn database_url_is_a_fallback_for_db_url() {
        let values = HashMap::from([("DATABASE_URL", "postgres://fallback/satbank")]);
        let config = Config::from_lookup(|key| values.get(key).map(ToString::to_string))
            .expect("config parse");
        assert_eq!(config.db_url.as_deref(), Some("postgres://fallback/satbank"));
    }

    #[test]
    fn invalid_numbers_are_rejected_per_variable() {
        let values = HashMap::from([("SATBANK_JOB_CONCURRENCY", "not-a-number")]);
        let error = Config::from_lookup(|key| values.get(key).map(ToString::to_string))
            .expect_err("invalid value should fail");
        match error {
            ConfigError::InvalidJobConcurrency(message) => {
                assert!(message.contains("invalid digit"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn subscribe_retry_max_is_raised_to_base() {
        let values = HashMap::from([
            ("SATBANK_SUBSCRIBE_RETRY_BASE_MS", "5000"),
            ("SATBANK_SUBSCRIBE_RETRY_MAX_MS", "1000"),
        ]);
        let config = Config::from_lookup(|key| values.get(key).map(ToString::to_string))
            .expect("config parse");
        assert_eq!(config.subscribe_retry_base_ms, 5_000);
        assert_eq!(config.subscribe_retry_max_ms, 5_000);
    }

    #[test]
    fn blank_values_read_as_unset() {
        let values = HashMap::from([("SATBANK_LND_SOCKET", "   "), ("DB_URL", "")]);
        let config = Config::from_lookup(|key| values.get(key).map(ToString::to_string))
            .expect("config parse");
        assert_eq!(config.lnd_socket, None);
        assert_eq!(config.db_url, None);
    }
}
