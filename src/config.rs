//! Runtime configuration.
//!
//! Loaded from `COURSEBOOK_*` environment variables, falling back to the
//! defaults in [`Config::default`].

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::Amount;
use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum wait for a session row or table lock.
    pub lock_timeout: Duration,
    /// Attempts for a reservation that keeps hitting lock timeouts.
    pub reserve_max_attempts: u32,
    /// Backoff before the second reservation attempt; doubles each retry.
    pub reserve_backoff: Duration,
    /// Bound on every payment provider call.
    pub gateway_timeout: Duration,
    /// ISO currency code sent to the provider.
    pub currency: String,
    pub webhook_secret: String,
    /// Accepted age of a webhook signature timestamp.
    pub webhook_tolerance: Duration,
    /// Processing attempts before an event is left for manual review.
    pub webhook_max_attempts: u32,
    pub outbox_max_attempts: u32,
    /// How long a claimed side effect may stay in flight before another
    /// drain takes it back.
    pub outbox_lease: Duration,
    /// Delivered and dead-lettered side effects are kept this long.
    pub outbox_retention: Duration,
    /// Groups above this size get a warning pointing to the group process.
    pub large_group_threshold: u32,
    /// Availability at or below this emits a low-capacity warning.
    pub low_availability_threshold: u32,
    pub price_tolerance: Amount,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
            reserve_max_attempts: 3,
            reserve_backoff: Duration::from_millis(50),
            gateway_timeout: Duration::from_secs(10),
            currency: "gbp".to_string(),
            webhook_secret: "whsec_dev".to_string(),
            webhook_tolerance: Duration::from_secs(300),
            webhook_max_attempts: 3,
            outbox_max_attempts: 5,
            outbox_lease: Duration::from_secs(60),
            outbox_retention: Duration::from_secs(7 * 24 * 60 * 60),
            large_group_threshold: 10,
            low_availability_threshold: 5,
            price_tolerance: Amount::from_minor_units(1),
        }
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Unset variables keep their default; set but unparsable ones are an
    /// error rather than silently ignored.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            lock_timeout: millis("COURSEBOOK_LOCK_TIMEOUT_MS", defaults.lock_timeout)?,
            reserve_max_attempts: parsed(
                "COURSEBOOK_RESERVE_MAX_ATTEMPTS",
                defaults.reserve_max_attempts,
            )?,
            reserve_backoff: millis("COURSEBOOK_RESERVE_BACKOFF_MS", defaults.reserve_backoff)?,
            gateway_timeout: millis("COURSEBOOK_GATEWAY_TIMEOUT_MS", defaults.gateway_timeout)?,
            currency: env::var("COURSEBOOK_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or(defaults.currency),
            webhook_secret: env::var("COURSEBOOK_WEBHOOK_SECRET")
                .unwrap_or(defaults.webhook_secret),
            webhook_tolerance: Duration::from_secs(parsed(
                "COURSEBOOK_WEBHOOK_TOLERANCE_SECS",
                defaults.webhook_tolerance.as_secs(),
            )?),
            webhook_max_attempts: parsed(
                "COURSEBOOK_WEBHOOK_MAX_ATTEMPTS",
                defaults.webhook_max_attempts,
            )?,
            outbox_max_attempts: parsed(
                "COURSEBOOK_OUTBOX_MAX_ATTEMPTS",
                defaults.outbox_max_attempts,
            )?,
            outbox_lease: Duration::from_secs(parsed(
                "COURSEBOOK_OUTBOX_LEASE_SECS",
                defaults.outbox_lease.as_secs(),
            )?),
            outbox_retention: Duration::from_secs(parsed(
                "COURSEBOOK_OUTBOX_RETENTION_SECS",
                defaults.outbox_retention.as_secs(),
            )?),
            large_group_threshold: parsed(
                "COURSEBOOK_LARGE_GROUP_THRESHOLD",
                defaults.large_group_threshold,
            )?,
            low_availability_threshold: parsed(
                "COURSEBOOK_LOW_AVAILABILITY_THRESHOLD",
                defaults.low_availability_threshold,
            )?,
            price_tolerance: parsed("COURSEBOOK_PRICE_TOLERANCE", defaults.price_tolerance)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.webhook_secret.is_empty() {
            return Err(ConfigError::Empty("COURSEBOOK_WEBHOOK_SECRET"));
        }
        if self.currency.is_empty() {
            return Err(ConfigError::Empty("COURSEBOOK_CURRENCY"));
        }
        if self.reserve_max_attempts == 0 {
            return Err(ConfigError::Zero("COURSEBOOK_RESERVE_MAX_ATTEMPTS"));
        }
        if self.webhook_max_attempts == 0 {
            return Err(ConfigError::Zero("COURSEBOOK_WEBHOOK_MAX_ATTEMPTS"));
        }
        if self.outbox_max_attempts == 0 {
            return Err(ConfigError::Zero("COURSEBOOK_OUTBOX_MAX_ATTEMPTS"));
        }
        Ok(())
    }
}

fn parsed<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

fn millis(key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    parsed(key, default.as_millis() as u64).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.webhook_max_attempts, 3);
        assert_eq!(config.price_tolerance.to_string(), "0.01");
    }

    #[test]
    fn validate_rejects_zero_retry_cap() {
        let config = Config {
            reserve_max_attempts: 0,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Zero(_))));
    }

    #[test]
    fn validate_rejects_empty_secret() {
        let config = Config {
            webhook_secret: String::new(),
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Empty(_))));
    }

    #[test]
    fn parsed_falls_back_to_default_when_unset() {
        let value: u32 = parsed("COURSEBOOK_TEST_SURELY_UNSET_KEY", 7).unwrap();
        assert_eq!(value, 7);
    }
}
