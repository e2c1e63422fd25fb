//! Application configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use domain::FeeSchedule;
use saga::{OrchestratorConfig, ReconcilePolicy};
use thiserror::Error;

/// A variable was set to something unusable.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("Unknown provider: {0} (supported: mock)")]
    UnknownProvider(String),
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `DATABASE_URL`: PostgreSQL URL; in-memory stores when unset
/// - `DATABASE_MAX_CONNECTIONS`: pool size (default: `10`)
/// - `FEE_DIVISOR`: `fee = amount / divisor` (default: `40`)
/// - `PROVIDER_NAME`: payment provider (default: `"mock"`)
/// - `PROVIDER_DEADLINE_MS`: pay deadline (default: `5000`)
/// - `PROVIDER_FAILURE_RATE`: mock decline percentage (default: `0`)
/// - `PAY_RETRIES`: retries of ambiguous payments on idempotent providers (default: `0`)
/// - `RECONCILE_INTERVAL_SECS` (default: `30`), `RECONCILE_GRACE_SECS` (default: `60`),
///   `RECONCILE_MAX_AGE_SECS` (default: `3600`), `RECONCILE_BATCH_SIZE` (default: `100`)
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub fee_schedule: FeeSchedule,
    pub provider_name: String,
    pub provider_deadline: Duration,
    pub provider_failure_rate: u8,
    pub pay_retries: u32,
    pub reconcile_interval: Duration,
    pub reconcile_grace: Duration,
    pub reconcile_max_age: Duration,
    pub reconcile_batch_size: usize,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, which returns a variable's value if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let text = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let fee_divisor: i64 = parse(&lookup, "FEE_DIVISOR", defaults.fee_schedule.divisor())?;
        let fee_schedule = FeeSchedule::new(fee_divisor).map_err(|e| ConfigError::Invalid {
            key: "FEE_DIVISOR",
            value: fee_divisor.to_string(),
            reason: e.to_string(),
        })?;

        let provider_name = text("PROVIDER_NAME").unwrap_or(defaults.provider_name);
        if provider_name != "mock" {
            return Err(ConfigError::UnknownProvider(provider_name));
        }

        let provider_failure_rate: u8 = parse(&lookup, "PROVIDER_FAILURE_RATE", 0)?;
        if provider_failure_rate > 100 {
            return Err(ConfigError::Invalid {
                key: "PROVIDER_FAILURE_RATE",
                value: provider_failure_rate.to_string(),
                reason: "must be a percentage between 0 and 100".to_string(),
            });
        }

        Ok(Self {
            host: text("HOST").unwrap_or(defaults.host),
            port: parse(&lookup, "PORT", defaults.port)?,
            log_level: text("RUST_LOG").unwrap_or(defaults.log_level),
            database_url: text("DATABASE_URL"),
            database_max_connections: parse(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
            fee_schedule,
            provider_name,
            provider_deadline: Duration::from_millis(parse(&lookup, "PROVIDER_DEADLINE_MS", 5_000)?),
            provider_failure_rate,
            pay_retries: parse(&lookup, "PAY_RETRIES", defaults.pay_retries)?,
            reconcile_interval: Duration::from_secs(positive(&lookup, "RECONCILE_INTERVAL_SECS", 30)?),
            reconcile_grace: Duration::from_secs(parse(&lookup, "RECONCILE_GRACE_SECS", 60)?),
            reconcile_max_age: Duration::from_secs(parse(&lookup, "RECONCILE_MAX_AGE_SECS", 3_600)?),
            reconcile_batch_size: positive(&lookup, "RECONCILE_BATCH_SIZE", 100)?,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            fee_schedule: self.fee_schedule,
            provider_deadline: self.provider_deadline,
            pay_retries: self.pay_retries,
        }
    }

    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            interval: self.reconcile_interval,
            grace_period: self.reconcile_grace,
            max_age: self.reconcile_max_age,
            batch_size: self.reconcile_batch_size,
            ..ReconcilePolicy::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        let policy = ReconcilePolicy::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            database_max_connections: 10,
            fee_schedule: FeeSchedule::default(),
            provider_name: "mock".to_string(),
            provider_deadline: saga::DEFAULT_PROVIDER_DEADLINE,
            provider_failure_rate: 0,
            pay_retries: 0,
            reconcile_interval: policy.interval,
            reconcile_grace: policy.grace_period,
            reconcile_max_age: policy.max_age,
            reconcile_batch_size: policy.batch_size,
        }
    }
}

fn parse<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => {
            value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
                key,
                value,
                reason: e.to_string(),
            })
        }
        _ => Ok(default),
    }
}

fn positive<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let value = parse(lookup, key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.fee_schedule.divisor(), 40);
        assert_eq!(config.provider_deadline, Duration::from_secs(5));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn test_empty_environment_matches_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "8080"),
            ("DATABASE_URL", "postgres://localhost/ppob"),
            ("FEE_DIVISOR", "50"),
            ("PROVIDER_DEADLINE_MS", "1500"),
            ("PROVIDER_FAILURE_RATE", "10"),
            ("PAY_RETRIES", "2"),
            ("RECONCILE_GRACE_SECS", "120"),
            ("RECONCILE_BATCH_SIZE", "25"),
        ]))
        .unwrap();

        assert_eq!(config.addr(), "127.0.0.1:8080");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/ppob")
        );
        assert_eq!(config.fee_schedule.divisor(), 50);
        assert_eq!(config.provider_failure_rate, 10);

        let saga = config.orchestrator_config();
        assert_eq!(saga.provider_deadline, Duration::from_millis(1500));
        assert_eq!(saga.pay_retries, 2);

        let policy = config.reconcile_policy();
        assert_eq!(policy.grace_period, Duration::from_secs(120));
        assert_eq!(policy.batch_size, 25);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let bad_port = Config::from_lookup(lookup(&[("PORT", "eighty")]));
        assert!(matches!(
            bad_port,
            Err(ConfigError::Invalid { key: "PORT", .. })
        ));

        let zero_divisor = Config::from_lookup(lookup(&[("FEE_DIVISOR", "0")]));
        assert!(matches!(
            zero_divisor,
            Err(ConfigError::Invalid {
                key: "FEE_DIVISOR",
                ..
            })
        ));

        let rate = Config::from_lookup(lookup(&[("PROVIDER_FAILURE_RATE", "150")]));
        assert!(rate.is_err());

        let interval = Config::from_lookup(lookup(&[("RECONCILE_INTERVAL_SECS", "0")]));
        assert!(interval.is_err());
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let result = Config::from_lookup(lookup(&[("PROVIDER_NAME", "acme")]));
        assert_eq!(
            result,
            Err(ConfigError::UnknownProvider("acme".to_string()))
        );
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }
}
