//! Environment-driven configuration for the broker client, store client,
//! shutdown manager, and TTL policy.

use crate::retry::BackoffConfig;
use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment variable '{0}' is required but not set")]
    MissingEnvVar(String),
    #[error("failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
    #[error("shutdown_timeout must be within [1.0, 300.0] seconds, got {0}")]
    ShutdownTimeoutOutOfRange(f64),
}

/// Application environment, gating log format (pretty vs. JSON).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

pub(crate) fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub(crate) fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Retry/health-check parameters for one connection-managed client (the
/// broker or the store). Both clients share this shape; only their env
/// var prefixes (`BROKER_*` / `STORE_*`) differ.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    pub health_check_interval: Duration,
    pub backoff: BackoffConfig,
}

impl ConnectionConfig {
    fn from_env_prefixed(prefix: &str, url_key: &str, default_url: &str) -> Result<Self, ConfigError> {
        let url = env_or_default(url_key, default_url);
        let health_check_interval = Duration::from_secs_f64(env_parse(
            &format!("{prefix}_HEALTH_CHECK_INTERVAL"),
            30.0,
        )?);
        let max_attempts: u32 = env_parse(&format!("{prefix}_RECONNECT_MAX_RETRIES"), 10)?;
        let initial_delay = Duration::from_secs_f64(env_parse(
            &format!("{prefix}_RECONNECT_INITIAL_DELAY"),
            3.0,
        )?);
        let max_delay = Duration::from_secs_f64(env_parse(
            &format!("{prefix}_RECONNECT_MAX_DELAY"),
            30.0,
        )?);

        Ok(Self {
            url,
            health_check_interval,
            backoff: BackoffConfig::new(initial_delay, max_delay, max_attempts),
        })
    }
}

/// TTL policy in seconds by job status. A value of `0` means "no expiry".
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub completed_secs: u64,
    pub failed_secs: u64,
    pub active_secs: u64,
}

impl TtlPolicy {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            completed_secs: env_parse("JOB_TTL_COMPLETED", 604_800)?,
            failed_secs: env_parse("JOB_TTL_FAILED", 259_200)?,
            active_secs: env_parse("JOB_TTL_ACTIVE", 0)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: Environment,
    pub store: ConnectionConfig,
    pub broker: ConnectionConfig,
    pub shutdown_timeout: Duration,
    pub ttl: TtlPolicy,
}

/// Load and parse environment variable configuration. Fails fast
/// (`ConfigError`) on a malformed value or an out-of-range
/// `shutdown_timeout` — both are fatal configuration errors per contract.
impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let shutdown_timeout_secs: f64 = env_parse("SHUTDOWN_TIMEOUT", 30.0)?;
        if !(1.0..=300.0).contains(&shutdown_timeout_secs) {
            return Err(ConfigError::ShutdownTimeoutOutOfRange(shutdown_timeout_secs));
        }

        Ok(Self {
            environment: Environment::from_env(),
            store: ConnectionConfig::from_env_prefixed(
                "STORE",
                "STORE_URL",
                "redis://127.0.0.1:6379",
            )?,
            broker: ConnectionConfig::from_env_prefixed(
                "BROKER",
                "BROKER_URL",
                "amqp://127.0.0.1:5672/%2f",
            )?,
            shutdown_timeout: Duration::from_secs_f64(shutdown_timeout_secs),
            ttl: TtlPolicy::from_env()?,
        })
    }
}

/// Initialize tracing with environment-aware formatting: JSON in
/// production (for log aggregation), pretty-printed in development.
/// Infallible — a second call (common in tests) is a no-op.
pub fn init_tracing(environment: &Environment) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if environment.is_production() {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("debug")
        }
    });

    let result = if environment.is_production() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing already initialized, skipping");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_timeout_out_of_range_is_fatal() {
        temp_env(&[("SHUTDOWN_TIMEOUT", Some("0.5"))], || {
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::ShutdownTimeoutOutOfRange(_)));
        });

        temp_env(&[("SHUTDOWN_TIMEOUT", Some("301"))], || {
            let err = Config::from_env().unwrap_err();
            assert!(matches!(err, ConfigError::ShutdownTimeoutOutOfRange(_)));
        });
    }

    #[test]
    fn shutdown_timeout_defaults_to_30s() {
        temp_env(&[("SHUTDOWN_TIMEOUT", None)], || {
            let cfg = Config::from_env().unwrap();
            assert_eq!(cfg.shutdown_timeout, Duration::from_secs(30));
        });
    }

    #[test]
    fn ttl_policy_defaults_match_contract() {
        let ttl = TtlPolicy::from_env().unwrap();
        assert_eq!(ttl.completed_secs, 604_800);
        assert_eq!(ttl.failed_secs, 259_200);
        assert_eq!(ttl.active_secs, 0);
    }

    #[test]
    fn environment_defaults_to_development() {
        temp_env(&[("APP_ENV", None)], || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn environment_production_case_insensitive() {
        temp_env(&[("APP_ENV", Some("PRODUCTION"))], || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });
    }

    /// Minimal sequential env-var scoping helper (this module's tests
    /// mutate global process state, so they must not run concurrently
    /// with each other — `cargo test` runs `#[test]`s in the same binary
    /// in parallel by default, but each call here saves and restores the
    /// prior value, keeping repeated runs deterministic).
    fn temp_env(vars: &[(&str, Option<&str>)], f: impl FnOnce()) {
        let saved: Vec<(String, Option<String>)> = vars
            .iter()
            .map(|(k, _)| (k.to_string(), env::var(k).ok()))
            .collect();

        for (k, v) in vars {
            match v {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }

        f();

        for (k, v) in saved {
            match v {
                Some(val) => env::set_var(&k, val),
                None => env::remove_var(&k),
            }
        }
    }
}
