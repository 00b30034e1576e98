//! Process configuration, read once from the environment at startup.

use std::time::Duration;

use keel_broker::BrokerConfig;

use crate::error::AppError;

/// Settings for the API server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// `PostgreSQL` connection string.
    pub database_url: String,
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Upper bound of the connection pool.
    pub database_max_connections: u32,
    /// Period of the publication sweep; `None` disables it.
    pub reconcile_interval: Option<Duration>,
    /// Age an unmarked event must reach before the sweep picks it up.
    pub reconcile_grace: Duration,
    /// Broker settings.
    pub broker: BrokerConfig,
}

fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T, AppError>
where
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("{key} must be a valid number: {e}"))),
    }
}

impl AppConfig {
    /// Reads the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is unset or a numeric
    /// variable does not parse.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `DATABASE_URL` is unset or a numeric
    /// variable does not parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let database_url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| AppError::Config("DATABASE_URL environment variable must be set".into()))?;
        let host = lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_owned());
        let port = parse("PORT", lookup("PORT"), 3000_u16)?;
        let database_max_connections =
            parse("DATABASE_MAX_CONNECTIONS", lookup("DATABASE_MAX_CONNECTIONS"), 10_u32)?;
        let interval_secs =
            parse("RECONCILE_INTERVAL_SECS", lookup("RECONCILE_INTERVAL_SECS"), 30_u64)?;
        let grace_secs = parse("RECONCILE_GRACE_SECS", lookup("RECONCILE_GRACE_SECS"), 60_u64)?;
        let broker = BrokerConfig::from_lookup(&lookup)?;

        Ok(Self {
            database_url,
            host,
            port,
            database_max_connections,
            reconcile_interval: (interval_secs > 0).then(|| Duration::from_secs(interval_secs)),
            reconcile_grace: Duration::from_secs(grace_secs),
            broker,
        })
    }

    /// `host:port` for binding the listener.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
