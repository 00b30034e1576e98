//! Broker configuration.

use std::time::Duration;

use crate::error::BrokerError;

/// Connection, naming and timing settings shared by producer and consumer.
///
/// The initial-offset policy is always "from the beginning" and
/// acknowledgements are always explicit; neither is configurable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Broker addresses.
    pub urls: Vec<String>,
    /// Durable consumer name; every worker process sharing it forms one
    /// consumer group.
    pub consumer_group: String,
    /// Subject prefix; topic `item.created` maps to `{prefix}.item.created`.
    pub subject_prefix: String,
    /// `JetStream` stream capturing `{prefix}.>`.
    pub stream: String,
    /// Upper bound on waiting for publish acknowledgements, per batch.
    pub flush_timeout_ms: u64,
    /// Upper bound on one poll of the consumer.
    pub poll_timeout_ms: u64,
    /// How long the broker waits for an acknowledgement before
    /// redelivering.
    pub ack_wait_secs: u64,
    /// Unacknowledged messages allowed per consumer.
    pub max_in_flight: i64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_owned()],
            consumer_group: "keel-workers".to_owned(),
            subject_prefix: "keel".to_owned(),
            stream: "KEEL_EVENTS".to_owned(),
            flush_timeout_ms: 5_000,
            poll_timeout_ms: 1_000,
            ack_wait_secs: 30,
            max_in_flight: 1,
        }
    }
}

impl BrokerConfig {
    /// Reads the configuration from the environment, falling back to the
    /// defaults for unset variables.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Config` when a numeric variable does not
    /// parse.
    pub fn from_env() -> Result<Self, BrokerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`BrokerConfig::from_env`] but reads variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Config` when a numeric variable does not
    /// parse.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, BrokerError> {
        let mut config = Self::default();
        if let Some(urls) = lookup("NATS_URLS") {
            config.urls = urls
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_owned)
                .collect();
        }
        if let Some(group) = lookup("BROKER_CONSUMER_GROUP") {
            config.consumer_group = group;
        }
        if let Some(prefix) = lookup("BROKER_SUBJECT_PREFIX") {
            config.subject_prefix = prefix;
        }
        if let Some(stream) = lookup("BROKER_STREAM") {
            config.stream = stream;
        }
        config.flush_timeout_ms = parse(&lookup, "BROKER_FLUSH_TIMEOUT_MS", config.flush_timeout_ms)?;
        config.poll_timeout_ms = parse(&lookup, "BROKER_POLL_TIMEOUT_MS", config.poll_timeout_ms)?;
        config.ack_wait_secs = parse(&lookup, "BROKER_ACK_WAIT_SECS", config.ack_wait_secs)?;
        config.max_in_flight = parse(&lookup, "BROKER_MAX_IN_FLIGHT", config.max_in_flight)?;

        if config.urls.is_empty() {
            return Err(BrokerError::Config("NATS_URLS must name at least one server".into()));
        }
        if config.max_in_flight < 1 {
            return Err(BrokerError::Config("BROKER_MAX_IN_FLIGHT must be at least 1".into()));
        }
        Ok(config)
    }

    /// Flush timeout as a `Duration`.
    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Poll timeout as a `Duration`.
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    /// Ack wait as a `Duration`.
    #[must_use]
    pub fn ack_wait(&self) -> Duration {
        Duration::from_secs(self.ack_wait_secs)
    }

    /// Full subject for a topic.
    #[must_use]
    pub fn subject_for(&self, topic: &str) -> String {
        format!("{}.{topic}", self.subject_prefix)
    }

    /// Topic for a full subject, if it carries this prefix.
    #[must_use]
    pub fn topic_of<'a>(&self, subject: &'a str) -> Option<&'a str> {
        subject
            .strip_prefix(self.subject_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('.'))
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, BrokerError>
where
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| BrokerError::Config(format!("{key} is invalid: {e}"))),
    }
}
