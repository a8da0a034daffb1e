use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::assignment::AssignmentStrategy;
use crate::broker_config::{BrokerConfig, Credentials};
use crate::error::ConfigError;

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_REBALANCE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_COMMIT_INTERVAL: Duration = Duration::from_secs(1);

/// Where a claim starts when the group has no committed offset for it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialOffset {
    #[default]
    Oldest,
    Newest,
}

impl FromStr for InitialOffset {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "oldest" | "earliest" => Ok(InitialOffset::Oldest),
            "newest" | "latest" => Ok(InitialOffset::Newest),
            other => Err(ConfigError::Invalid {
                key: "INITIAL_OFFSET",
                reason: format!("expected oldest or newest, got '{other}'"),
            }),
        }
    }
}

/// What a claim does when the processing callback returns an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingErrorPolicy {
    /// Log, mark the message anyway, keep consuming
    #[default]
    LogAndContinue,
    /// Stop the claim and hand the error to the caller
    Halt,
}

impl FromStr for ProcessingErrorPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" | "log" => Ok(ProcessingErrorPolicy::LogAndContinue),
            "halt" | "stop" => Ok(ProcessingErrorPolicy::Halt),
            other => Err(ConfigError::Invalid {
                key: "PROCESSING_ERRORS",
                reason: format!("expected continue or halt, got '{other}'"),
            }),
        }
    }
}

/// Consumer group behaviour
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub group_id: String,
    pub topics: Vec<String>,
    pub strategy: AssignmentStrategy,
    pub session_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub rebalance_timeout: Duration,
    pub commit_interval: Duration,
    pub initial_offset: InitialOffset,
    pub processing_errors: ProcessingErrorPolicy,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub max_join_attempts: u32,
    pub fetch_max_messages: usize,
    pub fetch_max_wait: Duration,
}

impl GroupConfig {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            group_id: group_id.into(),
            topics,
            strategy: AssignmentStrategy::RoundRobin,
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            rebalance_timeout: DEFAULT_REBALANCE_TIMEOUT,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            initial_offset: InitialOffset::Oldest,
            processing_errors: ProcessingErrorPolicy::LogAndContinue,
            retry_backoff: Duration::from_millis(250),
            max_retry_backoff: Duration::from_secs(10),
            max_join_attempts: 10,
            fetch_max_messages: 500,
            fetch_max_wait: Duration::from_millis(250),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::Missing("GROUP_ID"));
        }
        if self.topics.is_empty() || self.topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Missing("TOPICS"));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval * 3 > self.session_timeout {
            return Err(ConfigError::Invalid {
                key: "HEARTBEAT_INTERVAL_MS",
                reason: format!(
                    "{:?} must be non-zero and at most a third of the session timeout {:?}",
                    self.heartbeat_interval, self.session_timeout
                ),
            });
        }
        if self.commit_interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "COMMIT_INTERVAL_MS",
                reason: "must be non-zero".into(),
            });
        }
        if self.fetch_max_messages == 0 {
            return Err(ConfigError::Invalid {
                key: "FETCH_MAX_MESSAGES",
                reason: "must be non-zero".into(),
            });
        }
        if self.max_join_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "MAX_JOIN_ATTEMPTS",
                reason: "must be non-zero".into(),
            });
        }
        if self.max_retry_backoff < self.retry_backoff {
            return Err(ConfigError::Invalid {
                key: "MAX_RETRY_BACKOFF_MS",
                reason: "must not be below RETRY_BACKOFF_MS".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // --- Server ---
    pub port: String,

    // --- Cluster ---
    pub broker: BrokerConfig,

    // --- Group ---
    pub group: GroupConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        // dotenv belongs HERE, nowhere else
        dotenvy::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds and validates the configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let endpoints = split_list(&lookup("BROKER_ADDRS").context("BROKER_ADDRS missing")?);
        let username = lookup("BROKER_USERNAME").context("BROKER_USERNAME missing")?;
        let password = lookup("BROKER_PASSWORD").unwrap_or_default();

        let tls = parse_or(&lookup, "BROKER_TLS", true)?;
        let sasl = parse_or(&lookup, "BROKER_SASL", true)?;
        let client_id = lookup("CLIENT_ID").unwrap_or_else(|| username.clone());

        let mut broker = BrokerConfig::new(endpoints, client_id);
        broker.tls = tls;
        if sasl {
            broker.credentials = Some(Credentials::new(username.clone(), password));
        }

        let group_id = lookup("GROUP_ID").unwrap_or_else(|| format!("{username}.consumer-group"));
        let topics = split_list(&lookup("TOPICS").context("TOPICS missing")?);

        let mut group = GroupConfig::new(group_id, topics);
        if let Some(strategy) = lookup("ASSIGNMENT_STRATEGY") {
            group.strategy = strategy.parse()?;
        }
        if let Some(initial) = lookup("INITIAL_OFFSET") {
            group.initial_offset = initial.parse()?;
        }
        if let Some(policy) = lookup("PROCESSING_ERRORS") {
            group.processing_errors = policy.parse()?;
        }
        group.session_timeout = millis_or(&lookup, "SESSION_TIMEOUT_MS", group.session_timeout)?;
        group.heartbeat_interval =
            millis_or(&lookup, "HEARTBEAT_INTERVAL_MS", group.heartbeat_interval)?;
        group.rebalance_timeout =
            millis_or(&lookup, "REBALANCE_TIMEOUT_MS", group.rebalance_timeout)?;
        group.commit_interval = millis_or(&lookup, "COMMIT_INTERVAL_MS", group.commit_interval)?;
        group.retry_backoff = millis_or(&lookup, "RETRY_BACKOFF_MS", group.retry_backoff)?;
        group.max_retry_backoff =
            millis_or(&lookup, "MAX_RETRY_BACKOFF_MS", group.max_retry_backoff)?;
        group.fetch_max_wait = millis_or(&lookup, "FETCH_MAX_WAIT_MS", group.fetch_max_wait)?;
        group.max_join_attempts = parse_or(&lookup, "MAX_JOIN_ATTEMPTS", group.max_join_attempts)?;
        group.fetch_max_messages =
            parse_or(&lookup, "FETCH_MAX_MESSAGES", group.fetch_max_messages)?;

        let config = Self {
            port: lookup("PORT").unwrap_or_else(|| "3001".into()),
            broker,
            group,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.broker.endpoints.is_empty() {
            return Err(ConfigError::Missing("BROKER_ADDRS"));
        }
        for endpoint in &self.broker.endpoints {
            let valid = endpoint
                .rsplit_once(':')
                .map(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok())
                .unwrap_or(false);
            if !valid {
                return Err(ConfigError::Invalid {
                    key: "BROKER_ADDRS",
                    reason: format!("'{endpoint}' is not host:port"),
                });
            }
        }
        if let Some(credentials) = &self.broker.credentials {
            if credentials.username.trim().is_empty() {
                return Err(ConfigError::Missing("BROKER_USERNAME"));
            }
            // credentials never travel in clear text
            if !self.broker.tls {
                return Err(ConfigError::Invalid {
                    key: "BROKER_TLS",
                    reason: "SASL requires TLS".into(),
                });
            }
        }
        if self.port.parse::<u16>().is_err() {
            return Err(ConfigError::Invalid {
                key: "PORT",
                reason: format!("'{}' is not a port", self.port),
            });
        }
        self.group.validate()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> std::result::Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key,
            reason: format!("cannot parse '{raw}'"),
        }),
        None => Ok(default),
    }
}

fn millis_or<F>(lookup: &F, key: &'static str, default: Duration) -> std::result::Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let default_ms = default.as_millis() as u64;
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}
