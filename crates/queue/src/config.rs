//! Queue configuration
//!
//! [`QueueConfig`] is resolved once, from builders or from `QUEUE_*`
//! environment variables, and validated before anything starts.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::MAX_TIME_OFFSET;
use crate::persistence::{DequeueFilter, DequeueOrder};
use crate::reliability::{BackoffLadder, ErrorPolicy};
use crate::scheduler::SchedulerConfig;
use crate::worker::PollerConfig;

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid environment variable {var}={value}: {reason}")]
    Env {
        var: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Lease heartbeat and reclaim settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatConfig {
    /// Stamp and renew heartbeats on leased messages
    pub enabled: bool,

    /// How often in-flight leases are renewed
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// A lease whose heartbeat is older than this is considered dead
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// How often the sweeper scans for dead leases
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,

    /// Delay applied to a reclaimed message before it is eligible again
    #[serde(with = "duration_millis")]
    pub reclaim_delay: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            reclaim_delay: Duration::ZERO,
        }
    }
}

impl HeartbeatConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Which ordering and filtering features dequeue uses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DequeueOptions {
    pub priority: bool,
    pub delay: bool,
    pub expiration: bool,

    /// Only consume messages sent with this route
    pub route: Option<String>,
}

impl Default for DequeueOptions {
    fn default() -> Self {
        let order = DequeueOrder::default();
        Self {
            priority: order.priority,
            delay: order.delay,
            expiration: order.expiration,
            route: None,
        }
    }
}

impl DequeueOptions {
    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn order(&self) -> DequeueOrder {
        DequeueOrder {
            priority: self.priority,
            delay: self.delay,
            expiration: self.expiration,
        }
    }

    /// Filter for a dequeue at `now`
    pub fn filter(&self, now: DateTime<Utc>, track_heartbeat: bool) -> DequeueFilter {
        let filter = DequeueFilter::new(now)
            .with_order(self.order())
            .with_heartbeat(track_heartbeat);
        match &self.route {
            Some(route) => filter.with_route(route.clone()),
            None => filter,
        }
    }
}

/// Removal of messages that expired while waiting
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpirationConfig {
    pub enabled: bool,

    #[serde(with = "duration_millis")]
    pub interval: Duration,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(60),
        }
    }
}

/// Work group the consumer submits its messages under
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkGroupConfig {
    pub name: String,
    pub concurrency_level: usize,
    pub max_queue_size: usize,
}

/// Complete queue consumer configuration
///
/// # Example
///
/// ```
/// use durable_queue::config::QueueConfig;
/// use std::time::Duration;
///
/// let config = QueueConfig::new("thumbnails")
///     .with_max_threads(8)
///     .with_work_group("images", 4, 2)
///     .with_shutdown_timeout(Duration::from_secs(10));
///
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Queue name (used in logs and by the PostgreSQL store)
    pub name: String,

    pub heartbeat: HeartbeatConfig,
    pub dequeue: DequeueOptions,
    pub scheduler: SchedulerConfig,
    pub work_group: Option<WorkGroupConfig>,
    pub poller: PollerConfig,
    pub error_policy: ErrorPolicy,

    /// Delays after consecutive receive errors
    pub receive_backoff: BackoffLadder,
    pub expiration: ExpirationConfig,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            heartbeat: HeartbeatConfig::default(),
            dequeue: DequeueOptions::default(),
            scheduler: SchedulerConfig::default(),
            work_group: None,
            poller: PollerConfig::default(),
            error_policy: ErrorPolicy::default(),
            receive_backoff: BackoffLadder::default(),
            expiration: ExpirationConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.scheduler.max_threads = max_threads;
        self
    }

    pub fn with_scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn with_work_group(
        mut self,
        name: impl Into<String>,
        concurrency_level: usize,
        max_queue_size: usize,
    ) -> Self {
        self.work_group = Some(WorkGroupConfig {
            name: name.into(),
            concurrency_level,
            max_queue_size,
        });
        self
    }

    pub fn with_heartbeat(mut self, config: HeartbeatConfig) -> Self {
        self.heartbeat = config;
        self
    }

    pub fn with_dequeue(mut self, options: DequeueOptions) -> Self {
        self.dequeue = options;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn with_receive_backoff(mut self, ladder: BackoffLadder) -> Self {
        self.receive_backoff = ladder;
        self
    }

    pub fn with_expiration(mut self, config: ExpirationConfig) -> Self {
        self.expiration = config;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Create configuration from `QUEUE_*` environment variables
    ///
    /// Unset variables keep their defaults; unparseable values are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = EnvReader { lookup: &lookup };
        let mut config = Self::default();

        if let Some(name) = lookup("QUEUE_NAME") {
            config.name = name;
        }

        if let Some(v) = env.parse("QUEUE_MAX_THREADS")? {
            config.scheduler.max_threads = v;
        }
        if let Some(v) = env.parse("QUEUE_MAX_QUEUE_SIZE")? {
            config.scheduler.max_queue_size = v;
        }
        if let Some(v) = env.millis("QUEUE_DRAIN_TIMEOUT_MS")? {
            config.scheduler.wait_for_drain = v;
        }

        if let Some(v) = env.parse("QUEUE_HEARTBEAT_ENABLED")? {
            config.heartbeat.enabled = v;
        }
        if let Some(v) = env.millis("QUEUE_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat.interval = v;
        }
        if let Some(v) = env.millis("QUEUE_HEARTBEAT_TIMEOUT_MS")? {
            config.heartbeat.timeout = v;
        }
        if let Some(v) = env.millis("QUEUE_SWEEP_INTERVAL_MS")? {
            config.heartbeat.sweep_interval = v;
        }

        if let Some(v) = env.parse("QUEUE_ENABLE_PRIORITY")? {
            config.dequeue.priority = v;
        }
        if let Some(v) = env.parse("QUEUE_ENABLE_DELAY")? {
            config.dequeue.delay = v;
        }
        if let Some(v) = env.parse("QUEUE_ENABLE_EXPIRATION")? {
            config.dequeue.expiration = v;
            config.expiration.enabled = v;
        }
        if let Some(route) = lookup("QUEUE_ROUTE") {
            config.dequeue.route = Some(route);
        }

        if let Some(v) = env.millis("QUEUE_POLL_MIN_MS")? {
            config.poller.min_interval = v;
        }
        if let Some(v) = env.millis("QUEUE_POLL_MAX_MS")? {
            config.poller.max_interval = v;
        }

        if let Some(v) = env.parse("QUEUE_MAX_RETRIES")? {
            config.error_policy.default.max_retries = v;
        }
        if let Some(v) = env.millis("QUEUE_RETRY_INITIAL_MS")? {
            config.error_policy.default.initial_interval = v;
        }

        if let Some(v) = env.millis("QUEUE_SHUTDOWN_TIMEOUT_MS")? {
            config.shutdown_timeout = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::invalid("name", "must not be empty"));
        }

        self.scheduler.validate()?;

        if let Some(group) = &self.work_group {
            if group.concurrency_level == 0 {
                return Err(ConfigError::invalid(
                    "work_group.concurrency_level",
                    "must be at least 1",
                ));
            }
        }

        if self.heartbeat.enabled {
            if self.heartbeat.interval.is_zero() {
                return Err(ConfigError::invalid("heartbeat.interval", "must be positive"));
            }
            if self.heartbeat.timeout <= self.heartbeat.interval {
                return Err(ConfigError::invalid(
                    "heartbeat.timeout",
                    "must be longer than the heartbeat interval",
                ));
            }
            if self.heartbeat.timeout > MAX_TIME_OFFSET {
                return Err(ConfigError::invalid(
                    "heartbeat.timeout",
                    format!("must not exceed {}s", MAX_TIME_OFFSET.as_secs()),
                ));
            }
            if self.heartbeat.sweep_interval.is_zero() {
                return Err(ConfigError::invalid(
                    "heartbeat.sweep_interval",
                    "must be positive",
                ));
            }
        }

        self.poller.validate()?;
        self.error_policy.validate()?;

        if self.expiration.enabled && self.expiration.interval.is_zero() {
            return Err(ConfigError::invalid("expiration.interval", "must be positive"));
        }

        Ok(())
    }
}

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn parse<T>(&self, var: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = (self.lookup)(var) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::Env {
                var: var.to_string(),
                value: value.clone(),
                reason: e.to_string(),
            })
    }

    fn millis(&self, var: &str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.parse::<u64>(var)?.map(Duration::from_millis))
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        u64::try_from(duration.as_millis())
            .unwrap_or(u64::MAX)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
