//! Receive polling with exponential backoff
//!
//! The consumer loop polls quickly while messages keep arriving and backs
//! off toward the maximum interval while the queue is empty.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::{duration_millis, ConfigError};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while messages are available
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval cap while idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier applied after each empty receive
    pub backoff_multiplier: f64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_interval.is_zero() {
            return Err(ConfigError::invalid("poller.min_interval", "must be positive"));
        }
        if self.max_interval < self.min_interval {
            return Err(ConfigError::invalid(
                "poller.max_interval",
                "must not be shorter than the minimum interval",
            ));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "poller.backoff_multiplier",
                "must be a finite value of at least 1.0",
            ));
        }
        Ok(())
    }
}

/// Poll interval state for one receive loop
///
/// Backs off exponentially when no message is found and resets to the
/// minimum interval when one is.
#[derive(Debug)]
pub struct MessagePoller {
    config: PollerConfig,
    current_interval: Duration,
    shutdown: CancellationToken,
}

impl MessagePoller {
    pub fn new(config: PollerConfig, shutdown: CancellationToken) -> Self {
        Self {
            current_interval: config.min_interval,
            config,
            shutdown,
        }
    }

    /// A message was received
    pub fn on_message(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    /// The queue was empty
    pub fn on_empty(&mut self) {
        let next = Duration::try_from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        )
        .unwrap_or(self.config.max_interval);
        self.current_interval = next.min(self.config.max_interval);
        trace!(
            interval_ms = self.current_interval.as_millis() as u64,
            "no messages, backing off"
        );
    }

    /// Wait for the current interval
    ///
    /// Returns `true` if shutdown was signalled during the wait.
    pub async fn wait(&self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = self.shutdown.cancelled() => {
                debug!("shutdown signalled during poll wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
