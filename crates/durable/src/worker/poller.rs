//! Polling with exponential backoff
//!
//! Both workers claim rows on an adaptive interval: back off while the
//! store has nothing due, snap back to the minimum once work shows up.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};

/// Polling configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when work is available)
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    pub max_interval: Duration,

    /// Backoff multiplier when nothing was claimed
    pub backoff_multiplier: f64,

    /// Maximum rows to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        if self.max_interval < interval {
            self.max_interval = interval;
        }
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval.max(self.min_interval);
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Adaptive poll interval
pub struct Backoff {
    config: PollerConfig,
    current_interval: Duration,
}

impl Backoff {
    pub fn new(config: PollerConfig) -> Self {
        Self {
            current_interval: config.min_interval,
            config,
        }
    }

    /// Record how many rows the last poll claimed
    pub fn record(&mut self, claimed: usize) {
        if claimed == 0 {
            self.increase();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "Nothing claimed, backing off"
            );
        } else {
            self.reset();
        }
    }

    /// Wait for the current interval
    ///
    /// Returns `true` if shutdown was signaled while waiting.
    pub async fn wait(&self, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        if *shutdown_rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    fn reset(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(5));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(2.0)
            .with_batch_size(20);

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert_eq!(config.batch_size, 20);
    }

    #[test]
    fn test_backoff_grows_and_resets() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);
        let mut backoff = Backoff::new(config);

        backoff.record(0);
        assert_eq!(backoff.current_interval(), Duration::from_millis(200));
        backoff.record(0);
        assert_eq!(backoff.current_interval(), Duration::from_millis(300));

        backoff.record(3);
        assert_eq!(backoff.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_returns_on_shutdown() {
        let backoff = Backoff::new(PollerConfig::new().with_min_interval(Duration::from_secs(60)));
        let (tx, mut rx) = watch::channel(false);

        let waiter = tokio::spawn(async move { backoff.wait(&mut rx).await });
        tx.send(true).unwrap();

        assert!(waiter.await.unwrap());
    }
}
