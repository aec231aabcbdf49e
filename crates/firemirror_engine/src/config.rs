//! Configuration for the mirror engine.

use crate::reconcile::SnapshotPolicy;
use rand::Rng;
use std::time::Duration;

/// How the remote snapshot is merged into the local replica at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullStrategy {
    /// Skip the remote fetch; start from local data only.
    None,
    /// Add remote keys that are absent locally; never overwrite.
    #[default]
    MissingOnly,
    /// Replace the local replica with the remote snapshot.
    Everything,
}

/// What happens after hydration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamingOptions {
    /// No change stream; only local writes produce events.
    None,
    /// Stream changes, conflating undelivered updates per key.
    #[default]
    LatestOnly,
    /// Stream changes and deliver every update in arrival order.
    Everything,
}

impl StreamingOptions {
    /// Returns true if a change stream is opened.
    pub fn is_streaming(&self) -> bool {
        !matches!(self, StreamingOptions::None)
    }

    /// Returns true if queued stream events are conflated by key.
    pub fn conflates(&self) -> bool {
        matches!(self, StreamingOptions::LatestOnly)
    }
}

/// Configuration for a [`MirrorEngine`](crate::MirrorEngine).
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Namespace path of the mirrored subtree, e.g. `"dinosaurs"`.
    pub path: String,
    /// Startup pull strategy.
    pub pull: PullStrategy,
    /// Post-hydration streaming behavior.
    pub streaming: StreamingOptions,
    /// Whether `MirrorEngine::new` also starts the engine.
    pub start_immediately: bool,
    /// Retry policy for forwarding local writes.
    pub forward_retry: RetryConfig,
    /// Retry policy for re-opening the change stream.
    pub reconnect: RetryConfig,
}

impl MirrorConfig {
    /// Creates a configuration for `path` with default options.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            pull: PullStrategy::default(),
            streaming: StreamingOptions::default(),
            start_immediately: true,
            forward_retry: RetryConfig::default(),
            reconnect: RetryConfig::new(8)
                .with_initial_delay(Duration::from_millis(250))
                .with_max_delay(Duration::from_secs(30)),
        }
    }

    /// Sets the pull strategy.
    pub fn with_pull(mut self, pull: PullStrategy) -> Self {
        self.pull = pull;
        self
    }

    /// Sets the streaming options.
    pub fn with_streaming(mut self, streaming: StreamingOptions) -> Self {
        self.streaming = streaming;
        self
    }

    /// Sets whether the engine starts during construction.
    pub fn with_start_immediately(mut self, start: bool) -> Self {
        self.start_immediately = start;
        self
    }

    /// Sets the forward retry configuration.
    pub fn with_forward_retry(mut self, retry: RetryConfig) -> Self {
        self.forward_retry = retry;
        self
    }

    /// Sets the reconnect retry configuration.
    pub fn with_reconnect(mut self, retry: RetryConfig) -> Self {
        self.reconnect = retry;
        self
    }

    /// Policy used when a full snapshot arrives after hydration.
    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        match (self.streaming, self.pull) {
            (StreamingOptions::Everything, PullStrategy::Everything) => SnapshotPolicy::Replace,
            (_, PullStrategy::MissingOnly) => SnapshotPolicy::MissingOnly,
            _ => SnapshotPolicy::Upsert,
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::new("")
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the maximum number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay =
            self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% on top
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirror_config_defaults() {
        let config = MirrorConfig::new("dinosaurs");
        assert_eq!(config.path, "dinosaurs");
        assert_eq!(config.pull, PullStrategy::MissingOnly);
        assert_eq!(config.streaming, StreamingOptions::LatestOnly);
        assert!(config.start_immediately);
        assert_eq!(config.forward_retry.max_attempts, 3);
        assert_eq!(config.reconnect.max_attempts, 8);
    }

    #[test]
    fn mirror_config_builder() {
        let config = MirrorConfig::new("dinosaurs")
            .with_pull(PullStrategy::Everything)
            .with_streaming(StreamingOptions::None)
            .with_start_immediately(false)
            .with_forward_retry(RetryConfig::no_retry());

        assert_eq!(config.pull, PullStrategy::Everything);
        assert!(!config.streaming.is_streaming());
        assert!(!config.start_immediately);
        assert_eq!(config.forward_retry.max_attempts, 1);
    }

    #[test]
    fn snapshot_policy_selection() {
        let config = MirrorConfig::new("d")
            .with_pull(PullStrategy::Everything)
            .with_streaming(StreamingOptions::Everything);
        assert_eq!(config.snapshot_policy(), SnapshotPolicy::Replace);

        let config = config.with_streaming(StreamingOptions::LatestOnly);
        assert_eq!(config.snapshot_policy(), SnapshotPolicy::Upsert);

        let config = config.with_pull(PullStrategy::MissingOnly);
        assert_eq!(config.snapshot_policy(), SnapshotPolicy::MissingOnly);

        let config = config.with_pull(PullStrategy::None);
        assert_eq!(config.snapshot_policy(), SnapshotPolicy::Upsert);
    }

    #[test]
    fn streaming_flags() {
        assert!(StreamingOptions::LatestOnly.conflates());
        assert!(!StreamingOptions::Everything.conflates());
        assert!(StreamingOptions::Everything.is_streaming());
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_without_jitter_is_exact() {
        let config = RetryConfig::new(5)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(60))
            .with_jitter(false);
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250));
    }

    #[test]
    fn no_retry_has_zero_delay() {
        let config = RetryConfig::no_retry();
        assert_eq!(config.max_attempts, 1);
        assert_eq!(config.delay_for_attempt(4), Duration::ZERO);
    }
}
