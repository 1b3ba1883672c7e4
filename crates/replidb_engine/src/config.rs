//! Configuration for replication sessions.

use replidb_protocol::{DocumentState, ReplicationIdentity};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Predicate deciding whether a document is transferred in a direction.
#[derive(Clone)]
pub struct DocumentFilter(Arc<dyn Fn(&DocumentState) -> bool + Send + Sync>);

impl DocumentFilter {
    /// Creates a filter from a predicate.
    pub fn new(predicate: impl Fn(&DocumentState) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(predicate))
    }

    /// Returns true if the document passes the filter.
    pub fn matches(&self, document: &DocumentState) -> bool {
        (self.0)(document)
    }
}

impl fmt::Debug for DocumentFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DocumentFilter(..)")
    }
}

/// Configuration for one replication direction.
#[derive(Debug, Clone)]
pub struct DirectionConfig {
    /// Maximum documents per batch.
    pub batch_size: u32,
    /// Documents failing the filter are not transferred in this direction.
    pub filter: Option<DocumentFilter>,
}

impl DirectionConfig {
    /// Creates a direction configuration with the given batch size.
    pub fn new(batch_size: u32) -> Self {
        Self {
            batch_size: batch_size.max(1),
            filter: None,
        }
    }

    /// Sets the filter predicate.
    pub fn with_filter(
        mut self,
        predicate: impl Fn(&DocumentState) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(DocumentFilter::new(predicate));
        self
    }

    /// Returns true if the document passes this direction's filter.
    pub fn admits(&self, document: &DocumentState) -> bool {
        self.filter.as_ref().map_or(true, |f| f.matches(document))
    }
}

impl Default for DirectionConfig {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Configuration for a replication session.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Identity scoping checkpoints.
    pub identity: ReplicationIdentity,
    /// Keep replicating after the first drain.
    pub live: bool,
    /// Pull direction, `None` to disable.
    pub pull: Option<DirectionConfig>,
    /// Push direction, `None` to disable.
    pub push: Option<DirectionConfig>,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Wake a drained live pull loop at this interval even without master
    /// notifications.
    pub poll_interval: Option<Duration>,
    /// Consecutive storage failures before a direction stops fatally.
    pub storage_failure_threshold: u32,
}

impl ReplicationConfig {
    /// Creates a live, bidirectional configuration.
    pub fn new(identity: impl Into<ReplicationIdentity>) -> Self {
        Self {
            identity: identity.into(),
            live: true,
            pull: Some(DirectionConfig::default()),
            push: Some(DirectionConfig::default()),
            retry: RetryConfig::default(),
            poll_interval: None,
            storage_failure_threshold: 5,
        }
    }

    /// Sets live or one-shot mode.
    pub fn with_live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Sets the batch size for both directions.
    pub fn with_batch_size(mut self, size: u32) -> Self {
        if let Some(pull) = self.pull.as_mut() {
            pull.batch_size = size.max(1);
        }
        if let Some(push) = self.push.as_mut() {
            push.batch_size = size.max(1);
        }
        self
    }

    /// Sets the pull direction configuration.
    pub fn with_pull(mut self, pull: DirectionConfig) -> Self {
        self.pull = Some(pull);
        self
    }

    /// Sets the push direction configuration.
    pub fn with_push(mut self, push: DirectionConfig) -> Self {
        self.push = Some(push);
        self
    }

    /// Disables the push direction.
    pub fn pull_only(mut self) -> Self {
        self.push = None;
        self
    }

    /// Disables the pull direction.
    pub fn push_only(mut self) -> Self {
        self.pull = None;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the live pull poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Sets the storage failure threshold.
    pub fn with_storage_failure_threshold(mut self, threshold: u32) -> Self {
        self.storage_failure_threshold = threshold.max(1);
        self
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Configuration for retry behavior.
///
/// Retries never run out: a direction keeps retrying until it is cancelled or
/// a storage failure escalates. Consecutive failures widen the delay up to
/// `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Multiplier applied per consecutive failure (1.0 keeps the delay fixed).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a fixed-interval retry configuration.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Creates an exponential retry configuration.
    pub fn exponential(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay after `consecutive_failures` failures in a row.
    pub fn delay_for_failure(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let exponent = consecutive_failures.saturating_sub(1).min(64) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        let total_secs = if self.add_jitter {
            delay_secs + delay_secs * 0.25 * rand::random::<f64>()
        } else {
            delay_secs
        };
        // Saturates at max_delay when the float form is not representable.
        Duration::try_from_secs_f64(total_secs).unwrap_or(self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}
