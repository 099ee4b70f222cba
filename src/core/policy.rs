//! Per-queue reliability policies.
//!
//! Each queue carries its attempt limit, backoff strategy, count-based
//! retention and worker concurrency. The table is total over [`QueueName`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::QueueName;

/// Delay strategy between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BackoffStrategy {
    /// `base_delay_ms * 2^(attempt-1)`
    Exponential { base_delay_ms: u64 },

    /// Constant `delay_ms`
    Fixed { delay_ms: u64 },
}

impl BackoffStrategy {
    /// Delay before the next attempt, after attempt `attempt` (1-indexed) failed
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match *self {
            Self::Exponential { base_delay_ms } => {
                let exponent = attempt.saturating_sub(1).min(31);
                Duration::from_millis(base_delay_ms.saturating_mul(1u64 << exponent))
            }
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
        }
    }
}

/// Reliability policy for one queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuePolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    pub backoff: BackoffStrategy,

    /// Completed records kept; older ones are purged
    pub remove_on_complete: usize,

    /// Failed records kept; older ones are purged
    pub remove_on_fail: usize,

    /// Jobs from this queue that may be active at once
    pub concurrency: usize,

    /// Upper bound on a single attempt
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

const DEFAULT_REMOVE_ON_COMPLETE: usize = 100;
const DEFAULT_REMOVE_ON_FAIL: usize = 500;
const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const LONG_JOB_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

impl QueuePolicy {
    pub fn new(max_attempts: u32, backoff: BackoffStrategy) -> Self {
        Self {
            max_attempts,
            backoff,
            remove_on_complete: DEFAULT_REMOVE_ON_COMPLETE,
            remove_on_fail: DEFAULT_REMOVE_ON_FAIL,
            concurrency: 1,
            timeout: DEFAULT_JOB_TIMEOUT,
        }
    }

    pub fn with_retention(mut self, remove_on_complete: usize, remove_on_fail: usize) -> Self {
        self.remove_on_complete = remove_on_complete;
        self.remove_on_fail = remove_on_fail;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether a job that just failed attempt `attempt` gets another try
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn validate(&self, queue: QueueName) -> Result<(), PolicyError> {
        if self.max_attempts == 0 {
            return Err(PolicyError::ZeroAttempts(queue));
        }
        if self.concurrency == 0 {
            return Err(PolicyError::ZeroConcurrency(queue));
        }
        if self.timeout.is_zero() {
            return Err(PolicyError::ZeroTimeout(queue));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Queue {0} must allow at least one attempt")]
    ZeroAttempts(QueueName),

    #[error("Queue {0} must have a concurrency of at least one")]
    ZeroConcurrency(QueueName),

    #[error("Queue {0} must have a non-zero timeout")]
    ZeroTimeout(QueueName),
}

/// Policy for every queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyTable {
    policies: [QueuePolicy; QueueName::COUNT],
}

impl PolicyTable {
    /// Production defaults
    pub fn standard() -> Self {
        use BackoffStrategy::{Exponential, Fixed};

        let policies = QueueName::ALL.map(|queue| match queue {
            QueueName::VideoProcess => QueuePolicy::new(3, Exponential { base_delay_ms: 5_000 })
                .with_timeout(LONG_JOB_TIMEOUT),
            QueueName::UploadYoutube => QueuePolicy::new(5, Exponential { base_delay_ms: 10_000 })
                .with_timeout(LONG_JOB_TIMEOUT),
            QueueName::AnalyticsSync => QueuePolicy::new(3, Fixed { delay_ms: 300_000 }),
            QueueName::CrossPost => QueuePolicy::new(3, Exponential { base_delay_ms: 5_000 }),
            QueueName::Notifications => QueuePolicy::new(2, Fixed { delay_ms: 60_000 }),
            QueueName::Scheduler => QueuePolicy::new(5, Fixed { delay_ms: 60_000 }),
            QueueName::ChannelSync => QueuePolicy::new(3, Exponential { base_delay_ms: 30_000 }),
        });

        Self { policies }
    }

    pub fn get(&self, queue: QueueName) -> &QueuePolicy {
        &self.policies[queue.index()]
    }

    /// Replace the policy of one queue
    pub fn set(&mut self, queue: QueueName, policy: QueuePolicy) -> Result<(), PolicyError> {
        policy.validate(queue)?;
        self.policies[queue.index()] = policy;
        Ok(())
    }

    pub fn with(mut self, queue: QueueName, policy: QueuePolicy) -> Result<Self, PolicyError> {
        self.set(queue, policy)?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), PolicyError> {
        for queue in QueueName::ALL {
            self.get(queue).validate(queue)?;
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (QueueName, &QueuePolicy)> {
        QueueName::ALL.into_iter().map(|q| (q, self.get(q)))
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self::standard()
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
