//! Job records and the job state machine.
//!
//! A job belongs to exactly one queue and moves through
//! `queued → active → (completed | failed | retry-scheduled)`, with
//! `retry-scheduled → queued` once its backoff delay elapses.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::payloads::JobPayload;

/// Named queues, one per job kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueName {
    VideoProcess,
    UploadYoutube,
    AnalyticsSync,
    CrossPost,
    Notifications,
    Scheduler,
    ChannelSync,
}

impl QueueName {
    /// Every queue, in declaration order
    pub const ALL: [QueueName; 7] = [
        QueueName::VideoProcess,
        QueueName::UploadYoutube,
        QueueName::AnalyticsSync,
        QueueName::CrossPost,
        QueueName::Notifications,
        QueueName::Scheduler,
        QueueName::ChannelSync,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Wire name of the queue
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoProcess => "video-process",
            Self::UploadYoutube => "upload-youtube",
            Self::AnalyticsSync => "analytics-sync",
            Self::CrossPost => "cross-post",
            Self::Notifications => "notifications",
            Self::Scheduler => "scheduler",
            Self::ChannelSync => "channel-sync",
        }
    }

    /// Dense index, used by tables keyed on every queue
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("Unknown queue: {0}")]
pub struct UnknownQueue(pub String);

impl FromStr for QueueName {
    type Err = UnknownQueue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|q| q.as_str() == s)
            .ok_or_else(|| UnknownQueue(s.to_string()))
    }
}

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    /// Waiting for a worker
    Queued,

    /// Held by a worker, processor running
    Active,

    /// Failed an attempt, waiting out its backoff delay
    RetryScheduled,

    /// Terminal: processor succeeded
    Completed,

    /// Terminal: attempts exhausted or retry cancelled
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `to`
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, to),
            (Queued, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, RetryScheduled)
                | (RetryScheduled, Queued)
                | (RetryScheduled, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::RetryScheduled => "retry-scheduled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Invalid state transition for job {job}: {from} → {to}")]
pub struct TransitionError {
    pub job: JobId,
    pub from: JobState,
    pub to: JobState,
}

/// Outcome of a single attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum AttemptOutcome {
    Running,
    Succeeded,
    Failed { error: String },
}

/// History entry for one processor invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-indexed attempt number
    pub attempt: u32,

    pub started_at: DateTime<Utc>,

    pub finished_at: Option<DateTime<Utc>>,

    pub outcome: AttemptOutcome,

    /// Backoff delay scheduled after this attempt failed (if retried)
    pub retry_delay_ms: Option<u64>,
}

/// Handle returned to producers on submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: QueueName,
}

/// Full state of a job as held by the job store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,

    pub queue: QueueName,

    pub payload: JobPayload,

    pub state: JobState,

    /// Number of attempts started so far
    pub attempts_made: u32,

    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,

    /// Last reported progress (0-100)
    #[serde(default)]
    pub progress: u8,

    pub result: Option<serde_json::Value>,

    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    /// When the pending retry fires (retry-scheduled only)
    pub retry_at: Option<DateTime<Utc>>,

    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a freshly queued job
    pub fn new(payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            queue: payload.queue(),
            payload,
            state: JobState::Queued,
            attempts_made: 0,
            attempts: Vec::new(),
            progress: 0,
            result: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            retry_at: None,
            finished_at: None,
        }
    }

    pub fn handle(&self) -> JobHandle {
        JobHandle {
            id: self.id,
            queue: self.queue,
        }
    }

    /// Move to `to`, rejecting edges outside the state machine
    pub fn transition(&mut self, to: JobState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(to) {
            return Err(TransitionError {
                job: self.id,
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        self.state = to;
        self.updated_at = now;

        match to {
            JobState::Active => {
                self.attempts_made += 1;
                self.retry_at = None;
                self.attempts.push(AttemptRecord {
                    attempt: self.attempts_made,
                    started_at: now,
                    finished_at: None,
                    outcome: AttemptOutcome::Running,
                    retry_delay_ms: None,
                });
            }
            JobState::Queued => self.retry_at = None,
            JobState::Completed | JobState::Failed => self.finished_at = Some(now),
            JobState::RetryScheduled => {}
        }

        Ok(())
    }

    /// Close the running attempt with its outcome
    pub fn finish_attempt(&mut self, outcome: AttemptOutcome) {
        if let Some(current) = self.attempts.last_mut() {
            current.finished_at = Some(Utc::now());
            current.outcome = outcome;
        }
    }

    /// The attempt currently (or most recently) running
    pub fn current_attempt(&self) -> Option<&AttemptRecord> {
        self.attempts.last()
    }

    /// Backoff delays scheduled so far, in attempt order
    pub fn retry_delays(&self) -> Vec<u64> {
        self.attempts
            .iter()
            .filter_map(|a| a.retry_delay_ms)
            .collect()
    }
}
