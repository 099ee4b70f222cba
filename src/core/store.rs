//! Backing store for queued jobs.
//!
//! The store owns admission order and the atomic claim of the next queued
//! job; the orchestrator relies on that atomicity for its per-queue
//! concurrency limit. Terminal records are kept per queue and trimmed to the
//! queue's retention count, oldest first.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::domain::{JobId, JobRecord, JobState, QueueName, TransitionError};

/// Errors from job store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {0} already exists")]
    AlreadyExists(JobId),

    #[error("Job {id} is {state}, expected a terminal state")]
    NotTerminal { id: JobId, state: JobState },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Number of jobs per state for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub active: usize,
    pub retry_scheduled: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.queued + self.active + self.retry_scheduled + self.completed + self.failed
    }
}

/// Trait for job store backends
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Admit a queued job at the back of its queue
    async fn push(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Atomically move the oldest queued job of `queue` to active
    async fn claim_next(&self, queue: QueueName) -> Result<Option<JobRecord>, StoreError>;

    /// Persist a non-terminal change (progress, retry scheduling)
    async fn update(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Move a retry-scheduled job back to the end of its queue
    async fn requeue(&self, id: JobId) -> Result<JobRecord, StoreError>;

    /// Persist a terminal record and purge beyond `retain`; returns purged ids
    async fn finish(&self, record: &JobRecord, retain: usize) -> Result<Vec<JobId>, StoreError>;

    /// Atomically fail a retry-scheduled job with `reason`, then apply retention
    ///
    /// Any other state is rejected with [`StoreError::Transition`] and left
    /// untouched. Returns the failed record and the purged ids.
    async fn fail_pending(
        &self,
        id: JobId,
        reason: &str,
        retain: usize,
    ) -> Result<(JobRecord, Vec<JobId>), StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Jobs of `queue` in `state`, oldest first
    async fn list(&self, queue: QueueName, state: JobState) -> Result<Vec<JobRecord>, StoreError>;

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, StoreError>;

    /// Every job waiting on a retry timer
    async fn retry_scheduled(&self) -> Result<Vec<JobRecord>, StoreError>;
}

/// Plain in-memory job state shared by the store implementations
#[derive(Debug, Default)]
pub(crate) struct StoreState {
    jobs: HashMap<JobId, JobRecord>,
    queued: HashMap<QueueName, VecDeque<JobId>>,
    finished: HashMap<(QueueName, JobState), VecDeque<JobId>>,
}

impl StoreState {
    /// Rebuild from records; queued jobs keep creation order
    pub(crate) fn from_records(records: impl IntoIterator<Item = JobRecord>) -> Self {
        let mut records: Vec<JobRecord> = records.into_iter().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut state = Self::default();
        let mut terminal: Vec<(QueueName, JobState, JobId, chrono::DateTime<chrono::Utc>)> = Vec::new();

        for record in records {
            match record.state {
                JobState::Queued => state.queued.entry(record.queue).or_default().push_back(record.id),
                JobState::Completed | JobState::Failed => terminal.push((
                    record.queue,
                    record.state,
                    record.id,
                    record.finished_at.unwrap_or(record.updated_at),
                )),
                JobState::Active | JobState::RetryScheduled => {}
            }
            state.jobs.insert(record.id, record);
        }

        terminal.sort_by(|a, b| a.3.cmp(&b.3));
        for (queue, job_state, id, _) in terminal {
            state.finished.entry((queue, job_state)).or_default().push_back(id);
        }

        state
    }

    pub(crate) fn push(&mut self, record: JobRecord) -> Result<(), StoreError> {
        if self.jobs.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        self.queued.entry(record.queue).or_default().push_back(record.id);
        self.jobs.insert(record.id, record);
        Ok(())
    }

    pub(crate) fn claim_next(&mut self, queue: QueueName) -> Result<Option<JobRecord>, StoreError> {
        let Some(pending) = self.queued.get_mut(&queue) else {
            return Ok(None);
        };

        while let Some(id) = pending.pop_front() {
            // Skip ids whose record moved on (e.g. purged)
            let Some(record) = self.jobs.get_mut(&id) else {
                continue;
            };
            if record.state != JobState::Queued {
                continue;
            }
            record.transition(JobState::Active)?;
            return Ok(Some(record.clone()));
        }

        Ok(None)
    }

    pub(crate) fn update(&mut self, record: &JobRecord) -> Result<(), StoreError> {
        let slot = self
            .jobs
            .get_mut(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;
        *slot = record.clone();
        Ok(())
    }

    pub(crate) fn requeue(&mut self, id: JobId) -> Result<JobRecord, StoreError> {
        let record = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.transition(JobState::Queued)?;
        let snapshot = record.clone();
        self.queued.entry(snapshot.queue).or_default().push_back(id);
        Ok(snapshot)
    }

    pub(crate) fn finish(&mut self, record: &JobRecord, retain: usize) -> Result<Vec<JobId>, StoreError> {
        if !record.state.is_terminal() {
            return Err(StoreError::NotTerminal {
                id: record.id,
                state: record.state,
            });
        }
        self.update(record)?;

        let kept = self.finished.entry((record.queue, record.state)).or_default();
        kept.push_back(record.id);

        let mut purged = Vec::new();
        while kept.len() > retain {
            if let Some(old) = kept.pop_front() {
                self.jobs.remove(&old);
                purged.push(old);
            }
        }
        Ok(purged)
    }

    pub(crate) fn fail_pending(
        &mut self,
        id: JobId,
        reason: &str,
        retain: usize,
    ) -> Result<(JobRecord, Vec<JobId>), StoreError> {
        let record = self.jobs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        // Active -> failed is a valid edge, but not one this call may take
        if record.state != JobState::RetryScheduled {
            return Err(TransitionError {
                job: id,
                from: record.state,
                to: JobState::Failed,
            }
            .into());
        }

        record.transition(JobState::Failed)?;
        record.retry_at = None;
        record.last_error = Some(reason.to_string());
        let snapshot = record.clone();

        let purged = self.finish(&snapshot, retain)?;
        Ok((snapshot, purged))
    }

    pub(crate) fn get(&self, id: JobId) -> Option<JobRecord> {
        self.jobs.get(&id).cloned()
    }

    pub(crate) fn list(&self, queue: QueueName, state: JobState) -> Vec<JobRecord> {
        let ordered = |ids: Option<&VecDeque<JobId>>| -> Vec<JobRecord> {
            ids.into_iter()
                .flatten()
                .filter_map(|id| self.jobs.get(id))
                .filter(|r| r.state == state)
                .cloned()
                .collect()
        };

        match state {
            JobState::Queued => ordered(self.queued.get(&queue)),
            JobState::Completed | JobState::Failed => ordered(self.finished.get(&(queue, state))),
            JobState::Active | JobState::RetryScheduled => {
                let mut records: Vec<JobRecord> = self
                    .jobs
                    .values()
                    .filter(|r| r.queue == queue && r.state == state)
                    .cloned()
                    .collect();
                records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                records
            }
        }
    }

    pub(crate) fn counts(&self, queue: QueueName) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for record in self.jobs.values().filter(|r| r.queue == queue) {
            match record.state {
                JobState::Queued => counts.queued += 1,
                JobState::Active => counts.active += 1,
                JobState::RetryScheduled => counts.retry_scheduled += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub(crate) fn retry_scheduled(&self) -> Vec<JobRecord> {
        self.jobs
            .values()
            .filter(|r| r.state == JobState::RetryScheduled)
            .cloned()
            .collect()
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }
}

/// In-process job store
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    state: Mutex<StoreState>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn push(&self, record: JobRecord) -> Result<(), StoreError> {
        self.state.lock().await.push(record)
    }

    async fn claim_next(&self, queue: QueueName) -> Result<Option<JobRecord>, StoreError> {
        self.state.lock().await.claim_next(queue)
    }

    async fn update(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.state.lock().await.update(record)
    }

    async fn requeue(&self, id: JobId) -> Result<JobRecord, StoreError> {
        self.state.lock().await.requeue(id)
    }

    async fn finish(&self, record: &JobRecord, retain: usize) -> Result<Vec<JobId>, StoreError> {
        self.state.lock().await.finish(record, retain)
    }

    async fn fail_pending(
        &self,
        id: JobId,
        reason: &str,
        retain: usize,
    ) -> Result<(JobRecord, Vec<JobId>), StoreError> {
        self.state.lock().await.fail_pending(id, reason, retain)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.state.lock().await.get(id))
    }

    async fn list(&self, queue: QueueName, state: JobState) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.state.lock().await.list(queue, state))
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, StoreError> {
        Ok(self.state.lock().await.counts(queue))
    }

    async fn retry_scheduled(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.state.lock().await.retry_scheduled())
    }
}
