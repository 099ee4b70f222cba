//! Job orchestrator: delivery-with-retry of queued work to processors.
//!
//! Each registered queue gets `concurrency` workers. A worker claims the next
//! queued job from the store, runs the queue's processor under the policy
//! timeout, and records the outcome. Failures are retried after the queue's
//! backoff delay until `max_attempts` is reached; terminal records are
//! trimmed by the retention limits. Lifecycle changes are published to the
//! broadcaster when one is attached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::domain::{
    AttemptOutcome, EventKind, JobHandle, JobId, JobPayload, JobRecord, JobState, PayloadError,
    QueueName,
};
use crate::realtime::{Broadcaster, Room};

use super::policy::PolicyTable;
use super::store::{JobStore, QueueCounts, StoreError};

const TRANSITION_CAPACITY: usize = 1024;
const CLAIM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Work registered for a queue
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, ctx: JobContext) -> anyhow::Result<Value>;
}

/// Processor backed by an async closure
pub struct ProcessorFn<F> {
    f: F,
}

/// Wrap an async closure as a [`Processor`]
pub fn processor_fn<F, Fut>(f: F) -> ProcessorFn<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    ProcessorFn { f }
}

#[async_trait]
impl<F, Fut> Processor for ProcessorFn<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn process(&self, ctx: JobContext) -> anyhow::Result<Value> {
        (self.f)(ctx).await
    }
}

/// What a processor sees of the job it runs
#[derive(Clone)]
pub struct JobContext {
    id: JobId,
    queue: QueueName,
    attempt: u32,
    payload: JobPayload,
    shared: Arc<Shared>,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn queue(&self) -> QueueName {
        self.queue
    }

    /// 1-indexed attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn payload(&self) -> &JobPayload {
        &self.payload
    }

    /// Record progress (clamped to 100) and publish `job-progress`
    pub async fn progress(&self, pct: u8) -> Result<(), StoreError> {
        let pct = pct.min(100);
        let Some(mut job) = self.shared.store.get(self.id).await? else {
            return Err(StoreError::NotFound(self.id));
        };

        // Late reports from a timed-out attempt are ignored
        if job.state != JobState::Active || job.attempts_made != self.attempt {
            debug!(job = %self.id, attempt = self.attempt, "Ignoring stale progress report");
            return Ok(());
        }

        job.progress = pct;
        job.updated_at = Utc::now();
        self.shared.store.update(&job).await?;

        let payload = json!({
            "jobId": self.id,
            "queue": self.queue,
            "progress": pct,
        });
        self.shared.publish(&Room::job(self.id), EventKind::JobProgress, &payload);
        if let Some(user_id) = self.payload.user_id() {
            self.shared.publish(&Room::user(user_id), EventKind::JobProgress, &payload);
        }
        Ok(())
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// A state change, with the record as it was at that moment
#[derive(Debug, Clone)]
pub struct JobTransition {
    pub job: JobRecord,
}

impl JobTransition {
    pub fn id(&self) -> JobId {
        self.job.id
    }

    pub fn state(&self) -> JobState {
        self.job.state
    }
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    #[error("Orchestrator is shut down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} is {state}; only a pending retry can be cancelled")]
    NotCancellable { id: JobId, state: JobState },

    #[error("Transition stream closed")]
    Closed,

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Shared {
    store: Arc<dyn JobStore>,
    policies: PolicyTable,
    broadcaster: Option<Broadcaster>,
    wakeups: [Notify; QueueName::COUNT],
    transitions: broadcast::Sender<JobTransition>,
    retry_timers: Mutex<HashMap<JobId, JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn timers(&self) -> MutexGuard<'_, HashMap<JobId, JoinHandle<()>>> {
        self.retry_timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self, queue: QueueName) {
        self.wakeups[queue.index()].notify_one();
    }

    fn emit(&self, job: &JobRecord) {
        // No subscribers is fine
        let _ = self.transitions.send(JobTransition { job: job.clone() });
    }

    fn publish(&self, room: &Room, kind: EventKind, payload: &Value) {
        if let Some(broadcaster) = &self.broadcaster {
            let delivered = broadcaster.broadcast(room, kind, payload.clone());
            debug!(%room, %kind, delivered, "Published event");
        }
    }

    fn announce_completed(&self, job: &JobRecord) {
        let payload = json!({
            "jobId": job.id,
            "queue": job.queue,
            "attempts": job.attempts_made,
            "result": job.result,
        });
        self.publish(&Room::job(job.id), EventKind::JobCompleted, &payload);
        if let Some(user_id) = job.payload.user_id() {
            self.publish(&Room::user(user_id), EventKind::JobCompleted, &payload);
        }

        match job.queue {
            QueueName::VideoProcess | QueueName::UploadYoutube => {
                if let Some(video_id) = job.payload.video_id() {
                    let status = if job.queue == QueueName::VideoProcess {
                        "processed"
                    } else {
                        "uploaded"
                    };
                    let payload = json!({
                        "videoId": video_id,
                        "jobId": job.id,
                        "status": status,
                    });
                    self.publish(&Room::video(video_id), EventKind::VideoStatusChanged, &payload);
                }
            }
            QueueName::AnalyticsSync | QueueName::ChannelSync => {
                if let Some(channel_id) = job.payload.channel_id() {
                    let payload = json!({
                        "channelId": channel_id,
                        "jobId": job.id,
                        "queue": job.queue,
                    });
                    self.publish(&Room::channel(channel_id), EventKind::AnalyticsUpdated, &payload);
                }
            }
            _ => {}
        }
    }

    fn announce_failed(&self, job: &JobRecord) {
        let payload = json!({
            "jobId": job.id,
            "queue": job.queue,
            "attempts": job.attempts_made,
            "error": job.last_error,
        });
        self.publish(&Room::job(job.id), EventKind::JobFailed, &payload);
        if let Some(user_id) = job.payload.user_id() {
            self.publish(&Room::user(user_id), EventKind::JobFailed, &payload);
        }
    }

    /// Arm a timer that returns the job to its queue after `delay`
    fn schedule_retry(self: &Arc<Self>, id: JobId, delay: Duration) {
        let mut timers = self.timers();
        let shared = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.fire_retry(id).await;
        });
        if let Some(previous) = timers.insert(id, handle) {
            previous.abort();
        }
    }

    async fn fire_retry(&self, id: JobId) {
        self.timers().remove(&id);

        match self.store.requeue(id).await {
            Ok(job) => {
                info!(job = %id, queue = %job.queue, "Retry due, job requeued");
                self.emit(&job);
                self.wake(job.queue);
            }
            // Cancelled or purged in the meantime
            Err(e @ (StoreError::Transition(_) | StoreError::NotFound(_))) => {
                debug!(job = %id, error = %e, "Retry no longer pending");
            }
            Err(e) => {
                error!(job = %id, error = %e, "Failed to requeue job");
            }
        }
    }

    /// Settle a job whose attempt was cut short by a restart
    ///
    /// The interrupted attempt counts: with attempts left the job gets its
    /// normal backoff, otherwise it fails.
    async fn resume_interrupted(self: &Arc<Self>, mut job: JobRecord) -> Result<(), StoreError> {
        let policy = self.policies.get(job.queue);

        if !policy.should_retry(job.attempts_made) {
            let reason = job
                .last_error
                .clone()
                .unwrap_or_else(|| "attempts exhausted".to_string());
            let (job, purged) = self
                .store
                .fail_pending(job.id, &reason, policy.remove_on_fail)
                .await?;
            error!(
                job = %job.id,
                queue = %job.queue,
                attempts = job.attempts_made,
                purged = purged.len(),
                "Interrupted job has no attempts left, failed"
            );
            self.emit(&job);
            self.announce_failed(&job);
            return Ok(());
        }

        let delay = policy.backoff.delay_for_attempt(job.attempts_made);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if let Some(last) = job.attempts.last_mut() {
            last.retry_delay_ms = Some(delay_ms);
        }
        job.retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d));
        job.updated_at = Utc::now();
        self.store.update(&job).await?;

        warn!(job = %job.id, queue = %job.queue, delay_ms, "Interrupted job, retry scheduled");
        self.emit(&job);
        self.schedule_retry(job.id, delay);
        Ok(())
    }

    /// Run one claimed job to its next state
    #[instrument(skip(self, processor, job), fields(job = %job.id, queue = %job.queue, attempt = job.attempts_made))]
    async fn run_job(self: &Arc<Self>, processor: &Arc<dyn Processor>, job: JobRecord) -> Result<(), StoreError> {
        let policy = self.policies.get(job.queue).clone();
        let attempt = job.attempts_made;
        self.emit(&job);
        info!("Job started");

        let ctx = JobContext {
            id: job.id,
            queue: job.queue,
            attempt,
            payload: job.payload.clone(),
            shared: Arc::clone(self),
        };
        let processor = Arc::clone(processor);
        let mut task = tokio::spawn(async move { processor.process(ctx).await });

        let outcome: Result<Value, String> = match tokio::time::timeout(policy.timeout, &mut task).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(e))) => Err(format!("{:#}", e)),
            Ok(Err(join_error)) if join_error.is_panic() => Err("processor panicked".to_string()),
            Ok(Err(join_error)) => Err(format!("processor aborted: {}", join_error)),
            Err(_) => {
                task.abort();
                Err(format!("attempt timed out after {:?}", policy.timeout))
            }
        };

        // Pick up progress written while the processor ran
        let mut job = match self.store.get(job.id).await? {
            Some(current) => current,
            None => job,
        };

        match outcome {
            Ok(value) => {
                job.finish_attempt(AttemptOutcome::Succeeded);
                job.result = Some(value);
                job.progress = 100;
                job.last_error = None;
                job.transition(JobState::Completed)?;

                let purged = self.store.finish(&job, policy.remove_on_complete).await?;
                info!(purged = purged.len(), "Job completed");

                self.emit(&job);
                self.announce_completed(&job);
            }
            Err(message) => {
                job.finish_attempt(AttemptOutcome::Failed {
                    error: message.clone(),
                });
                job.last_error = Some(message.clone());

                if policy.should_retry(attempt) {
                    let delay = policy.backoff.delay_for_attempt(attempt);
                    let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    if let Some(current) = job.attempts.last_mut() {
                        current.retry_delay_ms = Some(delay_ms);
                    }
                    job.transition(JobState::RetryScheduled)?;
                    job.retry_at = chrono::Duration::from_std(delay)
                        .ok()
                        .and_then(|d| Utc::now().checked_add_signed(d));
                    self.store.update(&job).await?;

                    warn!(
                        delay_ms,
                        max_attempts = policy.max_attempts,
                        error = %message,
                        "Job failed, retry scheduled"
                    );

                    self.emit(&job);
                    self.schedule_retry(job.id, delay);
                } else {
                    job.transition(JobState::Failed)?;
                    let purged = self.store.finish(&job, policy.remove_on_fail).await?;

                    error!(purged = purged.len(), error = %message, "Job failed permanently");

                    self.emit(&job);
                    self.announce_failed(&job);
                }
            }
        }

        Ok(())
    }
}

async fn worker_loop(
    shared: Arc<Shared>,
    queue: QueueName,
    processor: Arc<dyn Processor>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%queue, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        match shared.store.claim_next(queue).await {
            Ok(Some(job)) => {
                let id = job.id;
                if let Err(e) = shared.run_job(&processor, job).await {
                    error!(job = %id, %queue, error = %e, "Failed to record job outcome");
                }
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!(%queue, error = %e, "Failed to claim job");
                tokio::select! {
                    _ = tokio::time::sleep(CLAIM_ERROR_BACKOFF) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }
        }

        tokio::select! {
            _ = shared.wakeups[queue.index()].notified() => {}
            _ = shutdown.changed() => {}
        }
    }

    debug!(%queue, "Worker stopped");
}

/// Accepts jobs and drives them through their lifecycle
pub struct JobOrchestrator {
    shared: Arc<Shared>,
    processors: HashMap<QueueName, Arc<dyn Processor>>,
    workers: Vec<JoinHandle<()>>,
}

impl JobOrchestrator {
    pub fn new(store: Arc<dyn JobStore>, policies: PolicyTable, broadcaster: Option<Broadcaster>) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                store,
                policies,
                broadcaster,
                wakeups: std::array::from_fn(|_| Notify::new()),
                transitions,
                retry_timers: Mutex::new(HashMap::new()),
                shutdown,
            }),
            processors: HashMap::new(),
            workers: Vec::new(),
        }
    }

    /// Bind the processor for `queue`; takes effect at [`start`](Self::start)
    pub fn register<P: Processor>(&mut self, queue: QueueName, processor: P) -> &mut Self {
        if self.processors.insert(queue, Arc::new(processor)).is_some() {
            warn!(%queue, "Replacing processor");
        }
        self
    }

    pub fn registered(&self) -> Vec<QueueName> {
        QueueName::ALL
            .into_iter()
            .filter(|q| self.processors.contains_key(q))
            .collect()
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.shared.policies
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.shared.store
    }

    /// Spawn the workers and re-arm retries left pending in the store
    pub async fn start(&mut self) -> Result<(), StoreError> {
        if !self.workers.is_empty() {
            warn!("Orchestrator already started");
            return Ok(());
        }

        for queue in QueueName::ALL {
            let Some(processor) = self.processors.get(&queue) else {
                continue;
            };
            let concurrency = self.shared.policies.get(queue).concurrency;
            for _ in 0..concurrency {
                self.workers.push(tokio::spawn(worker_loop(
                    Arc::clone(&self.shared),
                    queue,
                    Arc::clone(processor),
                    self.shared.shutdown.subscribe(),
                )));
            }
            info!(%queue, concurrency, "Queue workers started");
        }

        let pending = self.shared.store.retry_scheduled().await?;
        if !pending.is_empty() {
            info!(count = pending.len(), "Re-arming pending retries");
        }
        let now = Utc::now();
        for job in pending {
            match job.retry_at {
                Some(at) => {
                    let delay = (at - now).to_std().unwrap_or(Duration::ZERO);
                    self.shared.schedule_retry(job.id, delay);
                }
                None => self.shared.resume_interrupted(job).await?,
            }
        }

        Ok(())
    }

    /// Validate and enqueue a job
    pub async fn submit(&self, payload: JobPayload) -> Result<JobHandle, SubmitError> {
        if *self.shared.shutdown.borrow() {
            return Err(SubmitError::ShuttingDown);
        }

        payload.validate()?;

        let queue = payload.queue();
        if !self.processors.contains_key(&queue) {
            debug!(%queue, "No processor registered; job waits in queue");
        }

        let job = JobRecord::new(payload);
        let handle = job.handle();
        self.shared.store.push(job.clone()).await?;

        info!(job = %handle.id, %queue, "Job submitted");
        self.shared.emit(&job);
        self.shared.wake(queue);

        Ok(handle)
    }

    /// Parse `value` against the contract of `queue`, then enqueue it
    pub async fn submit_json(&self, queue: QueueName, value: Value) -> Result<JobHandle, SubmitError> {
        let payload = JobPayload::from_json(queue, value)?;
        self.submit(payload).await
    }

    /// Cancel a retry that has not fired yet; the job ends `failed`
    pub async fn cancel_retry(&self, id: JobId) -> Result<JobRecord, OrchestratorError> {
        let job = self
            .shared
            .store
            .get(id)
            .await?
            .ok_or(OrchestratorError::NotFound(id))?;
        if job.state != JobState::RetryScheduled {
            return Err(OrchestratorError::NotCancellable { id, state: job.state });
        }

        if let Some(timer) = self.shared.timers().remove(&id) {
            timer.abort();
        }

        // The timer may already be requeueing; the store decides who wins
        let policy = self.shared.policies.get(job.queue);
        let (job, purged) = match self
            .shared
            .store
            .fail_pending(id, "retry cancelled", policy.remove_on_fail)
            .await
        {
            Ok(done) => done,
            Err(StoreError::Transition(e)) => {
                return Err(OrchestratorError::NotCancellable { id, state: e.from });
            }
            Err(StoreError::NotFound(_)) => return Err(OrchestratorError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };

        info!(job = %id, queue = %job.queue, purged = purged.len(), "Pending retry cancelled");
        self.shared.emit(&job);
        self.shared.announce_failed(&job);

        Ok(job)
    }

    pub async fn job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.shared.store.get(id).await
    }

    pub async fn counts(&self, queue: QueueName) -> Result<QueueCounts, StoreError> {
        self.shared.store.counts(queue).await
    }

    /// Stream of every state change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<JobTransition> {
        self.shared.transitions.subscribe()
    }

    /// Wait until `id` reaches `completed` or `failed`
    pub async fn wait_for(&self, id: JobId) -> Result<JobRecord, OrchestratorError> {
        let mut transitions = self.subscribe();

        loop {
            match self.shared.store.get(id).await? {
                Some(job) if job.state.is_terminal() => return Ok(job),
                Some(_) => {}
                None => return Err(OrchestratorError::NotFound(id)),
            }

            loop {
                match transitions.recv().await {
                    Ok(t) if t.id() == id && t.state().is_terminal() => return Ok(t.job),
                    Ok(_) => continue,
                    // Missed transitions; re-read the store
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return Err(OrchestratorError::Closed),
                }
            }
        }
    }

    /// Stop accepting jobs, cancel retry timers, and wait for workers to finish
    /// the job they are running
    pub async fn shutdown(&mut self) {
        self.shared.shutdown.send_replace(true);

        let timers: Vec<JoinHandle<()>> = self.shared.timers().drain().map(|(_, h)| h).collect();
        for timer in &timers {
            timer.abort();
        }

        let workers = std::mem::take(&mut self.workers);
        let count = workers.len();
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker ended abnormally");
            }
        }

        info!(workers = count, pending_retries = timers.len(), "Orchestrator shut down");
    }
}

impl Drop for JobOrchestrator {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        for (_, timer) in self.shared.timers().drain() {
            timer.abort();
        }
    }
}
