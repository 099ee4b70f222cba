//! Journal Integration Tests
//!
//! Tests that accepted jobs survive a restart of the process.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;

use vidcore::core::{
    processor_fn, BackoffStrategy, JobContext, JobOrchestrator, JobStore, JournalJobStore,
    PolicyTable, QueuePolicy,
};
use vidcore::domain::{
    AttemptOutcome, ChannelSyncJob, ChannelSyncType, JobPayload, JobRecord, JobState, QueueName,
};

fn channel_sync(channel_id: &str) -> JobPayload {
    JobPayload::ChannelSync(ChannelSyncJob {
        channel_id: channel_id.to_string(),
        user_id: "user-1".to_string(),
        sync_type: ChannelSyncType::StatsOnly,
    })
}

fn echo_attempt() -> impl vidcore::core::Processor {
    processor_fn(|ctx: JobContext| async move {
        Ok::<Value, anyhow::Error>(json!({ "attempt": ctx.attempt() }))
    })
}

/// Channel sync with three attempts and a short fixed backoff
fn quick_retries() -> PolicyTable {
    PolicyTable::standard()
        .with(
            QueueName::ChannelSync,
            QueuePolicy::new(3, BackoffStrategy::Fixed { delay_ms: 10 }),
        )
        .unwrap()
}

async fn open(dir: &TempDir) -> Arc<JournalJobStore> {
    Arc::new(JournalJobStore::open(dir.path().join("jobs.jsonl")).await.unwrap())
}

#[tokio::test]
async fn test_queued_job_survives_restart() {
    let dir = TempDir::new().unwrap();

    // First process accepts the job but never runs a worker
    let id = {
        let mut orch = JobOrchestrator::new(open(&dir).await, PolicyTable::standard(), None);
        let handle = orch.submit(channel_sync("ch-1")).await.unwrap();
        orch.shutdown().await;
        handle.id
    };

    let store = open(&dir).await;
    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Queued);

    let mut orch = JobOrchestrator::new(store, PolicyTable::standard(), None);
    orch.register(QueueName::ChannelSync, echo_attempt());
    orch.start().await.unwrap();

    let job = orch.wait_for(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 1);
    assert_eq!(job.result, Some(json!({ "attempt": 1 })));

    orch.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_attempt_is_retried() {
    let dir = TempDir::new().unwrap();

    let id = {
        let store = open(&dir).await;
        let record = JobRecord::new(channel_sync("ch-2"));
        let id = record.id;
        store.push(record).await.unwrap();

        // Claimed by a worker, then the process dies
        let claimed = store.claim_next(QueueName::ChannelSync).await.unwrap().unwrap();
        assert_eq!(claimed.state, JobState::Active);
        id
    };

    let store = open(&dir).await;
    let recovered = store.get(id).await.unwrap().unwrap();
    assert_eq!(recovered.state, JobState::RetryScheduled);
    assert_eq!(recovered.attempts_made, 1);
    assert!(recovered.retry_at.is_none());
    assert_eq!(
        recovered.attempts[0].outcome,
        AttemptOutcome::Failed {
            error: "interrupted by restart".to_string()
        }
    );

    let mut orch = JobOrchestrator::new(store, quick_retries(), None);
    orch.register(QueueName::ChannelSync, echo_attempt());
    orch.start().await.unwrap();

    let job = orch.wait_for(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 2);
    assert_eq!(job.result, Some(json!({ "attempt": 2 })));
    assert_eq!(job.retry_delays(), vec![10]);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_final_attempt_fails_without_rerun() {
    let dir = TempDir::new().unwrap();

    let id = {
        let store = open(&dir).await;
        let record = JobRecord::new(channel_sync("ch-4"));
        let id = record.id;
        store.push(record).await.unwrap();

        // Two failed attempts, then the process dies during the third
        for _ in 0..2 {
            let mut job = store.claim_next(QueueName::ChannelSync).await.unwrap().unwrap();
            job.finish_attempt(AttemptOutcome::Failed {
                error: "quota exceeded".to_string(),
            });
            job.transition(JobState::RetryScheduled).unwrap();
            store.update(&job).await.unwrap();
            store.requeue(id).await.unwrap();
        }
        let third = store.claim_next(QueueName::ChannelSync).await.unwrap().unwrap();
        assert_eq!(third.attempts_made, 3);
        id
    };

    let runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&runs);

    let mut orch = JobOrchestrator::new(open(&dir).await, quick_retries(), None);
    orch.register(
        QueueName::ChannelSync,
        processor_fn(move |_ctx: JobContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<Value, anyhow::Error>(Value::Null)
            }
        }),
    );
    orch.start().await.unwrap();

    let job = orch.wait_for(id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts_made, 3);
    assert_eq!(job.last_error.as_deref(), Some("interrupted by restart"));

    // Give a stray worker a chance to pick it up
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(orch.counts(QueueName::ChannelSync).await.unwrap().failed, 1);

    orch.shutdown().await;

    // The failure is durable
    let store = open(&dir).await;
    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Failed);
}

#[tokio::test]
async fn test_cancel_after_retry_fired_is_rejected() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir).await;

    let record = JobRecord::new(channel_sync("ch-5"));
    let id = record.id;
    store.push(record).await.unwrap();
    let mut job = store.claim_next(QueueName::ChannelSync).await.unwrap().unwrap();
    job.transition(JobState::RetryScheduled).unwrap();
    store.update(&job).await.unwrap();

    // No workers: the job sits in the queue once its retry fires
    let orch = JobOrchestrator::new(Arc::clone(&store) as Arc<dyn JobStore>, quick_retries(), None);
    store.requeue(id).await.unwrap();

    assert!(matches!(
        orch.cancel_retry(id).await,
        Err(vidcore::core::OrchestratorError::NotCancellable {
            state: JobState::Queued,
            ..
        })
    ));
    assert_eq!(store.get(id).await.unwrap().unwrap().state, JobState::Queued);
    assert!(store.fail_pending(id, "late cancel", 10).await.is_err());
}

#[tokio::test]
async fn test_pending_retry_is_rearmed_on_start() {
    let dir = TempDir::new().unwrap();

    let id = {
        let store = open(&dir).await;
        let record = JobRecord::new(channel_sync("ch-3"));
        let id = record.id;
        store.push(record).await.unwrap();

        let mut job = store.claim_next(QueueName::ChannelSync).await.unwrap().unwrap();
        job.finish_attempt(AttemptOutcome::Failed {
            error: "rate limited".to_string(),
        });
        job.transition(JobState::RetryScheduled).unwrap();
        job.retry_at = Some(Utc::now());
        store.update(&job).await.unwrap();
        id
    };

    let store = open(&dir).await;
    assert_eq!(store.retry_scheduled().await.unwrap().len(), 1);

    let mut orch = JobOrchestrator::new(store, PolicyTable::standard(), None);
    orch.register(QueueName::ChannelSync, echo_attempt());
    orch.start().await.unwrap();

    let job = orch.wait_for(id).await.unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts_made, 2);

    orch.shutdown().await;
}

#[tokio::test]
async fn test_retention_purges_are_replayed() {
    let dir = TempDir::new().unwrap();
    let policies = PolicyTable::standard()
        .with(
            QueueName::ChannelSync,
            PolicyTable::standard()
                .get(QueueName::ChannelSync)
                .clone()
                .with_retention(2, 2),
        )
        .unwrap();

    let ids = {
        let mut orch = JobOrchestrator::new(open(&dir).await, policies, None);
        orch.register(QueueName::ChannelSync, echo_attempt());
        orch.start().await.unwrap();

        let mut ids = Vec::new();
        for i in 0..4 {
            let handle = orch.submit(channel_sync(&format!("ch-{}", i))).await.unwrap();
            orch.wait_for(handle.id).await.unwrap();
            ids.push(handle.id);
        }
        orch.shutdown().await;
        ids
    };

    let store = open(&dir).await;
    assert_eq!(store.len().await, 2);
    assert!(store.get(ids[0]).await.unwrap().is_none());
    assert!(store.get(ids[1]).await.unwrap().is_none());
    assert!(store.get(ids[3]).await.unwrap().is_some());
    assert_eq!(store.counts(QueueName::ChannelSync).await.unwrap().completed, 2);
}
