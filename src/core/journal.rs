//! Durable job store backed by an append-only JSONL journal.
//!
//! Every change appends a full snapshot of the affected job; purges append a
//! tombstone. Current state is derived by replaying the journal, last entry
//! wins. Jobs found active on open were interrupted mid-attempt: the attempt
//! is closed as failed and the job is left retry-scheduled with no due time,
//! for the orchestrator to retry or fail against its queue policy. An
//! accepted job is therefore delivered at least once across restarts.
//!
//! When replay finds far more lines than live jobs, the journal is rewritten
//! with one snapshot per live job before new entries are appended.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::domain::{AttemptOutcome, JobId, JobRecord, JobState, QueueName};

use super::store::{JobStore, QueueCounts, StoreError, StoreState};

/// A single line in the journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub change: JournalChange,
}

/// What a journal line records
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalChange {
    /// Latest snapshot of a job
    Upsert { job: JobRecord },

    /// Job removed by retention
    Purge { id: JobId },
}

/// Replays below this many lines never trigger compaction
const COMPACT_MIN_LINES: usize = 64;

/// Compact once lines outnumber live jobs by this factor
const COMPACT_RATIO: usize = 4;

const INTERRUPTED: &str = "interrupted by restart";

struct Inner {
    state: StoreState,
    file: File,
}

/// JSONL-backed job store
pub struct JournalJobStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JournalJobStore {
    /// Open (or create) the journal at `path` and replay it
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let Replay {
            mut records,
            lines,
            torn,
        } = replay(&path).await?;
        let recovered = recover_interrupted(&mut records);
        if !recovered.is_empty() {
            info!(count = recovered.len(), path = %path.display(), "Found jobs interrupted mid-attempt");
        }

        let file = if lines >= COMPACT_MIN_LINES && lines > records.len() * COMPACT_RATIO {
            let file = compact(&path, &records).await?;
            info!(lines, live = records.len(), path = %path.display(), "Compacted job journal");
            file
        } else {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;

            if torn {
                file.write_all(b"\n").await?;
                file.flush().await?;
            }

            let entries: Vec<JournalChange> = recovered
                .iter()
                .filter_map(|id| records.get(id))
                .map(|job| JournalChange::Upsert { job: job.clone() })
                .collect();
            append(&mut file, &entries).await?;
            file
        };

        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                state: StoreState::from_records(records.into_values()),
                file,
            }),
        })
    }

    /// Open the journal at the configured location
    pub async fn open_default() -> anyhow::Result<Self> {
        let path = crate::config::journal_path()?;
        Ok(Self::open(path).await?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of jobs currently held (any state)
    pub async fn len(&self) -> usize {
        self.inner.lock().await.state.records().count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Result of replaying a journal
struct Replay {
    /// Latest snapshot per job
    records: HashMap<JobId, JobRecord>,

    /// Non-empty lines read, readable or not
    lines: usize,

    /// The file ends mid-line; the next append must start on a fresh line
    torn: bool,
}

async fn replay(path: &Path) -> Result<Replay, StoreError> {
    let mut records: HashMap<JobId, JobRecord> = HashMap::new();

    if !path.exists() {
        return Ok(Replay {
            records,
            lines: 0,
            torn: false,
        });
    }

    let file = File::open(path).await?;
    let mut reader = BufReader::new(file).lines();
    let mut line_no = 0usize;
    let mut lines = 0usize;
    let mut torn = false;

    while let Some(line) = reader.next_line().await? {
        line_no += 1;
        torn = false;
        if line.trim().is_empty() {
            continue;
        }
        lines += 1;

        // A torn final write must not make the whole journal unreadable
        let entry: JournalEntry = match serde_json::from_str(&line) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping unreadable journal line");
                torn = true;
                continue;
            }
        };

        match entry.change {
            JournalChange::Upsert { job } => {
                records.insert(job.id, job);
            }
            JournalChange::Purge { id } => {
                records.remove(&id);
            }
        }
    }

    Ok(Replay {
        records,
        lines,
        torn,
    })
}

/// Close attempts caught mid-run as failed; yields the affected ids
///
/// The jobs are left retry-scheduled without `retry_at`: whether another
/// attempt is allowed depends on the queue policy, which the store does not
/// hold.
fn recover_interrupted(records: &mut HashMap<JobId, JobRecord>) -> Vec<JobId> {
    let mut recovered = Vec::new();
    for record in records.values_mut().filter(|r| r.state == JobState::Active) {
        record.finish_attempt(AttemptOutcome::Failed {
            error: INTERRUPTED.to_string(),
        });
        record.last_error = Some(INTERRUPTED.to_string());
        record.state = JobState::RetryScheduled;
        record.retry_at = None;
        record.updated_at = Utc::now();
        recovered.push(record.id);
    }
    recovered
}

/// Rewrite the journal as one snapshot per live job; returns it opened for append
async fn compact(path: &Path, records: &HashMap<JobId, JobRecord>) -> Result<File, StoreError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".compact");
    let tmp = PathBuf::from(tmp);

    let mut jobs: Vec<&JobRecord> = records.values().collect();
    jobs.sort_by_key(|job| job.created_at);
    let changes: Vec<JournalChange> = jobs
        .into_iter()
        .map(|job| JournalChange::Upsert { job: job.clone() })
        .collect();

    let mut out = File::create(&tmp).await?;
    append(&mut out, &changes).await?;
    out.sync_all().await?;
    drop(out);

    fs::rename(&tmp, path).await?;

    Ok(OpenOptions::new().append(true).open(path).await?)
}

async fn append(file: &mut File, changes: &[JournalChange]) -> Result<(), StoreError> {
    if changes.is_empty() {
        return Ok(());
    }

    let timestamp = Utc::now();
    let mut buf = String::new();
    for change in changes {
        let entry = JournalEntry {
            timestamp,
            change: change.clone(),
        };
        buf.push_str(&serde_json::to_string(&entry)?);
        buf.push('\n');
    }

    file.write_all(buf.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

#[async_trait]
impl JobStore for JournalJobStore {
    async fn push(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.state.push(record.clone())?;
        append(&mut inner.file, &[JournalChange::Upsert { job: record }]).await
    }

    async fn claim_next(&self, queue: QueueName) -> Result<Option<JobRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        let claimed = inner.state.claim_next(queue)?;
        if let Some(job) = &claimed {
            append(&mut inner.file, &[JournalChange::Upsert { job: job.clone() }]).await?;
        }
        Ok(claimed)
    }

    async fn update(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.state.update(record)?;
        append(&mut inner.file, &[JournalChange::Upsert { job: record.clone() }]).await
    }

    async fn requeue(&self, id: JobId) -> Result<JobRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.state.requeue(id)?;
        append(&mut inner.file, &[JournalChange::Upsert { job: job.clone() }]).await?;
        Ok(job)
    }

    async fn finish(&self, record: &JobRecord, retain: usize) -> Result<Vec<JobId>, StoreError> {
        let mut inner = self.inner.lock().await;
        let purged = inner.state.finish(record, retain)?;

        let mut changes = vec![JournalChange::Upsert { job: record.clone() }];
        changes.extend(purged.iter().map(|id| JournalChange::Purge { id: *id }));
        append(&mut inner.file, &changes).await?;

        Ok(purged)
    }

    async fn fail_pending(
        &self,
        id: JobId,
        reason: &str,
        retain: usize,
    ) -> Result<(JobRecord, Vec<JobId>), StoreError> {
        let mut inner = self.inner.lock().await;
        let (job, purged) = inner.state.fail_pending(id, reason, retain)?;

        let mut changes = vec![JournalChange::Upsert { job: job.clone() }];
        changes.extend(purged.iter().map(|id| JournalChange::Purge { id: *id }));
        append(&mut inner.file, &changes).await?;

        Ok((job, purged))
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.inner.lock().await.state.get(id))
    }

    async fn list(&self, queue: QueueName, state: JobState) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.inner.lock().await.state.list(queue, state))
    }

    async fn counts(&self, queue: QueueName) -> Result<QueueCounts, StoreError> {
        Ok(self.inner.lock().await.state.counts(queue))
    }

    async fn retry_scheduled(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.inner.lock().await.state.retry_scheduled())
    }
}
