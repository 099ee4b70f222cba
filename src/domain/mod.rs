//! Domain types for the dispatch core.
//!
//! This module contains the core data structures:
//! - Job: queue names, job records and the job state machine
//! - Payloads: typed contracts for each queue
//! - Events: real-time events pushed to rooms

pub mod events;
pub mod job;
pub mod payloads;

// Re-export commonly used types
pub use events::{EventKind, RealtimeEvent};
pub use job::{
    AttemptOutcome, AttemptRecord, JobHandle, JobId, JobRecord, JobState, QueueName,
    TransitionError, UnknownQueue,
};
pub use payloads::{
    AnalyticsSyncJob, AnalyticsSyncType, ChannelSyncJob, ChannelSyncType, CrossPostContent,
    CrossPostJob, DateRange, JobPayload, NotificationChannel, NotificationJob, PayloadError,
    PrivacyStatus, SchedulerAction, SchedulerJob, SocialPlatform, UploadMetadata,
    UploadYoutubeJob, VideoOperation, VideoProcessJob,
};
