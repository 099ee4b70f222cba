//! Typed payload contracts for the seven job queues.
//!
//! Payloads arrive as JSON with camelCase field names. Each queue accepts
//! exactly one payload shape; [`JobPayload::from_json`] parses and validates
//! a raw value against the contract of the queue it is submitted to.
//! Only `Option` fields may be omitted; every other field must be present,
//! even when its value is empty.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::job::QueueName;

/// Errors raised when a payload does not match its queue's contract
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Malformed {queue} payload: {source}")]
    Malformed {
        queue: QueueName,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing required field '{field}' in {queue} payload")]
    MissingField {
        queue: QueueName,
        field: &'static str,
    },

    #[error("Invalid {queue} payload: {reason}")]
    Invalid { queue: QueueName, reason: String },
}

// ============================================================================
// video-process
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoOperation {
    Transcode,
    Clip,
    Shorts,
    Watermark,
    Subtitles,
    AudioNormalize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoProcessJob {
    pub video_id: String,
    pub source_file_url: String,
    pub operation: VideoOperation,
    /// Operation-specific options, passed through untouched
    pub options: serde_json::Value,
}

// ============================================================================
// upload-youtube
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyStatus {
    Public,
    Private,
    Unlisted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    pub category_id: String,
    pub privacy_status: PrivacyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadYoutubeJob {
    pub video_id: String,
    pub channel_id: String,
    pub file_path: String,
    pub metadata: UploadMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
}

// ============================================================================
// analytics-sync
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsSyncType {
    Channel,
    Videos,
    Retention,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSyncJob {
    pub channel_id: String,
    pub sync_type: AnalyticsSyncType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

// ============================================================================
// cross-post
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocialPlatform {
    Tiktok,
    Instagram,
    Twitter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossPostContent {
    pub file_path: String,
    pub caption: String,
    pub hashtags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossPostJob {
    pub video_id: String,
    pub social_account_id: String,
    pub platform: SocialPlatform,
    pub content: CrossPostContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
}

// ============================================================================
// notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Push,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    pub user_id: String,
    #[serde(rename = "type")]
    pub channel: NotificationChannel,
    pub template: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Value>,
}

// ============================================================================
// scheduler
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerAction {
    CheckScheduledVideos,
    UpdateGoals,
    RunExperiments,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerJob {
    pub action: SchedulerAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

// ============================================================================
// channel-sync
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelSyncType {
    Full,
    StatsOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSyncJob {
    pub channel_id: String,
    pub user_id: String,
    pub sync_type: ChannelSyncType,
}

// ============================================================================
// Payload union
// ============================================================================

/// A job payload tagged with the queue it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "queue", content = "data", rename_all = "kebab-case")]
pub enum JobPayload {
    VideoProcess(VideoProcessJob),
    UploadYoutube(UploadYoutubeJob),
    AnalyticsSync(AnalyticsSyncJob),
    CrossPost(CrossPostJob),
    Notifications(NotificationJob),
    Scheduler(SchedulerJob),
    ChannelSync(ChannelSyncJob),
}

impl JobPayload {
    /// Parse a raw JSON payload against the contract of `queue`
    pub fn from_json(queue: QueueName, value: serde_json::Value) -> Result<Self, PayloadError> {
        let malformed = |source| PayloadError::Malformed { queue, source };

        let payload = match queue {
            QueueName::VideoProcess => Self::VideoProcess(serde_json::from_value(value).map_err(malformed)?),
            QueueName::UploadYoutube => Self::UploadYoutube(serde_json::from_value(value).map_err(malformed)?),
            QueueName::AnalyticsSync => Self::AnalyticsSync(serde_json::from_value(value).map_err(malformed)?),
            QueueName::CrossPost => Self::CrossPost(serde_json::from_value(value).map_err(malformed)?),
            QueueName::Notifications => Self::Notifications(serde_json::from_value(value).map_err(malformed)?),
            QueueName::Scheduler => Self::Scheduler(serde_json::from_value(value).map_err(malformed)?),
            QueueName::ChannelSync => Self::ChannelSync(serde_json::from_value(value).map_err(malformed)?),
        };

        payload.validate()?;
        Ok(payload)
    }

    /// The queue this payload is bound to
    pub fn queue(&self) -> QueueName {
        match self {
            Self::VideoProcess(_) => QueueName::VideoProcess,
            Self::UploadYoutube(_) => QueueName::UploadYoutube,
            Self::AnalyticsSync(_) => QueueName::AnalyticsSync,
            Self::CrossPost(_) => QueueName::CrossPost,
            Self::Notifications(_) => QueueName::Notifications,
            Self::Scheduler(_) => QueueName::Scheduler,
            Self::ChannelSync(_) => QueueName::ChannelSync,
        }
    }

    /// Check field-level constraints the type system cannot express
    pub fn validate(&self) -> Result<(), PayloadError> {
        let queue = self.queue();
        let required = |field: &'static str, value: &str| {
            if value.trim().is_empty() {
                Err(PayloadError::MissingField { queue, field })
            } else {
                Ok(())
            }
        };

        match self {
            Self::VideoProcess(job) => {
                required("videoId", &job.video_id)?;
                required("sourceFileUrl", &job.source_file_url)?;
            }
            Self::UploadYoutube(job) => {
                required("videoId", &job.video_id)?;
                required("channelId", &job.channel_id)?;
                required("filePath", &job.file_path)?;
                required("metadata.title", &job.metadata.title)?;
                required("metadata.categoryId", &job.metadata.category_id)?;
            }
            Self::AnalyticsSync(job) => {
                required("channelId", &job.channel_id)?;
                if let Some(range) = &job.date_range {
                    if range.start_date > range.end_date {
                        return Err(PayloadError::Invalid {
                            queue,
                            reason: format!(
                                "dateRange starts after it ends ({} > {})",
                                range.start_date, range.end_date
                            ),
                        });
                    }
                }
            }
            Self::CrossPost(job) => {
                required("videoId", &job.video_id)?;
                required("socialAccountId", &job.social_account_id)?;
                required("content.filePath", &job.content.file_path)?;
            }
            Self::Notifications(job) => {
                required("userId", &job.user_id)?;
                required("template", &job.template)?;
            }
            Self::Scheduler(job) => {
                if let Some(channel_id) = &job.channel_id {
                    required("channelId", channel_id)?;
                }
            }
            Self::ChannelSync(job) => {
                required("channelId", &job.channel_id)?;
                required("userId", &job.user_id)?;
            }
        }

        Ok(())
    }

    /// User the job acts for, when the payload names one
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Self::Notifications(job) => Some(&job.user_id),
            Self::ChannelSync(job) => Some(&job.user_id),
            _ => None,
        }
    }

    /// Video the job acts on, when the payload names one
    pub fn video_id(&self) -> Option<&str> {
        match self {
            Self::VideoProcess(job) => Some(&job.video_id),
            Self::UploadYoutube(job) => Some(&job.video_id),
            Self::CrossPost(job) => Some(&job.video_id),
            _ => None,
        }
    }

    /// Channel the job acts on, when the payload names one
    pub fn channel_id(&self) -> Option<&str> {
        match self {
            Self::UploadYoutube(job) => Some(&job.channel_id),
            Self::AnalyticsSync(job) => Some(&job.channel_id),
            Self::Scheduler(job) => job.channel_id.as_deref(),
            Self::ChannelSync(job) => Some(&job.channel_id),
            _ => None,
        }
    }

    /// The payload body without the queue tag
    pub fn to_body(&self) -> serde_json::Value {
        let result = match self {
            Self::VideoProcess(job) => serde_json::to_value(job),
            Self::UploadYoutube(job) => serde_json::to_value(job),
            Self::AnalyticsSync(job) => serde_json::to_value(job),
            Self::CrossPost(job) => serde_json::to_value(job),
            Self::Notifications(job) => serde_json::to_value(job),
            Self::Scheduler(job) => serde_json::to_value(job),
            Self::ChannelSync(job) => serde_json::to_value(job),
        };
        result.unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_video_process_parsing() {
        let payload = JobPayload::from_json(
            QueueName::VideoProcess,
            json!({
                "videoId": "vid_42",
                "sourceFileUrl": "s3://bucket/raw/vid_42.mp4",
                "operation": "audio_normalize",
                "options": { "targetLufs": -14 }
            }),
        )
        .unwrap();

        match payload {
            JobPayload::VideoProcess(job) => {
                assert_eq!(job.video_id, "vid_42");
                assert_eq!(job.operation, VideoOperation::AudioNormalize);
                assert_eq!(job.options["targetLufs"], -14);
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_operation_rejected() {
        let result = JobPayload::from_json(
            QueueName::VideoProcess,
            json!({ "videoId": "v", "sourceFileUrl": "u", "operation": "upscale" }),
        );
        assert!(matches!(result, Err(PayloadError::Malformed { .. })));
    }

    #[test]
    fn test_payload_for_wrong_queue_rejected() {
        // A channel-sync body is not a valid notifications body
        let result = JobPayload::from_json(
            QueueName::Notifications,
            json!({ "channelId": "ch", "userId": "u", "syncType": "full" }),
        );
        assert!(matches!(result, Err(PayloadError::Malformed { .. })));
    }

    #[test]
    fn test_empty_required_field_rejected() {
        let result = JobPayload::from_json(
            QueueName::ChannelSync,
            json!({ "channelId": "  ", "userId": "u", "syncType": "stats_only" }),
        );
        assert!(matches!(
            result,
            Err(PayloadError::MissingField { field: "channelId", .. })
        ));
    }

    #[test]
    fn test_upload_metadata_and_optional_fields() {
        let payload = JobPayload::from_json(
            QueueName::UploadYoutube,
            json!({
                "videoId": "v1",
                "channelId": "c1",
                "filePath": "/tmp/v1.mp4",
                "metadata": {
                    "title": "My video",
                    "description": "desc",
                    "tags": ["rust"],
                    "categoryId": "28",
                    "privacyStatus": "unlisted",
                    "publishAt": "2026-11-01T12:00:00Z"
                }
            }),
        )
        .unwrap();

        let JobPayload::UploadYoutube(job) = &payload else {
            panic!("expected upload payload");
        };
        assert_eq!(job.metadata.privacy_status, PrivacyStatus::Unlisted);
        assert!(job.metadata.publish_at.is_some());
        assert!(job.thumbnail_path.is_none());
        assert_eq!(payload.video_id(), Some("v1"));
        assert_eq!(payload.channel_id(), Some("c1"));
    }

    #[test]
    fn test_contract_fields_must_be_present() {
        let no_options = JobPayload::from_json(
            QueueName::VideoProcess,
            json!({ "videoId": "v", "sourceFileUrl": "u", "operation": "clip" }),
        );
        assert!(matches!(no_options, Err(PayloadError::Malformed { .. })));

        let no_tags = JobPayload::from_json(
            QueueName::UploadYoutube,
            json!({
                "videoId": "v1",
                "channelId": "c1",
                "filePath": "/tmp/v1.mp4",
                "metadata": {
                    "title": "My video",
                    "description": "",
                    "categoryId": "28",
                    "privacyStatus": "public"
                }
            }),
        );
        assert!(matches!(no_tags, Err(PayloadError::Malformed { .. })));

        let no_caption = JobPayload::from_json(
            QueueName::CrossPost,
            json!({
                "videoId": "v1",
                "socialAccountId": "a1",
                "platform": "tiktok",
                "content": { "filePath": "/clips/1.mp4", "hashtags": [] }
            }),
        );
        assert!(matches!(no_caption, Err(PayloadError::Malformed { .. })));

        // Empty values are fine as long as the field is there
        let empty_caption = JobPayload::from_json(
            QueueName::CrossPost,
            json!({
                "videoId": "v1",
                "socialAccountId": "a1",
                "platform": "tiktok",
                "content": { "filePath": "/clips/1.mp4", "caption": "", "hashtags": [] }
            }),
        );
        assert!(empty_caption.is_ok());
    }

    #[test]
    fn test_inverted_date_range_rejected() {
        let result = JobPayload::from_json(
            QueueName::AnalyticsSync,
            json!({
                "channelId": "c1",
                "syncType": "retention",
                "dateRange": { "startDate": "2026-02-01", "endDate": "2026-01-01" }
            }),
        );
        assert!(matches!(result, Err(PayloadError::Invalid { .. })));
    }

    #[test]
    fn test_notification_type_field() {
        let payload = JobPayload::from_json(
            QueueName::Notifications,
            json!({ "userId": "u9", "type": "webhook", "template": "video_published", "data": {} }),
        )
        .unwrap();

        assert_eq!(payload.user_id(), Some("u9"));
        assert_eq!(payload.to_body()["type"], "webhook");
    }

    #[test]
    fn test_tagged_serialization() {
        let payload = JobPayload::Scheduler(SchedulerJob {
            action: SchedulerAction::RunExperiments,
            channel_id: None,
        });

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["queue"], "scheduler");
        assert_eq!(value["data"]["action"], "run_experiments");
    }
}
