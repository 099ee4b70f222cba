//! Real-time event types pushed to subscribed rooms.
//!
//! Every event is addressed to exactly one room at emission time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of real-time events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    /// A processor reported progress on a running job
    JobProgress,

    /// A job reached `completed`
    JobCompleted,

    /// A job reached `failed` permanently
    JobFailed,

    /// A video's processing or publishing status changed
    VideoStatusChanged,

    /// Fresh analytics are available for a channel
    AnalyticsUpdated,

    /// Free-form notification for a user
    GenericNotification,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobProgress => "job-progress",
            Self::JobCompleted => "job-completed",
            Self::JobFailed => "job-failed",
            Self::VideoStatusChanged => "video-status-changed",
            Self::AnalyticsUpdated => "analytics-updated",
            Self::GenericNotification => "generic-notification",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single event as delivered to a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    /// Type tag
    pub kind: EventKind,

    /// Room the event was addressed to
    pub room: String,

    /// Event body
    pub payload: serde_json::Value,

    pub emitted_at: DateTime<Utc>,
}

impl RealtimeEvent {
    pub fn new(kind: EventKind, room: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            room: room.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_wire_names() {
        let json = serde_json::to_string(&EventKind::VideoStatusChanged).unwrap();
        assert_eq!(json, "\"video-status-changed\"");
        assert_eq!(EventKind::GenericNotification.as_str(), "generic-notification");
    }

    #[test]
    fn test_event_serialization() {
        let event = RealtimeEvent::new(
            EventKind::JobProgress,
            "job:123",
            serde_json::json!({ "progress": 40 }),
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: RealtimeEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.kind, EventKind::JobProgress);
        assert_eq!(parsed.room, "job:123");
        assert_eq!(parsed.payload["progress"], 40);
    }
}
