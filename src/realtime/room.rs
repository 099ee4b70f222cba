//! Room keys for event fan-out.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named broadcast target such as `user:42` or `video:7`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Room(String);

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Per-user room every connection joins on admission
    pub fn user(id: impl fmt::Display) -> Self {
        Self(format!("user:{}", id))
    }

    pub fn channel(id: impl fmt::Display) -> Self {
        Self(format!("channel:{}", id))
    }

    pub fn video(id: impl fmt::Display) -> Self {
        Self(format!("video:{}", id))
    }

    pub fn job(id: impl fmt::Display) -> Self {
        Self(format!("job:{}", id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Room {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Room {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl AsRef<str> for Room {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
