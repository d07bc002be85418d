//! Session records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{Record, RecordKind};

/// A user session (chat, voice, or any other conversational context).
///
/// Stored at `users/{user_id}/sessions/{session_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Owning user.
    pub user_id: String,
    /// Unique session identifier within the user.
    pub session_id: String,
    /// Session kind, free-form (e.g. `chat`, `voice`).
    #[serde(default)]
    pub kind: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Optional expiry.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Application state.
    #[serde(default)]
    pub state: serde_json::Value,
}

impl SessionRecord {
    /// Create a new session stamped with the current time.
    #[must_use]
    pub fn new(user_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            session_id: session_id.into(),
            kind: None,
            created_at: now,
            updated_at: now,
            expires_at: None,
            state: serde_json::Value::Null,
        }
    }

    /// Whether the session has passed its expiry.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

impl Record for SessionRecord {
    fn kind() -> RecordKind {
        RecordKind::Session
    }

    fn identity(&self) -> Vec<&str> {
        vec![self.user_id.as_str(), self.session_id.as_str()]
    }

    fn key_for(identity: &[&str]) -> Option<String> {
        match identity {
            [user_id, session_id] => Some(format!("users/{user_id}/sessions/{session_id}")),
            _ => None,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key() {
        let session = SessionRecord::new("u1", "s1");
        assert_eq!(
            SessionRecord::key_for(&session.identity()).unwrap(),
            "users/u1/sessions/s1"
        );
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let mut session = SessionRecord::new("u1", "s1");
        assert!(!session.is_expired(now));

        session.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(session.is_expired(now));
    }
}
