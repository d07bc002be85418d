//! Record trait shared by every stored entity.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Kind of stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// User profile.
    User,
    /// Authentication method attached to a user.
    AuthMethod,
    /// Session belonging to a user.
    Session,
    /// Free-form data under a namespace.
    Data,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::AuthMethod => write!(f, "auth_method"),
            Self::Session => write!(f, "session"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// A structured document with an identity that determines its storage key.
pub trait Record: Send + Sync + Serialize + DeserializeOwned {
    /// Record kind, used in error messages and logs.
    fn kind() -> RecordKind;

    /// Identity segments, outermost first (e.g. `[user_id, session_id]`).
    fn identity(&self) -> Vec<&str>;

    /// Storage key for an identity.
    ///
    /// Returns `None` if the identity has the wrong number of segments.
    fn key_for(identity: &[&str]) -> Option<String>;

    /// Stamp the modification time.
    fn touch(&mut self, now: DateTime<Utc>);
}
