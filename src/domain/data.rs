//! Free-form data records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{Record, RecordKind};

/// Arbitrary JSON stored under a namespace.
///
/// Stored at `data/{namespace}/{key}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitraryData {
    /// Namespace grouping related entries.
    pub namespace: String,
    /// Key within the namespace.
    pub key: String,
    /// Payload.
    pub value: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl ArbitraryData {
    /// Create a new entry stamped with the current time.
    #[must_use]
    pub fn new(namespace: impl Into<String>, key: impl Into<String>, value: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            namespace: namespace.into(),
            key: key.into(),
            value,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Record for ArbitraryData {
    fn kind() -> RecordKind {
        RecordKind::Data
    }

    fn identity(&self) -> Vec<&str> {
        vec![self.namespace.as_str(), self.key.as_str()]
    }

    fn key_for(identity: &[&str]) -> Option<String> {
        match identity {
            [namespace, key] => Some(format!("data/{namespace}/{key}")),
            _ => None,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
