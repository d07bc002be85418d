//! User and authentication-method records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::record::{Record, RecordKind};

/// A user profile.
///
/// Stored at `users/{user_id}/profile`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Unique user identifier.
    pub user_id: String,
    /// Contact email, if known.
    #[serde(default)]
    pub email: Option<String>,
    /// Display name.
    #[serde(default)]
    pub display_name: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Application-defined attributes.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl User {
    /// Create a new user stamped with the current time.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            email: None,
            display_name: None,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    /// Set the email.
    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

impl Record for User {
    fn kind() -> RecordKind {
        RecordKind::User
    }

    fn identity(&self) -> Vec<&str> {
        vec![self.user_id.as_str()]
    }

    fn key_for(identity: &[&str]) -> Option<String> {
        match identity {
            [user_id] => Some(format!("users/{user_id}/profile")),
            _ => None,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

/// Identity provider backing an authentication method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthProvider {
    /// Username/password.
    Password,
    /// Emailed one-time link or code.
    Email,
    /// External OAuth/OIDC provider.
    Oauth {
        /// Provider name (e.g. `google`).
        issuer: String,
    },
    /// API key.
    ApiKey,
}

/// An authentication method attached to a user.
///
/// Stored at `users/{user_id}/auth_methods/{method_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAuthMethod {
    /// Owning user.
    pub user_id: String,
    /// Unique method identifier within the user.
    pub method_id: String,
    /// Provider kind.
    pub provider: AuthProvider,
    /// Subject identifier at the provider (email, OAuth `sub`, key id).
    pub subject: String,
    /// Hashed secret, if the provider uses one.
    #[serde(default)]
    pub credential_hash: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
    /// Last successful authentication.
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl UserAuthMethod {
    /// Create a new auth method stamped with the current time.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        method_id: impl Into<String>,
        provider: AuthProvider,
        subject: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            method_id: method_id.into(),
            provider,
            subject: subject.into(),
            credential_hash: None,
            created_at: now,
            updated_at: now,
            last_used_at: None,
        }
    }
}

impl Record for UserAuthMethod {
    fn kind() -> RecordKind {
        RecordKind::AuthMethod
    }

    fn identity(&self) -> Vec<&str> {
        vec![self.user_id.as_str(), self.method_id.as_str()]
    }

    fn key_for(identity: &[&str]) -> Option<String> {
        match identity {
            [user_id, method_id] => Some(format!("users/{user_id}/auth_methods/{method_id}")),
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
    fn test_user_key() {
        let user = User::new("u1");
        assert_eq!(User::key_for(&user.identity()).unwrap(), "users/u1/profile");
        assert!(User::key_for(&["a", "b"]).is_none());
    }

    #[test]
    fn test_auth_method_key_and_serde() {
        let method = UserAuthMethod::new(
            "u1",
            "m1",
            AuthProvider::Oauth {
                issuer: "google".to_string(),
            },
            "sub-123",
        );
        assert_eq!(
            UserAuthMethod::key_for(&method.identity()).unwrap(),
            "users/u1/auth_methods/m1"
        );

        let json = serde_json::to_value(&method).unwrap();
        assert_eq!(json["provider"]["oauth"]["issuer"], "google");
    }

    #[test]
    fn test_touch_only_moves_updated_at() {
        let mut user = User::new("u1");
        let created = user.created_at;
        let later = created + chrono::Duration::seconds(5);
        user.touch(later);
        assert_eq!(user.created_at, created);
        assert_eq!(user.updated_at, later);
    }
}
