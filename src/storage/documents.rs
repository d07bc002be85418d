//! Record CRUD on top of raw storage.
//!
//! Records are stored as JSON at the key their identity maps to. Every
//! mutation runs under the lock for that key; nothing here is atomic across
//! keys.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, instrument};

use crate::domain::{ArbitraryData, Record, SessionRecord, User, UserAuthMethod};
use crate::error::{StorageError, StorageResult};
use crate::storage::key::validate_segment;
use crate::storage::traits::Storage;

/// Document helpers over any [`Storage`].
#[derive(Clone)]
pub struct DocumentStore {
    storage: Arc<dyn Storage>,
    lock_timeout: Duration,
}

impl DocumentStore {
    /// Create document helpers; each mutation waits at most `lock_timeout`
    /// for its lock.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, lock_timeout: Duration) -> Self {
        Self {
            storage,
            lock_timeout,
        }
    }

    /// Underlying storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    fn key<R: Record>(identity: &[&str]) -> StorageResult<String> {
        for segment in identity {
            validate_segment(segment)?;
        }
        R::key_for(identity).ok_or_else(|| {
            StorageError::InvalidPath(format!("{} identity {identity:?}", R::kind()))
        })
    }

    async fn locked<T, Fut>(&self, key: &str, body: Fut) -> StorageResult<T>
    where
        Fut: Future<Output = StorageResult<T>>,
    {
        let guard = self.storage.lock(key, self.lock_timeout).await?;
        let result = body.await;
        guard.release().await;
        result
    }

    async fn put<R: Record>(&self, key: &str, record: &R) -> StorageResult<()> {
        let json = serde_json::to_string(record).map_err(|e| StorageError::backend(key, e))?;
        self.storage.write(key, &json).await
    }

    async fn load<R: Record>(&self, key: &str) -> StorageResult<Option<R>> {
        let Some(json) = self.storage.read(key).await? else {
            return Ok(None);
        };
        serde_json::from_str(&json)
            .map(Some)
            .map_err(|e| StorageError::backend(key, format!("malformed {}: {e}", R::kind())))
    }

    /// Store a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if a record with the same
    /// identity exists.
    #[instrument(skip_all, level = "debug", fields(kind = %R::kind()))]
    pub async fn create<R: Record>(&self, record: &R) -> StorageResult<()> {
        let key = Self::key::<R>(&record.identity())?;
        self.locked(&key, async {
            if self.storage.exists(&key).await? {
                return Err(StorageError::AlreadyExists(key.clone()));
            }
            self.put(&key, record).await
        })
        .await?;
        debug!(key, "Created record");
        Ok(())
    }

    /// Fetch a record. Missing records return `None`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the stored document is not valid JSON for `R`.
    pub async fn get<R: Record>(&self, identity: &[&str]) -> StorageResult<Option<R>> {
        let key = Self::key::<R>(identity)?;
        self.load(&key).await
    }

    /// Replace an existing record, stamping its modification time.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the record does not exist.
    #[instrument(skip_all, level = "debug", fields(kind = %R::kind()))]
    pub async fn update<R: Record>(&self, record: &mut R) -> StorageResult<()> {
        let key = Self::key::<R>(&record.identity())?;
        self.locked(&key, async {
            if !self.storage.exists(&key).await? {
                return Err(StorageError::NotFound(key.clone()));
            }
            record.touch(Utc::now());
            self.put(&key, &*record).await
        })
        .await?;
        debug!(key, "Updated record");
        Ok(())
    }

    /// Create or replace a record, stamping its modification time.
    #[instrument(skip_all, level = "debug", fields(kind = %R::kind()))]
    pub async fn upsert<R: Record>(&self, record: &mut R) -> StorageResult<()> {
        let key = Self::key::<R>(&record.identity())?;
        self.locked(&key, async {
            record.touch(Utc::now());
            self.put(&key, &*record).await
        })
        .await
    }

    /// Delete a record. Deleting a missing record succeeds.
    ///
    /// Returns `true` iff a record was removed.
    #[instrument(skip(self), level = "debug", fields(kind = %R::kind()))]
    pub async fn delete<R: Record>(&self, identity: &[&str]) -> StorageResult<bool> {
        let key = Self::key::<R>(identity)?;
        let removed = self.locked(&key, self.storage.delete(&key)).await?;
        debug!(key, removed, "Deleted record");
        Ok(removed)
    }

    /// Ids of the direct children under `prefix` whose key ends in `leaf`
    /// (or that are leaves themselves when `leaf` is `None`), sorted.
    async fn child_ids(&self, prefix: &str, leaf: Option<&str>) -> StorageResult<Vec<String>> {
        let mut ids: Vec<String> = self
            .storage
            .list_keys(prefix)
            .await?
            .into_iter()
            .filter_map(|key| {
                let rest = key.strip_prefix(prefix)?;
                match (rest.split_once('/'), leaf) {
                    (None, None) => Some(rest.to_string()),
                    (Some((id, tail)), Some(leaf)) if tail == leaf => Some(id.to_string()),
                    _ => None,
                }
            })
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Load the records for `ids`, skipping any deleted since listing.
    async fn load_all<R: Record>(&self, identities: Vec<Vec<&str>>) -> StorageResult<Vec<R>> {
        let mut records = Vec::with_capacity(identities.len());
        for identity in identities {
            if let Some(record) = self.get::<R>(&identity).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    // =========================================================================
    // Users
    // =========================================================================

    /// Store a new user.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if the user exists.
    pub async fn create_user(&self, user: &User) -> StorageResult<()> {
        self.create(user).await
    }

    /// Fetch a user.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or malformed data.
    pub async fn get_user(&self, user_id: &str) -> StorageResult<Option<User>> {
        self.get(&[user_id]).await
    }

    /// Replace an existing user.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the user does not exist.
    pub async fn update_user(&self, user: &mut User) -> StorageResult<()> {
        self.update(user).await
    }

    /// Delete a user profile. Auth methods and sessions are left in place.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or lock timeout.
    pub async fn delete_user(&self, user_id: &str) -> StorageResult<bool> {
        self.delete::<User>(&[user_id]).await
    }

    /// All user profiles, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or malformed data.
    pub async fn list_users(&self) -> StorageResult<Vec<User>> {
        let ids = self.child_ids("users/", Some("profile")).await?;
        self.load_all(ids.iter().map(|id| vec![id.as_str()]).collect())
            .await
    }

    // =========================================================================
    // Auth methods
    // =========================================================================

    /// Store a new auth method.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if the method exists.
    pub async fn create_auth_method(&self, method: &UserAuthMethod) -> StorageResult<()> {
        self.create(method).await
    }

    /// Fetch an auth method.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or malformed data.
    pub async fn get_auth_method(
        &self,
        user_id: &str,
        method_id: &str,
    ) -> StorageResult<Option<UserAuthMethod>> {
        self.get(&[user_id, method_id]).await
    }

    /// Replace an existing auth method.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the method does not exist.
    pub async fn update_auth_method(&self, method: &mut UserAuthMethod) -> StorageResult<()> {
        self.update(method).await
    }

    /// Delete an auth method.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or lock timeout.
    pub async fn delete_auth_method(&self, user_id: &str, method_id: &str) -> StorageResult<bool> {
        self.delete::<UserAuthMethod>(&[user_id, method_id]).await
    }

    /// A user's auth methods, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or malformed data.
    pub async fn list_auth_methods(&self, user_id: &str) -> StorageResult<Vec<UserAuthMethod>> {
        validate_segment(user_id)?;
        let ids = self
            .child_ids(&format!("users/{user_id}/auth_methods/"), None)
            .await?;
        self.load_all(ids.iter().map(|id| vec![user_id, id.as_str()]).collect())
            .await
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Store a new session.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if the session exists.
    pub async fn create_session(&self, session: &SessionRecord) -> StorageResult<()> {
        self.create(session).await
    }

    /// Fetch a session.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or malformed data.
    pub async fn get_session(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> StorageResult<Option<SessionRecord>> {
        self.get(&[user_id, session_id]).await
    }

    /// Replace an existing session.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the session does not exist.
    pub async fn update_session(&self, session: &mut SessionRecord) -> StorageResult<()> {
        self.update(session).await
    }

    /// Delete a session.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or lock timeout.
    pub async fn delete_session(&self, user_id: &str, session_id: &str) -> StorageResult<bool> {
        self.delete::<SessionRecord>(&[user_id, session_id]).await
    }

    /// A user's sessions, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or malformed data.
    pub async fn list_sessions(&self, user_id: &str) -> StorageResult<Vec<SessionRecord>> {
        validate_segment(user_id)?;
        let ids = self
            .child_ids(&format!("users/{user_id}/sessions/"), None)
            .await?;
        self.load_all(ids.iter().map(|id| vec![user_id, id.as_str()]).collect())
            .await
    }

    // =========================================================================
    // Arbitrary data
    // =========================================================================

    /// Store a new data entry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::AlreadyExists`] if the entry exists.
    pub async fn create_data(&self, data: &ArbitraryData) -> StorageResult<()> {
        self.create(data).await
    }

    /// Create or replace a data entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or lock timeout.
    pub async fn store_data(&self, data: &mut ArbitraryData) -> StorageResult<()> {
        self.upsert(data).await
    }

    /// Fetch a data entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or malformed data.
    pub async fn get_data(&self, namespace: &str, key: &str) -> StorageResult<Option<ArbitraryData>> {
        self.get(&[namespace, key]).await
    }

    /// Replace an existing data entry.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the entry does not exist.
    pub async fn update_data(&self, data: &mut ArbitraryData) -> StorageResult<()> {
        self.update(data).await
    }

    /// Delete a data entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or lock timeout.
    pub async fn delete_data(&self, namespace: &str, key: &str) -> StorageResult<bool> {
        self.delete::<ArbitraryData>(&[namespace, key]).await
    }

    /// Entries in a namespace, ordered by key.
    ///
    /// # Errors
    ///
    /// Returns a storage error on I/O failure or malformed data.
    pub async fn list_data(&self, namespace: &str) -> StorageResult<Vec<ArbitraryData>> {
        validate_segment(namespace)?;
        let keys = self.child_ids(&format!("data/{namespace}/"), None).await?;
        self.load_all(keys.iter().map(|key| vec![namespace, key.as_str()]).collect())
            .await
    }
}
