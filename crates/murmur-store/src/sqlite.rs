//! Async [`Store`] adapter over [`Database`].
//!
//! The connection lives behind a mutex. Each operation takes it on the
//! blocking pool for the length of one closure, so no async task ever waits
//! on SQLite and the connection is never held across an await point.

use async_trait::async_trait;
use murmur_core::{
    Call, ChatMessage, NewCall, NewMessage, NewOfflineItem, OfflineItem, OfflineItemId, Store,
    StoreError,
};
use murmur_protocol::{CallId, CallStatus, GroupId, UserId};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::database::Database;
use crate::error::SqliteError;

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`. `:memory:` is accepted.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteError> {
        Ok(Self::from_database(Database::open_at(path.as_ref())?))
    }

    /// Open a fresh in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub fn open_in_memory() -> Result<Self, SqliteError> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    #[must_use]
    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    /// Run `op` against the database on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns the operation's error, or [`StoreError::Task`] if the blocking
    /// task did not complete.
    pub async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Database) -> Result<T, SqliteError> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|_| SqliteError::Poisoned)?;
            op(&guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
        .map_err(StoreError::from)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn authenticate(&self, credential: &str) -> Result<Option<UserId>, StoreError> {
        let credential = credential.to_owned();
        self.run(move |db| db.authenticate(&credential)).await
    }

    async fn user_exists(&self, user_id: UserId) -> Result<bool, StoreError> {
        self.run(move |db| db.user_exists(user_id)).await
    }

    async fn set_active(&self, user_id: UserId, active: bool) -> Result<(), StoreError> {
        self.run(move |db| db.set_active(user_id, active)).await
    }

    async fn clear_active(&self) -> Result<(), StoreError> {
        let cleared = self.run(|db| db.clear_active()).await?;
        tracing::debug!(cleared, "cleared active flags");
        Ok(())
    }

    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, StoreError> {
        self.run(move |db| db.are_friends(a, b)).await
    }

    async fn is_group_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        self.run(move |db| db.is_group_member(group_id, user_id))
            .await
    }

    async fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StoreError> {
        self.run(move |db| db.group_members(group_id)).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        self.run(move |db| db.insert_message(&message)).await
    }

    async fn enqueue_offline(&self, item: NewOfflineItem) -> Result<OfflineItem, StoreError> {
        self.run(move |db| db.enqueue_offline(&item)).await
    }

    async fn pending_offline(
        &self,
        recipient_id: UserId,
    ) -> Result<Vec<OfflineItem>, StoreError> {
        self.run(move |db| db.pending_offline(recipient_id)).await
    }

    async fn mark_delivered(&self, item_id: OfflineItemId) -> Result<bool, StoreError> {
        self.run(move |db| db.mark_delivered(item_id)).await
    }

    async fn create_call(&self, call: NewCall) -> Result<Call, StoreError> {
        self.run(move |db| db.create_call(&call)).await
    }

    async fn get_call(&self, call_id: CallId) -> Result<Option<Call>, StoreError> {
        self.run(move |db| db.get_call(call_id)).await
    }

    async fn transition_call(
        &self,
        call_id: CallId,
        expected: &[CallStatus],
        next: CallStatus,
        ended_at: Option<u64>,
    ) -> Result<Option<Call>, StoreError> {
        let expected = expected.to_vec();
        self.run(move |db| db.transition_call(call_id, &expected, next, ended_at))
            .await
    }
}
