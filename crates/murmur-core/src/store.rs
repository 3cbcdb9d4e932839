//! Persistence and directory collaborator.
//!
//! The core never owns user accounts, friendships or groups. It reads them,
//! and hands message and call records back, through the [`Store`] trait.

use async_trait::async_trait;
use murmur_protocol::{CallId, CallStatus, GroupId, UserId};
use std::fmt;
use thiserror::Error;

use crate::call::{Call, NewCall};
use crate::message::{ChatMessage, NewMessage, NewOfflineItem, OfflineItem, OfflineItemId};

/// Storage errors.
///
/// These are the unrecoverable failures of the persistence layer; they fail
/// the one operation that hit them.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend reported an error.
    #[error("Storage backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A blocking storage task panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(String),

    /// A row that must exist was missing.
    #[error("Record not found: {0}")]
    Missing(String),
}

/// Relationship state between two users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FriendshipStatus {
    Pending,
    Accepted,
    Blocked,
}

impl FriendshipStatus {
    /// Stable string form, as stored.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FriendshipStatus::Pending => "pending",
            FriendshipStatus::Accepted => "accepted",
            FriendshipStatus::Blocked => "blocked",
        }
    }
}

impl TryFrom<&str> for FriendshipStatus {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(FriendshipStatus::Pending),
            "accepted" => Ok(FriendshipStatus::Accepted),
            "blocked" => Ok(FriendshipStatus::Blocked),
            _ => Err("Invalid friendship status"),
        }
    }
}

impl fmt::Display for FriendshipStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the core reads from, and writes to, the outside world.
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve a bearer credential to a user.
    async fn authenticate(&self, credential: &str) -> Result<Option<UserId>, StoreError>;

    /// Check whether a user id is known.
    async fn user_exists(&self, user_id: UserId) -> Result<bool, StoreError>;

    /// Record whether a user currently has a live connection.
    async fn set_active(&self, user_id: UserId, active: bool) -> Result<(), StoreError>;

    /// Mark every user inactive.
    async fn clear_active(&self) -> Result<(), StoreError>;

    /// Check for an accepted friendship between two users.
    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, StoreError>;

    /// Check whether `user_id` currently belongs to `group_id`.
    async fn is_group_member(&self, group_id: GroupId, user_id: UserId)
        -> Result<bool, StoreError>;

    /// Current members of a group.
    async fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StoreError>;

    /// Persist a chat message, unread.
    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    /// Queue a message for a recipient who is away.
    async fn enqueue_offline(&self, item: NewOfflineItem) -> Result<OfflineItem, StoreError>;

    /// Undelivered items for `recipient_id`, oldest first.
    async fn pending_offline(&self, recipient_id: UserId)
        -> Result<Vec<OfflineItem>, StoreError>;

    /// Flag an item delivered. Returns `false` if it already was.
    async fn mark_delivered(&self, item_id: OfflineItemId) -> Result<bool, StoreError>;

    /// Persist a new call in `pending`.
    async fn create_call(&self, call: NewCall) -> Result<Call, StoreError>;

    /// Fetch a call.
    async fn get_call(&self, call_id: CallId) -> Result<Option<Call>, StoreError>;

    /// Move a call to `next` if its stored status is one of `expected`.
    ///
    /// `ended_at` is written only if the call has none yet. Returns the
    /// updated call, or `None` if the call is missing or was in another
    /// state.
    async fn transition_call(
        &self,
        call_id: CallId,
        expected: &[CallStatus],
        next: CallStatus,
        ended_at: Option<u64>,
    ) -> Result<Option<Call>, StoreError>;
}
