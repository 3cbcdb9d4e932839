//! In-process [`Store`] implementation.
//!
//! Keeps every table in memory behind one async mutex. Nothing survives a
//! restart, so this backs tests and embedders that bring their own
//! durability.

use async_trait::async_trait;
use murmur_protocol::{CallId, CallStatus, GroupId, UserId};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;

use crate::call::{Call, NewCall};
use crate::message::{
    now_millis, ChatMessage, NewMessage, NewOfflineItem, OfflineItem, OfflineItemId,
};
use crate::store::{FriendshipStatus, Store, StoreError};

#[derive(Debug, Default)]
struct Tables {
    /// User id -> active flag.
    users: HashMap<UserId, bool>,
    credentials: HashMap<String, UserId>,
    /// Keyed by the ordered pair (low id, high id).
    friendships: HashMap<(UserId, UserId), FriendshipStatus>,
    groups: HashMap<GroupId, BTreeSet<UserId>>,
    messages: Vec<ChatMessage>,
    offline: Vec<OfflineItem>,
    calls: BTreeMap<CallId, Call>,
}

fn pair(a: UserId, b: UserId) -> (UserId, UserId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Memory-backed store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user reachable with `credential`.
    pub async fn add_user(&self, user_id: UserId, credential: impl Into<String>) {
        let mut tables = self.tables.lock().await;
        tables.users.entry(user_id).or_insert(false);
        tables.credentials.insert(credential.into(), user_id);
    }

    /// Set the relationship between two users.
    pub async fn set_friendship(&self, a: UserId, b: UserId, status: FriendshipStatus) {
        self.tables
            .lock()
            .await
            .friendships
            .insert(pair(a, b), status);
    }

    /// Shorthand for an accepted friendship.
    pub async fn befriend(&self, a: UserId, b: UserId) {
        self.set_friendship(a, b, FriendshipStatus::Accepted).await;
    }

    /// Add a user to a group, creating the group if needed.
    pub async fn add_group_member(&self, group_id: GroupId, user_id: UserId) {
        self.tables
            .lock()
            .await
            .groups
            .entry(group_id)
            .or_default()
            .insert(user_id);
    }

    /// Snapshot of every stored chat message.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.tables.lock().await.messages.clone()
    }

    /// Snapshot of every offline item, delivered or not.
    pub async fn offline_items(&self) -> Vec<OfflineItem> {
        self.tables.lock().await.offline.clone()
    }

    /// Current active flag of a user.
    pub async fn is_active(&self, user_id: UserId) -> bool {
        self.tables
            .lock()
            .await
            .users
            .get(&user_id)
            .copied()
            .unwrap_or(false)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn authenticate(&self, credential: &str) -> Result<Option<UserId>, StoreError> {
        Ok(self.tables.lock().await.credentials.get(credential).copied())
    }

    async fn user_exists(&self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.tables.lock().await.users.contains_key(&user_id))
    }

    async fn set_active(&self, user_id: UserId, active: bool) -> Result<(), StoreError> {
        if let Some(flag) = self.tables.lock().await.users.get_mut(&user_id) {
            *flag = active;
        }
        Ok(())
    }

    async fn clear_active(&self) -> Result<(), StoreError> {
        for flag in self.tables.lock().await.users.values_mut() {
            *flag = false;
        }
        Ok(())
    }

    async fn are_friends(&self, a: UserId, b: UserId) -> Result<bool, StoreError> {
        Ok(matches!(
            self.tables.lock().await.friendships.get(&pair(a, b)),
            Some(FriendshipStatus::Accepted)
        ))
    }

    async fn is_group_member(
        &self,
        group_id: GroupId,
        user_id: UserId,
    ) -> Result<bool, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .groups
            .get(&group_id)
            .is_some_and(|members| members.contains(&user_id)))
    }

    async fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>, StoreError> {
        Ok(self
            .tables
            .lock()
            .await
            .groups
            .get(&group_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let mut tables = self.tables.lock().await;
        let stored = ChatMessage {
            id: tables.messages.len() as i64 + 1,
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content,
            is_group: message.is_group,
            group_id: message.group_id,
            created_at: now_millis(),
            is_read: false,
        };
        tables.messages.push(stored.clone());
        Ok(stored)
    }

    async fn enqueue_offline(&self, item: NewOfflineItem) -> Result<OfflineItem, StoreError> {
        let mut tables = self.tables.lock().await;
        let stored = OfflineItem {
            id: tables.offline.len() as i64 + 1,
            message_id: item.message_id,
            sender_id: item.sender_id,
            recipient_id: item.recipient_id,
            content: item.content,
            created_at: now_millis(),
            delivered: false,
        };
        tables.offline.push(stored.clone());
        Ok(stored)
    }

    async fn pending_offline(
        &self,
        recipient_id: UserId,
    ) -> Result<Vec<OfflineItem>, StoreError> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<OfflineItem> = tables
            .offline
            .iter()
            .filter(|item| item.recipient_id == recipient_id && !item.delivered)
            .cloned()
            .collect();
        pending.sort_by_key(|item| (item.created_at, item.id));
        Ok(pending)
    }

    async fn mark_delivered(&self, item_id: OfflineItemId) -> Result<bool, StoreError> {
        let mut tables = self.tables.lock().await;
        match tables.offline.iter_mut().find(|item| item.id == item_id) {
            Some(item) if !item.delivered => {
                item.delivered = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(StoreError::Missing(format!("offline item {}", item_id))),
        }
    }

    async fn create_call(&self, call: NewCall) -> Result<Call, StoreError> {
        let mut tables = self.tables.lock().await;
        let id = tables.calls.keys().next_back().copied().unwrap_or(0) + 1;
        let stored = Call {
            id,
            initiator_id: call.initiator_id,
            receiver_id: call.receiver_id,
            call_type: call.call_type,
            status: CallStatus::Pending,
            created_at: now_millis(),
            ended_at: None,
        };
        tables.calls.insert(id, stored.clone());
        Ok(stored)
    }

    async fn get_call(&self, call_id: CallId) -> Result<Option<Call>, StoreError> {
        Ok(self.tables.lock().await.calls.get(&call_id).cloned())
    }

    async fn transition_call(
        &self,
        call_id: CallId,
        expected: &[CallStatus],
        next: CallStatus,
        ended_at: Option<u64>,
    ) -> Result<Option<Call>, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(call) = tables.calls.get_mut(&call_id) else {
            return Ok(None);
        };
        if !expected.contains(&call.status) {
            return Ok(None);
        }

        call.status = next;
        if call.ended_at.is_none() {
            call.ended_at = ended_at;
        }
        Ok(Some(call.clone()))
    }
}
