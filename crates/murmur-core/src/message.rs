//! Chat message and offline queue records.

use murmur_protocol::{GroupId, MessageId, ServerFrame, UserId};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a queued offline item.
pub type OfflineItemId = i64;

/// Current time in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// A message about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    /// Recipient user, or the group for group messages.
    pub recipient_id: i64,
    pub content: String,
    pub is_group: bool,
    pub group_id: Option<GroupId>,
}

/// A persisted chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: i64,
    pub content: String,
    pub is_group: bool,
    pub group_id: Option<GroupId>,
    pub created_at: u64,
    /// Flips only when the recipient fetches the conversation.
    pub is_read: bool,
}

impl ChatMessage {
    /// Live delivery frame for this message.
    #[must_use]
    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::Message {
            message_id: self.id,
            sender_id: self.sender_id,
            content: self.content.clone(),
            created_at: self.created_at,
            is_group: self.is_group,
            group_id: self.group_id,
            offline: false,
        }
    }
}

/// An offline item about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOfflineItem {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
}

impl From<&ChatMessage> for NewOfflineItem {
    fn from(message: &ChatMessage) -> Self {
        Self {
            message_id: message.id,
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content.clone(),
        }
    }
}

/// A message awaiting delivery to a recipient who was away at send time.
///
/// Never deleted; `delivered` flips once after a successful push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineItem {
    pub id: OfflineItemId,
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: u64,
    pub delivered: bool,
}

impl OfflineItem {
    /// Delivery frame used when flushing the queue.
    #[must_use]
    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::Message {
            message_id: self.message_id,
            sender_id: self.sender_id,
            content: self.content.clone(),
            created_at: self.created_at,
            is_group: false,
            group_id: None,
            offline: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> ChatMessage {
        ChatMessage {
            id: 10,
            sender_id: 1,
            recipient_id: 2,
            content: "hi".to_string(),
            is_group: false,
            group_id: None,
            created_at: 1_000,
            is_read: false,
        }
    }

    #[test]
    fn test_offline_item_from_message() {
        let item = NewOfflineItem::from(&message());
        assert_eq!(item.message_id, 10);
        assert_eq!(item.recipient_id, 2);
        assert_eq!(item.content, "hi");
    }

    #[test]
    fn test_offline_frame_is_flagged() {
        let item = OfflineItem {
            id: 1,
            message_id: 10,
            sender_id: 1,
            recipient_id: 2,
            content: "hi".to_string(),
            created_at: 1_000,
            delivered: false,
        };

        match item.to_frame() {
            ServerFrame::Message {
                offline,
                message_id,
                ..
            } => {
                assert!(offline);
                assert_eq!(message_id, 10);
            }
            other => panic!("unexpected frame {:?}", other),
        }

        assert!(matches!(
            message().to_frame(),
            ServerFrame::Message { offline: false, .. }
        ));
    }

    #[test]
    fn test_now_millis_advances() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
        assert!(a > 0);
    }
}
