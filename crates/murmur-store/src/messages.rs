//! Chat messages and the offline queue.

use murmur_core::{now_millis, ChatMessage, NewMessage, NewOfflineItem, OfflineItem, OfflineItemId};
use murmur_protocol::UserId;
use rusqlite::{params, OptionalExtension};

use crate::database::{millis_from_sql, millis_to_sql, Database};
use crate::error::{Result, SqliteError};

impl Database {
    pub fn insert_message(&self, message: &NewMessage) -> Result<ChatMessage> {
        let created_at = now_millis();
        self.conn().execute(
            "INSERT INTO messages (sender_id, recipient_id, content, is_group, group_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                message.sender_id,
                message.recipient_id,
                message.content,
                message.is_group,
                message.group_id,
                millis_to_sql(created_at),
            ],
        )?;

        Ok(ChatMessage {
            id: self.conn().last_insert_rowid(),
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content.clone(),
            is_group: message.is_group,
            group_id: message.group_id,
            created_at,
            is_read: false,
        })
    }

    pub fn enqueue_offline(&self, item: &NewOfflineItem) -> Result<OfflineItem> {
        let created_at = now_millis();
        self.conn().execute(
            "INSERT INTO offline_messages (message_id, sender_id, recipient_id, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                item.message_id,
                item.sender_id,
                item.recipient_id,
                item.content,
                millis_to_sql(created_at),
            ],
        )?;

        Ok(OfflineItem {
            id: self.conn().last_insert_rowid(),
            message_id: item.message_id,
            sender_id: item.sender_id,
            recipient_id: item.recipient_id,
            content: item.content.clone(),
            created_at,
            delivered: false,
        })
    }

    /// Undelivered items for a recipient, oldest first.
    pub fn pending_offline(&self, recipient_id: UserId) -> Result<Vec<OfflineItem>> {
        let mut stmt = self.conn().prepare(
            "SELECT id, message_id, sender_id, recipient_id, content, created_at, delivered
             FROM offline_messages
             WHERE recipient_id = ?1 AND delivered = 0
             ORDER BY created_at ASC, id ASC",
        )?;

        let rows = stmt.query_map(params![recipient_id], row_to_offline_item)?;

        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    }

    /// Flip an item to delivered. Returns `false` if it already was.
    pub fn mark_delivered(&self, item_id: OfflineItemId) -> Result<bool> {
        let updated = self.conn().execute(
            "UPDATE offline_messages SET delivered = 1 WHERE id = ?1 AND delivered = 0",
            params![item_id],
        )?;
        if updated > 0 {
            return Ok(true);
        }

        let exists = self
            .conn()
            .query_row(
                "SELECT 1 FROM offline_messages WHERE id = ?1",
                params![item_id],
                |_| Ok(()),
            )
            .optional()?;
        match exists {
            Some(()) => Ok(false),
            None => Err(SqliteError::NotFound(format!("offline item {}", item_id))),
        }
    }
}

fn row_to_offline_item(row: &rusqlite::Row<'_>) -> rusqlite::Result<OfflineItem> {
    Ok(OfflineItem {
        id: row.get(0)?,
        message_id: row.get(1)?,
        sender_id: row.get(2)?,
        recipient_id: row.get(3)?,
        content: row.get(4)?,
        created_at: millis_from_sql(row.get(5)?),
        delivered: row.get(6)?,
    })
}
