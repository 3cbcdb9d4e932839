//! Users, credentials, friendships and groups.
//!
//! The core only reads these tables; the provisioning helpers exist for the
//! account surface and for tests.

use murmur_core::{now_millis, FriendshipStatus};
use murmur_protocol::{GroupId, UserId};
use rusqlite::{params, OptionalExtension};

use crate::database::{millis_to_sql, Database};
use crate::error::Result;

impl Database {
    /// Create a user and return its id.
    pub fn create_user(&self, username: &str) -> Result<UserId> {
        self.conn().execute(
            "INSERT INTO users (username, created_at) VALUES (?1, ?2)",
            params![username, millis_to_sql(now_millis())],
        )?;
        Ok(self.conn().last_insert_rowid())
    }

    /// Attach a bearer credential to a user.
    pub fn issue_token(&self, user_id: UserId, token: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO auth_tokens (token, user_id, created_at) VALUES (?1, ?2, ?3)",
            params![token, user_id, millis_to_sql(now_millis())],
        )?;
        Ok(())
    }

    pub fn authenticate(&self, token: &str) -> Result<Option<UserId>> {
        let user_id = self
            .conn()
            .query_row(
                "SELECT user_id FROM auth_tokens WHERE token = ?1",
                params![token],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id)
    }

    pub fn user_exists(&self, user_id: UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM users WHERE id = ?1",
                params![user_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn set_active(&self, user_id: UserId, active: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE users SET is_active = ?1 WHERE id = ?2",
            params![active, user_id],
        )?;
        Ok(())
    }

    /// Mark every user inactive. Returns how many were active.
    pub fn clear_active(&self) -> Result<usize> {
        let cleared = self
            .conn()
            .execute("UPDATE users SET is_active = 0 WHERE is_active = 1", [])?;
        Ok(cleared)
    }

    pub fn is_active(&self, user_id: UserId) -> Result<bool> {
        let active = self
            .conn()
            .query_row(
                "SELECT is_active FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(active.unwrap_or(false))
    }

    /// Record the relationship `user_id -> friend_id`.
    ///
    /// Replaces any row in either direction so a pair has one status.
    pub fn set_friendship(
        &self,
        user_id: UserId,
        friend_id: UserId,
        status: FriendshipStatus,
    ) -> Result<()> {
        self.conn().execute(
            "DELETE FROM friendships WHERE user_id = ?1 AND friend_id = ?2",
            params![friend_id, user_id],
        )?;
        self.conn().execute(
            "INSERT INTO friendships (user_id, friend_id, status, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, friend_id) DO UPDATE SET status = excluded.status",
            params![user_id, friend_id, status.as_str(), millis_to_sql(now_millis())],
        )?;
        Ok(())
    }

    /// Check for an accepted friendship in either direction.
    pub fn are_friends(&self, a: UserId, b: UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM friendships
                 WHERE ((user_id = ?1 AND friend_id = ?2) OR (user_id = ?2 AND friend_id = ?1))
                   AND status = 'accepted'",
                params![a, b],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Create a group owned by `created_by` and add the owner as a member.
    pub fn create_group(&self, name: &str, created_by: UserId) -> Result<GroupId> {
        self.conn().execute(
            "INSERT INTO groups (name, created_by, created_at) VALUES (?1, ?2, ?3)",
            params![name, created_by, millis_to_sql(now_millis())],
        )?;
        let group_id = self.conn().last_insert_rowid();
        self.add_group_member(group_id, created_by)?;
        Ok(group_id)
    }

    pub fn add_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<()> {
        self.conn().execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![group_id, user_id, millis_to_sql(now_millis())],
        )?;
        Ok(())
    }

    pub fn is_group_member(&self, group_id: GroupId, user_id: UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM group_members WHERE group_id = ?1 AND user_id = ?2",
                params![group_id, user_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn group_members(&self, group_id: GroupId) -> Result<Vec<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM group_members WHERE group_id = ?1 ORDER BY user_id")?;
        let rows = stmt.query_map(params![group_id], |row| row.get(0))?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }
}
