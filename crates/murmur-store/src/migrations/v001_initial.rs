//! v001 -- Initial schema.
//!
//! Timestamps are integer milliseconds since the Unix epoch. Statuses are
//! stored as lowercase text and checked against their closed vocabularies.

use rusqlite::Connection;

const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Identity
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    username   TEXT NOT NULL UNIQUE,
    is_active  INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    token      TEXT PRIMARY KEY NOT NULL,
    user_id    INTEGER NOT NULL,
    created_at INTEGER NOT NULL,

    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_auth_tokens_user ON auth_tokens(user_id);

-- ----------------------------------------------------------------
-- Relationships
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS friendships (
    user_id    INTEGER NOT NULL,   -- requester
    friend_id  INTEGER NOT NULL,
    status     TEXT NOT NULL CHECK (status IN ('pending', 'accepted', 'blocked')),
    created_at INTEGER NOT NULL,

    PRIMARY KEY (user_id, friend_id),
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
    FOREIGN KEY (friend_id) REFERENCES users(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS groups (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL,
    created_by INTEGER,
    created_at INTEGER NOT NULL,

    FOREIGN KEY (created_by) REFERENCES users(id) ON DELETE SET NULL
);

CREATE TABLE IF NOT EXISTS group_members (
    group_id  INTEGER NOT NULL,
    user_id   INTEGER NOT NULL,
    joined_at INTEGER NOT NULL,

    PRIMARY KEY (group_id, user_id),
    FOREIGN KEY (group_id) REFERENCES groups(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_id    INTEGER NOT NULL,
    recipient_id INTEGER NOT NULL,   -- user id, or group id when is_group
    content      TEXT NOT NULL,
    is_group     INTEGER NOT NULL DEFAULT 0,
    group_id     INTEGER,
    created_at   INTEGER NOT NULL,
    is_read      INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (sender_id) REFERENCES users(id),
    FOREIGN KEY (group_id) REFERENCES groups(id)
);

CREATE INDEX IF NOT EXISTS idx_messages_recipient
    ON messages(recipient_id, created_at);

CREATE TABLE IF NOT EXISTS offline_messages (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id   INTEGER NOT NULL,
    sender_id    INTEGER NOT NULL,
    recipient_id INTEGER NOT NULL,
    content      TEXT NOT NULL,
    created_at   INTEGER NOT NULL,
    delivered    INTEGER NOT NULL DEFAULT 0,

    FOREIGN KEY (message_id) REFERENCES messages(id),
    FOREIGN KEY (recipient_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_offline_pending
    ON offline_messages(recipient_id, delivered, created_at, id);

-- ----------------------------------------------------------------
-- Calls
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS calls (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    initiator_id INTEGER NOT NULL,
    receiver_id  INTEGER NOT NULL,
    call_type    TEXT NOT NULL CHECK (call_type IN ('audio', 'video')),
    status       TEXT NOT NULL
                 CHECK (status IN ('pending', 'accepted', 'declined', 'missed', 'completed')),
    created_at   INTEGER NOT NULL,
    ended_at     INTEGER,

    FOREIGN KEY (initiator_id) REFERENCES users(id),
    FOREIGN KEY (receiver_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_calls_participants
    ON calls(initiator_id, receiver_id);
"#;

/// Apply the v001 migration.
pub fn up(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(UP_SQL)
}
