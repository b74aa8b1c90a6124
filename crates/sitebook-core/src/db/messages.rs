//! Messaging substrate
//!
//! Channels are synthetic keys (`type:scope_id`); messages carry rendered
//! blocks and metadata so agents can post cards and buttons. Soft-deleted
//! messages never count toward unread totals.

use chrono::Utc;
use rusqlite::{params, Row};
use serde::Serialize;
use uuid::Uuid;

use super::{fmt_datetime, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::models::Message;

/// Unread count for one channel
#[derive(Debug, Clone, Serialize)]
pub struct UnreadCount {
    pub channel_key: String,
    pub count: i64,
}

fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    Ok(Message {
        id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_default(),
        channel_key: row.get(1)?,
        author_id: Uuid::parse_str(&row.get::<_, String>(2)?).unwrap_or_default(),
        body: row.get(3)?,
        blocks: row
            .get::<_, Option<String>>(4)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        metadata: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        reply_to: row
            .get::<_, Option<String>>(6)?
            .and_then(|s| Uuid::parse_str(&s).ok()),
        deleted: row.get::<_, i64>(7)? != 0,
        created_at: parse_datetime(&row.get::<_, String>(8)?),
    })
}

const MESSAGE_COLS: &str =
    "id, channel_key, author_id, body, blocks, metadata, reply_to, deleted, created_at";

impl Database {
    /// Post a message. Mentions (`@name` resolved by the caller to user ids)
    /// are recorded for notification fan-out.
    pub fn post_message(
        &self,
        channel_key: &str,
        author_id: Uuid,
        body: &str,
        blocks: Option<&serde_json::Value>,
        metadata: Option<&serde_json::Value>,
        reply_to: Option<Uuid>,
        mentions: &[Uuid],
    ) -> Result<Uuid> {
        if channel_key.trim().is_empty() || !channel_key.contains(':') {
            return Err(Error::Validation(format!(
                "Invalid channel key: '{}'",
                channel_key
            )));
        }
        if body.trim().is_empty() {
            return Err(Error::Validation("Message body is empty".into()));
        }

        let id = Uuid::new_v4();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO messages (id, channel_key, author_id, body, blocks, metadata, reply_to, deleted, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
            "#,
            params![
                id.to_string(),
                channel_key,
                author_id.to_string(),
                body,
                blocks.map(|b| b.to_string()),
                metadata.map(|m| m.to_string()),
                reply_to.map(|r| r.to_string()),
                fmt_datetime(Utc::now()),
            ],
        )?;
        for user in mentions {
            tx.execute(
                "INSERT OR IGNORE INTO message_mentions (message_id, user_id) VALUES (?, ?)",
                params![id.to_string(), user.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(id)
    }

    /// Recent messages in a channel, newest last (for agent context windows).
    pub fn recent_messages(&self, channel_key: &str, limit: i64) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM (
                SELECT {} FROM messages
                 WHERE channel_key = ? AND deleted = 0
                 ORDER BY created_at DESC LIMIT ?
            ) ORDER BY created_at ASC
            "#,
            MESSAGE_COLS, MESSAGE_COLS
        ))?;
        let rows = stmt
            .query_map(params![channel_key, limit], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<Message>> {
        use rusqlite::OptionalExtension;
        let conn = self.conn()?;
        let msg = conn
            .query_row(
                &format!("SELECT {} FROM messages WHERE id = ?", MESSAGE_COLS),
                params![id.to_string()],
                row_to_message,
            )
            .optional()?;
        Ok(msg)
    }

    /// Soft-delete a message.
    pub fn delete_message(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE messages SET deleted = 1 WHERE id = ?",
            params![id.to_string()],
        )?;
        if n == 0 {
            return Err(Error::NotFound(format!("Message {}", id)));
        }
        Ok(())
    }

    /// Mark a channel read for a user up to now.
    pub fn mark_channel_read(&self, user_id: Uuid, channel_key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO channel_read_status (user_id, channel_key, last_read_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id, channel_key) DO UPDATE SET last_read_at = excluded.last_read_at
            "#,
            params![user_id.to_string(), channel_key, fmt_datetime(Utc::now())],
        )?;
        Ok(())
    }

    /// Unread counts per channel the user has ever read or been mentioned in,
    /// excluding soft-deleted messages and the user's own posts.
    pub fn unread_counts(&self, user_id: Uuid) -> Result<Vec<UnreadCount>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT m.channel_key, COUNT(*)
              FROM messages m
              LEFT JOIN channel_read_status r
                ON r.channel_key = m.channel_key AND r.user_id = ?1
             WHERE m.deleted = 0
               AND m.author_id != ?1
               AND (r.last_read_at IS NULL OR m.created_at > r.last_read_at)
             GROUP BY m.channel_key
             ORDER BY m.channel_key
            "#,
        )?;
        let rows = stmt
            .query_map(params![user_id.to_string()], |row| {
                Ok(UnreadCount {
                    channel_key: row.get(0)?,
                    count: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Users mentioned in a message (for push fan-out).
    pub fn message_mentions(&self, message_id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT user_id FROM message_mentions WHERE message_id = ?")?;
        let rows = stmt
            .query_map(params![message_id.to_string()], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .filter_map(|s| Uuid::parse_str(&s).ok())
            .collect())
    }
}
