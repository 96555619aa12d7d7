use crate::Database;
use crate::models::{MessageRow, ProfileRow, format_timestamp};
use anyhow::Result;
use rusqlite::Connection;
use uuid::Uuid;

use huddle_types::models::MessageRecord;

impl Database {
    // -- Profiles --

    pub fn upsert_profile(&self, id: &Uuid, display_name: &str, avatar_ref: Option<&str>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO profiles (id, display_name, avatar_ref) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET display_name = excluded.display_name,
                                               avatar_ref = excluded.avatar_ref",
                rusqlite::params![id.to_string(), display_name, avatar_ref],
            )?;
            Ok(())
        })
    }

    pub fn get_profile(&self, id: &Uuid) -> Result<Option<ProfileRow>> {
        self.with_conn(|conn| query_profile(conn, &id.to_string()))
    }

    // -- Messages --

    /// Insert a message row. Returns false if a row with this id already exists.
    pub fn insert_message(&self, record: &MessageRecord) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO messages (id, room_id, sender_id, content, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    record.id.to_string(),
                    record.room_id.to_string(),
                    record.sender_id.to_string(),
                    record.content,
                    format_timestamp(&record.created_at),
                ],
            )?;
            Ok(changed == 1)
        })
    }

    /// Newest-first window of a room's messages. `from` and `to` are
    /// inclusive row offsets, so at most `to - from + 1` rows come back.
    pub fn get_messages(&self, room_id: &Uuid, from: u32, to: u32) -> Result<Vec<MessageRow>> {
        if to < from {
            return Ok(vec![]);
        }
        self.with_conn(|conn| query_messages(conn, &room_id.to_string(), from, (to - from).saturating_add(1)))
    }
}

fn query_profile(conn: &Connection, id: &str) -> Result<Option<ProfileRow>> {
    let mut stmt =
        conn.prepare("SELECT id, display_name, avatar_ref, created_at FROM profiles WHERE id = ?1")?;

    let row = stmt
        .query_row([id], |row| {
            Ok(ProfileRow {
                id: row.get(0)?,
                display_name: row.get(1)?,
                avatar_ref: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .optional()?;

    Ok(row)
}

fn query_messages(conn: &Connection, room_id: &str, offset: u32, limit: u32) -> Result<Vec<MessageRow>> {
    // JOIN profiles to fetch the author projection in a single query
    let mut stmt = conn.prepare(
        "SELECT m.id, m.room_id, m.sender_id, m.content, m.created_at, p.display_name, p.avatar_ref
         FROM messages m
         LEFT JOIN profiles p ON m.sender_id = p.id
         WHERE m.room_id = ?1
         ORDER BY m.created_at DESC, m.id DESC
         LIMIT ?2 OFFSET ?3",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![room_id, limit, offset], |row| {
            Ok(MessageRow {
                id: row.get(0)?,
                room_id: row.get(1)?,
                sender_id: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
                author_display_name: row.get(5)?,
                author_avatar_ref: row.get(6)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
