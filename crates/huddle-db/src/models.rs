//! Row types for the SQLite tables, plus their conversion into domain models.
//! Distinct from huddle-types models to keep the DB layer independent.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use huddle_types::models::{Author, Message, MessageRecord};

/// Display name joined onto rows whose sender has no profile row.
pub const UNKNOWN_AUTHOR: &str = "unknown";

pub struct ProfileRow {
    pub id: String,
    pub display_name: String,
    pub avatar_ref: Option<String>,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: String,
    pub author_display_name: Option<String>,
    pub author_avatar_ref: Option<String>,
}

impl ProfileRow {
    pub fn into_author(self) -> Result<Author> {
        Ok(Author {
            id: self.id.parse().with_context(|| format!("corrupt profile id '{}'", self.id))?,
            display_name: self.display_name,
            avatar_ref: self.avatar_ref,
        })
    }
}

impl MessageRow {
    pub fn into_message(self) -> Result<Message> {
        let id: Uuid = self.id.parse().with_context(|| format!("corrupt message id '{}'", self.id))?;
        let room_id: Uuid = self
            .room_id
            .parse()
            .with_context(|| format!("corrupt room_id '{}' on message '{}'", self.room_id, self.id))?;
        let sender_id: Uuid = self
            .sender_id
            .parse()
            .with_context(|| format!("corrupt sender_id '{}' on message '{}'", self.sender_id, self.id))?;
        let created_at = parse_timestamp(&self.created_at)
            .with_context(|| format!("corrupt created_at '{}' on message '{}'", self.created_at, self.id))?;

        let record = MessageRecord {
            id,
            room_id,
            sender_id,
            content: self.content,
            created_at,
        };
        let author = Author {
            id: sender_id,
            display_name: self
                .author_display_name
                .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string()),
            avatar_ref: self.author_avatar_ref,
        };
        Ok(Message::from_record(record, author))
    }
}

/// Fixed-width RFC 3339 so that lexical order on the column is chronological.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}
