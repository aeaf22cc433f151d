//! Database row types. These map directly to SQLite rows and are converted
//! into `slowchat-types` models at the edge of this crate.

use chrono::{DateTime, Utc};
use rusqlite::Row;
use tracing::warn;
use uuid::Uuid;

use slowchat_types::models::{Message, MessageKind, ReactionGroup, User, UserSummary};

use crate::parse_timestamp;

pub const USER_COLUMNS: &str = "id, username, email, phone, name, avatar_url, password, \
     oauth_provider, oauth_provider_id, created_at";

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: String,
    pub username: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub password: Option<String>,
    pub oauth_provider: Option<String>,
    pub oauth_provider_id: Option<String>,
    pub created_at: String,
}

impl UserRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            phone: row.get(3)?,
            name: row.get(4)?,
            avatar_url: row.get(5)?,
            password: row.get(6)?,
            oauth_provider: row.get(7)?,
            oauth_provider_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    pub fn handle(&self) -> String {
        self.username
            .clone()
            .or_else(|| self.email.clone())
            .unwrap_or_default()
    }

    pub fn to_user(&self) -> User {
        User {
            id: parse_id(&self.id, "user"),
            username: self.username.clone(),
            email: self.email.clone(),
            phone: self.phone.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
            oauth_provider: self.oauth_provider.clone(),
            created_at: parse_created(&self.created_at, &self.id),
        }
    }

    pub fn to_summary(&self) -> UserSummary {
        UserSummary {
            id: parse_id(&self.id, "user"),
            username: self.username.clone(),
            name: self.name.clone(),
            avatar_url: self.avatar_url.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub remember: bool,
    /// Unix seconds.
    pub expires_at: i64,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct ChatRow {
    pub id: String,
    pub name: Option<String>,
    pub is_group: bool,
    pub avatar_url: Option<String>,
    pub created_by: Option<String>,
    pub direct_key: Option<String>,
    pub last_message_id: Option<String>,
    pub last_seq: i64,
    pub created_at: String,
}

pub const CHAT_COLUMNS: &str = "id, name, is_group, avatar_url, created_by, direct_key, \
     last_message_id, last_seq, created_at";

impl ChatRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            is_group: row.get(2)?,
            avatar_url: row.get(3)?,
            created_by: row.get(4)?,
            direct_key: row.get(5)?,
            last_message_id: row.get(6)?,
            last_seq: row.get(7)?,
            created_at: row.get(8)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct MemberRow {
    pub chat_id: String,
    pub user_id: String,
    pub username: Option<String>,
    pub name: Option<String>,
    pub avatar_url: Option<String>,
    pub is_admin: bool,
    pub delivered_seq: i64,
    pub read_seq: i64,
}

#[derive(Debug, Clone)]
pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub seq: i64,
    pub sender_id: String,
    pub sender_username: Option<String>,
    pub content: String,
    pub kind: String,
    pub reply_to: Option<String>,
    pub client_id: Option<String>,
    pub created_at: String,
}

/// Selects message columns joined with the sender's username.
/// Callers append their own WHERE / ORDER BY.
pub const MESSAGE_SELECT: &str = "SELECT m.id, m.chat_id, m.seq, m.sender_id, u.username, m.content, m.kind, \
     m.reply_to, m.client_id, m.created_at
     FROM messages m
     LEFT JOIN users u ON m.sender_id = u.id";

impl MessageRow {
    pub(crate) fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            seq: row.get(2)?,
            sender_id: row.get(3)?,
            sender_username: row.get(4)?,
            content: row.get(5)?,
            kind: row.get(6)?,
            reply_to: row.get(7)?,
            client_id: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    pub fn to_message(&self, reactions: Vec<ReactionGroup>) -> Message {
        Message {
            id: parse_id(&self.id, "message"),
            chat_id: parse_id(&self.chat_id, "chat"),
            seq: self.seq,
            sender_id: parse_id(&self.sender_id, "sender"),
            sender_username: self.sender_username.clone(),
            content: self.content.clone(),
            kind: self.kind.parse().unwrap_or_else(|e| {
                warn!("Corrupt kind on message '{}': {}", self.id, e);
                MessageKind::Text
            }),
            reply_to: self.reply_to.as_deref().map(|id| parse_id(id, "reply_to")),
            client_id: self.client_id.clone(),
            created_at: parse_created(&self.created_at, &self.id),
            reactions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReactionRow {
    pub id: String,
    pub message_id: String,
    pub user_id: String,
    pub emoji: String,
    pub created_at: String,
}

pub(crate) fn parse_id(raw: &str, what: &str) -> Uuid {
    raw.parse().unwrap_or_else(|e| {
        warn!("Corrupt {} id '{}': {}", what, raw, e);
        Uuid::default()
    })
}

fn parse_created(raw: &str, owner: &str) -> DateTime<Utc> {
    parse_timestamp(raw).unwrap_or_else(|| {
        warn!("Corrupt created_at '{}' on '{}'", raw, owner);
        DateTime::default()
    })
}
