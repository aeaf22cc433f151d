use std::collections::HashMap;

use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tracing::info;

use slowchat_types::models::{Chat, Participant, UserSummary};

use crate::models::{CHAT_COLUMNS, ChatRow, MESSAGE_SELECT, MemberRow, MessageRow, parse_id};
use crate::{Database, now_rfc3339, parse_timestamp, placeholders};

/// Result of a one-on-one lookup. `created` is false when the chat existed.
#[derive(Debug, Clone)]
pub struct DirectChat {
    pub chat: ChatRow,
    pub created: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    pub removed: bool,
    /// Member promoted to admin because the last admin left.
    pub promoted: Option<String>,
}

/// Canonical key of the participant set {a, b}; order-insensitive.
pub fn direct_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{}:{}", a, b)
    } else {
        format!("{}:{}", b, a)
    }
}

impl Database {
    // -- Chats --

    /// Returns the one-on-one chat between `a` and `b`, creating it under
    /// `new_id` if none exists. The UNIQUE direct key makes concurrent first
    /// contact converge on a single row.
    pub fn find_or_create_direct(&self, new_id: &str, a: &str, b: &str) -> Result<DirectChat> {
        if a == b {
            return Err(anyhow!("A direct chat needs two distinct participants"));
        }
        let key = direct_key(a, b);

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let inserted = tx.execute(
                "INSERT OR IGNORE INTO chats (id, is_group, direct_key, created_by, created_at)
                 VALUES (?1, 0, ?2, ?3, ?4)",
                params![new_id, key, a, now_rfc3339()],
            )?;

            if inserted == 1 {
                let mut stmt = tx.prepare(
                    "INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2)",
                )?;
                stmt.execute(params![new_id, a])?;
                stmt.execute(params![new_id, b])?;
            }

            let chat = tx.query_row(
                &format!("SELECT {} FROM chats WHERE direct_key = ?1", CHAT_COLUMNS),
                [&key],
                ChatRow::from_row,
            )?;
            tx.commit()?;

            if inserted == 1 {
                info!("Created direct chat {} for {}", chat.id, key);
            }
            Ok(DirectChat {
                chat,
                created: inserted == 1,
            })
        })
    }

    /// Creates a group. `creator` is always stored as a member and admin.
    pub fn create_group(
        &self,
        id: &str,
        name: &str,
        avatar_url: Option<&str>,
        creator: &str,
        members: &[String],
        admins: &[String],
    ) -> Result<ChatRow> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO chats (id, name, is_group, avatar_url, created_by, created_at)
                 VALUES (?1, ?2, 1, ?3, ?4, ?5)",
                params![id, name, avatar_url, creator, now_rfc3339()],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO chat_members (chat_id, user_id, is_admin) VALUES (?1, ?2, ?3)",
                )?;
                stmt.execute(params![id, creator, true])?;
                for member in members {
                    let is_admin = admins.contains(member);
                    stmt.execute(params![id, member, is_admin])?;
                }
            }

            let chat = query_chat(&tx, id)?.ok_or_else(|| anyhow!("Chat vanished after insert: {}", id))?;
            tx.commit()?;
            Ok(chat)
        })
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<ChatRow>> {
        self.with_conn(|conn| query_chat(conn, id))
    }

    pub fn get_member(&self, chat_id: &str, user_id: &str) -> Result<Option<MemberRow>> {
        self.with_conn(|conn| {
            let members = query_members(conn, &[chat_id.to_string()])?;
            Ok(members.into_iter().find(|m| m.user_id == user_id))
        })
    }

    pub fn chat_member_ids(&self, chat_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT user_id FROM chat_members WHERE chat_id = ?1")?;
            let ids = stmt
                .query_map([chat_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }

    /// Chats `user_id` belongs to, most recently active first.
    pub fn chats_for_user(&self, user_id: &str) -> Result<Vec<ChatRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM chats c
                 JOIN chat_members cm ON cm.chat_id = c.id AND cm.user_id = ?1
                 LEFT JOIN messages lm ON lm.id = c.last_message_id
                 ORDER BY COALESCE(lm.created_at, c.created_at) DESC, c.id",
                prefixed(CHAT_COLUMNS, "c")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map([user_id], ChatRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Adds members to a chat. New members start with their cursors at the
    /// chat's current `last_seq`, so earlier history is neither replayed nor
    /// counted as unread. Returns the ids that were not members before.
    pub fn add_members(&self, chat_id: &str, user_ids: &[String]) -> Result<Vec<String>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let mut added = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO chat_members (chat_id, user_id, delivered_seq, read_seq)
                     SELECT id, ?2, last_seq, last_seq FROM chats WHERE id = ?1",
                )?;
                for user_id in user_ids {
                    if stmt.execute(params![chat_id, user_id])? == 1 {
                        added.push(user_id.clone());
                    }
                }
            }
            tx.commit()?;
            Ok(added)
        })
    }

    /// Removes a member. A group that loses its last admin promotes the
    /// longest-standing remaining member.
    pub fn remove_member(&self, chat_id: &str, user_id: &str) -> Result<MembershipChange> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
            )? > 0;

            let mut promoted = None;
            if removed {
                let admins: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM chat_members WHERE chat_id = ?1 AND is_admin = 1",
                    [chat_id],
                    |row| row.get(0),
                )?;
                if admins == 0 {
                    let next: Option<String> = tx
                        .query_row(
                            "SELECT user_id FROM chat_members WHERE chat_id = ?1
                             ORDER BY joined_at, rowid LIMIT 1",
                            [chat_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    if let Some(next) = next {
                        tx.execute(
                            "UPDATE chat_members SET is_admin = 1 WHERE chat_id = ?1 AND user_id = ?2",
                            params![chat_id, next],
                        )?;
                        promoted = Some(next);
                    }
                }
            }
            tx.commit()?;
            Ok(MembershipChange { removed, promoted })
        })
    }

    /// Moves the delivered cursor forward (never back). Returns the cursor
    /// after the update, or `None` if the user is not a member.
    pub fn advance_delivered(&self, chat_id: &str, user_id: &str, seq: i64) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE chat_members
                 SET delivered_seq = MAX(delivered_seq,
                        MIN(?3, (SELECT last_seq FROM chats WHERE id = ?1)))
                 WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id, seq],
            )?;
            let cursor = conn
                .query_row(
                    "SELECT delivered_seq FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(cursor)
        })
    }

    /// Moves the read cursor forward, clamped to the chat's `last_seq`.
    /// Reading implies delivery, so the delivered cursor follows.
    /// Returns `(previous, current)` read cursors, or `None` for non-members.
    pub fn advance_read(&self, chat_id: &str, user_id: &str, seq: i64) -> Result<Option<(i64, i64)>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let previous: Option<i64> = tx
                .query_row(
                    "SELECT read_seq FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                    params![chat_id, user_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(previous) = previous else {
                return Ok(None);
            };

            tx.execute(
                "UPDATE chat_members
                 SET read_seq = MAX(read_seq, MIN(?3, (SELECT last_seq FROM chats WHERE id = ?1)))
                 WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id, seq],
            )?;
            tx.execute(
                "UPDATE chat_members SET delivered_seq = MAX(delivered_seq, read_seq)
                 WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
            )?;
            let current: i64 = tx.query_row(
                "SELECT read_seq FROM chat_members WHERE chat_id = ?1 AND user_id = ?2",
                params![chat_id, user_id],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(Some((previous, current)))
        })
    }

    /// Builds the API view of `chats` as seen by `viewer`: participants,
    /// last message and the viewer's unread count.
    pub fn chat_views(&self, viewer: &str, chats: &[ChatRow]) -> Result<Vec<Chat>> {
        if chats.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let chat_ids: Vec<String> = chats.iter().map(|c| c.id.clone()).collect();
            let members = query_members(conn, &chat_ids)?;

            let last_ids: Vec<String> = chats.iter().filter_map(|c| c.last_message_id.clone()).collect();
            let last_messages: HashMap<String, MessageRow> = if last_ids.is_empty() {
                HashMap::new()
            } else {
                let sql = format!("{} WHERE m.id IN ({})", MESSAGE_SELECT, placeholders(last_ids.len()));
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(params_from_iter(last_ids.iter()), MessageRow::from_row)?
                    .map(|r| r.map(|m| (m.id.clone(), m)))
                    .collect::<std::result::Result<HashMap<_, _>, _>>()?
            };

            let mut by_chat: HashMap<&str, Vec<&MemberRow>> = HashMap::new();
            for m in &members {
                by_chat.entry(m.chat_id.as_str()).or_default().push(m);
            }

            let views = chats
                .iter()
                .map(|chat| {
                    let chat_members = by_chat.get(chat.id.as_str()).cloned().unwrap_or_default();
                    let viewer_read = chat_members
                        .iter()
                        .find(|m| m.user_id == viewer)
                        .map(|m| m.read_seq)
                        .unwrap_or(chat.last_seq);

                    Chat {
                        id: parse_id(&chat.id, "chat"),
                        name: chat.name.clone(),
                        is_group: chat.is_group,
                        avatar_url: chat.avatar_url.clone(),
                        created_by: chat.created_by.as_deref().map(|id| parse_id(id, "created_by")),
                        participants: chat_members
                            .iter()
                            .map(|m| Participant {
                                user: UserSummary {
                                    id: parse_id(&m.user_id, "member"),
                                    username: m.username.clone(),
                                    name: m.name.clone(),
                                    avatar_url: m.avatar_url.clone(),
                                },
                                is_admin: m.is_admin,
                                read_seq: m.read_seq,
                            })
                            .collect(),
                        last_message: chat
                            .last_message_id
                            .as_ref()
                            .and_then(|id| last_messages.get(id))
                            .map(|m| m.to_message(vec![])),
                        last_seq: chat.last_seq,
                        unread_count: (chat.last_seq - viewer_read).max(0),
                        created_at: parse_timestamp(&chat.created_at).unwrap_or_default(),
                    }
                })
                .collect();

            Ok(views)
        })
    }
}

fn query_chat(conn: &Connection, id: &str) -> Result<Option<ChatRow>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM chats WHERE id = ?1", CHAT_COLUMNS),
            [id],
            ChatRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Batch-fetch memberships (with user profile columns) for a set of chats.
fn query_members(conn: &Connection, chat_ids: &[String]) -> Result<Vec<MemberRow>> {
    if chat_ids.is_empty() {
        return Ok(vec![]);
    }
    let sql = format!(
        "SELECT cm.chat_id, cm.user_id, u.username, u.name, u.avatar_url,
                cm.is_admin, cm.delivered_seq, cm.read_seq
         FROM chat_members cm
         JOIN users u ON u.id = cm.user_id
         WHERE cm.chat_id IN ({})
         ORDER BY cm.joined_at, cm.rowid",
        placeholders(chat_ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(chat_ids.iter()), |row| {
            Ok(MemberRow {
                chat_id: row.get(0)?,
                user_id: row.get(1)?,
                username: row.get(2)?,
                name: row.get(3)?,
                avatar_url: row.get(4)?,
                is_admin: row.get(5)?,
                delivered_seq: row.get(6)?,
                read_seq: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn prefixed(columns: &str, alias: &str) -> String {
    columns
        .split(',')
        .map(|c| format!("{}.{}", alias, c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
