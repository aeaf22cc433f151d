use std::collections::HashMap;

use anyhow::{Result, anyhow};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use uuid::Uuid;

use slowchat_types::models::{Message, ReactionGroup};

use crate::models::{MESSAGE_SELECT, MessageRow, ReactionRow, parse_id};
use crate::{Database, now_rfc3339, placeholders};

pub struct NewMessage<'a> {
    pub id: &'a str,
    pub chat_id: &'a str,
    pub sender_id: &'a str,
    pub content: &'a str,
    pub kind: &'a str,
    pub reply_to: Option<&'a str>,
    pub client_id: Option<&'a str>,
}

#[derive(Debug, Clone)]
pub enum AppendOutcome {
    /// Stored under a freshly assigned sequence number.
    Stored(MessageRow),
    /// The sender already stored a message with this client id.
    Duplicate(MessageRow),
    /// The sender is not a member of the chat (or the chat does not exist).
    NotMember,
    /// `reply_to` does not name a message of the same chat.
    UnknownReply,
}

impl Database {
    // -- Messages --

    /// Appends a message to its chat log. Sequence assignment, the insert and
    /// the chat/cursor bookkeeping happen in one transaction, so `seq` is
    /// gap-free and unique per chat.
    pub fn append_message(&self, msg: &NewMessage<'_>) -> Result<AppendOutcome> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let is_member = tx
                .prepare("SELECT 1 FROM chat_members WHERE chat_id = ?1 AND user_id = ?2")?
                .exists(params![msg.chat_id, msg.sender_id])?;
            if !is_member {
                return Ok(AppendOutcome::NotMember);
            }

            if let Some(client_id) = msg.client_id {
                let existing = tx
                    .query_row(
                        &format!(
                            "{} WHERE m.chat_id = ?1 AND m.sender_id = ?2 AND m.client_id = ?3",
                            MESSAGE_SELECT
                        ),
                        params![msg.chat_id, msg.sender_id, client_id],
                        MessageRow::from_row,
                    )
                    .optional()?;
                if let Some(existing) = existing {
                    return Ok(AppendOutcome::Duplicate(existing));
                }
            }

            if let Some(reply_to) = msg.reply_to {
                let in_chat = tx
                    .prepare("SELECT 1 FROM messages WHERE id = ?1 AND chat_id = ?2")?
                    .exists(params![reply_to, msg.chat_id])?;
                if !in_chat {
                    return Ok(AppendOutcome::UnknownReply);
                }
            }

            let seq: i64 = tx.query_row(
                "UPDATE chats SET last_seq = last_seq + 1 WHERE id = ?1 RETURNING last_seq",
                [msg.chat_id],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO messages (id, chat_id, sender_id, seq, content, kind, reply_to, client_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    msg.id,
                    msg.chat_id,
                    msg.sender_id,
                    seq,
                    msg.content,
                    msg.kind,
                    msg.reply_to,
                    msg.client_id,
                    now_rfc3339()
                ],
            )?;
            tx.execute(
                "UPDATE chats SET last_message_id = ?2 WHERE id = ?1",
                params![msg.chat_id, msg.id],
            )?;
            // The sender has trivially received and read their own message.
            tx.execute(
                "UPDATE chat_members SET delivered_seq = ?3, read_seq = ?3
                 WHERE chat_id = ?1 AND user_id = ?2",
                params![msg.chat_id, msg.sender_id, seq],
            )?;

            let row = query_message(&tx, msg.id)?
                .ok_or_else(|| anyhow!("Message vanished after insert: {}", msg.id))?;
            tx.commit()?;
            Ok(AppendOutcome::Stored(row))
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, id))
    }

    /// A page of a chat's log in ascending seq order, without messages hidden
    /// for `viewer`. With only `before_seq` (or no cursor) the page is the
    /// newest `limit` messages below the cursor; with `after_seq` it is the
    /// oldest `limit` above it.
    pub fn list_messages(
        &self,
        chat_id: &str,
        viewer: &str,
        before_seq: Option<i64>,
        after_seq: Option<i64>,
        limit: u32,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let ascending = after_seq.is_some();
            let sql = format!(
                "{} WHERE m.chat_id = ?1
                   AND m.seq < COALESCE(?2, 9223372036854775807)
                   AND m.seq > COALESCE(?3, 0)
                   AND NOT EXISTS (SELECT 1 FROM message_hidden h
                                   WHERE h.message_id = m.id AND h.user_id = ?4)
                 ORDER BY m.seq {}
                 LIMIT ?5",
                MESSAGE_SELECT,
                if ascending { "ASC" } else { "DESC" }
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt
                .query_map(
                    params![chat_id, before_seq, after_seq, viewer, limit],
                    MessageRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            if !ascending {
                rows.reverse();
            }
            Ok(rows)
        })
    }

    /// Messages not yet acknowledged by `user_id`, across all their chats,
    /// ordered by chat and seq. At most `per_chat` messages per chat.
    pub fn undelivered_messages(&self, user_id: &str, per_chat: u32) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut pending = conn.prepare(
                "SELECT cm.chat_id, cm.delivered_seq FROM chat_members cm
                 JOIN chats c ON c.id = cm.chat_id
                 WHERE cm.user_id = ?1 AND c.last_seq > cm.delivered_seq
                 ORDER BY c.id",
            )?;
            let cursors = pending
                .query_map([user_id], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            let sql = format!(
                "{} WHERE m.chat_id = ?1 AND m.seq > ?2
                   AND NOT EXISTS (SELECT 1 FROM message_hidden h
                                   WHERE h.message_id = m.id AND h.user_id = ?3)
                 ORDER BY m.seq ASC
                 LIMIT ?4",
                MESSAGE_SELECT
            );
            let mut stmt = conn.prepare(&sql)?;
            let mut out = Vec::new();
            for (chat_id, delivered) in cursors {
                let rows = stmt
                    .query_map(params![chat_id, delivered, user_id, per_chat], MessageRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                out.extend(rows);
            }
            Ok(out)
        })
    }

    /// Hides a message for one user. Returns false if the message is not part
    /// of `chat_id`.
    pub fn hide_message(&self, chat_id: &str, message_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO message_hidden (message_id, user_id)
                 SELECT id, ?3 FROM messages WHERE id = ?1 AND chat_id = ?2",
                params![message_id, chat_id, user_id],
            )?;
            if inserted > 0 {
                return Ok(true);
            }
            // Already hidden counts as success; a foreign message does not.
            let exists = conn
                .prepare("SELECT 1 FROM messages WHERE id = ?1 AND chat_id = ?2")?
                .exists(params![message_id, chat_id])?;
            Ok(exists)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if exists, inserts if not.
    /// Returns true when the reaction was added.
    pub fn toggle_reaction(&self, id: &str, message_id: &str, user_id: &str, emoji: &str) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM reactions WHERE message_id = ?1 AND user_id = ?2 AND emoji = ?3",
                    params![message_id, user_id, emoji],
                    |row| row.get(0),
                )
                .optional()?;

            let added = if let Some(existing_id) = existing {
                tx.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                false
            } else {
                tx.execute(
                    "INSERT INTO reactions (id, message_id, user_id, emoji) VALUES (?1, ?2, ?3, ?4)",
                    params![id, message_id, user_id, emoji],
                )?;
                true
            };
            tx.commit()?;
            Ok(added)
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let sql = format!(
                "SELECT id, message_id, user_id, emoji, created_at FROM reactions
                 WHERE message_id IN ({})
                 ORDER BY created_at, rowid",
                placeholders(message_ids.len())
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(message_ids.iter()), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        user_id: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    /// Converts rows to API messages with their reactions attached.
    pub fn hydrate_messages(&self, rows: Vec<MessageRow>) -> Result<Vec<Message>> {
        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut reactions = group_reactions(self.get_reactions_for_messages(&ids)?);
        Ok(rows
            .into_iter()
            .map(|row| {
                let groups = reactions.remove(&row.id).unwrap_or_default();
                row.to_message(groups)
            })
            .collect())
    }
}

fn query_message(conn: &Connection, id: &str) -> Result<Option<MessageRow>> {
    let row = conn
        .query_row(&format!("{} WHERE m.id = ?1", MESSAGE_SELECT), [id], MessageRow::from_row)
        .optional()?;
    Ok(row)
}

/// Groups reactions by message id, then by emoji in order of first use.
fn group_reactions(rows: Vec<ReactionRow>) -> HashMap<String, Vec<ReactionGroup>> {
    let mut grouped: HashMap<String, Vec<ReactionGroup>> = HashMap::new();
    for r in rows {
        let groups = grouped.entry(r.message_id).or_default();
        let user_id: Uuid = parse_id(&r.user_id, "reaction user");
        match groups.iter_mut().find(|g| g.emoji == r.emoji) {
            Some(group) => {
                group.count += 1;
                group.user_ids.push(user_id);
            }
            None => groups.push(ReactionGroup {
                emoji: r.emoji,
                count: 1,
                user_ids: vec![user_id],
            }),
        }
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NewUser;

    const ALICE: &str = "00000000-0000-0000-0000-00000000000a";
    const BOB: &str = "00000000-0000-0000-0000-00000000000b";
    const CAROL: &str = "00000000-0000-0000-0000-00000000000c";

    fn setup() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        for (id, name) in [(ALICE, "alice"), (BOB, "bob"), (CAROL, "carol")] {
            db.create_user(&NewUser {
                id,
                username: Some(name),
                email: None,
                phone: None,
                name: None,
                password_hash: Some("hash"),
            })
            .unwrap();
        }
        let chat = db.find_or_create_direct("c1", ALICE, BOB).unwrap().chat.id;
        (db, chat)
    }

    fn send(db: &Database, chat: &str, sender: &str, content: &str, client_id: Option<&str>) -> AppendOutcome {
        let id = Uuid::new_v4().to_string();
        db.append_message(&NewMessage {
            id: &id,
            chat_id: chat,
            sender_id: sender,
            content,
            kind: "text",
            reply_to: None,
            client_id,
        })
        .unwrap()
    }

    fn stored(outcome: AppendOutcome) -> MessageRow {
        match outcome {
            AppendOutcome::Stored(row) => row,
            other => panic!("expected Stored, got {:?}", other),
        }
    }

    #[test]
    fn sequence_numbers_are_gap_free_per_chat() {
        let (db, chat) = setup();
        let seqs: Vec<i64> = (0..5)
            .map(|i| stored(send(&db, &chat, if i % 2 == 0 { ALICE } else { BOB }, "hi", None)).seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        let other = db.find_or_create_direct("c2", ALICE, CAROL).unwrap().chat.id;
        assert_eq!(stored(send(&db, &other, CAROL, "yo", None)).seq, 1);

        let chat_row = db.get_chat(&chat).unwrap().unwrap();
        assert_eq!(chat_row.last_seq, 5);
    }

    #[test]
    fn non_members_cannot_append() {
        let (db, chat) = setup();
        assert!(matches!(send(&db, &chat, CAROL, "hi", None), AppendOutcome::NotMember));
        assert!(matches!(send(&db, "nope", ALICE, "hi", None), AppendOutcome::NotMember));
        assert_eq!(db.get_chat(&chat).unwrap().unwrap().last_seq, 0);
    }

    #[test]
    fn client_id_makes_retries_idempotent() {
        let (db, chat) = setup();
        let first = stored(send(&db, &chat, ALICE, "hi", Some("k1")));
        match send(&db, &chat, ALICE, "hi again", Some("k1")) {
            AppendOutcome::Duplicate(row) => {
                assert_eq!(row.id, first.id);
                assert_eq!(row.content, "hi");
            }
            other => panic!("expected Duplicate, got {:?}", other),
        }
        // Same key from another sender is a different message.
        assert_eq!(stored(send(&db, &chat, BOB, "hi", Some("k1"))).seq, 2);
    }

    #[test]
    fn replies_must_stay_in_chat() {
        let (db, chat) = setup();
        let other = db.find_or_create_direct("c2", ALICE, CAROL).unwrap().chat.id;
        let foreign = stored(send(&db, &other, CAROL, "elsewhere", None));

        let id = Uuid::new_v4().to_string();
        let outcome = db
            .append_message(&NewMessage {
                id: &id,
                chat_id: &chat,
                sender_id: ALICE,
                content: "re",
                kind: "text",
                reply_to: Some(&foreign.id),
                client_id: None,
            })
            .unwrap();
        assert!(matches!(outcome, AppendOutcome::UnknownReply));
    }

    #[test]
    fn pages_are_ascending() {
        let (db, chat) = setup();
        for i in 0..10 {
            send(&db, &chat, ALICE, &format!("m{}", i), None);
        }
        let seqs = |rows: Vec<MessageRow>| rows.into_iter().map(|r| r.seq).collect::<Vec<_>>();

        assert_eq!(seqs(db.list_messages(&chat, BOB, None, None, 3).unwrap()), vec![8, 9, 10]);
        assert_eq!(seqs(db.list_messages(&chat, BOB, Some(8), None, 3).unwrap()), vec![5, 6, 7]);
        assert_eq!(seqs(db.list_messages(&chat, BOB, None, Some(2), 3).unwrap()), vec![3, 4, 5]);
        assert_eq!(seqs(db.list_messages(&chat, BOB, Some(6), Some(3), 50).unwrap()), vec![4, 5]);
    }

    #[test]
    fn hidden_messages_only_disappear_for_that_user() {
        let (db, chat) = setup();
        let m = stored(send(&db, &chat, ALICE, "oops", None));
        send(&db, &chat, ALICE, "fine", None);

        assert!(db.hide_message(&chat, &m.id, BOB).unwrap());
        assert!(db.hide_message(&chat, &m.id, BOB).unwrap());
        assert!(!db.hide_message("c-other", &m.id, BOB).unwrap());

        assert_eq!(db.list_messages(&chat, BOB, None, None, 50).unwrap().len(), 1);
        assert_eq!(db.list_messages(&chat, ALICE, None, None, 50).unwrap().len(), 2);
    }

    #[test]
    fn undelivered_until_acked() {
        let (db, chat) = setup();
        send(&db, &chat, ALICE, "one", None);
        send(&db, &chat, ALICE, "two", None);
        send(&db, &chat, ALICE, "three", None);

        // The sender has nothing pending.
        assert!(db.undelivered_messages(ALICE, 200).unwrap().is_empty());

        let pending = db.undelivered_messages(BOB, 200).unwrap();
        assert_eq!(pending.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3]);

        assert_eq!(db.advance_delivered(&chat, BOB, 2).unwrap(), Some(2));
        // Cursors never move back.
        assert_eq!(db.advance_delivered(&chat, BOB, 1).unwrap(), Some(2));
        let pending = db.undelivered_messages(BOB, 200).unwrap();
        assert_eq!(pending.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![3]);

        assert_eq!(db.advance_delivered(&chat, CAROL, 3).unwrap(), None);
    }

    #[test]
    fn read_cursor_is_clamped_and_implies_delivery() {
        let (db, chat) = setup();
        send(&db, &chat, ALICE, "one", None);
        send(&db, &chat, ALICE, "two", None);

        assert_eq!(db.advance_read(&chat, BOB, 99).unwrap(), Some((0, 2)));
        assert_eq!(db.advance_read(&chat, BOB, 1).unwrap(), Some((2, 2)));
        assert!(db.undelivered_messages(BOB, 200).unwrap().is_empty());
        assert_eq!(db.advance_read(&chat, CAROL, 1).unwrap(), None);

        let chat_row = db.get_chat(&chat).unwrap().unwrap();
        let view = db.chat_views(BOB, &[chat_row]).unwrap().remove(0);
        assert_eq!(view.unread_count, 0);
        assert_eq!(view.last_message.unwrap().content, "two");
    }

    #[test]
    fn reactions_toggle_and_group() {
        let (db, chat) = setup();
        let m = stored(send(&db, &chat, ALICE, "nice", None));

        assert!(db.toggle_reaction("r1", &m.id, ALICE, "👍").unwrap());
        assert!(db.toggle_reaction("r2", &m.id, BOB, "👍").unwrap());
        assert!(db.toggle_reaction("r3", &m.id, BOB, "🎉").unwrap());
        assert!(!db.toggle_reaction("r4", &m.id, BOB, "🎉").unwrap());

        let messages = db.hydrate_messages(vec![m]).unwrap();
        let reactions = &messages[0].reactions;
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].emoji, "👍");
        assert_eq!(reactions[0].count, 2);
    }
}
