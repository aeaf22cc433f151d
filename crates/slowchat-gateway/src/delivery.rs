use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use slowchat_db::models::ChatRow;
use slowchat_db::{AppendOutcome, Database, NewMessage};
use slowchat_types::api::SendMessageRequest;
use slowchat_types::events::GatewayEvent;
use slowchat_types::models::Message;

use crate::dispatcher::Dispatcher;
use crate::identity::Identity;

pub const MAX_CONTENT_CHARS: usize = 4000;
pub const MAX_CLIENT_ID_LEN: usize = 64;
pub const MAX_EMOJI_CHARS: usize = 32;

/// Upper bound on messages replayed per chat when a connection comes up.
pub const REPLAY_PER_CHAT: u32 = 200;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("chat not found")]
    ChatNotFound,
    #[error("not a member of this chat")]
    NotMember,
    #[error("message not found")]
    MessageNotFound,
    #[error("{0}")]
    Invalid(String),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl DeliveryError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ChatNotFound | Self::MessageNotFound => "not_found",
            Self::NotMember => "forbidden",
            Self::Invalid(_) => "validation_error",
            Self::Storage(_) => "internal_error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: Message,
    /// True when the client id matched an earlier message; nothing new was
    /// stored or fanned out.
    pub duplicate: bool,
}

/// Persists chat traffic and routes the resulting events to the online
/// connections of the affected users. Shared by REST handlers and the
/// WebSocket gateway.
#[derive(Clone)]
pub struct Delivery {
    db: Arc<Database>,
    dispatcher: Dispatcher,
}

impl Delivery {
    pub fn new(db: Arc<Database>, dispatcher: Dispatcher) -> Self {
        Self { db, dispatcher }
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Runs blocking DB work off the async runtime.
    pub async fn blocking<F, T>(&self, f: F) -> Result<T, DeliveryError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                DeliveryError::Storage(anyhow!("blocking task failed: {}", e))
            })?
            .map_err(DeliveryError::from)
    }

    /// Loads a chat, failing unless `user_id` is one of its members.
    pub async fn require_member(&self, chat_id: Uuid, user_id: Uuid) -> Result<ChatRow, DeliveryError> {
        let (cid, uid) = (chat_id.to_string(), user_id.to_string());
        let (chat, member) = self
            .blocking(move |db| Ok((db.get_chat(&cid)?, db.get_member(&cid, &uid)?)))
            .await?;
        let chat = chat.ok_or(DeliveryError::ChatNotFound)?;
        member.ok_or(DeliveryError::NotMember)?;
        Ok(chat)
    }

    pub async fn member_ids(&self, chat_id: Uuid) -> Result<Vec<Uuid>, DeliveryError> {
        let cid = chat_id.to_string();
        let ids = self.blocking(move |db| db.chat_member_ids(&cid)).await?;
        Ok(parse_ids(&ids))
    }

    /// Sends an event to every online member of a chat.
    pub async fn notify_chat(&self, chat_id: Uuid, event: GatewayEvent) -> Result<usize, DeliveryError> {
        let members = self.member_ids(chat_id).await?;
        Ok(self.dispatcher.send_to_users(members, event).await)
    }

    async fn notify_chat_except(&self, chat_id: Uuid, except: Uuid, event: GatewayEvent) -> Result<usize, DeliveryError> {
        let members = self.member_ids(chat_id).await?;
        let others = members.into_iter().filter(|id| *id != except);
        Ok(self.dispatcher.send_to_users(others, event).await)
    }

    pub async fn notify_users(&self, user_ids: Vec<Uuid>, event: GatewayEvent) -> usize {
        self.dispatcher.send_to_users(user_ids, event).await
    }

    /// Stores a message and fans it out as `MessageCreate` to every online
    /// connection of every member, the sender's included.
    pub async fn send_message(
        &self,
        sender: &Identity,
        chat_id: Uuid,
        req: SendMessageRequest,
    ) -> Result<SendOutcome, DeliveryError> {
        validate_message(&req)?;

        let message_id = Uuid::new_v4().to_string();
        let cid = chat_id.to_string();
        let sid = sender.user_id.to_string();
        let kind = req.kind.as_str();
        let reply_to = req.reply_to.map(|id| id.to_string());
        let content = req.content;
        let client_id = req.client_id;

        let (outcome, message) = self
            .blocking(move |db| {
                if db.get_chat(&cid)?.is_none() {
                    return Ok((None, None));
                }
                let outcome = db.append_message(&NewMessage {
                    id: &message_id,
                    chat_id: &cid,
                    sender_id: &sid,
                    content: &content,
                    kind,
                    reply_to: reply_to.as_deref(),
                    client_id: client_id.as_deref(),
                })?;
                let row = match &outcome {
                    AppendOutcome::Stored(row) | AppendOutcome::Duplicate(row) => Some(row.clone()),
                    _ => None,
                };
                let message = match row {
                    Some(row) => db.hydrate_messages(vec![row])?.pop(),
                    None => None,
                };
                Ok((Some(outcome), message))
            })
            .await?;

        let outcome = outcome.ok_or(DeliveryError::ChatNotFound)?;
        let duplicate = match outcome {
            AppendOutcome::Stored(_) => false,
            AppendOutcome::Duplicate(_) => true,
            AppendOutcome::NotMember => return Err(DeliveryError::NotMember),
            AppendOutcome::UnknownReply => {
                return Err(DeliveryError::Invalid("reply_to does not name a message in this chat".into()));
            }
        };
        let message = message.ok_or_else(|| DeliveryError::Storage(anyhow!("stored message missing")))?;

        if duplicate {
            debug!(
                "{} ({}) resent client id {:?} in chat {}",
                sender.username, sender.user_id, message.client_id, chat_id
            );
            return Ok(SendOutcome { message, duplicate });
        }

        if self.dispatcher.typing().stop(chat_id, sender.user_id) {
            self.notify_chat_except(
                chat_id,
                sender.user_id,
                GatewayEvent::TypingStop {
                    chat_id,
                    user_id: sender.user_id,
                },
            )
            .await?;
        }

        let reached = self
            .notify_chat(chat_id, GatewayEvent::MessageCreate { message: message.clone() })
            .await?;
        debug!("Message {} (seq {}) in chat {} reached {} connections", message.id, message.seq, chat_id, reached);

        Ok(SendOutcome { message, duplicate })
    }

    /// Moves the user's read cursor and tells the chat if it advanced.
    pub async fn mark_read(&self, user_id: Uuid, chat_id: Uuid, seq: i64) -> Result<i64, DeliveryError> {
        let (cid, uid) = (chat_id.to_string(), user_id.to_string());
        let cursors = self
            .blocking(move |db| {
                if db.get_chat(&cid)?.is_none() {
                    return Ok(None);
                }
                Ok(Some(db.advance_read(&cid, &uid, seq)?))
            })
            .await?
            .ok_or(DeliveryError::ChatNotFound)?;
        let (previous, current) = cursors.ok_or(DeliveryError::NotMember)?;

        if current > previous {
            self.notify_chat(
                chat_id,
                GatewayEvent::ReadReceipt {
                    chat_id,
                    user_id,
                    seq: current,
                },
            )
            .await?;
        }
        Ok(current)
    }

    /// Records that everything up to `seq` reached the user.
    pub async fn ack(&self, user_id: Uuid, chat_id: Uuid, seq: i64) -> Result<i64, DeliveryError> {
        let (cid, uid) = (chat_id.to_string(), user_id.to_string());
        self.blocking(move |db| db.advance_delivered(&cid, &uid, seq))
            .await?
            .ok_or(DeliveryError::NotMember)
    }

    /// Messages the user has not acknowledged yet, oldest first per chat.
    pub async fn pending_for(&self, user_id: Uuid) -> Result<Vec<Message>, DeliveryError> {
        let uid = user_id.to_string();
        self.blocking(move |db| {
            let rows = db.undelivered_messages(&uid, REPLAY_PER_CHAT)?;
            db.hydrate_messages(rows)
        })
        .await
    }

    pub async fn start_typing(&self, who: &Identity, chat_id: Uuid) -> Result<(), DeliveryError> {
        self.require_member(chat_id, who.user_id).await?;
        if !self.dispatcher.typing().start(chat_id, who.user_id, Instant::now()) {
            return Ok(());
        }
        self.notify_chat_except(
            chat_id,
            who.user_id,
            GatewayEvent::TypingStart {
                chat_id,
                user_id: who.user_id,
                username: who.username.clone(),
            },
        )
        .await?;
        Ok(())
    }

    pub async fn stop_typing(&self, user_id: Uuid, chat_id: Uuid) -> Result<(), DeliveryError> {
        if self.dispatcher.typing().stop(chat_id, user_id) {
            self.notify_chat_except(chat_id, user_id, GatewayEvent::TypingStop { chat_id, user_id })
                .await?;
        }
        Ok(())
    }

    /// Ends every typing indicator the user left behind.
    pub async fn clear_typing(&self, user_id: Uuid) {
        for chat_id in self.dispatcher.typing().clear_user(user_id) {
            if let Err(e) = self
                .notify_chat_except(chat_id, user_id, GatewayEvent::TypingStop { chat_id, user_id })
                .await
            {
                debug!("Typing stop for {} in {} not delivered: {}", user_id, chat_id, e);
            }
        }
    }

    /// Adds or removes a reaction and tells the chat. Returns true if added.
    pub async fn toggle_reaction(
        &self,
        user_id: Uuid,
        chat_id: Uuid,
        message_id: Uuid,
        emoji: String,
    ) -> Result<bool, DeliveryError> {
        let emoji = emoji.trim().to_string();
        if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_CHARS {
            return Err(DeliveryError::Invalid(format!(
                "emoji must be 1-{} characters",
                MAX_EMOJI_CHARS
            )));
        }

        self.require_member(chat_id, user_id).await?;

        let (cid, mid, uid, e) = (chat_id.to_string(), message_id.to_string(), user_id.to_string(), emoji.clone());
        let added = self
            .blocking(move |db| {
                match db.get_message(&mid)? {
                    Some(m) if m.chat_id == cid => {}
                    _ => return Ok(None),
                }
                let reaction_id = Uuid::new_v4().to_string();
                Ok(Some(db.toggle_reaction(&reaction_id, &mid, &uid, &e)?))
            })
            .await?
            .ok_or(DeliveryError::MessageNotFound)?;

        let event = if added {
            GatewayEvent::ReactionAdd {
                chat_id,
                message_id,
                user_id,
                emoji,
            }
        } else {
            GatewayEvent::ReactionRemove {
                chat_id,
                message_id,
                user_id,
                emoji,
            }
        };
        self.notify_chat(chat_id, event).await?;
        Ok(added)
    }

    /// Online users who share a chat with `user_id`.
    pub async fn online_contacts(&self, user_id: Uuid) -> Result<Vec<Uuid>, DeliveryError> {
        let uid = user_id.to_string();
        let contacts = self.blocking(move |db| db.contact_ids(&uid)).await?;
        Ok(self.dispatcher.online_among(&parse_ids(&contacts)).await)
    }

    /// Tells the user's online contacts that they came online or went offline.
    pub async fn announce_presence(&self, user_id: Uuid, online: bool) -> Result<(), DeliveryError> {
        let contacts = self.online_contacts(user_id).await?;
        info!("{} is now {} ({} contacts online)", user_id, if online { "online" } else { "offline" }, contacts.len());
        self.dispatcher
            .send_to_users(contacts, GatewayEvent::PresenceUpdate { user_id, online })
            .await;
        Ok(())
    }
}

fn validate_message(req: &SendMessageRequest) -> Result<(), DeliveryError> {
    if req.content.trim().is_empty() {
        return Err(DeliveryError::Invalid("content must not be empty".into()));
    }
    if req.content.chars().count() > MAX_CONTENT_CHARS {
        return Err(DeliveryError::Invalid(format!(
            "content exceeds {} characters",
            MAX_CONTENT_CHARS
        )));
    }
    if let Some(client_id) = &req.client_id {
        if client_id.is_empty() || client_id.len() > MAX_CLIENT_ID_LEN {
            return Err(DeliveryError::Invalid(format!(
                "client_id must be 1-{} bytes",
                MAX_CLIENT_ID_LEN
            )));
        }
    }
    Ok(())
}

fn parse_ids(raw: &[String]) -> Vec<Uuid> {
    raw.iter().filter_map(|id| id.parse().ok()).collect()
}
