use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::SendMessageRequest;
use crate::models::{Chat, Message, MessageKind};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// A message was stored in a chat the receiver belongs to. Also used to
    /// replay unacknowledged messages after (re)connect.
    MessageCreate { message: Message },

    /// Confirms a `SendMessage` command to the connection that issued it
    MessageAck {
        client_id: Option<String>,
        message: Message,
    },

    TypingStart {
        chat_id: Uuid,
        user_id: Uuid,
        username: String,
    },

    TypingStop { chat_id: Uuid, user_id: Uuid },

    /// A contact came online or went offline
    PresenceUpdate { user_id: Uuid, online: bool },

    /// A member's read cursor moved forward
    ReadReceipt {
        chat_id: Uuid,
        user_id: Uuid,
        seq: i64,
    },

    ReactionAdd {
        chat_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    ReactionRemove {
        chat_id: Uuid,
        message_id: Uuid,
        user_id: Uuid,
        emoji: String,
    },

    /// The receiver became a member of a new chat
    ChatCreate { chat: Chat },

    /// Membership of a chat changed
    ChatUpdate { chat: Chat },

    /// The receiver was removed from (or left) a group
    ParticipantRemoved { chat_id: Uuid, user_id: Uuid },

    /// A command could not be carried out
    Error { code: String, message: String },
}

impl GatewayCommand {
    /// Splits a `SendMessage` command into its chat id and REST-shaped payload.
    pub fn into_send_request(self) -> Option<(Uuid, SendMessageRequest)> {
        match self {
            Self::SendMessage {
                chat_id,
                content,
                kind,
                reply_to,
                client_id,
            } => Some((
                chat_id,
                SendMessageRequest {
                    content,
                    kind,
                    reply_to,
                    client_id,
                },
            )),
            _ => None,
        }
    }
}

impl GatewayEvent {
    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Store a message and fan it out to the chat's members
    SendMessage {
        chat_id: Uuid,
        content: String,
        #[serde(default)]
        kind: MessageKind,
        reply_to: Option<Uuid>,
        client_id: Option<String>,
    },

    StartTyping { chat_id: Uuid },

    StopTyping { chat_id: Uuid },

    /// Everything up to `seq` in the chat has reached this client
    Ack { chat_id: Uuid, seq: i64 },

    /// Everything up to `seq` in the chat has been read
    MarkRead { chat_id: Uuid, seq: i64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_use_adjacent_tagging() {
        let event = GatewayEvent::PresenceUpdate {
            user_id: Uuid::nil(),
            online: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PresenceUpdate");
        assert_eq!(json["data"]["online"], true);
    }

    #[test]
    fn send_message_command_converts_to_request() {
        let raw = r#"{"type":"SendMessage","data":{"chat_id":"00000000-0000-0000-0000-000000000001","content":"hi","kind":"image","client_id":"c-1"}}"#;
        let cmd: GatewayCommand = serde_json::from_str(raw).unwrap();
        let (chat_id, message) = cmd.into_send_request().expect("send command");
        assert_eq!(chat_id.as_u128(), 1);
        assert_eq!(message.content, "hi");
        assert_eq!(message.kind, MessageKind::Image);
        assert_eq!(message.client_id.as_deref(), Some("c-1"));
        assert!(message.reply_to.is_none());
    }
}

