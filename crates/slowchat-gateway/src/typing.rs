use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

/// Minimum gap between two fanned-out `TypingStart` events for the same
/// (chat, user).
pub const TYPING_THROTTLE: Duration = Duration::from_secs(3);

/// Who is typing where. A user is either idle or typing in a chat; the
/// instant records when the last `TypingStart` was fanned out.
#[derive(Default)]
pub struct TypingTracker {
    active: Mutex<HashMap<(Uuid, Uuid), Instant>>,
}

impl TypingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a start. Returns true if the start should be fanned out:
    /// the user was idle, or the last fan-out is older than the throttle.
    pub fn start(&self, chat_id: Uuid, user_id: Uuid, now: Instant) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(&(chat_id, user_id)) {
            Some(last) if now.saturating_duration_since(*last) < TYPING_THROTTLE => false,
            _ => {
                active.insert((chat_id, user_id), now);
                true
            }
        }
    }

    /// Returns true if the user was typing in the chat.
    pub fn stop(&self, chat_id: Uuid, user_id: Uuid) -> bool {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&(chat_id, user_id)).is_some()
    }

    /// Clears every chat the user was typing in and returns those chats.
    pub fn clear_user(&self, user_id: Uuid) -> Vec<Uuid> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        let chats: Vec<Uuid> = active
            .keys()
            .filter(|(_, uid)| *uid == user_id)
            .map(|(cid, _)| *cid)
            .collect();
        for chat_id in &chats {
            active.remove(&(*chat_id, user_id));
        }
        chats
    }
}
