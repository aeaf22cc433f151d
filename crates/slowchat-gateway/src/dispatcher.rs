use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use slowchat_types::events::GatewayEvent;

use crate::typing::TypingTracker;

type ConnectionMap = HashMap<Uuid, mpsc::UnboundedSender<GatewayEvent>>;

/// Presence map and fan-out hub. Tracks every live connection per user
/// (one per device) and delivers events to them. Process-local.
#[derive(Clone, Default)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

#[derive(Default)]
struct DispatcherInner {
    /// user_id -> (conn_id -> sender)
    connections: RwLock<HashMap<Uuid, ConnectionMap>>,

    typing: TypingTracker,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection for `user_id`. Returns its id, the receiving
    /// end of its event queue and whether this is the user's first live
    /// connection (i.e. the user just came online).
    pub async fn connect(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>, bool) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        let mut connections = self.inner.connections.write().await;
        let devices = connections.entry(user_id).or_default();
        let first = devices.is_empty();
        devices.insert(conn_id, tx);
        (conn_id, rx, first)
    }

    /// Drops one connection. Returns true if it was the user's last one
    /// (i.e. the user just went offline).
    pub async fn disconnect(&self, user_id: Uuid, conn_id: Uuid) -> bool {
        let mut connections = self.inner.connections.write().await;
        let Some(devices) = connections.get_mut(&user_id) else {
            return false;
        };
        if devices.remove(&conn_id).is_none() {
            return false;
        }
        if devices.is_empty() {
            connections.remove(&user_id);
            true
        } else {
            false
        }
    }

    /// Sends an event to every connection of a user. Returns how many
    /// connections accepted it.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) -> usize {
        let connections = self.inner.connections.read().await;
        connections
            .get(&user_id)
            .map(|devices| devices.values().filter(|tx| tx.send(event.clone()).is_ok()).count())
            .unwrap_or(0)
    }

    /// Sends an event to every connection of every listed user.
    pub async fn send_to_users<I>(&self, user_ids: I, event: GatewayEvent) -> usize
    where
        I: IntoIterator<Item = Uuid>,
    {
        let connections = self.inner.connections.read().await;
        let mut delivered = 0;
        for user_id in user_ids {
            if let Some(devices) = connections.get(&user_id) {
                delivered += devices.values().filter(|tx| tx.send(event.clone()).is_ok()).count();
            }
        }
        delivered
    }

    /// Sends an event to one specific connection.
    pub async fn send_to_connection(&self, user_id: Uuid, conn_id: Uuid, event: GatewayEvent) -> bool {
        let connections = self.inner.connections.read().await;
        connections
            .get(&user_id)
            .and_then(|devices| devices.get(&conn_id))
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.inner.connections.read().await.contains_key(&user_id)
    }

    /// The subset of `user_ids` with at least one live connection.
    pub async fn online_among(&self, user_ids: &[Uuid]) -> Vec<Uuid> {
        let connections = self.inner.connections.read().await;
        user_ids.iter().copied().filter(|id| connections.contains_key(id)).collect()
    }

    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .connections
            .read()
            .await
            .get(&user_id)
            .map_or(0, HashMap::len)
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.inner.typing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn presence(user_id: Uuid) -> GatewayEvent {
        GatewayEvent::PresenceUpdate { user_id, online: true }
    }

    #[tokio::test]
    async fn first_and_last_connection_flip_presence() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();

        let (phone, _rx1, first) = dispatcher.connect(user).await;
        assert!(first);
        let (laptop, _rx2, first) = dispatcher.connect(user).await;
        assert!(!first);
        assert_eq!(dispatcher.connection_count(user).await, 2);

        assert!(!dispatcher.disconnect(user, phone).await);
        assert!(dispatcher.is_online(user).await);
        assert!(dispatcher.disconnect(user, laptop).await);
        assert!(!dispatcher.is_online(user).await);

        // Unknown or repeated disconnects are no-ops.
        assert!(!dispatcher.disconnect(user, laptop).await);
    }

    #[tokio::test]
    async fn fan_out_reaches_every_device() {
        let dispatcher = Dispatcher::new();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());

        let (_, mut a1, _) = dispatcher.connect(alice).await;
        let (_, mut a2, _) = dispatcher.connect(alice).await;
        let (_, mut b1, _) = dispatcher.connect(bob).await;

        let delivered = dispatcher.send_to_users([alice, Uuid::new_v4()], presence(bob)).await;
        assert_eq!(delivered, 2);

        assert!(matches!(a1.try_recv(), Ok(GatewayEvent::PresenceUpdate { .. })));
        assert!(matches!(a2.try_recv(), Ok(GatewayEvent::PresenceUpdate { .. })));
        assert!(b1.try_recv().is_err());
    }

    #[tokio::test]
    async fn targeted_send_hits_one_connection() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (c1, mut rx1, _) = dispatcher.connect(user).await;
        let (_c2, mut rx2, _) = dispatcher.connect(user).await;

        assert!(dispatcher.send_to_connection(user, c1, presence(user)).await);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());

        assert!(!dispatcher.send_to_connection(user, Uuid::new_v4(), presence(user)).await);
    }

    #[tokio::test]
    async fn closed_receivers_are_not_counted() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (_, rx, _) = dispatcher.connect(user).await;
        drop(rx);

        assert_eq!(dispatcher.send_to_user(user, presence(user)).await, 0);
        assert_eq!(dispatcher.online_among(&[user, Uuid::new_v4()]).await, vec![user]);
    }
}
