use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast, mpsc};
use tracing::trace;
use uuid::Uuid;

use handsign_engine::ports::RealtimePublisher;
use handsign_types::events::GatewayEvent;
use handsign_types::models::Role;

/// An event addressed to every connection authenticated with `role`.
#[derive(Debug, Clone)]
pub struct RoleEvent {
    pub role: Role,
    pub event: GatewayEvent,
}

/// Manages all connected sessions and routes events to them.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Role-scoped events; every connection subscribes and keeps its own role's.
    broadcast_tx: broadcast::Sender<RoleEvent>,

    /// Per-user targeted send channels: user_id -> [(conn_id, sender)].
    /// A user may have several tabs open.
    user_channels: RwLock<HashMap<Uuid, Vec<(Uuid, mpsc::UnboundedSender<GatewayEvent>)>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                user_channels: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoleEvent> {
        self.inner.broadcast_tx.subscribe()
    }

    /// Send an event to every connection of the given role.
    pub fn broadcast_to_role(&self, role: Role, event: GatewayEvent) {
        // No receivers just means nobody with that role is connected.
        let _ = self.inner.broadcast_tx.send(RoleEvent { role, event });
    }

    /// Register a per-connection targeted channel. Returns (conn_id, receiver).
    pub async fn register(&self, user_id: Uuid) -> (Uuid, mpsc::UnboundedReceiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .user_channels
            .write()
            .await
            .entry(user_id)
            .or_default()
            .push((conn_id, tx));
        (conn_id, rx)
    }

    /// Drop one connection's channel, leaving the user's other connections alone.
    pub async fn unregister(&self, user_id: Uuid, conn_id: Uuid) {
        let mut channels = self.inner.user_channels.write().await;
        if let Some(conns) = channels.get_mut(&user_id) {
            conns.retain(|(id, _)| *id != conn_id);
            if conns.is_empty() {
                channels.remove(&user_id);
            }
        }
    }

    /// Send a targeted event to every connection of a specific user.
    pub async fn send_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let channels = self.inner.user_channels.read().await;
        if let Some(conns) = channels.get(&user_id) {
            for (_, tx) in conns {
                let _ = tx.send(event.clone());
            }
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.user_channels.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl RealtimePublisher for Dispatcher {
    async fn publish_to_user(
        &self,
        user_id: Uuid,
        event: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        trace!("publish {} to user {}", event, user_id);
        self.send_to_user(
            user_id,
            GatewayEvent::Publish {
                name: event.to_string(),
                payload,
            },
        )
        .await;
        Ok(())
    }

    async fn publish_to_role(
        &self,
        role: Role,
        event: &str,
        payload: serde_json::Value,
    ) -> anyhow::Result<()> {
        trace!("publish {} to role {}", event, role.as_str());
        self.broadcast_to_role(
            role,
            GatewayEvent::Publish {
                name: event.to_string(),
                payload,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn name_of(event: &GatewayEvent) -> &str {
        match event {
            GatewayEvent::Publish { name, .. } => name,
            GatewayEvent::Ready { .. } => "ready",
        }
    }

    #[tokio::test]
    async fn user_events_reach_every_connection_of_that_user() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (_, mut tab_a) = dispatcher.register(user).await;
        let (_, mut tab_b) = dispatcher.register(user).await;
        let (_, mut stranger) = dispatcher.register(other).await;

        dispatcher
            .publish_to_user(user, "verification:approved", json!({"ok": true}))
            .await
            .unwrap();

        assert_eq!(name_of(&tab_a.recv().await.unwrap()), "verification:approved");
        assert_eq!(name_of(&tab_b.recv().await.unwrap()), "verification:approved");
        assert!(stranger.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_only_drops_that_connection() {
        let dispatcher = Dispatcher::new();
        let user = Uuid::new_v4();
        let (first, _rx_a) = dispatcher.register(user).await;
        let (_, mut rx_b) = dispatcher.register(user).await;
        assert_eq!(dispatcher.connection_count().await, 2);

        dispatcher.unregister(user, first).await;
        assert_eq!(dispatcher.connection_count().await, 1);

        let ready = GatewayEvent::Ready {
            user_id: user,
            role: Role::User,
        };
        dispatcher.send_to_user(user, ready).await;
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn role_events_carry_their_role() {
        let dispatcher = Dispatcher::new();
        let mut rx = dispatcher.subscribe();

        dispatcher
            .publish_to_role(Role::Staff, "verification:new", json!({}))
            .await
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received.role, Role::Staff);
        assert_eq!(name_of(&received.event), "verification:new");
    }

    #[tokio::test]
    async fn publishing_without_listeners_is_fine() {
        let dispatcher = Dispatcher::new();
        dispatcher
            .publish_to_role(Role::Admin, "verification:new", json!({}))
            .await
            .unwrap();
        dispatcher
            .publish_to_user(Uuid::new_v4(), "verification:new", json!({}))
            .await
            .unwrap();
    }
}
