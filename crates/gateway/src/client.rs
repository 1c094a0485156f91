//! Connected-client state and registry.
//!
//! The registry holds every live downstream session and implements the
//! feed engine's [`Broadcast`] seam. Per-event subscriber sets live in the
//! feed's interest map; a client only remembers its own subscriptions so
//! they can be withdrawn when the socket goes away.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use chrono::Utc;
use common::MatchUpdate;
use dashmap::{DashMap, DashSet};
use feed::{Broadcast, SessionId};
use metrics::counter;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Buffer size for client message channels.
/// Sized for roughly a second of high-frequency updates.
pub const CLIENT_CHANNEL_BUFFER_SIZE: usize = 1000;

/// State for a single connected client.
pub struct ClientState {
    /// Unique session identifier.
    pub id: SessionId,
    /// Bounded channel to the client's WebSocket writer.
    pub tx: mpsc::Sender<Message>,
    /// Event ids this session watches.
    pub subscriptions: DashSet<String>,
    /// Timestamp when the client connected.
    pub connected_at: i64,
    /// Timestamp of the last ping received.
    pub last_ping: AtomicI64,
}

impl ClientState {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        let now = Utc::now().timestamp_millis();
        Self {
            id: SessionId::new_v4(),
            tx,
            subscriptions: DashSet::new(),
            connected_at: now,
            last_ping: AtomicI64::new(now),
        }
    }

    /// Send a control message to this client. Non-blocking; fails when the
    /// buffer is full or the connection is gone.
    pub fn send(&self, msg: &ServerMessage) -> Result<()> {
        let json = serde_json::to_string(msg)?;
        self.tx
            .try_send(Message::Text(json.into()))
            .map_err(|_| GatewayError::ChannelSend)
    }

    pub fn update_ping(&self) {
        self.last_ping
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.load(Ordering::Relaxed)
    }
}

/// Registry of connected clients.
pub struct ClientRegistry {
    clients: DashMap<SessionId, Arc<ClientState>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self { clients: DashMap::new() }
    }

    pub fn register(&self, client: Arc<ClientState>) -> SessionId {
        let id = client.id;
        self.clients.insert(id, client);
        info!("client {} registered", id);
        id
    }

    /// Remove a client, returning its state so the caller can withdraw the
    /// session's remaining interest.
    pub fn unregister(&self, id: &SessionId) -> Option<Arc<ClientState>> {
        let removed = self.clients.remove(id).map(|(_, client)| client);
        if removed.is_some() {
            info!("client {} unregistered", id);
        }
        removed
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<ClientState>> {
        self.clients.get(id).map(|c| c.clone())
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcast for ClientRegistry {
    fn deliver(&self, sessions: &[SessionId], update: &MatchUpdate) {
        // Serialize the envelope once for the whole fan-out.
        let json = match serde_json::to_string(update) {
            Ok(json) => json,
            Err(e) => {
                warn!("failed to serialize update envelope: {}", e);
                return;
            }
        };

        for id in sessions {
            let Some(client) = self.clients.get(id) else { continue };
            if client.tx.try_send(Message::Text(json.clone().into())).is_ok() {
                counter!("gateway_updates_delivered_total").increment(1);
            } else {
                debug!("dropping update for slow client {}", id);
                counter!("gateway_updates_dropped_total").increment(1);
            }
        }
    }

    fn unavailable(&self, sessions: &[SessionId], event_id: &str) {
        let msg = ServerMessage::Error {
            message: format!("upstream feed unavailable for event {}", event_id),
            code: "UPSTREAM_UNAVAILABLE".to_string(),
        };
        for id in sessions {
            if let Some(client) = self.clients.get(id) {
                let _ = client.send(&msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::UpdateKind;
    use serde_json::json;

    fn make_client() -> (Arc<ClientState>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_BUFFER_SIZE);
        (Arc::new(ClientState::new(tx)), rx)
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(text) => text.to_string(),
            other => panic!("expected text message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn delivers_bare_envelope_to_listed_sessions_only() {
        let registry = ClientRegistry::new();
        let (watcher, mut watcher_rx) = make_client();
        let (other, mut other_rx) = make_client();
        let watcher_id = registry.register(watcher);
        registry.register(other);

        let update = MatchUpdate {
            kind: UpdateKind::Odds,
            data: json!([{"runner": "A", "odds": 1.9}]),
            timestamp: 1_700_000_000_000,
        };
        registry.deliver(&[watcher_id], &update);

        let received = text_of(watcher_rx.recv().await.unwrap());
        let value: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(value["type"], "odds");
        assert_eq!(value["data"][0]["odds"], 1.9);
        assert_eq!(value["timestamp"], 1_700_000_000_000i64);

        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn delivery_to_unknown_session_is_skipped() {
        let registry = ClientRegistry::new();
        let update = MatchUpdate {
            kind: UpdateKind::Fancy,
            data: json!([]),
            timestamp: 0,
        };
        // Must not panic or block.
        registry.deliver(&[SessionId::new_v4()], &update);
    }

    #[tokio::test]
    async fn unavailable_sends_error_control_message() {
        let registry = ClientRegistry::new();
        let (client, mut rx) = make_client();
        let id = registry.register(client);

        registry.unavailable(&[id], "123");

        let received = text_of(rx.recv().await.unwrap());
        let value: serde_json::Value = serde_json::from_str(&received).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["code"], "UPSTREAM_UNAVAILABLE");
    }

    #[tokio::test]
    async fn unregister_returns_state_with_subscriptions() {
        let registry = ClientRegistry::new();
        let (client, _rx) = make_client();
        let id = registry.register(client);
        registry.get(&id).unwrap().subscriptions.insert("123".to_string());

        let removed = registry.unregister(&id).unwrap();
        assert!(removed.subscriptions.contains("123"));
        assert_eq!(registry.client_count(), 0);
        assert!(registry.unregister(&id).is_none());
    }
}
