//! WebSocket server handler using Axum.

use crate::client::{ClientRegistry, ClientState, CLIENT_CHANNEL_BUFFER_SIZE};
use crate::error::{GatewayError, Result};
use crate::protocol::{ClientMessage, ServerMessage};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use feed::FeedService;
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub registry: Arc<ClientRegistry>,
    pub feed: FeedService,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        r#"{{"status":"ok","clients":{},"upstreams":{}}}"#,
        state.registry.client_count(),
        state.feed.pool_size()
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle a WebSocket connection for its whole lifetime.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_CHANNEL_BUFFER_SIZE);
    let client = Arc::new(ClientState::new(tx));
    let client_id = state.registry.register(client.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);

    info!("client {} connected", client_id);

    // Forward buffered messages to the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(msg)) => {
                        if let Err(e) = handle_message(&state, &client, msg) {
                            warn!("error handling message from {}: {:?}", client_id, e);
                            let _ = client.send(&ServerMessage::Error {
                                message: e.to_string(),
                                code: "PROCESSING_ERROR".to_string(),
                            });
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", client_id, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if client.tx.try_send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    // Withdraw this session's interest before dropping it; events left
    // with no watchers get their upstream connection closed.
    if let Some(client) = state.registry.unregister(&client_id) {
        let watched: Vec<String> = client.subscriptions.iter().map(|s| s.clone()).collect();
        if !watched.is_empty() {
            state.feed.unsubscribe(&client_id, &watched);
        }
    }
    send_task.abort();

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.client_count() as f64);

    info!("client {} disconnected", client_id);
}

/// Handle a single WebSocket message.
fn handle_message(state: &Arc<AppState>, client: &Arc<ClientState>, msg: Message) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = serde_json::from_str(&text)?;
            handle_client_message(state, client, client_msg)
        }
        Message::Binary(data) => {
            let client_msg: ClientMessage = serde_json::from_slice(&data)?;
            handle_client_message(state, client, client_msg)
        }
        Message::Ping(data) => {
            client.update_ping();
            client
                .tx
                .try_send(Message::Pong(data))
                .map_err(|_| GatewayError::ChannelSend)?;
            Ok(())
        }
        Message::Pong(_) => {
            client.update_ping();
            Ok(())
        }
        Message::Close(_) => {
            // Handled by the connection loop.
            Ok(())
        }
    }
}

/// Handle a parsed client message.
fn handle_client_message(
    state: &Arc<AppState>,
    client: &Arc<ClientState>,
    msg: ClientMessage,
) -> Result<()> {
    match msg {
        ClientMessage::Sub { event_id } => {
            debug!("client {} subscribing to {}", client.id, event_id);

            client.subscriptions.insert(event_id.clone());
            state.feed.subscribe(client.id, &event_id);

            client.send(&ServerMessage::Subscribed { event_id })?;
            counter!("gateway_subscriptions_total").increment(1);
            Ok(())
        }
        ClientMessage::Leave { event_ids } => {
            let event_ids = event_ids.into_vec();
            debug!("client {} leaving {:?}", client.id, event_ids);

            for event_id in &event_ids {
                client.subscriptions.remove(event_id);
            }
            state.feed.unsubscribe(&client.id, &event_ids);

            client.send(&ServerMessage::Unsubscribed { event_ids })?;
            Ok(())
        }
        ClientMessage::Ping => {
            client.update_ping();
            client.send(&ServerMessage::Pong)
        }
    }
}
