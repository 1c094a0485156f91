//! Upstream connection task: one WebSocket per watched event.

use crate::config::FeedConfig;
use crate::frame::{self, Frame};
use crate::router::UpdateRouter;
use common::{Error, Result};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::protocol::Message, Connector, MaybeTlsStream,
    WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

/// Lifecycle state of an upstream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ConnState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Open,
            2 => ConnState::Closing,
            _ => ConnState::Closed,
        }
    }
}

/// State shared between a connection task, the pool, and the keepalive sweep.
pub struct ConnShared {
    event_id: String,
    state: AtomicU8,
    last_liveness: AtomicI64,
    ever_open: AtomicBool,
}

impl ConnShared {
    pub(crate) fn new(event_id: String) -> Self {
        Self {
            event_id,
            state: AtomicU8::new(ConnState::Connecting as u8),
            last_liveness: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            ever_open: AtomicBool::new(false),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn mark_open(&self) {
        self.set_state(ConnState::Open);
        self.ever_open.store(true, Ordering::Release);
        self.touch_liveness();
    }

    /// Whether this instance ever completed the handshake.
    pub(crate) fn ever_open(&self) -> bool {
        self.ever_open.load(Ordering::Acquire)
    }

    fn touch_liveness(&self) {
        self.last_liveness
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Epoch millis of the last liveness signal.
    pub fn last_liveness(&self) -> i64 {
        self.last_liveness.load(Ordering::Relaxed)
    }
}

/// Commands the pool can issue to a running connection task.
#[derive(Debug)]
pub(crate) enum ConnCommand {
    /// Send a liveness probe if the connection is open.
    Probe,
    /// Graceful teardown: best-effort leave, then close.
    Shutdown,
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Drive one upstream connection until shutdown or transport failure.
///
/// Returns `Ok(())` only for a commanded shutdown; every transport fault
/// surfaces as an error so the pool can supervise reconnection.
pub(crate) async fn run(
    shared: Arc<ConnShared>,
    config: FeedConfig,
    mut command_rx: mpsc::Receiver<ConnCommand>,
    router: Arc<UpdateRouter>,
) -> Result<()> {
    let result = match connect_upstream(&config.upstream_url, config.connect_timeout).await {
        Ok(ws) => {
            gauge!("feed_active_connections").increment(1.0);
            let driven = drive(&shared, ws, &mut command_rx, &router).await;
            gauge!("feed_active_connections").decrement(1.0);
            driven
        }
        Err(e) => Err(e),
    };
    shared.set_state(ConnState::Closed);
    result
}

async fn drive(
    shared: &ConnShared,
    ws: WsStream,
    command_rx: &mut mpsc::Receiver<ConnCommand>,
    router: &UpdateRouter,
) -> Result<()> {
    let event_id = shared.event_id();
    let (mut write, mut read) = ws.split();

    info!("[{}] upstream connected", event_id);
    write.send(Message::Text(frame::CONNECT_REQUEST.into())).await?;

    let mut sub_sent = false;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        counter!("feed_frames_received_total").increment(1);
                        match frame::decode(&text) {
                            Ok(Frame::OpenAck) => {
                                debug!("[{}] transport open acknowledged", event_id);
                            }
                            Ok(Frame::HandshakeAck) => {
                                // The domain sub goes out at most once per
                                // connection instance.
                                if !sub_sent {
                                    sub_sent = true;
                                    shared.mark_open();
                                    write.send(Message::Text(frame::sub_frame(event_id))).await?;
                                    info!("[{}] handshake complete, subscribed upstream", event_id);
                                }
                            }
                            Ok(Frame::Ping) => {
                                write.send(Message::Text(frame::PROBE_REPLY.into())).await?;
                                shared.touch_liveness();
                            }
                            Ok(Frame::Pong) => {
                                shared.touch_liveness();
                            }
                            Ok(Frame::Event(event)) => {
                                router.route(event_id, event);
                            }
                            Ok(Frame::Unknown) => {
                                debug!("[{}] ignoring unrecognized frame", event_id);
                            }
                            Err(e) => {
                                counter!("feed_decode_errors_total").increment(1);
                                warn!("[{}] dropping malformed frame: {}", event_id, e);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                        shared.touch_liveness();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("[{}] upstream sent close: {:?}", event_id, frame);
                        return Err(Error::ConnectionClosed);
                    }
                    Some(Ok(_)) => {
                        // Binary and pong frames from upstream carry nothing.
                    }
                    Some(Err(e)) => {
                        warn!("[{}] upstream transport error: {:?}", event_id, e);
                        return Err(Error::WebSocket(e));
                    }
                    None => {
                        info!("[{}] upstream stream ended", event_id);
                        return Err(Error::ConnectionClosed);
                    }
                }
            }

            cmd = command_rx.recv() => {
                match cmd {
                    Some(ConnCommand::Probe) => {
                        if shared.state() == ConnState::Open {
                            write.send(Message::Text(frame::PROBE.into())).await?;
                            // Optimistic refresh; we do not wait for an echo.
                            shared.touch_liveness();
                        }
                    }
                    Some(ConnCommand::Shutdown) | None => {
                        let was_open = shared.state() == ConnState::Open;
                        shared.set_state(ConnState::Closing);
                        if was_open {
                            let _ = write.send(Message::Text(frame::leave_frame(event_id))).await;
                        }
                        let _ = write.send(Message::Close(None)).await;
                        info!("[{}] upstream connection closed", event_id);
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Open the upstream transport: resolve DNS preferring IPv4, connect with a
/// per-address timeout, then perform the WebSocket handshake (TLS for wss).
async fn connect_upstream(url_str: &str, connect_timeout: Duration) -> Result<WsStream> {
    let url = Url::parse(url_str)?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Generic("no host in upstream URL".to_string()))?;
    let port = url.port_or_known_default().unwrap_or(443);
    let addr_str = format!("{}:{}", host, port);

    let addrs: Vec<SocketAddr> = addr_str
        .to_socket_addrs()
        .map_err(|e| Error::Generic(format!("DNS resolution failed: {}", e)))?
        .collect();

    let mut sorted_addrs: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

    let mut tcp_stream = None;
    for addr in &sorted_addrs {
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                tcp_stream = Some(stream);
                break;
            }
            Ok(Err(e)) => debug!("TCP connect to {} failed: {}", addr, e),
            Err(_) => debug!("TCP connect to {} timed out", addr),
        }
    }
    let tcp_stream =
        tcp_stream.ok_or_else(|| Error::Generic("all connection attempts failed".to_string()))?;

    let mut root_store = rustls::RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs();
    for cert in certs.certs {
        let _ = root_store.add(cert);
    }

    let connector = Connector::Rustls(Arc::new(
        rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Generic(format!("TLS config error: {}", e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth(),
    ));

    let (ws_stream, _response) = tokio::time::timeout(
        connect_timeout,
        client_async_tls_with_config(url_str, tcp_stream, None, Some(connector)),
    )
    .await
    .map_err(|_| Error::Generic("upstream handshake timed out".to_string()))??;

    Ok(ws_stream)
}
