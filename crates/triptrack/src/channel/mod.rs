//! Realtime trip-room channel.
//!
//! A [`RealtimeChannel`] owns one WebSocket connection to the trip server
//! and speaks socket.io framing over it. It is constructed and disposed by
//! its owner; there is no process-wide instance.
//!
//! # Lifecycle
//!
//! - [`connect`](RealtimeChannel::connect) performs the engine.io and
//!   socket.io handshakes, then spawns a reader task (answers pings, decodes
//!   events) and a writer task (serialises outbound packets).
//! - [`join_room`](RealtimeChannel::join_room),
//!   [`leave_room`](RealtimeChannel::leave_room) and
//!   [`publish_position`](RealtimeChannel::publish_position) queue packets
//!   and return immediately. Delivery is best-effort, at most once.
//! - Inbound broadcasts and runtime errors reach callers through
//!   [`Subscription`]s bound to the current connection.
//! - [`disconnect`](RealtimeChannel::disconnect) closes the session. Once it
//!   returns, no subscription yields anything further.
//!
//! There is no reconnection. A lost connection is reported once on the
//! error subscription and [`is_connected`](RealtimeChannel::is_connected)
//! turns false.

mod events;
mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::position::TripId;

pub use events::{
    PositionBroadcast, PositionReport, JOIN_TRIP, LEAVE_TRIP, POSITION_UPDATE, UPDATE_POSITION,
};
pub use protocol::{OpenHandshake, Packet};

/// How long `disconnect` waits for the writer to flush the goodbye packets.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Handshake = (SplitSink<WsStream, Message>, SplitStream<WsStream>, OpenHandshake);

/// Errors raised by the realtime channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    /// The configured server URL cannot be used.
    #[error("invalid server URL: {0}")]
    InvalidUrl(String),

    /// An operation needed a live connection.
    #[error("channel not connected")]
    NotConnected,

    /// The WebSocket connection could not be established.
    #[error("failed to connect: {0}")]
    Connect(String),

    /// The handshake did not complete in time.
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    /// The server answered the handshake unexpectedly.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server refused the connection (usually authentication).
    #[error("connection rejected by server: {0}")]
    Rejected(String),

    /// The underlying socket failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server sent something we could not decode.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server closed the session.
    #[error("connection closed: {0}")]
    Closed(String),
}

impl From<tungstenite::Error> for ChannelError {
    fn from(err: tungstenite::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Configuration for a [`RealtimeChannel`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Server base URL (`http://host:port` or `ws://host:port`).
    pub server_url: String,

    /// Upper bound on the whole connect handshake.
    pub connect_timeout: Duration,

    /// Per-subscriber buffer for inbound broadcasts. A subscriber that falls
    /// further behind skips the oldest positions.
    pub broadcast_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:3000".to_string(),
            connect_timeout: Duration::from_secs(10),
            broadcast_capacity: 64,
        }
    }
}

/// Build the socket.io WebSocket endpoint for a server base URL.
///
/// # Errors
///
/// Returns [`ChannelError::InvalidUrl`] for unsupported schemes or a
/// missing host.
pub fn socket_endpoint(server_url: &str) -> Result<String, ChannelError> {
    let server_url = server_url.trim().trim_end_matches('/');
    let (scheme, rest) = server_url
        .split_once("://")
        .ok_or_else(|| ChannelError::InvalidUrl(format!("{server_url}: missing scheme")))?;

    let ws_scheme = match scheme.to_ascii_lowercase().as_str() {
        "http" | "ws" => "ws",
        "https" | "wss" => {
            return Err(ChannelError::InvalidUrl(format!(
                "{server_url}: TLS endpoints are not supported"
            )))
        }
        other => {
            return Err(ChannelError::InvalidUrl(format!(
                "{server_url}: unsupported scheme '{other}'"
            )))
        }
    };

    if rest.is_empty() || rest.starts_with('/') {
        return Err(ChannelError::InvalidUrl(format!("{server_url}: missing host")));
    }

    Ok(format!(
        "{ws_scheme}://{rest}/socket.io/?EIO=4&transport=websocket"
    ))
}

/// Items queued for the writer task.
#[derive(Debug)]
enum Outbound {
    Packet(Packet),
    Close,
}

/// A receiver bound to one connection.
///
/// Yields items in arrival order until the connection is torn down. A
/// subscriber that falls behind skips the items it missed.
///
/// After a local [`disconnect`](RealtimeChannel::disconnect) nothing more is
/// yielded, buffered or not. When the connection is lost instead, items
/// already delivered (including the loss error) are still drained before
/// `recv` returns `None`.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
    session: CancellationToken,
    closed: CancellationToken,
}

impl<T: Clone> Subscription<T> {
    /// Wait for the next item. Returns `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            if self.session.is_cancelled() {
                return None;
            }

            let result = tokio::select! {
                biased;
                () = self.session.cancelled() => return None,
                result = self.rx.recv() => result,
                () = self.closed.cancelled() => self.rx.try_recv().map_err(|e| match e {
                    broadcast::error::TryRecvError::Lagged(skipped) => {
                        broadcast::error::RecvError::Lagged(skipped)
                    }
                    _ => broadcast::error::RecvError::Closed,
                }),
            };

            match result {
                Ok(item) if !self.session.is_cancelled() => return Some(item),
                Ok(_) | Err(broadcast::error::RecvError::Closed) => return None,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Subscriber lagged, skipping to latest");
                }
            }
        }
    }
}

/// State of one live connection.
#[derive(Debug)]
struct Connection {
    session_id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    positions: broadcast::Sender<PositionBroadcast>,
    errors: broadcast::Sender<ChannelError>,
    session: CancellationToken,
    closed: CancellationToken,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn emit(&self, packet: Packet) -> Result<(), ChannelError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(ChannelError::NotConnected);
        }
        self.outbound
            .send(Outbound::Packet(packet))
            .map_err(|_| ChannelError::NotConnected)
    }

    async fn shutdown(self) {
        // Subscribers stop seeing anything from here on.
        self.session.cancel();
        self.reader.abort();

        if self.alive.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Outbound::Packet(Packet::Disconnect));
            let _ = self.outbound.send(Outbound::Close);
        }
        drop(self.outbound);

        let mut writer = self.writer;
        if tokio::time::timeout(CLOSE_TIMEOUT, &mut writer).await.is_err() {
            warn!("Timed out flushing realtime channel, aborting writer");
            writer.abort();
        }
    }
}

/// A WebSocket connection to the trip server.
#[derive(Debug)]
pub struct RealtimeChannel {
    config: ChannelConfig,
    connection: Option<Connection>,
}

impl RealtimeChannel {
    /// Create a disconnected channel.
    #[must_use]
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            connection: None,
        }
    }

    /// The channel configuration.
    #[must_use]
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Whether the connection is up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.alive.load(Ordering::SeqCst))
    }

    /// The engine.io session id of the current connection.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.connection.as_ref().map(|c| c.session_id.as_str())
    }

    /// Connect and authenticate. Does nothing if already connected.
    ///
    /// An empty `auth_token` connects without an auth payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid, the socket cannot be opened,
    /// the server rejects the token, or the handshake times out.
    pub async fn connect(&mut self, auth_token: &str) -> Result<(), ChannelError> {
        if self.is_connected() {
            debug!("Realtime channel already connected");
            return Ok(());
        }
        if let Some(stale) = self.connection.take() {
            stale.shutdown().await;
        }

        let endpoint = socket_endpoint(&self.config.server_url)?;
        debug!(endpoint = %endpoint, "Connecting realtime channel");

        let (sink, stream, open) =
            tokio::time::timeout(self.config.connect_timeout, handshake(&endpoint, auth_token))
                .await
                .map_err(|_| ChannelError::Timeout(self.config.connect_timeout))??;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (positions, _) = broadcast::channel(self.config.broadcast_capacity);
        let (errors, _) = broadcast::channel(self.config.broadcast_capacity);
        let session = CancellationToken::new();
        // Cancelled when the socket goes away for any reason.
        let closed = session.child_token();
        let alive = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(write_loop(
            sink,
            outbound_rx,
            errors.clone(),
            session.clone(),
            closed.clone(),
            Arc::clone(&alive),
        ));
        let reader = tokio::spawn(read_loop(
            stream,
            outbound_tx.clone(),
            positions.clone(),
            errors.clone(),
            session.clone(),
            closed.clone(),
            Arc::clone(&alive),
        ));

        info!(
            sid = %open.sid,
            ping_interval_ms = open.ping_interval,
            "Connected to realtime server"
        );

        self.connection = Some(Connection {
            session_id: open.sid,
            outbound: outbound_tx,
            positions,
            errors,
            session,
            closed,
            alive,
            reader,
            writer,
        });
        Ok(())
    }

    /// Join a trip room.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] without a live connection.
    pub fn join_room(&self, trip_id: &TripId) -> Result<(), ChannelError> {
        debug!(trip_id = %trip_id, "Joining trip room");
        self.emit(Packet::event(JOIN_TRIP, trip_id.as_str().into()))
    }

    /// Leave a trip room.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] without a live connection.
    pub fn leave_room(&self, trip_id: &TripId) -> Result<(), ChannelError> {
        debug!(trip_id = %trip_id, "Leaving trip room");
        self.emit(Packet::event(LEAVE_TRIP, trip_id.as_str().into()))
    }

    /// Publish the local user's position. Fire-and-forget; a no-op when not
    /// connected.
    pub fn publish_position(&self, report: &PositionReport) {
        let data = match serde_json::to_value(report) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to encode position report");
                return;
            }
        };
        if let Err(e) = self.emit(Packet::event(UPDATE_POSITION, data)) {
            trace!(error = %e, "Dropping position report");
        }
    }

    /// Subscribe to inbound position broadcasts on the current connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] without a live connection.
    pub fn subscribe_positions(&self) -> Result<Subscription<PositionBroadcast>, ChannelError> {
        let conn = self.live()?;
        Ok(Subscription {
            rx: conn.positions.subscribe(),
            session: conn.session.clone(),
            closed: conn.closed.clone(),
        })
    }

    /// Subscribe to runtime errors on the current connection.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelError::NotConnected`] without a live connection.
    pub fn subscribe_errors(&self) -> Result<Subscription<ChannelError>, ChannelError> {
        let conn = self.live()?;
        Ok(Subscription {
            rx: conn.errors.subscribe(),
            session: conn.session.clone(),
            closed: conn.closed.clone(),
        })
    }

    /// Close the connection. Safe to call when already disconnected.
    pub async fn disconnect(&mut self) {
        let Some(conn) = self.connection.take() else {
            trace!("Realtime channel already disconnected");
            return;
        };
        conn.shutdown().await;
        info!("Disconnected from realtime server");
    }

    fn live(&self) -> Result<&Connection, ChannelError> {
        self.connection
            .as_ref()
            .filter(|c| c.alive.load(Ordering::SeqCst))
            .ok_or(ChannelError::NotConnected)
    }

    fn emit(&self, packet: Packet) -> Result<(), ChannelError> {
        self.live()?.emit(packet)
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.session.cancel();
            conn.reader.abort();
            conn.writer.abort();
        }
    }
}

/// Read frames until one carries a text packet.
async fn next_packet<S>(stream: &mut S) -> Result<Packet, ChannelError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Packet::decode(&text),
            Some(Ok(Message::Close(frame))) => {
                return Err(ChannelError::Closed(close_reason(frame.as_ref())))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ChannelError::Closed("stream ended".to_string())),
        }
    }
}

fn close_reason(frame: Option<&tungstenite::protocol::CloseFrame<'_>>) -> String {
    frame.map_or_else(
        || "no reason given".to_string(),
        |f| format!("{} {}", f.code, f.reason),
    )
}

async fn handshake(endpoint: &str, auth_token: &str) -> Result<Handshake, ChannelError> {
    let (ws, _response) = tokio_tungstenite::connect_async(endpoint)
        .await
        .map_err(|e| ChannelError::Connect(e.to_string()))?;
    let (mut sink, mut stream) = ws.split();

    let open = match next_packet(&mut stream).await? {
        Packet::Open(open) => open,
        other => {
            return Err(ChannelError::Handshake(format!(
                "expected open packet, got {other:?}"
            )))
        }
    };

    let auth = (!auth_token.is_empty()).then(|| serde_json::json!({ "token": auth_token }));
    sink.send(Message::Text(Packet::Connect(auth).encode()))
        .await?;

    loop {
        match next_packet(&mut stream).await? {
            Packet::Connect(_) => break,
            Packet::ConnectError(reason) => {
                let message = reason
                    .get("message")
                    .and_then(serde_json::Value::as_str)
                    .map_or_else(|| reason.to_string(), str::to_string);
                return Err(ChannelError::Rejected(message));
            }
            Packet::Ping => sink.send(Message::Text(Packet::Pong.encode())).await?,
            Packet::Close | Packet::Disconnect => {
                return Err(ChannelError::Handshake(
                    "server closed the session during connect".to_string(),
                ))
            }
            other => trace!(packet = ?other, "Ignoring packet during handshake"),
        }
    }

    Ok((sink, stream, open))
}

async fn write_loop(
    mut sink: SplitSink<WsStream, Message>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    errors: broadcast::Sender<ChannelError>,
    session: CancellationToken,
    closed: CancellationToken,
    alive: Arc<AtomicBool>,
) {
    while let Some(item) = outbound.recv().await {
        let result = match item {
            Outbound::Packet(packet) => {
                trace!(packet = ?packet, "Sending packet");
                sink.send(Message::Text(packet.encode())).await
            }
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.close().await;
                break;
            }
        };

        if let Err(e) = result {
            alive.store(false, Ordering::SeqCst);
            if !session.is_cancelled() {
                warn!(error = %e, "Realtime channel write failed");
                let _ = errors.send(e.into());
            }
            closed.cancel();
            break;
        }
    }
    debug!("Realtime writer stopped");
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    outbound: mpsc::UnboundedSender<Outbound>,
    positions: broadcast::Sender<PositionBroadcast>,
    errors: broadcast::Sender<ChannelError>,
    session: CancellationToken,
    closed: CancellationToken,
    alive: Arc<AtomicBool>,
) {
    let lost = loop {
        let packet = tokio::select! {
            biased;
            () = closed.cancelled() => break None,
            packet = next_packet(&mut stream) => packet,
        };

        match packet {
            Ok(Packet::Ping) => {
                let _ = outbound.send(Outbound::Packet(Packet::Pong));
            }
            Ok(Packet::Event { name, data }) if name == POSITION_UPDATE => {
                match PositionBroadcast::from_wire(data, Utc::now()) {
                    Ok(broadcast) => {
                        if session.is_cancelled() {
                            break None;
                        }
                        trace!(
                            participant = %broadcast.participant_id,
                            position = %broadcast.position,
                            "Position broadcast received"
                        );
                        // No subscribers is fine.
                        let _ = positions.send(broadcast);
                    }
                    Err(e) => {
                        let _ = errors.send(ChannelError::Protocol(format!(
                            "malformed {POSITION_UPDATE}: {e}"
                        )));
                    }
                }
            }
            Ok(Packet::Event { name, .. }) => trace!(event = %name, "Ignoring event"),
            Ok(Packet::Close | Packet::Disconnect) => {
                break Some(ChannelError::Closed("server ended the session".to_string()))
            }
            Ok(Packet::ConnectError(reason)) => {
                break Some(ChannelError::Rejected(reason.to_string()))
            }
            Ok(other) => trace!(packet = ?other, "Ignoring packet"),
            Err(e @ ChannelError::Protocol(_)) => {
                warn!(error = %e, "Undecodable packet");
                let _ = errors.send(e);
            }
            Err(e) => break Some(e),
        }
    };

    alive.store(false, Ordering::SeqCst);
    if let Some(e) = lost {
        if !session.is_cancelled() {
            warn!(error = %e, "Realtime connection lost");
            let _ = errors.send(e);
        }
    }
    // Subscribers drain what was sent above, then see the end.
    closed.cancel();
    debug!("Realtime reader stopped");
}
