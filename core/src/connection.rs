/// Live-update channel: one connection for the whole session, reconnecting on drop
use crate::config::Config;
use crate::controller::MessageStreamController;
use crate::error::{Result, StreamError};
use crate::message_types::{LiveEvent, Message, PING_FRAME, SUBSCRIBE_FRAME};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

// ─── Seams ───────────────────────────────────────────────────────────────────

/// An open live channel carrying text frames
#[async_trait]
pub trait LiveChannel: Send {
    async fn send_text(&mut self, text: String) -> Result<()>;

    /// Next inbound text frame; `None` once the channel is closed
    async fn next_text(&mut self) -> Option<Result<String>>;

    async fn close(&mut self);
}

/// Opens live channels
#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn LiveChannel>>;
}

/// Receiver of routed live messages
#[async_trait]
pub trait LiveSink: Send + Sync {
    /// Read at dispatch time, never cached
    async fn selected_conversation(&self) -> Option<i64>;

    async fn append_live(&self, message: Message) -> bool;
}

#[async_trait]
impl LiveSink for MessageStreamController {
    async fn selected_conversation(&self) -> Option<i64> {
        MessageStreamController::selected_conversation(self).await
    }

    async fn append_live(&self, message: Message) -> bool {
        MessageStreamController::append_live(self, message).await
    }
}

// ─── Routing ─────────────────────────────────────────────────────────────────

/// What happened to one inbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Merged into the selected conversation
    Delivered,
    /// For the selected conversation but already present
    Duplicate,
    /// For a conversation that is not selected; dropped, not buffered
    Discarded,
    /// Control frame (heartbeat, pong, subscription ack, server error)
    Control,
    /// Could not be parsed; dropped
    Malformed,
}

/// Parse a raw frame and route it to the sink if it belongs to the selected conversation
pub async fn dispatch_payload(raw: &str, sink: &dyn LiveSink) -> Dispatch {
    let event = match LiveEvent::parse(raw) {
        Ok(event) => event,
        Err(e) => {
            warn!("Ignoring malformed live payload: {}", e);
            return Dispatch::Malformed;
        }
    };

    match event {
        LiveEvent::NewMessage {
            conversation_id,
            message,
        } => {
            if sink.selected_conversation().await != Some(conversation_id) {
                trace!("Dropping live message {} for unselected conversation {}", message.id, conversation_id);
                return Dispatch::Discarded;
            }
            let id = message.id;
            if sink.append_live(message).await {
                debug!("Live message {} appended to {}", id, conversation_id);
                Dispatch::Delivered
            } else {
                debug!("Live message {} already in window", id);
                Dispatch::Duplicate
            }
        }
        LiveEvent::Subscribed => {
            info!("Live channel subscription confirmed");
            Dispatch::Control
        }
        LiveEvent::Heartbeat | LiveEvent::Pong => {
            trace!("Live channel keepalive");
            Dispatch::Control
        }
        LiveEvent::ServerError(message) => {
            warn!("Live channel server error: {}", message);
            Dispatch::Control
        }
        LiveEvent::Unknown(kind) => {
            debug!("Ignoring live frame of type {}", kind);
            Dispatch::Control
        }
    }
}

// ─── Manager ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected
    Disconnected,
    Connecting,
    Connected,
    /// Channel dropped; a single reconnect timer is running
    WaitingToReconnect,
    /// Reconnect cap reached
    GaveUp,
    /// Torn down
    Closed,
}

/// Keeps exactly one live channel open and routes its events
#[derive(Clone)]
pub struct ConnectionManager {
    transport: Arc<dyn LiveTransport>,
    sink: Arc<dyn LiveSink>,
    reconnect_delay: Duration,
    max_reconnect_attempts: Option<u32>,
    heartbeat_interval: Duration,
    state: Arc<RwLock<ConnectionState>>,
    attempts: Arc<AtomicU32>,
    supervisor: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn LiveTransport>, sink: Arc<dyn LiveSink>, config: &Config) -> Self {
        let (shutdown, _) = watch::channel(false);
        // a zero period would panic the keepalive timer inside the supervisor
        let heartbeat_interval = if config.heartbeat_interval.is_zero() {
            let fallback = Config::default().heartbeat_interval;
            warn!("Heartbeat interval is zero, using {:?}", fallback);
            fallback
        } else {
            config.heartbeat_interval
        };
        Self {
            transport,
            sink,
            reconnect_delay: config.reconnect_delay,
            max_reconnect_attempts: config.max_reconnect_attempts,
            heartbeat_interval,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            attempts: Arc::new(AtomicU32::new(0)),
            supervisor: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(shutdown),
        }
    }

    /// Start the channel. No-op while a channel (or its reconnect loop) is
    /// already running, and after shutdown.
    pub async fn connect(&self) {
        if *self.shutdown.borrow() {
            debug!("Ignoring connect after shutdown");
            return;
        }

        let mut supervisor = self.supervisor.lock().await;
        if let Some(handle) = supervisor.as_ref() {
            if !handle.is_finished() {
                debug!("Live channel already running");
                return;
            }
        }

        let manager = self.clone();
        *supervisor = Some(tokio::spawn(async move { manager.run_supervisor().await }));
    }

    /// Close the channel once and stop reconnecting. Later calls are no-ops.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Shutting down live channel");

        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.set_state(ConnectionState::Closed).await;
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Total connect attempts made so far
    pub fn connect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.state.write().await = state;
    }

    async fn run_supervisor(&self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut failures: u32 = 0;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.set_state(ConnectionState::Connecting).await;
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Opening live channel (attempt {})", attempt);

            let connected = tokio::select! {
                result = self.transport.connect() => result,
                _ = shutdown_rx.changed() => break,
            };

            match connected {
                Ok(mut channel) => {
                    failures = 0;
                    self.set_state(ConnectionState::Connected).await;
                    info!("Live channel connected");

                    let stopped = match channel.send_text(SUBSCRIBE_FRAME.to_string()).await {
                        Ok(()) => self.run_session(channel.as_mut(), &mut shutdown_rx).await,
                        Err(e) => {
                            warn!("Failed to send subscription: {}", e);
                            false
                        }
                    };
                    if stopped {
                        break;
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!("Live channel connect failed: {}", e);
                }
            }

            // Some(0) gives up on the first drop, even after a good session
            if let Some(max) = self.max_reconnect_attempts {
                if failures >= max {
                    error!("Giving up on live channel after {} failed attempts", failures);
                    self.set_state(ConnectionState::GaveUp).await;
                    return;
                }
            }

            self.set_state(ConnectionState::WaitingToReconnect).await;
            info!("Reconnecting live channel in {:?}", self.reconnect_delay);
            tokio::select! {
                _ = sleep(self.reconnect_delay) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        self.set_state(ConnectionState::Closed).await;
    }

    /// Pump one connected channel. Returns true if it ended because of shutdown.
    async fn run_session(
        &self,
        channel: &mut dyn LiveChannel,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        let mut heartbeat = interval_at(
            Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    channel.close().await;
                    return true;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = channel.send_text(PING_FRAME.to_string()).await {
                        warn!("Live channel keepalive failed: {}", e);
                        return false;
                    }
                }
                frame = channel.next_text() => match frame {
                    Some(Ok(text)) => {
                        dispatch_payload(&text, self.sink.as_ref()).await;
                    }
                    Some(Err(e)) => {
                        warn!("Live channel error: {}", e);
                        return false;
                    }
                    None => {
                        info!("Live channel closed by server");
                        return false;
                    }
                }
            }
        }
    }
}

// ─── WebSocket transport ─────────────────────────────────────────────────────

/// Live transport over a WebSocket URL
pub struct WsTransport {
    url: String,
    connect_timeout: Duration,
}

impl WsTransport {
    pub fn new(config: &Config) -> Self {
        Self {
            url: config.live_url.clone(),
            connect_timeout: config.request_timeout,
        }
    }
}

#[async_trait]
impl LiveTransport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn LiveChannel>> {
        info!(url = %self.url, "Connecting live channel");
        let (stream, _) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| StreamError::Timeout(format!("connecting to {}", self.url)))??;
        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl LiveChannel for WsChannel {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.stream.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn next_text(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!("Ignoring non-UTF-8 binary frame"),
                },
                Ok(WsMessage::Close(_)) => return None,
                // Ping replies are queued by tungstenite itself
                Ok(_) => continue,
                Err(e) => return Some(Err(StreamError::WebSocket(e))),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            debug!("Live channel close: {}", e);
        }
    }
}
