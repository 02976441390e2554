//! A single live WebSocket connection.
//!
//! Each connection runs two loops. The write loop owns the socket's sink,
//! so at most one write is ever in flight; it drains the outbound queue,
//! sends keepalive pings and closes the socket when the queue ends. The
//! read loop owns the stream; it enforces the read deadline and frame
//! limits, persists inbound messages and hands them to the registry.
//!
//! Whichever loop stops first brings the other one down: the read loop
//! watches the write task, and the write task stops when the registry drops
//! its queue after the read loop unregisters.

use axum::body::Bytes;
use axum::extract::ws::{close_code, CloseFrame, Message as WsMessage, Utf8Bytes, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use playzy_messages::{Message, MessageStore, NewMessage};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::GatewayConfig;
use crate::registry::{ConnectionHandle, ConnectionKey, ConnectionRegistry};

/// Per-connection limits and timings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub max_frame_bytes: usize,
    pub outbound_capacity: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
}

impl From<&GatewayConfig> for ConnectionSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            outbound_capacity: config.outbound_queue_capacity,
            write_wait: config.write_wait(),
            pong_wait: config.pong_wait(),
            ping_period: config.ping_period(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&GatewayConfig::default())
    }
}

/// A message as sent by a client: `{"content": "...", "receiverId": "..."}`.
#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct InboundFrame {
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "receiverId", alias = "receiverID")]
    pub receiver_id: String,
}

/// Why an inbound frame was dropped. None of these end the connection.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    Oversized { len: usize, max: usize },
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("frame has empty content")]
    EmptyContent,
    #[error("frame has no receiver")]
    MissingReceiver,
}

/// Size-checks, parses and validates one inbound frame. The receiver id
/// comes back trimmed, ready for routing.
pub fn decode_frame(bytes: &[u8], max_frame_bytes: usize) -> Result<InboundFrame, FrameError> {
    if bytes.len() > max_frame_bytes {
        return Err(FrameError::Oversized {
            len: bytes.len(),
            max: max_frame_bytes,
        });
    }
    let mut frame: InboundFrame = serde_json::from_slice(bytes)?;
    if frame.content.is_empty() {
        return Err(FrameError::EmptyContent);
    }
    let receiver = frame.receiver_id.trim();
    if receiver.is_empty() {
        return Err(FrameError::MissingReceiver);
    }
    if receiver.len() != frame.receiver_id.len() {
        frame.receiver_id = receiver.to_string();
    }
    Ok(frame)
}

#[derive(Debug)]
enum ReadExit {
    PeerClosed,
    ReadTimeout,
    Transport(String),
    WriterStopped,
}

#[derive(Debug, Error)]
enum WriteError {
    #[error("write deadline exceeded")]
    Timeout,
    #[error("transport error: {0}")]
    Transport(#[from] axum::Error),
}

/// The read side of a connection plus everything it needs to hand off
/// messages.
pub struct Connection {
    key: ConnectionKey,
    registry: ConnectionRegistry,
    store: Arc<dyn MessageStore>,
    settings: ConnectionSettings,
}

impl Connection {
    /// Builds a connection for `user_id` together with the handle to
    /// register and the receiving end of its outbound queue.
    pub fn open(
        user_id: impl Into<String>,
        registry: ConnectionRegistry,
        store: Arc<dyn MessageStore>,
        settings: ConnectionSettings,
    ) -> (Self, ConnectionHandle, mpsc::Receiver<Message>) {
        let (handle, outbound) = ConnectionHandle::new(user_id, settings.outbound_capacity);
        let connection = Self {
            key: handle.key().clone(),
            registry,
            store,
            settings,
        };
        (connection, handle, outbound)
    }

    /// Runs both loops until the connection ends, then unregisters.
    pub async fn serve(self, socket: WebSocket, outbound: mpsc::Receiver<Message>) {
        let (sink, stream) = socket.split();
        let mut writer = tokio::spawn(write_loop(
            sink,
            outbound,
            self.settings.clone(),
            self.key.clone(),
        ));

        let exit = self.read_loop(stream, &mut writer).await;
        tracing::info!(
            user_id = %self.key.user_id,
            connection_id = %self.key.connection_id,
            reason = ?exit,
            "connection closing"
        );

        self.registry.unregister(self.key.clone()).await;

        if !matches!(exit, ReadExit::WriterStopped) {
            // The registry has dropped our queue by now (or will shortly), so
            // the writer is on its way out after sending the close frame.
            if tokio::time::timeout(self.settings.write_wait, &mut writer)
                .await
                .is_err()
            {
                tracing::warn!(
                    connection_id = %self.key.connection_id,
                    "write loop did not stop in time, aborting"
                );
                writer.abort();
            }
        }
    }

    async fn read_loop(
        &self,
        mut stream: SplitStream<WebSocket>,
        writer: &mut JoinHandle<()>,
    ) -> ReadExit {
        let mut deadline = Instant::now() + self.settings.pong_wait;
        loop {
            tokio::select! {
                _ = &mut *writer => return ReadExit::WriterStopped,
                next = tokio::time::timeout_at(deadline, stream.next()) => {
                    let frame = match next {
                        Err(_) => return ReadExit::ReadTimeout,
                        Ok(None) => return ReadExit::PeerClosed,
                        Ok(Some(Err(e))) => return ReadExit::Transport(e.to_string()),
                        Ok(Some(Ok(frame))) => frame,
                    };
                    deadline = Instant::now() + self.settings.pong_wait;

                    match frame {
                        WsMessage::Text(text) => self.handle_frame(text.as_str().as_bytes()).await,
                        WsMessage::Binary(bytes) => self.handle_frame(&bytes).await,
                        WsMessage::Ping(_) | WsMessage::Pong(_) => {}
                        WsMessage::Close(_) => return ReadExit::PeerClosed,
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, bytes: &[u8]) {
        let frame = match decode_frame(bytes, self.settings.max_frame_bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(
                    user_id = %self.key.user_id,
                    connection_id = %self.key.connection_id,
                    "dropping inbound frame: {}",
                    e
                );
                return;
            }
        };

        let draft = NewMessage::new(self.key.user_id.clone(), frame.receiver_id, frame.content);
        let message = self.persist(draft).await;

        if let Err(e) = self.registry.try_broadcast(message) {
            tracing::warn!(
                user_id = %self.key.user_id,
                "live delivery dropped, message remains in history: {}",
                e
            );
        }
    }

    /// Appends to the store. A failed append is logged and the message is
    /// still delivered live under a generated id.
    async fn persist(&self, draft: NewMessage) -> Message {
        let store = self.store.clone();
        let pending = draft.clone();
        match tokio::task::spawn_blocking(move || store.append(&pending)).await {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                tracing::warn!(
                    user_id = %draft.sender_id,
                    receiver_id = %draft.receiver_id,
                    "failed to persist message, delivering anyway: {}",
                    e
                );
                draft.into_unpersisted()
            }
            Err(e) => {
                tracing::error!("message persistence task failed: {}", e);
                draft.into_unpersisted()
            }
        }
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Message>,
    settings: ConnectionSettings,
    key: ConnectionKey,
) {
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_period,
        settings.ping_period,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let frame = tokio::select! {
            next = outbound.recv() => match next {
                Some(message) => match serde_json::to_string(&message) {
                    Ok(json) => WsMessage::Text(json.into()),
                    Err(e) => {
                        tracing::error!(message_id = %message.id, "failed to encode message: {}", e);
                        continue;
                    }
                },
                None => {
                    let close = WsMessage::Close(Some(CloseFrame {
                        code: close_code::NORMAL,
                        reason: Utf8Bytes::from_static("connection closed"),
                    }));
                    if let Err(e) = send_with_deadline(&mut sink, close, settings.write_wait).await {
                        tracing::debug!(connection_id = %key.connection_id, "close frame not sent: {}", e);
                    }
                    return;
                }
            },
            _ = ping.tick() => WsMessage::Ping(Bytes::new()),
        };

        if let Err(e) = send_with_deadline(&mut sink, frame, settings.write_wait).await {
            tracing::debug!(
                user_id = %key.user_id,
                connection_id = %key.connection_id,
                "write loop stopping: {}",
                e
            );
            return;
        }
    }
}

async fn send_with_deadline(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: WsMessage,
    deadline: Duration,
) -> Result<(), WriteError> {
    match tokio::time::timeout(deadline, sink.send(frame)).await {
        Ok(result) => result.map_err(WriteError::from),
        Err(_) => Err(WriteError::Timeout),
    }
}
