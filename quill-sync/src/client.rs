//! WebSocket sync client for editors written in Rust.
//!
//! Provides:
//! - Connection lifecycle (connect, join, disconnect)
//! - Operation submission stamped with the last known server version
//! - Cursor updates
//! - Keepalive pings, so a client that only reads is not timed out
//! - Offline queue for edits made while disconnected, compacted with
//!   `compose` and replayed on the next connect
//!
//! The client does not keep a copy of the document text. The application
//! owns its buffer and reacts to [`SyncEvent`]s.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use quill_ot::{compose, Operation, OperationWire};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::presence::Participant;
use crate::protocol::{ClientMessage, ProtocolError, Selection, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Full document state. Replace the local buffer with `content`.
    DocumentState {
        content: String,
        version: u64,
        participants: Vec<Participant>,
    },
    /// Another participant's edit, as the server applied it.
    RemoteOperation {
        operation: OperationWire,
        version: u64,
        content: String,
    },
    Acknowledged { operation_id: String, version: u64 },
    Rejected { operation_id: String, reason: String },
    /// The server dropped an edit; a `DocumentState` follows.
    Resynchronized { operation_id: String, reason: String },
    ParticipantJoined { user_id: String, color: String },
    ParticipantLeft { user_id: String },
    CursorMoved {
        user_id: String,
        position: usize,
        selection: Option<Selection>,
    },
    DurabilityDegraded,
    ServerError(String),
}

impl SyncEvent {
    fn from_server(message: ServerMessage) -> Option<Self> {
        let event = match message {
            ServerMessage::DocumentState {
                content,
                version,
                participants,
                ..
            } => SyncEvent::DocumentState {
                content,
                version,
                participants,
            },
            ServerMessage::DocumentOperation {
                operation,
                version,
                content,
            } => SyncEvent::RemoteOperation {
                operation,
                version,
                content,
            },
            ServerMessage::OperationAck {
                operation_id,
                version,
            } => SyncEvent::Acknowledged {
                operation_id,
                version,
            },
            ServerMessage::OperationError {
                operation_id,
                reason,
            } => SyncEvent::Rejected {
                operation_id,
                reason,
            },
            ServerMessage::Resynchronized {
                operation_id,
                reason,
            } => SyncEvent::Resynchronized {
                operation_id,
                reason,
            },
            ServerMessage::UserJoined { user_id, color } => {
                SyncEvent::ParticipantJoined { user_id, color }
            }
            ServerMessage::UserLeft { user_id } => SyncEvent::ParticipantLeft { user_id },
            ServerMessage::CursorUpdate {
                user_id,
                position,
                selection,
            } => SyncEvent::CursorMoved {
                user_id,
                position,
                selection,
            },
            ServerMessage::DurabilityDegraded { .. } => SyncEvent::DurabilityDegraded,
            ServerMessage::Error { reason } => SyncEvent::ServerError(reason),
            ServerMessage::Pong => return None,
        };
        Some(event)
    }
}

#[derive(Debug, Clone)]
struct QueuedOperation {
    operation: Operation,
    base_version: u64,
}

/// Edits made while disconnected.
///
/// Each edit keeps the version it was made against, so the server can
/// transform it on replay. An insert followed by a delete inside the text it
/// inserted is merged into one operation.
pub struct OfflineQueue {
    queue: VecDeque<QueuedOperation>,
    max_size: usize,
}

impl OfflineQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Queue an operation. Returns `false` if the queue is full.
    pub fn enqueue(&mut self, operation: Operation, base_version: u64) -> bool {
        if let Some(last) = self.queue.back_mut() {
            if last.operation.author_id() == operation.author_id() {
                let mut merged = compose(&last.operation, &operation);
                if merged.len() == 1 {
                    if let Some(op) = merged.pop() {
                        last.operation = op;
                        return true;
                    }
                }
            }
        }

        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(QueuedOperation {
            operation,
            base_version,
        });
        true
    }

    /// Take every queued operation with its base version, oldest first.
    pub fn drain(&mut self) -> Vec<(Operation, u64)> {
        self.queue
            .drain(..)
            .map(|q| (q.operation, q.base_version))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Default gap between keepalive pings. Well under the server's default
/// 60s heartbeat timeout.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// The sync client.
pub struct SyncClient {
    user_id: String,
    document_id: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    /// Newest server version seen.
    version: Arc<AtomicU64>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    heartbeat_interval: Duration,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(
        user_id: impl Into<String>,
        document_id: impl Into<String>,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            document_id: document_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            version: Arc::new(AtomicU64::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(10_000))),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Ping at `interval` while connected. Must be shorter than the
    /// server's `heartbeat_timeout_secs`.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the document, and replay queued edits once the
    /// document state arrives.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Could not connect to {}: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let join = ClientMessage::JoinDocument {
            document_id: self.document_id.clone(),
            user_id: self.user_id.clone(),
        };
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx.clone());

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Keepalive task: holds only a weak sender, so it never keeps the
        // writer alive and stops once the connection is gone.
        let keepalive = out_tx.downgrade();
        let interval = self.heartbeat_interval;
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(tx) = keepalive.upgrade() else {
                    break;
                };
                let Ok(ping) = ClientMessage::Ping.encode() else {
                    break;
                };
                if tx.send(ping).await.is_err() {
                    break;
                }
                log::trace!("Sent keepalive ping");
            }
        });

        // Reader task: turn server messages into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let version = self.version.clone();
        let queue = self.offline_queue.clone();
        let replay_tx = out_tx.downgrade();
        tokio::spawn(async move {
            let mut replayed = false;
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let message = match ServerMessage::decode(text.as_str()) {
                    Ok(message) => message,
                    Err(e) => {
                        log::warn!("Ignoring undecodable server frame: {e}");
                        continue;
                    }
                };

                match &message {
                    ServerMessage::DocumentState { version: v, .. } => {
                        version.store(*v, Ordering::Release);
                    }
                    ServerMessage::DocumentOperation { version: v, .. }
                    | ServerMessage::OperationAck { version: v, .. } => {
                        version.fetch_max(*v, Ordering::AcqRel);
                    }
                    _ => {}
                }
                let is_state = matches!(message, ServerMessage::DocumentState { .. });

                if let Some(event) = SyncEvent::from_server(message) {
                    let _ = event_tx.send(event).await;
                }

                if is_state && !replayed {
                    replayed = true;
                    let Some(out_tx) = replay_tx.upgrade() else {
                        break;
                    };
                    let queued = queue.lock().await.drain();
                    if !queued.is_empty() {
                        log::info!("Replaying {} queued operations", queued.len());
                    }
                    for (operation, base_version) in queued {
                        let message = ClientMessage::DocumentOperation {
                            operation: OperationWire::from(&operation),
                            base_version,
                        };
                        match message.encode() {
                            Ok(text) => {
                                if out_tx.send(text).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::warn!("Dropping queued operation: {e}"),
                        }
                    }
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Submit an edit made against the newest version this client has seen.
    /// Queued for replay while disconnected.
    pub async fn send_operation(&self, operation: Operation) -> Result<(), ProtocolError> {
        let base_version = self.version.load(Ordering::Acquire);

        if *self.state.read().await != ConnectionState::Connected {
            let mut queue = self.offline_queue.lock().await;
            if !queue.enqueue(operation, base_version) {
                return Err(ProtocolError::ConnectionClosed);
            }
            return Ok(());
        }

        self.send(ClientMessage::DocumentOperation {
            operation: OperationWire::from(&operation),
            base_version,
        })
        .await
    }

    /// Move the cursor. Dropped silently while offline.
    pub async fn update_cursor(
        &self,
        position: usize,
        selection: Option<Selection>,
    ) -> Result<(), ProtocolError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(ClientMessage::CursorUpdate { position, selection })
            .await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        self.send(ClientMessage::Ping).await
    }

    /// Leave the document and close the connection.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        if self.outgoing_tx.is_some() {
            self.send(ClientMessage::LeaveDocument).await?;
        }
        // Dropping the sender ends the writer task, which closes the socket.
        self.outgoing_tx = None;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    async fn send(&self, message: ClientMessage) -> Result<(), ProtocolError> {
        let text = message.encode()?;
        match self.outgoing_tx {
            Some(ref tx) => tx
                .send(text)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Newest server version seen.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}
