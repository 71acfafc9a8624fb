//! WebSocket synchronization gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐                              ┌── DocumentRegistry ── store
//!            ├── ConnectionContext ── Hub ──┤
//! Client B ──┘   (one per socket)           ├── PresenceRegistry
//!                                           └── RoomManager ──► other sockets
//! ```
//!
//! Each socket runs one task that multiplexes three sources with
//! `tokio::select!`: inbound frames, the document's broadcast channel, and a
//! heartbeat deadline. Any inbound frame pushes the deadline back; a socket
//! that stays silent past `heartbeat_timeout_secs` is closed and its
//! participant removed.
//!
//! A background sweeper evicts idle documents every
//! `eviction_interval_secs`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::Envelope;
use crate::config::Config;
use crate::document::{ApplyError, DocumentId, Durability};
use crate::hub::{CollabHub, HubError};
use crate::presence::ConnectionId;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::storage::{open_store, KeyValueStore, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
}

/// The sync server.
pub struct SyncServer {
    config: Config,
    hub: Arc<CollabHub>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Open the configured store and build the server.
    pub fn new(config: Config) -> Result<Self, StoreError> {
        let store = open_store(&config.storage)?;
        Ok(Self::with_store(config, store))
    }

    /// Build the server on an already opened store.
    pub fn with_store(config: Config, store: Arc<dyn KeyValueStore>) -> Self {
        let hub = Arc::new(CollabHub::new(store, &config));
        Self {
            config,
            hub,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    pub fn hub(&self) -> &Arc<CollabHub> {
        &self.hub
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.server.bind_addr
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
        }
    }

    /// Bind to the configured address and serve until an accept error.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.server.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let sweeper = self.spawn_sweeper();
        let result = self.accept_loop(listener).await;
        sweeper.abort();
        result
    }

    async fn accept_loop(&self, listener: TcpListener) -> Result<(), BoxError> {
        let heartbeat_timeout = self.config.server.heartbeat_timeout();
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let hub = self.hub.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) =
                    handle_connection(stream, addr, hub, heartbeat_timeout, &stats).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    fn spawn_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let hub = self.hub.clone();
        let interval = self.config.server.eviction_interval();
        let retention = self.config.documents.idle_retention();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let evicted = hub.evict_idle_documents(retention).await;
                if !evicted.is_empty() {
                    log::debug!("Sweeper evicted {} idle documents", evicted.len());
                }
            }
        })
    }
}

/// Drive one WebSocket until it closes, errors, or goes silent.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<CollabHub>,
    heartbeat_timeout: Duration,
    stats: &AtomicServerStats,
) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut ctx = ConnectionContext::new(hub);
    log::info!("WebSocket connection {} established from {addr}", ctx.connection_id());

    let heartbeat = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat);

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                heartbeat
                    .as_mut()
                    .reset(tokio::time::Instant::now() + heartbeat_timeout);

                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stats.total_messages.fetch_add(1, Ordering::Relaxed);
                        for reply in ctx.handle_text(text.as_str()).await {
                            send(&mut ws_sender, &reply).await?;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = ServerMessage::Error {
                            reason: "binary frames are not supported".into(),
                        };
                        send(&mut ws_sender, &reply).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            outgoing = ctx.next_broadcast() => {
                send(&mut ws_sender, &outgoing).await?;
            }

            _ = &mut heartbeat => {
                log::info!("No heartbeat from {addr} in {heartbeat_timeout:?}, closing");
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    ctx.leave().await;
    Ok(())
}

async fn send(sink: &mut WsSink, message: &ServerMessage) -> Result<(), BoxError> {
    let text = message.encode()?;
    sink.send(Message::Text(text.into())).await?;
    Ok(())
}

struct Membership {
    document_id: DocumentId,
    receiver: broadcast::Receiver<Envelope>,
    /// Newest document version this connection has been sent.
    known_version: u64,
}

/// Per-connection session state.
///
/// Holds the connection's document membership. Dropping the context leaves
/// the document, so a socket task that ends for any reason (including being
/// cancelled) never leaves a ghost participant behind.
pub struct ConnectionContext {
    hub: Arc<CollabHub>,
    connection_id: ConnectionId,
    membership: Option<Membership>,
}

impl ConnectionContext {
    pub fn new(hub: Arc<CollabHub>) -> Self {
        Self {
            hub,
            connection_id: Uuid::new_v4(),
            membership: None,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn document_id(&self) -> Option<&str> {
        self.membership.as_ref().map(|m| m.document_id.as_str())
    }

    /// Handle one text frame and return the replies for this connection,
    /// in send order.
    pub async fn handle_text(&mut self, text: &str) -> Vec<ServerMessage> {
        match ClientMessage::decode(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                log::debug!("Malformed frame on {}: {e}", self.connection_id);
                vec![ServerMessage::Error {
                    reason: e.to_string(),
                }]
            }
        }
    }

    pub async fn handle_message(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        match message {
            ClientMessage::JoinDocument {
                document_id,
                user_id,
            } => self.join(document_id, user_id).await,

            ClientMessage::DocumentOperation {
                operation,
                base_version,
            } => {
                let Some(document_id) = self.document_id().map(str::to_string) else {
                    return vec![not_joined()];
                };
                let result = self
                    .hub
                    .apply_operation(&document_id, self.connection_id, operation, base_version)
                    .await;
                self.operation_replies(&document_id, result).await
            }

            ClientMessage::CursorUpdate {
                position,
                selection,
            } => {
                let Some(document_id) = self.document_id().map(str::to_string) else {
                    return vec![not_joined()];
                };
                match self
                    .hub
                    .update_cursor(&document_id, self.connection_id, position, selection)
                    .await
                {
                    Ok(()) => Vec::new(),
                    Err(e) => vec![ServerMessage::Error {
                        reason: e.to_string(),
                    }],
                }
            }

            ClientMessage::LeaveDocument => {
                self.leave().await;
                Vec::new()
            }

            ClientMessage::Ping => vec![ServerMessage::Pong],
        }
    }

    async fn join(&mut self, document_id: String, user_id: String) -> Vec<ServerMessage> {
        if self.membership.is_some() {
            self.leave().await;
        }

        match self.hub.join(&document_id, &user_id, self.connection_id).await {
            Ok(joined) => {
                log::info!(
                    "Connection {} joined {document_id} as {user_id} at version {}",
                    self.connection_id,
                    joined.version
                );
                self.membership = Some(Membership {
                    document_id: document_id.clone(),
                    receiver: joined.receiver,
                    known_version: joined.version,
                });
                let mut replies = vec![joined.state];
                if self.hub.durability() == Durability::Degraded {
                    replies.push(ServerMessage::DurabilityDegraded { document_id });
                }
                replies
            }
            Err(e) => {
                log::info!("Join of {document_id} by {user_id} refused: {e}");
                vec![ServerMessage::Error {
                    reason: e.to_string(),
                }]
            }
        }
    }

    async fn operation_replies(
        &mut self,
        document_id: &str,
        result: Result<crate::document::Applied, HubError>,
    ) -> Vec<ServerMessage> {
        match result {
            Ok(applied) => {
                // Everything broadcast before this operation goes out first.
                let mut replies = self.drain_pending();
                if let Some(membership) = self.membership.as_mut() {
                    membership.known_version = membership.known_version.max(applied.version);
                }
                replies.push(ServerMessage::OperationAck {
                    operation_id: applied.operation.id().to_string(),
                    version: applied.version,
                });
                replies
            }
            Err(HubError::Apply {
                operation_id,
                source: source @ ApplyError::StaleBaseVersion { .. },
            }) => {
                log::info!(
                    "Resynchronizing {} after stale operation {operation_id}: {source}",
                    self.connection_id
                );
                let mut replies = vec![ServerMessage::Resynchronized {
                    operation_id,
                    reason: source.to_string(),
                }];
                replies.push(self.fresh_state(document_id).await);
                replies
            }
            Err(HubError::InvalidOperation {
                operation_id,
                source,
            }) => vec![ServerMessage::OperationError {
                operation_id,
                reason: source.to_string(),
            }],
            Err(HubError::Apply {
                operation_id,
                source,
            }) => vec![ServerMessage::OperationError {
                operation_id,
                reason: source.to_string(),
            }],
            Err(HubError::AuthorMismatch {
                operation_id,
                author_id,
                user_id,
            }) => vec![ServerMessage::OperationError {
                operation_id,
                reason: format!("authorId {author_id} does not match joined user {user_id}"),
            }],
            Err(e) => vec![ServerMessage::Error {
                reason: e.to_string(),
            }],
        }
    }

    /// Snapshot the document and mark everything up to it as delivered.
    async fn fresh_state(&mut self, document_id: &str) -> ServerMessage {
        match self.hub.snapshot(document_id).await {
            Ok(state) => {
                if let (ServerMessage::DocumentState { version, .. }, Some(membership)) =
                    (&state, self.membership.as_mut())
                {
                    membership.known_version = *version;
                }
                state
            }
            Err(e) => ServerMessage::Error {
                reason: e.to_string(),
            },
        }
    }

    /// Whether a broadcast should be forwarded, advancing `known_version`
    /// for document operations.
    fn accept(&mut self, envelope: &Envelope) -> bool {
        if !envelope.is_for(self.connection_id) {
            return false;
        }
        let Some(membership) = self.membership.as_mut() else {
            return false;
        };
        if let ServerMessage::DocumentOperation { version, .. } = &*envelope.message {
            if *version <= membership.known_version {
                return false;
            }
            membership.known_version = *version;
        }
        true
    }

    /// Broadcasts already queued for this connection.
    fn drain_pending(&mut self) -> Vec<ServerMessage> {
        let mut pending = Vec::new();
        loop {
            let Some(membership) = self.membership.as_mut() else {
                break;
            };
            match membership.receiver.try_recv() {
                Ok(envelope) => {
                    if self.accept(&envelope) {
                        pending.push((*envelope.message).clone());
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    log::warn!("Connection {} lagged by {n} messages", self.connection_id);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        pending
    }

    /// Wait for the next broadcast addressed to this connection. Pending
    /// forever while the connection is not in a document.
    ///
    /// A receiver that fell behind gets a fresh `document-state` instead of
    /// the messages it missed.
    pub async fn next_broadcast(&mut self) -> ServerMessage {
        loop {
            let Some(membership) = self.membership.as_mut() else {
                return std::future::pending().await;
            };
            match membership.receiver.recv().await {
                Ok(envelope) => {
                    if self.accept(&envelope) {
                        return (*envelope.message).clone();
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    log::warn!(
                        "Connection {} lagged by {n} messages, resending state",
                        self.connection_id
                    );
                    let document_id = membership.document_id.clone();
                    return self.fresh_state(&document_id).await;
                }
                Err(RecvError::Closed) => return std::future::pending().await,
            }
        }
    }

    /// Leave the current document, if any.
    pub async fn leave(&mut self) {
        if let Some(membership) = self.membership.take() {
            self.hub
                .leave(&membership.document_id, self.connection_id)
                .await;
        }
    }
}

impl Drop for ConnectionContext {
    fn drop(&mut self) {
        let Some(membership) = self.membership.take() else {
            return;
        };
        let hub = self.hub.clone();
        let connection_id = self.connection_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    hub.leave(&membership.document_id, connection_id).await;
                });
            }
            Err(_) => log::warn!(
                "Connection {connection_id} dropped outside a runtime, participant not removed"
            ),
        }
    }
}

fn not_joined() -> ServerMessage {
    ServerMessage::Error {
        reason: "join a document first".into(),
    }
}
