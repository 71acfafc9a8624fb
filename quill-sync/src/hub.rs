//! Collaboration hub: documents, presence and fan-out behind one API.
//!
//! ```text
//!            join / leave / cursor            apply_operation
//!                    │                              │
//!                    ▼                              ▼
//!           PresenceRegistry              DocumentRegistry
//!           (DashMap, no locks            (per-document mutex,
//!            on document state)            persists every op)
//!                    │                              │
//!                    └──────────► RoomManager ◄─────┘
//!                              (broadcast per document)
//! ```
//!
//! The gateway owns one hub per process and calls into it from each
//! connection task.

use std::sync::Arc;
use std::time::Duration;

use quill_ot::{Operation, OperationError, OperationWire};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::broadcast::{Envelope, RoomManager};
use crate::config::Config;
use crate::document::{Applied, ApplyError, DocumentId, DocumentRegistry, Durability};
use crate::presence::{ConnectionId, Participant, PresenceError, PresenceRegistry};
use crate::protocol::{Selection, ServerMessage};
use crate::storage::{KeyValueStore, StoreError};

#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Presence(#[from] PresenceError),
    #[error("invalid operation {operation_id}: {source}")]
    InvalidOperation {
        operation_id: String,
        #[source]
        source: OperationError,
    },
    #[error("operation {operation_id} rejected: {source}")]
    Apply {
        operation_id: String,
        #[source]
        source: ApplyError,
    },
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("connection is not in document {0}")]
    NotJoined(DocumentId),
    #[error("operation {operation_id} is authored by {author_id}, but the connection joined as {user_id}")]
    AuthorMismatch {
        operation_id: String,
        author_id: String,
        user_id: String,
    },
    #[error("internal error: {0}")]
    Internal(String),
}

/// What a connection gets back from a successful join.
pub struct Joined {
    pub participant: Participant,
    /// Full `document-state` to send first.
    pub state: ServerMessage,
    /// Version contained in `state`.
    pub version: u64,
    /// Subscribed before the snapshot was taken, so may replay operations at
    /// or below `version`.
    pub receiver: broadcast::Receiver<Envelope>,
}

pub struct CollabHub {
    documents: DocumentRegistry,
    presence: PresenceRegistry,
    rooms: RoomManager,
}

impl CollabHub {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &Config) -> Self {
        Self {
            documents: DocumentRegistry::new(store.clone(), config.documents.clone()),
            presence: PresenceRegistry::new(
                store,
                config.documents.max_participants_per_document,
            ),
            rooms: RoomManager::new(config.server.broadcast_capacity),
        }
    }

    pub fn documents(&self) -> &DocumentRegistry {
        &self.documents
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn durability(&self) -> Durability {
        self.documents.durability()
    }

    /// Attach a connection to a document, loading or creating it.
    pub async fn join(
        &self,
        document_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> Result<Joined, HubError> {
        let participant = self.presence.join(document_id, user_id, connection_id)?;

        let (room, receiver) = self.rooms.subscribe(document_id).await;

        let snapshot = match self.documents.acquire(document_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.presence.leave(document_id, connection_id);
                log::error!("Could not open document {document_id} for {user_id}: {e}");
                return Err(e.into());
            }
        };

        room.broadcast(
            Some(connection_id),
            ServerMessage::UserJoined {
                user_id: participant.user_id.clone(),
                color: participant.color.clone(),
            },
        );

        Ok(Joined {
            participant,
            version: snapshot.version,
            state: ServerMessage::DocumentState {
                document_id: snapshot.document_id,
                content: snapshot.content,
                version: snapshot.version,
                participants: self.presence.participants(document_id),
            },
            receiver,
        })
    }

    /// Validate, transform, apply and rebroadcast an operation.
    ///
    /// The work runs on its own task: once submitted, the edit completes and
    /// is persisted even if the caller goes away.
    pub async fn apply_operation(
        self: &Arc<Self>,
        document_id: &str,
        connection_id: ConnectionId,
        wire: OperationWire,
        base_version: u64,
    ) -> Result<Applied, HubError> {
        let operation_id = wire.id.clone();
        let Some(participant) = self.presence.participant(document_id, connection_id) else {
            return Err(HubError::NotJoined(document_id.to_string()));
        };
        if wire.author_id != participant.user_id {
            return Err(HubError::AuthorMismatch {
                operation_id,
                author_id: wire.author_id,
                user_id: participant.user_id,
            });
        }
        let op = Operation::try_from(wire).map_err(|source| HubError::InvalidOperation {
            operation_id: operation_id.clone(),
            source,
        })?;

        let hub = Arc::clone(self);
        let document_id = document_id.to_string();
        let task = tokio::spawn(async move {
            // Holding a receiver keeps the room from being dropped while
            // the edit is in flight.
            let (room, _pinned) = hub.rooms.subscribe(&document_id).await;
            hub.documents
                .apply_and_notify(&document_id, &op, base_version, |applied| {
                    room.broadcast(
                        Some(connection_id),
                        ServerMessage::DocumentOperation {
                            operation: OperationWire::from(&applied.operation),
                            version: applied.version,
                            content: applied.content.clone(),
                        },
                    );
                    if applied.durability_changed && applied.durability == Durability::Degraded {
                        room.broadcast(
                            None,
                            ServerMessage::DurabilityDegraded {
                                document_id: document_id.clone(),
                            },
                        );
                    }
                })
                .await
        });

        match task.await {
            Ok(result) => result.map_err(|source| HubError::Apply {
                operation_id,
                source,
            }),
            Err(e) => Err(HubError::Internal(e.to_string())),
        }
    }

    /// Record a cursor move and tell the other participants.
    pub async fn update_cursor(
        &self,
        document_id: &str,
        connection_id: ConnectionId,
        position: usize,
        selection: Option<Selection>,
    ) -> Result<(), HubError> {
        let participant = self
            .presence
            .update_cursor(document_id, connection_id, position, selection)
            .ok_or_else(|| HubError::NotJoined(document_id.to_string()))?;

        if let Some(room) = self.rooms.get(document_id).await {
            room.broadcast(
                Some(connection_id),
                ServerMessage::CursorUpdate {
                    user_id: participant.user_id,
                    position,
                    selection,
                },
            );
        }
        Ok(())
    }

    /// Detach a connection. Releasing the document happens on a separate
    /// task so it completes regardless of the caller.
    pub async fn leave(self: &Arc<Self>, document_id: &str, connection_id: ConnectionId) {
        let Some((participant, remaining)) = self.presence.leave(document_id, connection_id)
        else {
            return;
        };

        if let Some(room) = self.rooms.get(document_id).await {
            room.broadcast(
                Some(connection_id),
                ServerMessage::UserLeft {
                    user_id: participant.user_id,
                },
            );
        }

        let hub = Arc::clone(self);
        let document_id = document_id.to_string();
        tokio::spawn(async move {
            hub.documents.release(&document_id).await;
            if remaining == 0 {
                hub.rooms.remove_if_empty(&document_id).await;
            }
        });
    }

    /// Fresh `document-state` for a document.
    pub async fn snapshot(&self, document_id: &str) -> Result<ServerMessage, HubError> {
        let snapshot = self.documents.snapshot(document_id).await?;
        Ok(ServerMessage::DocumentState {
            document_id: snapshot.document_id,
            content: snapshot.content,
            version: snapshot.version,
            participants: self.presence.participants(document_id),
        })
    }

    /// Evict documents idle for at least `retention` and drop their rooms.
    pub async fn evict_idle_documents(&self, retention: Duration) -> Vec<DocumentId> {
        let evicted = self.documents.evict_idle(retention).await;
        for document_id in &evicted {
            self.rooms.remove_if_empty(document_id).await;
        }
        evicted
    }
}
