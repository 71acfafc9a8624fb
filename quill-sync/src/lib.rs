//! # quill-sync: Real-time collaborative text editing server
//!
//! Hosts shared plain-text documents that many editors change at once.
//! Concurrent edits are reconciled with operational transformation
//! (`quill-ot`): the server is the single place where operations are
//! transformed, so every participant converges on the same text.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer                   │
//! │ (per user)  │     JSON frames    │  └─ ConnectionContext (each) │
//! └─────────────┘                    └──────────────┬───────────────┘
//!                                                   ▼
//!                                            ┌─────────────┐
//!                                            │  CollabHub  │
//!                                            └──────┬──────┘
//!                        ┌──────────────────────────┼─────────────────┐
//!                        ▼                          ▼                 ▼
//!                 DocumentRegistry          PresenceRegistry     RoomManager
//!                 (OT, history,             (cursors, colors)    (fan-out)
//!                  versioning)
//!                        │
//!                        ▼
//!                 KeyValueStore (RocksDB + LZ4, or in-memory)
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages
//! - [`document`]: authoritative document state, lifecycle, persistence
//! - [`presence`]: participants, cursors and colors
//! - [`broadcast`]: per-document fan-out
//! - [`hub`]: the operations the gateway calls
//! - [`server`]: WebSocket gateway
//! - [`client`]: WebSocket client with offline queue
//! - [`config`]: TOML configuration
//! - [`storage`]: key/value persistence backends

pub mod broadcast;
pub mod client;
pub mod config;
pub mod document;
pub mod hub;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod storage;

pub use broadcast::{BroadcastGroup, BroadcastStats, Envelope, RoomManager};
pub use client::{ConnectionState, OfflineQueue, SyncClient, SyncEvent};
pub use config::{Config, ConfigError, DocumentConfig, ServerConfig};
pub use document::{
    Applied, ApplyError, DocumentId, DocumentRegistry, DocumentSnapshot, Durability, Lifecycle,
    PersistedDocument,
};
pub use hub::{CollabHub, HubError, Joined};
pub use presence::{color_for_user, ConnectionId, Participant, PresenceError, PresenceRegistry};
pub use protocol::{ClientMessage, ProtocolError, Selection, ServerMessage};
pub use server::{ConnectionContext, ServerStats, SyncServer};
pub use storage::{KeyValueStore, MemoryStore, RocksStore, StoreConfig, StoreError};
