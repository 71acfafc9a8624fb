//! Persistence adapter: a plain key/value interface over durable storage.
//!
//! The sync core only ever needs `get` / `set` / `delete`. Keys follow a
//! fixed logical layout:
//!
//! ```text
//! document:{id}               → bincode {content, version, history_start, history}
//! document:{id}:participants  → bincode set of active user ids
//! ```
//!
//! Two backends ship with the crate:
//!
//! - [`RocksStore`]: RocksDB with LZ4-compressed values, for deployments
//! - [`MemoryStore`]: a concurrent in-process map, for tests and ephemeral servers

pub mod memory;
pub mod rocks;

use std::sync::Arc;

use thiserror::Error;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable key/value store used to survive restarts.
///
/// Implementations must be safe to share between tasks; calls are short
/// and synchronous.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Force buffered writes to disk.
    fn flush(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Key holding a document's persisted record.
pub fn document_key(document_id: &str) -> String {
    format!("document:{document_id}")
}

/// Key holding the set of users attached to a document.
pub fn participants_key(document_id: &str) -> String {
    format!("document:{document_id}:participants")
}

/// Open the backend selected by `config`: RocksDB when a path is set,
/// otherwise an in-memory map.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn KeyValueStore>, StoreError> {
    match config.path {
        Some(_) => Ok(Arc::new(RocksStore::open(config.clone())?)),
        None => {
            log::info!("No storage path configured, documents are kept in memory only");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
