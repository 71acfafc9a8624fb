//! Authoritative document state and the registry that owns it.
//!
//! ```text
//!               acquire                release (last holder)
//!   absent ───────────────► active ───────────────────────► idle
//!     ▲                       ▲                               │
//!     │                       └──────── acquire ──────────────┤
//!     │                                                       │ evict_idle
//!     └─────────────── load from store on next access ◄── evicted
//! ```
//!
//! Each document lives behind its own `tokio::sync::Mutex`; the map of
//! documents sits behind an `RwLock` that is only write-locked to insert
//! or evict entries. A caller keeps the map's read guard while it holds a
//! document's mutex, so eviction can never pull a document out from under
//! an in-flight mutation.
//!
//! After every accepted operation the full record is written to the store
//! under `document:{id}`. A failed write does not fail the operation: the
//! registry flips to [`Durability::Degraded`] and keeps serving from memory
//! until a later write succeeds.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use quill_ot::{apply, transform_against, Operation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::config::DocumentConfig;
use crate::storage::{document_key, KeyValueStore, StoreError};

pub type DocumentId = String;

/// Reasons an operation could not be applied.
#[derive(Debug, Clone, Error)]
pub enum ApplyError {
    #[error("base version {base} cannot be transformed (retained range {oldest}..={current})")]
    StaleBaseVersion { base: u64, oldest: u64, current: u64 },
    #[error("document could not be loaded: {0}")]
    Load(#[from] StoreError),
}

/// Whether accepted edits are reaching durable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    Durable,
    Degraded,
}

/// Where a document sits in its in-memory lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Not in memory (never loaded, or evicted).
    Unloaded,
    Active,
    Idle,
}

/// Point-in-time view of a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    pub document_id: DocumentId,
    pub content: String,
    pub version: u64,
}

/// Result of an accepted operation.
#[derive(Debug, Clone)]
pub struct Applied {
    /// The operation as it was actually applied (transformed, clamped).
    pub operation: Operation,
    pub version: u64,
    pub content: String,
    pub durability: Durability,
    /// `durability` differs from what it was before this operation.
    pub durability_changed: bool,
}

/// Record stored under `document:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDocument {
    pub content: String,
    pub version: u64,
    pub history_start: u64,
    pub operation_history: VecDeque<Operation>,
}

#[derive(Serialize)]
struct PersistedDocumentRef<'a> {
    content: &'a str,
    version: u64,
    history_start: u64,
    operation_history: &'a VecDeque<Operation>,
}

impl PersistedDocument {
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _): (Self, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        if record.version != record.history_start + record.operation_history.len() as u64 {
            return Err(StoreError::Deserialization(format!(
                "version {} does not match history ({} + {})",
                record.version,
                record.history_start,
                record.operation_history.len()
            )));
        }
        Ok(record)
    }
}

/// One document's content, version and retained history.
///
/// `version == history_start + history.len()` always holds. While nothing
/// has been trimmed (`history_start == 0`), replaying `history` onto the
/// empty string reproduces `content`.
#[derive(Debug)]
pub struct DocumentState {
    id: DocumentId,
    content: String,
    version: u64,
    history: VecDeque<Operation>,
    history_start: u64,
    holders: usize,
    idle_since: Option<Instant>,
    /// Last write to the store failed.
    dirty: bool,
}

impl DocumentState {
    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            content: String::new(),
            version: 0,
            history: VecDeque::new(),
            history_start: 0,
            holders: 0,
            idle_since: Some(Instant::now()),
            dirty: false,
        }
    }

    fn from_record(id: &str, record: PersistedDocument) -> Self {
        Self {
            content: record.content,
            version: record.version,
            history: record.operation_history,
            history_start: record.history_start,
            ..Self::empty(id)
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn history(&self) -> &VecDeque<Operation> {
        &self.history
    }

    /// Version preceding the oldest retained history entry.
    pub fn history_start(&self) -> u64 {
        self.history_start
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.holders > 0 {
            Lifecycle::Active
        } else {
            Lifecycle::Idle
        }
    }

    fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            document_id: self.id.clone(),
            content: self.content.clone(),
            version: self.version,
        }
    }

    /// Transform `op` against everything accepted after `base_version` by
    /// other authors, apply it, and record it.
    fn apply_operation(
        &mut self,
        op: &Operation,
        base_version: u64,
        config: &DocumentConfig,
    ) -> Result<Operation, ApplyError> {
        let stale = base_version < self.history_start
            || base_version > self.version
            || self.version - base_version > config.max_transform_window as u64;
        if stale {
            return Err(ApplyError::StaleBaseVersion {
                base: base_version,
                oldest: self.history_start,
                current: self.version,
            });
        }

        let skip = (base_version - self.history_start) as usize;
        let concurrent = self
            .history
            .iter()
            .skip(skip)
            .filter(|seen| seen.author_id() != op.author_id());
        let transformed = transform_against(op, concurrent);

        let effective = apply(&mut self.content, &transformed);
        self.history.push_back(effective.clone());
        self.version += 1;

        while self.history.len() > config.max_history {
            self.history.pop_front();
            self.history_start += 1;
        }

        Ok(effective)
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let record = PersistedDocumentRef {
            content: &self.content,
            version: self.version,
            history_start: self.history_start,
            operation_history: &self.history,
        };
        bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

type DocumentHandle = Arc<Mutex<DocumentState>>;

/// All documents currently held in memory.
pub struct DocumentRegistry {
    documents: RwLock<HashMap<DocumentId, DocumentHandle>>,
    store: Arc<dyn KeyValueStore>,
    config: DocumentConfig,
    degraded: AtomicBool,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, config: DocumentConfig) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            store,
            config,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.config
    }

    pub fn durability(&self) -> Durability {
        if self.degraded.load(Ordering::Acquire) {
            Durability::Degraded
        } else {
            Durability::Durable
        }
    }

    /// Run `f` with exclusive access to the document, loading it from the
    /// store (or creating it empty) if it is not in memory.
    async fn with_document<R>(
        &self,
        document_id: &str,
        f: impl FnOnce(&mut DocumentState) -> R,
    ) -> Result<R, StoreError> {
        loop {
            {
                let documents = self.documents.read().await;
                if let Some(handle) = documents.get(document_id) {
                    let mut state = handle.lock().await;
                    return Ok(f(&mut state));
                }
            }

            let mut documents = self.documents.write().await;
            if !documents.contains_key(document_id) {
                let state = self.load_or_create(document_id)?;
                documents.insert(document_id.to_string(), Arc::new(Mutex::new(state)));
            }
        }
    }

    fn load_or_create(&self, document_id: &str) -> Result<DocumentState, StoreError> {
        match self.store.get(&document_key(document_id))? {
            Some(bytes) => {
                let record = PersistedDocument::decode(&bytes)?;
                log::info!(
                    "Loaded document {document_id} at version {} from storage",
                    record.version
                );
                Ok(DocumentState::from_record(document_id, record))
            }
            None => {
                log::info!("Created document {document_id}");
                Ok(DocumentState::empty(document_id))
            }
        }
    }

    /// Write the document and update the durability flag. Returns whether
    /// the flag changed.
    fn persist(&self, state: &mut DocumentState) -> bool {
        let result = state
            .encode()
            .and_then(|bytes| self.store.set(&document_key(&state.id), &bytes));

        match result {
            Ok(()) => {
                state.dirty = false;
                let was_degraded = self.degraded.swap(false, Ordering::AcqRel);
                if was_degraded {
                    log::info!("Storage writes recovered (document {})", state.id);
                }
                was_degraded
            }
            Err(e) => {
                state.dirty = true;
                let was_degraded = self.degraded.swap(true, Ordering::AcqRel);
                log::warn!(
                    "Failed to persist document {} at version {}: {e}",
                    state.id,
                    state.version
                );
                !was_degraded
            }
        }
    }

    /// Register a holder (a joined participant) and return the current state.
    pub async fn acquire(&self, document_id: &str) -> Result<DocumentSnapshot, StoreError> {
        self.with_document(document_id, |state| {
            state.holders += 1;
            state.idle_since = None;
            state.snapshot()
        })
        .await
    }

    /// Drop a holder. The last release moves the document to idle and, with
    /// a zero retention window, evicts it straight away.
    pub async fn release(&self, document_id: &str) {
        let now_idle = {
            let documents = self.documents.read().await;
            let Some(handle) = documents.get(document_id) else {
                return;
            };
            let mut state = handle.lock().await;
            state.holders = state.holders.saturating_sub(1);
            if state.holders == 0 {
                state.idle_since = Some(Instant::now());
                if state.dirty {
                    self.persist(&mut state);
                }
                log::debug!("Document {document_id} is idle at version {}", state.version);
                true
            } else {
                false
            }
        };

        if now_idle && self.config.idle_retention().is_zero() {
            self.evict_idle(Duration::ZERO).await;
        }
    }

    /// Apply a client operation generated against `base_version`.
    ///
    /// A document that is not in memory is loaded (or created empty) first.
    pub async fn apply_client_operation(
        &self,
        document_id: &str,
        op: &Operation,
        base_version: u64,
    ) -> Result<Applied, ApplyError> {
        self.apply_and_notify(document_id, op, base_version, |_| {}).await
    }

    /// Like [`apply_client_operation`](Self::apply_client_operation), but
    /// runs `notify` while the document is still locked, so notifications
    /// for one document go out in version order.
    pub async fn apply_and_notify(
        &self,
        document_id: &str,
        op: &Operation,
        base_version: u64,
        notify: impl FnOnce(&Applied),
    ) -> Result<Applied, ApplyError> {
        self.with_document(document_id, |state| {
            let operation = state.apply_operation(op, base_version, &self.config)?;
            let durability_changed = self.persist(state);
            log::debug!(
                "Applied {} {} from {} to {} (base {}, now {})",
                operation.type_name(),
                operation.id(),
                operation.author_id(),
                document_id,
                base_version,
                state.version
            );
            let applied = Applied {
                operation,
                version: state.version,
                content: state.content.clone(),
                durability: self.durability(),
                durability_changed,
            };
            notify(&applied);
            Ok(applied)
        })
        .await?
    }

    /// Current content and version, loading the document if needed.
    pub async fn snapshot(&self, document_id: &str) -> Result<DocumentSnapshot, StoreError> {
        self.with_document(document_id, |state| state.snapshot()).await
    }

    /// Lifecycle of a document without loading it.
    pub async fn lifecycle(&self, document_id: &str) -> Lifecycle {
        let documents = self.documents.read().await;
        match documents.get(document_id) {
            Some(handle) => handle.lock().await.lifecycle(),
            None => Lifecycle::Unloaded,
        }
    }

    /// Number of documents held in memory.
    pub async fn loaded_count(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Drop documents that have been idle for at least `retention`.
    ///
    /// Documents whose last write failed are written again first and kept
    /// in memory if that still fails. Documents busy with an operation are
    /// skipped until the next sweep.
    pub async fn evict_idle(&self, retention: Duration) -> Vec<DocumentId> {
        let mut documents = self.documents.write().await;
        let mut evicted = Vec::new();

        documents.retain(|id, handle| {
            let Ok(mut state) = handle.try_lock() else {
                return true;
            };
            let expired = state.holders == 0
                && state
                    .idle_since
                    .is_some_and(|since| since.elapsed() >= retention);
            if !expired {
                return true;
            }
            if state.dirty {
                self.persist(&mut state);
                if state.dirty {
                    return true;
                }
            }
            evicted.push(id.clone());
            false
        });

        for id in &evicted {
            log::info!("Evicted idle document {id}");
        }
        evicted
    }

    /// Retry every pending write and flush the store. Called on shutdown.
    pub async fn flush_all(&self) -> Result<(), StoreError> {
        let mut unsaved = Vec::new();
        {
            let documents = self.documents.read().await;
            for (id, handle) in documents.iter() {
                let mut state = handle.lock().await;
                if state.dirty {
                    self.persist(&mut state);
                }
                if state.dirty {
                    unsaved.push(id.clone());
                }
            }
        }
        self.store.flush()?;
        if unsaved.is_empty() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "unsaved documents: {}",
                unsaved.join(", ")
            )))
        }
    }
}
