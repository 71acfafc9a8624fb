//! Who is in which document, and where their cursor is.
//!
//! Presence is independent of document content: updates here never take a
//! document lock. Participants are keyed by connection, so one user with two
//! tabs open shows up twice.
//!
//! The set of user ids per document is mirrored to the store under
//! `document:{id}:participants`. The mirror is best-effort and nothing reads
//! it back for correctness.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::document::DocumentId;
use crate::protocol::Selection;
use crate::storage::{participants_key, KeyValueStore};

pub type ConnectionId = Uuid;

/// Cursor colors handed out to participants.
pub const PALETTE: [&str; 7] = [
    "#FF6B6B", "#4ECDC4", "#45B7D1", "#96CEB4", "#FFEAA7", "#DDA0DD", "#98D8C8",
];

/// Stable palette color for a user id.
///
/// Hashes UTF-16 code units, so browser clients computing the same hash over
/// a JavaScript string pick the same color.
pub fn color_for_user(user_id: &str) -> &'static str {
    let hash = user_id.encode_utf16().fold(0i32, |h, unit| {
        h.wrapping_shl(5).wrapping_sub(h).wrapping_add(i32::from(unit))
    });
    PALETTE[(hash.unsigned_abs() % PALETTE.len() as u32) as usize]
}

/// A connection attached to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub cursor_position: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<Selection>,
    pub color: String,
    /// Unix time in milliseconds.
    pub joined_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("document-full: {document_id} already has {limit} participants")]
    DocumentFull { document_id: DocumentId, limit: usize },
}

/// Concurrent map of `documentId -> {connectionId -> Participant}`.
pub struct PresenceRegistry {
    documents: DashMap<DocumentId, HashMap<ConnectionId, Participant>>,
    store: Arc<dyn KeyValueStore>,
    max_participants: usize,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>, max_participants: usize) -> Self {
        Self {
            documents: DashMap::new(),
            store,
            max_participants,
        }
    }

    /// Add a connection to a document. Rejoining with the same connection
    /// replaces the earlier entry.
    pub fn join(
        &self,
        document_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> Result<Participant, PresenceError> {
        let participant = Participant {
            user_id: user_id.to_string(),
            connection_id,
            cursor_position: 0,
            selection: None,
            color: color_for_user(user_id).to_string(),
            joined_at: unix_millis(),
        };

        let user_ids = {
            let mut entry = self.documents.entry(document_id.to_string()).or_default();
            if entry.len() >= self.max_participants && !entry.contains_key(&connection_id) {
                return Err(PresenceError::DocumentFull {
                    document_id: document_id.to_string(),
                    limit: self.max_participants,
                });
            }
            entry.insert(connection_id, participant.clone());
            user_ids(&entry)
        };

        self.mirror(document_id, &user_ids);
        log::info!(
            "{user_id} joined {document_id} ({} connected)",
            user_ids.len()
        );
        Ok(participant)
    }

    /// Move a participant's cursor. Returns the updated participant, or
    /// `None` if the connection is not in the document.
    pub fn update_cursor(
        &self,
        document_id: &str,
        connection_id: ConnectionId,
        position: usize,
        selection: Option<Selection>,
    ) -> Option<Participant> {
        let mut entry = self.documents.get_mut(document_id)?;
        let participant = entry.get_mut(&connection_id)?;
        participant.cursor_position = position;
        participant.selection = selection;
        log::trace!("{} cursor at {position} in {document_id}", participant.user_id);
        Some(participant.clone())
    }

    /// Remove a connection. Returns the departed participant and how many
    /// connections remain.
    pub fn leave(
        &self,
        document_id: &str,
        connection_id: ConnectionId,
    ) -> Option<(Participant, usize)> {
        let (participant, user_ids, remaining) = {
            let mut entry = self.documents.get_mut(document_id)?;
            let participant = entry.remove(&connection_id)?;
            (participant, user_ids(&entry), entry.len())
        };

        if remaining == 0 {
            self.documents.remove_if(document_id, |_, m| m.is_empty());
        }
        self.mirror(document_id, &user_ids);
        log::info!(
            "{} left {document_id} ({remaining} connected)",
            participant.user_id
        );
        Some((participant, remaining))
    }

    /// Participants of a document, oldest first.
    pub fn participants(&self, document_id: &str) -> Vec<Participant> {
        let mut list: Vec<Participant> = self
            .documents
            .get(document_id)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default();
        list.sort_by(|a, b| {
            a.joined_at
                .cmp(&b.joined_at)
                .then_with(|| a.user_id.cmp(&b.user_id))
        });
        list
    }

    pub fn participant(
        &self,
        document_id: &str,
        connection_id: ConnectionId,
    ) -> Option<Participant> {
        self.documents
            .get(document_id)
            .and_then(|entry| entry.get(&connection_id).cloned())
    }

    pub fn count(&self, document_id: &str) -> usize {
        self.documents.get(document_id).map_or(0, |entry| entry.len())
    }

    pub fn contains(&self, document_id: &str, connection_id: ConnectionId) -> bool {
        self.documents
            .get(document_id)
            .is_some_and(|entry| entry.contains_key(&connection_id))
    }

    fn mirror(&self, document_id: &str, user_ids: &BTreeSet<String>) {
        let key = participants_key(document_id);
        let result = if user_ids.is_empty() {
            self.store.delete(&key)
        } else {
            bincode::serde::encode_to_vec(user_ids, bincode::config::standard())
                .map_err(|e| crate::storage::StoreError::Serialization(e.to_string()))
                .and_then(|bytes| self.store.set(&key, &bytes))
        };
        if let Err(e) = result {
            log::debug!("Could not mirror participants of {document_id}: {e}");
        }
    }
}

fn user_ids(participants: &HashMap<ConnectionId, Participant>) -> BTreeSet<String> {
    participants.values().map(|p| p.user_id.clone()).collect()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn registry(limit: usize) -> (Arc<MemoryStore>, PresenceRegistry) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), PresenceRegistry::new(store, limit))
    }

    #[test]
    fn test_color_hashes_utf16_units() {
        // U+1F600 is the surrogate pair D83D DE00.
        assert_eq!(color_for_user("\u{1F600}"), PALETTE[2]);
        assert_eq!(color_for_user("\u{e9}\u{1F600}x"), PALETTE[5]);
    }

    #[test]
    fn test_color_is_stable_and_from_palette() {
        assert_eq!(color_for_user("alice"), "#98D8C8");
        assert_eq!(color_for_user("bob"), "#FFEAA7");
        assert_eq!(color_for_user("carol"), "#45B7D1");
        assert_eq!(color_for_user(""), "#FF6B6B");
        assert_eq!(color_for_user("alice"), color_for_user("alice"));
        for user in ["x", "a very long user identifier", "ünïcødé"] {
            assert!(PALETTE.contains(&color_for_user(user)));
        }
    }

    #[test]
    fn test_join_and_list() {
        let (_, presence) = registry(10);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        presence.join("doc", "alice", a).unwrap();
        presence.join("doc", "bob", b).unwrap();
        assert_eq!(presence.count("doc"), 2);
        assert!(presence.contains("doc", a));
        let names: Vec<String> = presence
            .participants("doc")
            .into_iter()
            .map(|p| p.user_id)
            .collect();
        assert!(names.contains(&"alice".to_string()));
        assert!(names.contains(&"bob".to_string()));
    }

    #[test]
    fn test_document_full() {
        let (_, presence) = registry(1);
        let first = Uuid::new_v4();
        presence.join("doc", "alice", first).unwrap();
        let err = presence.join("doc", "bob", Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, PresenceError::DocumentFull { limit: 1, .. }));
        assert!(err.to_string().starts_with("document-full"));
        // Rejoining on the same connection is not a new seat.
        assert!(presence.join("doc", "alice", first).is_ok());
        // Other documents are unaffected.
        assert!(presence.join("other", "bob", Uuid::new_v4()).is_ok());
    }

    #[test]
    fn test_cursor_update() {
        let (_, presence) = registry(10);
        let conn = Uuid::new_v4();
        presence.join("doc", "alice", conn).unwrap();
        let updated = presence
            .update_cursor("doc", conn, 7, Some(Selection { start: 3, end: 7 }))
            .unwrap();
        assert_eq!(updated.cursor_position, 7);
        assert_eq!(updated.selection, Some(Selection { start: 3, end: 7 }));
        assert!(presence.update_cursor("doc", Uuid::new_v4(), 1, None).is_none());
        assert!(presence.update_cursor("missing", conn, 1, None).is_none());
    }

    #[test]
    fn test_leave_reports_remaining() {
        let (_, presence) = registry(10);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        presence.join("doc", "alice", a).unwrap();
        presence.join("doc", "bob", b).unwrap();

        let (gone, remaining) = presence.leave("doc", a).unwrap();
        assert_eq!(gone.user_id, "alice");
        assert_eq!(remaining, 1);

        let (_, remaining) = presence.leave("doc", b).unwrap();
        assert_eq!(remaining, 0);
        assert_eq!(presence.count("doc"), 0);
        assert!(presence.leave("doc", b).is_none());
    }

    #[test]
    fn test_participants_mirrored_to_store() {
        let (store, presence) = registry(10);
        let conn = Uuid::new_v4();
        presence.join("doc", "alice", conn).unwrap();

        let bytes = store.get(&participants_key("doc")).unwrap().unwrap();
        let (ids, _): (BTreeSet<String>, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["alice".to_string()]);

        presence.leave("doc", conn);
        assert!(store.get(&participants_key("doc")).unwrap().is_none());
    }

    #[test]
    fn test_participant_wire_shape() {
        let p = Participant {
            user_id: "alice".into(),
            connection_id: Uuid::nil(),
            cursor_position: 4,
            selection: None,
            color: "#98D8C8".into(),
            joined_at: 1,
        };
        let value = serde_json::to_value(&p).unwrap();
        assert_eq!(value["userId"], "alice");
        assert_eq!(value["cursorPosition"], 4);
        assert!(value.get("selection").is_none());
    }
}
