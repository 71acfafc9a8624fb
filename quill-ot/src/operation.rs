//! Operation model: the atomic unit of change over a linear text buffer.
//!
//! An [`Operation`] is immutable once built. Transformation never edits an
//! operation in place; it derives a new value with adjusted coordinates.
//!
//! Two representations exist:
//!
//! ```text
//! ┌────────────────┐   TryFrom (validates)   ┌──────────────┐
//! │ OperationWire  │ ──────────────────────► │  Operation   │
//! │ (JSON, loose)  │ ◄────────────────────── │ (tagged kind)│
//! └────────────────┘          From           └──────────────┘
//! ```
//!
//! The wire shape mirrors what editors send (`type` + optional `content` /
//! `length`). The internal shape makes inconsistent combinations
//! unrepresentable: an insert always has content, a delete always has a length.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest position or length a submitted operation may carry.
pub const MAX_OFFSET: usize = u32::MAX as usize;

/// What an operation does, with the fields each kind requires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert `content` at the operation's position.
    Insert { content: String },
    /// Remove `length` characters starting at the operation's position.
    Delete { length: usize },
    /// Skip `length` characters. Only produced inside composed sequences.
    Retain { length: usize },
}

/// A single edit, stamped with its author and an ordering hint.
///
/// Equality is by `id` only: two values describing the same submitted edit
/// compare equal even after one of them has been transformed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    id: String,
    kind: OpKind,
    position: usize,
    author_id: String,
    timestamp: u64,
}

impl PartialEq for Operation {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Operation {}

impl Operation {
    /// Build an insert.
    pub fn insert(
        id: impl Into<String>,
        author_id: impl Into<String>,
        position: usize,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            kind: OpKind::Insert { content: content.into() },
            position,
            author_id: author_id.into(),
            timestamp,
        }
    }

    /// Build a delete of `length` characters.
    pub fn delete(
        id: impl Into<String>,
        author_id: impl Into<String>,
        position: usize,
        length: usize,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            kind: OpKind::Delete { length },
            position,
            author_id: author_id.into(),
            timestamp,
        }
    }

    /// Build a retain (cursor skip inside a composed sequence).
    pub fn retain(
        id: impl Into<String>,
        author_id: impl Into<String>,
        position: usize,
        length: usize,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            kind: OpKind::Retain { length },
            position,
            author_id: author_id.into(),
            timestamp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &OpKind {
        &self.kind
    }

    /// Zero-based character offset the operation targets.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn author_id(&self) -> &str {
        &self.author_id
    }

    /// Ordering hint. Only ever used to break ties.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_insert(&self) -> bool {
        matches!(self.kind, OpKind::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, OpKind::Delete { .. })
    }

    /// Number of characters the operation covers (inserted text length for
    /// inserts, affected span for deletes and retains).
    pub fn len(&self) -> usize {
        match &self.kind {
            OpKind::Insert { content } => content.chars().count(),
            OpKind::Delete { length } | OpKind::Retain { length } => *length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exclusive end of the covered span.
    pub fn end(&self) -> usize {
        self.position.saturating_add(self.len())
    }

    /// Wire name of the kind (`insert`, `delete`, `retain`).
    pub fn type_name(&self) -> &'static str {
        match self.kind {
            OpKind::Insert { .. } => "insert",
            OpKind::Delete { .. } => "delete",
            OpKind::Retain { .. } => "retain",
        }
    }

    // ─── Derivation (crate-internal) ──────────────────────────────────

    /// Same operation, moved to `position`.
    pub(crate) fn at(&self, position: usize) -> Self {
        Self {
            position,
            ..self.clone()
        }
    }

    /// Same delete/retain, with a new span.
    pub(crate) fn with_span(&self, position: usize, length: usize) -> Self {
        let kind = match &self.kind {
            OpKind::Insert { content } => OpKind::Insert { content: content.clone() },
            OpKind::Delete { .. } => OpKind::Delete { length },
            OpKind::Retain { .. } => OpKind::Retain { length },
        };
        Self {
            kind,
            position,
            ..self.clone()
        }
    }

    /// Same insert, carrying different text.
    pub(crate) fn with_content(&self, content: String) -> Self {
        Self {
            kind: OpKind::Insert { content },
            ..self.clone()
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire representation
// ───────────────────────────────────────────────────────────────────

/// Operation type tag as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Delete,
    Retain,
}

/// Loosely-typed operation as sent by editors.
///
/// Numbers are signed so that malformed input (negative offsets) reaches
/// validation instead of failing deserialization with an opaque error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationWire {
    pub id: String,
    #[serde(rename = "type")]
    pub op_type: OperationType,
    pub position: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<i64>,
    pub author_id: String,
    #[serde(default)]
    pub timestamp: u64,
}

/// Reasons a submitted operation is rejected before it touches a document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("operation id is empty")]
    EmptyId,
    #[error("author id is empty")]
    EmptyAuthor,
    #[error("negative position: {0}")]
    NegativePosition(i64),
    #[error("negative length: {0}")]
    NegativeLength(i64),
    #[error("{field} {value} exceeds the maximum of {max}", max = MAX_OFFSET)]
    OutOfRange { field: &'static str, value: i64 },
    #[error("insert without content")]
    MissingContent,
    #[error("delete without length")]
    MissingLength,
    #[error("{0} must not carry content")]
    UnexpectedContent(&'static str),
    #[error("insert must not carry a length")]
    UnexpectedLength,
    #[error("retain cannot be submitted on its own")]
    StandaloneRetain,
}

impl TryFrom<OperationWire> for Operation {
    type Error = OperationError;

    fn try_from(wire: OperationWire) -> Result<Self, Self::Error> {
        if wire.id.is_empty() {
            return Err(OperationError::EmptyId);
        }
        if wire.author_id.is_empty() {
            return Err(OperationError::EmptyAuthor);
        }
        let position = usize::try_from(wire.position)
            .map_err(|_| OperationError::NegativePosition(wire.position))?;
        if position > MAX_OFFSET {
            return Err(OperationError::OutOfRange {
                field: "position",
                value: wire.position,
            });
        }

        let kind = match wire.op_type {
            OperationType::Insert => {
                if wire.length.is_some() {
                    return Err(OperationError::UnexpectedLength);
                }
                let content = wire.content.ok_or(OperationError::MissingContent)?;
                OpKind::Insert { content }
            }
            OperationType::Delete => {
                if wire.content.is_some() {
                    return Err(OperationError::UnexpectedContent("delete"));
                }
                let raw = wire.length.ok_or(OperationError::MissingLength)?;
                let length =
                    usize::try_from(raw).map_err(|_| OperationError::NegativeLength(raw))?;
                if length > MAX_OFFSET {
                    return Err(OperationError::OutOfRange {
                        field: "length",
                        value: raw,
                    });
                }
                OpKind::Delete { length }
            }
            OperationType::Retain => return Err(OperationError::StandaloneRetain),
        };

        Ok(Self {
            id: wire.id,
            kind,
            position,
            author_id: wire.author_id,
            timestamp: wire.timestamp,
        })
    }
}

impl From<&Operation> for OperationWire {
    fn from(op: &Operation) -> Self {
        let (op_type, content, length) = match &op.kind {
            OpKind::Insert { content } => (OperationType::Insert, Some(content.clone()), None),
            OpKind::Delete { length } => (OperationType::Delete, None, Some(*length as i64)),
            OpKind::Retain { length } => (OperationType::Retain, None, Some(*length as i64)),
        };
        Self {
            id: op.id.clone(),
            op_type,
            position: op.position as i64,
            content,
            length,
            author_id: op.author_id.clone(),
            timestamp: op.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(op_type: OperationType, position: i64) -> OperationWire {
        OperationWire {
            id: "op-1".into(),
            op_type,
            position,
            content: None,
            length: None,
            author_id: "alice".into(),
            timestamp: 10,
        }
    }

    #[test]
    fn test_equality_is_by_id() {
        let a = Operation::insert("x", "alice", 0, "hi", 1);
        let moved = a.at(7);
        let other = Operation::insert("y", "alice", 0, "hi", 1);
        assert_eq!(a, moved);
        assert_ne!(a, other);
    }

    #[test]
    fn test_len_counts_chars() {
        let op = Operation::insert("x", "alice", 0, "héllo", 1);
        assert_eq!(op.len(), 5);
        assert_eq!(op.end(), 5);
        let del = Operation::delete("y", "alice", 3, 4, 1);
        assert_eq!(del.end(), 7);
    }

    #[test]
    fn test_wire_insert_valid() {
        let mut w = wire(OperationType::Insert, 3);
        w.content = Some("abc".into());
        let op = Operation::try_from(w).unwrap();
        assert_eq!(op.kind(), &OpKind::Insert { content: "abc".into() });
        assert_eq!(op.position(), 3);
        assert_eq!(op.author_id(), "alice");
    }

    #[test]
    fn test_wire_negative_length_rejected() {
        let mut w = wire(OperationType::Delete, 0);
        w.length = Some(-2);
        assert_eq!(Operation::try_from(w), Err(OperationError::NegativeLength(-2)));
    }

    #[test]
    fn test_wire_negative_position_rejected() {
        let mut w = wire(OperationType::Insert, -1);
        w.content = Some("a".into());
        assert_eq!(Operation::try_from(w), Err(OperationError::NegativePosition(-1)));
    }

    #[test]
    fn test_wire_huge_offsets_rejected() {
        let mut w = wire(OperationType::Delete, i64::MAX);
        w.length = Some(1);
        assert_eq!(
            Operation::try_from(w),
            Err(OperationError::OutOfRange {
                field: "position",
                value: i64::MAX
            })
        );

        let mut w = wire(OperationType::Delete, 0);
        w.length = Some(i64::MAX);
        assert_eq!(
            Operation::try_from(w),
            Err(OperationError::OutOfRange {
                field: "length",
                value: i64::MAX
            })
        );

        let mut w = wire(OperationType::Delete, MAX_OFFSET as i64);
        w.length = Some(MAX_OFFSET as i64);
        assert!(Operation::try_from(w).is_ok());
    }

    #[test]
    fn test_end_saturates() {
        let op = Operation::delete("x", "alice", usize::MAX, usize::MAX, 1);
        assert_eq!(op.end(), usize::MAX);
    }

    #[test]
    fn test_wire_inconsistent_fields_rejected() {
        let w = wire(OperationType::Insert, 0);
        assert_eq!(Operation::try_from(w), Err(OperationError::MissingContent));

        let w = wire(OperationType::Delete, 0);
        assert_eq!(Operation::try_from(w), Err(OperationError::MissingLength));

        let mut w = wire(OperationType::Delete, 0);
        w.length = Some(1);
        w.content = Some("x".into());
        assert_eq!(
            Operation::try_from(w),
            Err(OperationError::UnexpectedContent("delete"))
        );

        let mut w = wire(OperationType::Insert, 0);
        w.content = Some("x".into());
        w.length = Some(1);
        assert_eq!(Operation::try_from(w), Err(OperationError::UnexpectedLength));
    }

    #[test]
    fn test_wire_standalone_retain_rejected() {
        let mut w = wire(OperationType::Retain, 0);
        w.length = Some(3);
        assert_eq!(Operation::try_from(w), Err(OperationError::StandaloneRetain));
    }

    #[test]
    fn test_wire_empty_ids_rejected() {
        let mut w = wire(OperationType::Insert, 0);
        w.content = Some("a".into());
        w.id.clear();
        assert_eq!(Operation::try_from(w.clone()), Err(OperationError::EmptyId));
        w.id = "op".into();
        w.author_id.clear();
        assert_eq!(Operation::try_from(w), Err(OperationError::EmptyAuthor));
    }

    #[test]
    fn test_wire_json_shape() {
        let json = r#"{"id":"o1","type":"delete","position":2,"length":3,"authorId":"bob","timestamp":5}"#;
        let w: OperationWire = serde_json::from_str(json).unwrap();
        let op = Operation::try_from(w).unwrap();
        assert!(op.is_delete());
        assert_eq!(op.len(), 3);

        let back = serde_json::to_value(OperationWire::from(&op)).unwrap();
        assert_eq!(back["type"], "delete");
        assert_eq!(back["authorId"], "bob");
        assert!(back.get("content").is_none());
    }
}
