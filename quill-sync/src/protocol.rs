//! JSON wire protocol spoken over the document channel.
//!
//! Every frame is one JSON object naming its message in an `event` field:
//!
//! ```text
//! client ──► server                     server ──► client
//! ─────────────────                     ─────────────────
//! join-document                         document-state
//! document-operation                    user-joined / user-left
//! cursor-update                         document-operation (rebroadcast)
//! leave-document                        operation-ack / operation-error
//! ping                                  resynchronized, durability-degraded
//!                                       cursor-update, pong, error
//! ```
//!
//! Field names are camelCase to match browser editors.

use quill_ot::OperationWire;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::presence::Participant;

/// Selected character range, `start..end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub start: usize,
    pub end: usize,
}

/// Messages sent by editors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Attach this connection to a document.
    #[serde(rename_all = "camelCase")]
    JoinDocument { document_id: String, user_id: String },

    /// Submit an edit generated against `base_version`.
    #[serde(rename_all = "camelCase")]
    DocumentOperation {
        #[serde(flatten)]
        operation: OperationWire,
        base_version: u64,
    },

    /// Move the caret / selection.
    CursorUpdate {
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Selection>,
    },

    /// Detach from the current document.
    LeaveDocument,

    /// Heartbeat.
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Full snapshot. Replaces any local content wholesale.
    #[serde(rename_all = "camelCase")]
    DocumentState {
        document_id: String,
        content: String,
        version: u64,
        participants: Vec<Participant>,
    },

    #[serde(rename_all = "camelCase")]
    UserJoined { user_id: String, color: String },

    /// An accepted operation, as applied, with the resulting document.
    DocumentOperation {
        operation: OperationWire,
        version: u64,
        content: String,
    },

    #[serde(rename_all = "camelCase")]
    OperationAck { operation_id: String, version: u64 },

    #[serde(rename_all = "camelCase")]
    OperationError { operation_id: String, reason: String },

    /// The edit was dropped and a fresh `document-state` follows.
    #[serde(rename_all = "camelCase")]
    Resynchronized { operation_id: String, reason: String },

    #[serde(rename_all = "camelCase")]
    CursorUpdate {
        user_id: String,
        position: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<Selection>,
    },

    #[serde(rename_all = "camelCase")]
    UserLeft { user_id: String },

    /// Accepted edits are only held in memory until storage recovers.
    #[serde(rename_all = "camelCase")]
    DurabilityDegraded { document_id: String },

    Pong,

    Error { reason: String },
}

/// Protocol errors.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}
