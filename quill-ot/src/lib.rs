//! # quill-ot: Operational transformation for shared plain text
//!
//! Pure, deterministic building blocks used by the sync server and client:
//!
//! - [`operation`]: the [`Operation`] value (insert / delete / retain) and its
//!   validated wire form
//! - [`transform`]: pairwise and folded transforms, plus `compose`
//! - [`apply`]: splicing operations into a `String` with clamping
//!
//! Nothing in this crate performs I/O or holds state between calls.

pub mod apply;
pub mod operation;
pub mod transform;

pub use apply::{apply, replay};
pub use operation::{
    OpKind, Operation, OperationError, OperationType, OperationWire, MAX_OFFSET,
};
pub use transform::{compose, transform, transform_against};
