//! Transform engine: rewrite one operation so it applies after a concurrent one.
//!
//! `transform(a, b)` assumes `a` and `b` were generated against the same
//! document state and returns `a'`, the version of `a` that can be applied
//! once `b` has already been applied.
//!
//! ```text
//!            base
//!           ╱    ╲
//!          a      b
//!         ╱        ╲
//!   a·b' = b·a'   (convergence)
//! ```
//!
//! Policies fixed here, shared by every site:
//!
//! | a \ b  | insert                         | delete                           |
//! |--------|--------------------------------|----------------------------------|
//! | insert | shift right past b (ties: order by (timestamp, author)) | clamp into b's start when inside |
//! | delete | shift right, or widen if b lands inside ("delete wins") | shrink by overlap, start at min  |
//!
//! Reference: Ellis & Gibbs: Concurrency Control in Groupware Systems (1989)

use std::cmp::Ordering;

use crate::operation::{OpKind, Operation};

/// Transform `a` against `b`, producing `a'` to apply after `b`.
///
/// Operations by the same author are never transformed against each other;
/// the transport already orders one author's edits.
pub fn transform(a: &Operation, b: &Operation) -> Operation {
    if a.author_id() == b.author_id() {
        return a.clone();
    }

    match (a.kind(), b.kind()) {
        (OpKind::Insert { .. }, OpKind::Insert { .. }) => insert_insert(a, b),
        (OpKind::Insert { .. }, OpKind::Delete { .. }) => insert_delete(a, b),
        (OpKind::Delete { .. }, OpKind::Insert { .. }) => delete_insert(a, b),
        (OpKind::Delete { .. }, OpKind::Delete { .. }) => delete_delete(a, b),
        // Retains move no text.
        _ => a.clone(),
    }
}

/// Fold `op` through every operation in `applied`, in order.
pub fn transform_against<'a, I>(op: &Operation, applied: I) -> Operation
where
    I: IntoIterator<Item = &'a Operation>,
{
    applied
        .into_iter()
        .fold(op.clone(), |acc, prior| transform(&acc, prior))
}

/// Merge two consecutive operations by one author where possible.
///
/// An insert followed by a delete that lies entirely inside the inserted
/// text collapses into one shorter insert. Anything else comes back as
/// `[a, b]` unchanged.
pub fn compose(a: &Operation, b: &Operation) -> Vec<Operation> {
    if let (OpKind::Insert { content }, OpKind::Delete { length }) = (a.kind(), b.kind()) {
        if b.position() >= a.position() && b.position() + length <= a.end() {
            let cut_start = b.position() - a.position();
            let cut_end = cut_start + length;
            let merged: String = content
                .chars()
                .enumerate()
                .filter(|(i, _)| *i < cut_start || *i >= cut_end)
                .map(|(_, c)| c)
                .collect();
            return vec![a.with_content(merged)];
        }
    }
    vec![a.clone(), b.clone()]
}

/// Total order used when two inserts target the same offset.
///
/// Must be identical at every site, so it only looks at fields that travel
/// with the operation.
fn insert_precedes(a: &Operation, b: &Operation) -> bool {
    match a.timestamp().cmp(&b.timestamp()) {
        Ordering::Less => true,
        Ordering::Greater => false,
        Ordering::Equal => a.author_id() < b.author_id(),
    }
}

fn insert_insert(a: &Operation, b: &Operation) -> Operation {
    let unaffected = a.position() < b.position()
        || (a.position() == b.position() && insert_precedes(a, b));
    if unaffected {
        a.clone()
    } else {
        a.at(a.position().saturating_add(b.len()))
    }
}

fn insert_delete(a: &Operation, b: &Operation) -> Operation {
    if a.position() <= b.position() {
        a.clone()
    } else if a.position() >= b.end() {
        a.at(a.position() - b.len())
    } else {
        // Landed inside the removed range: pull to its start, never drop.
        a.at(b.position())
    }
}

fn delete_insert(a: &Operation, b: &Operation) -> Operation {
    if b.position() <= a.position() {
        a.at(a.position().saturating_add(b.len()))
    } else if b.position() >= a.end() {
        a.clone()
    } else {
        // Delete wins: the widened range also consumes the concurrent insert.
        a.with_span(a.position(), a.len().saturating_add(b.len()))
    }
}

fn delete_delete(a: &Operation, b: &Operation) -> Operation {
    if a.end() <= b.position() {
        a.clone()
    } else if a.position() >= b.end() {
        a.at(a.position() - b.len())
    } else {
        let overlap = a.end().min(b.end()) - a.position().max(b.position());
        a.with_span(a.position().min(b.position()), a.len() - overlap)
    }
}
