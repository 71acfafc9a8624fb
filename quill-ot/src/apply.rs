//! Splicing operations into text.
//!
//! Offsets are character offsets. Out-of-range coordinates are clamped
//! rather than rejected: an insert past the end appends, a delete running
//! past the end stops there.

use crate::operation::{OpKind, Operation};

/// Apply `op` to `content` in place and return the effective operation,
/// i.e. `op` with its coordinates clamped to what was actually changed.
pub fn apply(content: &mut String, op: &Operation) -> Operation {
    let char_len = content.chars().count();
    let start = op.position().min(char_len);

    match op.kind() {
        OpKind::Insert { content: text } => {
            let at = byte_offset(content, start);
            content.insert_str(at, text);
            op.at(start)
        }
        OpKind::Delete { length } => {
            let length = (*length).min(char_len - start);
            let from = byte_offset(content, start);
            let to = byte_offset(content, start + length);
            content.replace_range(from..to, "");
            op.with_span(start, length)
        }
        OpKind::Retain { .. } => op.clone(),
    }
}

/// Rebuild text by applying `ops` to the empty string.
pub fn replay<'a, I>(ops: I) -> String
where
    I: IntoIterator<Item = &'a Operation>,
{
    let mut content = String::new();
    for op in ops {
        apply(&mut content, op);
    }
    content
}

/// Byte index of the `chars`-th character, or the string length past the end.
fn byte_offset(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map_or(s.len(), |(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_middle() {
        let mut s = String::from("held");
        apply(&mut s, &Operation::insert("a", "u", 3, "lo worl", 1));
        assert_eq!(s, "hello world");
    }

    #[test]
    fn test_insert_past_end_appends() {
        let mut s = String::from("ab");
        let eff = apply(&mut s, &Operation::insert("a", "u", 40, "c", 1));
        assert_eq!(s, "abc");
        assert_eq!(eff.position(), 2);
    }

    #[test]
    fn test_empty_insert_is_noop_on_text() {
        let mut s = String::from("abc");
        apply(&mut s, &Operation::insert("a", "u", 1, "", 1));
        assert_eq!(s, "abc");
    }

    #[test]
    fn test_delete_truncates_at_end() {
        let mut s = String::from("abcdef");
        let eff = apply(&mut s, &Operation::delete("d", "u", 4, 100, 1));
        assert_eq!(s, "abcd");
        assert_eq!((eff.position(), eff.len()), (4, 2));
    }

    #[test]
    fn test_delete_from_past_end_is_empty() {
        let mut s = String::from("abc");
        let eff = apply(&mut s, &Operation::delete("d", "u", 9, 2, 1));
        assert_eq!(s, "abc");
        assert_eq!((eff.position(), eff.len()), (3, 0));
    }

    #[test]
    fn test_multibyte_offsets() {
        let mut s = String::from("añb");
        apply(&mut s, &Operation::insert("a", "u", 2, "é", 1));
        assert_eq!(s, "añéb");
        apply(&mut s, &Operation::delete("d", "u", 1, 2, 2));
        assert_eq!(s, "ab");
    }

    #[test]
    fn test_replay() {
        let ops = vec![
            Operation::insert("1", "u", 0, "hello", 1),
            Operation::insert("2", "u", 5, " world", 2),
            Operation::delete("3", "u", 0, 6, 3),
        ];
        assert_eq!(replay(&ops), "world");
    }
}
