//! Key ordering for persistent trees.

use std::cmp::Ordering;
use std::sync::Arc;

/// A total order over index keys.
///
/// The name is persisted in the tree header; attaching a tree with a
/// comparator of a different name fails, since the on-media order would no
/// longer match.
pub trait KeyComparator: Send + Sync {
    /// Stable identity of the ordering.
    fn name(&self) -> &str;

    /// Compares two keys.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;
}

/// Orders keys by their raw bytes (the default).
#[derive(Debug, Clone, Copy, Default)]
pub struct BytewiseComparator;

impl KeyComparator for BytewiseComparator {
    fn name(&self) -> &str {
        "pmse.bytewise"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

/// Orders keys by their raw bytes, largest first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReverseBytewiseComparator;

impl KeyComparator for ReverseBytewiseComparator {
    fn name(&self) -> &str {
        "pmse.reverse_bytewise"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        b.cmp(a)
    }
}

/// Returns the built-in comparator with the given name.
#[must_use]
pub fn builtin_comparator(name: &str) -> Option<Arc<dyn KeyComparator>> {
    match name {
        "pmse.bytewise" => Some(Arc::new(BytewiseComparator)),
        "pmse.reverse_bytewise" => Some(Arc::new(ReverseBytewiseComparator)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_resolve_by_name() {
        for cmp in [
            Arc::new(BytewiseComparator) as Arc<dyn KeyComparator>,
            Arc::new(ReverseBytewiseComparator),
        ] {
            let found = builtin_comparator(cmp.name()).unwrap();
            assert_eq!(found.name(), cmp.name());
        }
        assert!(builtin_comparator("custom").is_none());
    }

    #[test]
    fn reverse_inverts_order() {
        assert_eq!(BytewiseComparator.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(ReverseBytewiseComparator.compare(b"a", b"b"), Ordering::Greater);
        assert_eq!(ReverseBytewiseComparator.compare(b"ab", b"ab"), Ordering::Equal);
    }
}
