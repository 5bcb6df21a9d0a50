//! The string intern table.
//!
//! Mirrors `original_source/src/table.h`'s `tableFindString`: a weak,
//! content-addressed map from string bytes to the one heap `Str` object
//! that holds them. "Weak" means the table's entries never keep a string
//! alive on their own — [`crate::heap::Heap::collect`] removes entries
//! whose string has gone unmarked *before* it sweeps, so interning never
//! leaks memory (spec.md data-model invariant 8).

use crate::heap::ObjRef;
use ahash::AHashMap;

#[derive(Debug, Default)]
pub struct InternTable {
    // hash(bytes) -> candidate refs sharing that hash (collisions are rare
    // but possible; every candidate is re-checked by content).
    buckets: AHashMap<u64, Vec<(Box<str>, ObjRef)>>,
}

impl InternTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, hash: u64, text: &str) -> Option<ObjRef> {
        self.buckets
            .get(&hash)
            .and_then(|bucket| bucket.iter().find(|(s, _)| s.as_ref() == text))
            .map(|(_, r)| *r)
    }

    pub fn insert(&mut self, hash: u64, text: Box<str>, obj: ObjRef) {
        self.buckets.entry(hash).or_default().push((text, obj));
    }

    /// Drop every entry whose string object did not survive the mark phase.
    /// `is_marked` reports whether the given ref is still reachable.
    pub fn retain_marked(&mut self, is_marked: impl Fn(ObjRef) -> bool) {
        self.buckets.retain(|_, bucket| {
            bucket.retain(|(_, r)| is_marked(*r));
            !bucket.is_empty()
        });
    }

    pub fn len(&self) -> usize {
        self.buckets.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
