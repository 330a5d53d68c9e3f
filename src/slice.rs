//! Slice partitioning over document ids
//!
//! A job with `n` slices runs `n` independent scrolls. Slice `i` claims a
//! document iff `fnv1a32(id) % n == i`, so every id lands in exactly one
//! slice regardless of which slice runs first.

use serde::{Deserialize, Serialize};

/// FNV-1a 32-bit hash
#[inline]
pub fn fnv1a32(data: &[u8]) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 2166136261;
    const FNV_PRIME: u32 = 16777619;

    data.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ *byte as u32).wrapping_mul(FNV_PRIME)
    })
}

/// Compute which slice of `max` owns a document id
#[inline]
pub fn slice_for_id(id: &str, max: u32) -> u32 {
    fnv1a32(id.as_bytes()) % max
}

/// One slice of a sliced scroll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    /// Zero-based slice number
    pub id: u32,

    /// Total number of slices
    pub max: u32,
}

impl SliceSpec {
    pub fn new(id: u32, max: u32) -> Self {
        debug_assert!(max >= 1 && id < max);
        Self { id, max }
    }

    /// Check if this slice owns the document
    #[inline]
    pub fn claims(&self, doc_id: &str) -> bool {
        self.max <= 1 || slice_for_id(doc_id, self.max) == self.id
    }

    /// All slices of an `n`-way partition
    pub fn partition(max: u32) -> Vec<SliceSpec> {
        (0..max).map(|id| SliceSpec::new(id, max)).collect()
    }
}
