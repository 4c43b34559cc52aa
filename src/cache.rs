//! Per-module disassembly caches.
//!
//! Walking the same hot code over and over dominates decode time, so the
//! result of "walk from this offset to the next branch" is cached per module.
//! Entries never expire individually; the whole cache is discarded when its
//! module is unloaded. Both lookup and insert are best-effort: a full table
//! only means the entry is not cached, never that decoding stops.

use crate::walk::BranchKind;
use std::collections::HashMap;

/// The default divisor applied to a module's data size to derive its cache
/// capacity.
pub const DEFAULT_CACHE_DIVISOR: u64 = 64;

/// A cached walk result, keyed by the byte offset the walk started at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    /// Instructions executed from the starting offset up to and including the
    /// terminating branch.
    pub insn_cnt: u64,
    /// Bytes covered from the starting offset to the branch instruction.
    pub byte_cnt: u64,
    /// Classification of the terminating branch.
    pub branch: BranchKind,
    /// Encoded length of the branch instruction.
    pub length: u8,
    /// Relative displacement of the branch target (direct branches only).
    pub rel: i32,
}

/// Returned by [InsnCache::insert] when the table is at capacity.
#[derive(Debug, PartialEq, Eq)]
pub struct CacheFull;

/// A bounded offset -> [CacheEntry] table for one module.
#[derive(Debug)]
pub struct InsnCache {
    entries: HashMap<u64, CacheEntry>,
    capacity: usize,
}

impl InsnCache {
    /// Create a cache sized for a module whose on-disk data is `data_size`
    /// bytes. The capacity is `data_size / divisor` rounded to a power of
    /// two, clamped so that tiny and huge modules both get sane tables.
    pub fn new(data_size: u64, divisor: u64) -> Self {
        let divisor = divisor.max(1);
        let size = data_size / divisor;
        let bits = if size < 1000 {
            10
        } else if size >= (1 << 21) {
            21
        } else {
            64 - size.leading_zeros()
        };
        Self {
            entries: HashMap::new(),
            capacity: 1usize << bits,
        }
    }

    pub fn lookup(&self, offset: u64) -> Option<&CacheEntry> {
        self.entries.get(&offset)
    }

    /// Insert an entry, unless the table is full. Existing entries are
    /// overwritten regardless (they cannot grow the table).
    pub fn insert(&mut self, offset: u64, entry: CacheEntry) -> Result<(), CacheFull> {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&offset) {
            return Err(CacheFull);
        }
        self.entries.insert(offset, entry);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheEntry, InsnCache, DEFAULT_CACHE_DIVISOR};
    use crate::walk::BranchKind;

    fn entry(n: u64) -> CacheEntry {
        CacheEntry {
            insn_cnt: n,
            byte_cnt: n * 4,
            branch: BranchKind::Conditional,
            length: 2,
            rel: -16,
        }
    }

    #[test]
    fn capacity_is_clamped() {
        // A tiny module still gets a useful table.
        assert_eq!(InsnCache::new(100, DEFAULT_CACHE_DIVISOR).capacity(), 1 << 10);
        // A huge module does not get an unbounded one.
        assert_eq!(
            InsnCache::new(1 << 40, DEFAULT_CACHE_DIVISOR).capacity(),
            1 << 21
        );
    }

    #[test]
    fn insert_is_best_effort() {
        let mut c = InsnCache::new(0, 1);
        for off in 0..(1 << 10) {
            assert!(c.insert(off, entry(off)).is_ok());
        }
        // Table is now full: new keys are rejected, existing keys still update.
        assert!(c.insert(1 << 20, entry(9)).is_err());
        assert!(c.insert(3, entry(99)).is_ok());
        assert_eq!(c.lookup(3).unwrap().insn_cnt, 99);
        assert!(c.lookup(1 << 20).is_none());
    }
}
