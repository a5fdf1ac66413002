//! `chunkstore_core` is the physical-volume storage engine of an embeddable,
//! hierarchical key-value store: a chunked file format with crash-safe
//! single-writer/many-reader transactions, a B-tree index keyed by hashed
//! path segments, a Bloom filter for negative-lookup short-circuiting, and
//! an MRU cache of resident B-tree nodes.
//!
//! The routing layer that maps logical paths across multiple mounted
//! volumes is out of scope here; this crate only defines the interfaces
//! that layer needs (see [`storage::StorageFile`], [`btree`], [`cache`]).

pub mod bloom;
pub mod btree;
pub mod cache;
pub mod error;
pub mod hash;
pub mod key;
pub mod storage;
pub mod value;

pub use error::{Error, Result};
pub use key::Key;
pub use value::Value;

/// Tunable parameters a physical volume is opened with.
///
/// This is the concrete form of the "policy bundle" a physical volume
/// consumes: chunk geometry, Bloom filter sizing, B-tree fan-out, cache
/// capacity, and the reader pool size. A volume's [`storage::StorageFile`]
/// folds the on-disk-relevant fields into its compatibility stamp, so a file
/// created under one `Policy` cannot silently be reopened under an
/// incompatible one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Policy {
    /// Number of payload bytes carried by each chunk, excluding the chunk's
    /// own header (`used_size`/`next_used`/`next_free`).
    pub chunk_size: u32,
    /// Size, in bytes, of the Bloom filter bitset. Must be a power of two.
    pub bloom_size: u32,
    /// Number of bit positions set per Bloom filter entry. Must be `<= 16`.
    pub bloom_fn_count: u32,
    /// Maximum number of path segments folded into one Bloom filter digest;
    /// deeper paths are truncated to this many segments per side.
    pub bloom_precision: u32,
    /// Maximum number of entries held by one B-tree node. Must be `>= 2`.
    pub btree_power: usize,
    /// Minimum number of entries a non-root B-tree node may hold before
    /// underflow rebalancing kicks in.
    pub btree_min_power: usize,
    /// Maximum number of B-tree nodes resident in the MRU cache at once.
    pub btree_cache_size: usize,
    /// Maximum number of path segments a lookup may descend through.
    pub max_tree_depth: usize,
    /// Number of concurrent OS read handles kept open on the backing file.
    pub reader_number: usize,
}

impl Default for Policy {
    fn default() -> Self {
        Policy {
            chunk_size: 256,
            bloom_size: 64,
            bloom_fn_count: 8,
            bloom_precision: 16,
            btree_power: 8,
            btree_min_power: 4,
            btree_cache_size: 1024,
            max_tree_depth: 64,
            reader_number: 4,
        }
    }
}

impl Policy {
    /// Checks the invariants this crate relies on. Called by
    /// [`storage::StorageFile::open`] before touching the backing file.
    pub fn validate(&self) -> Result<()> {
        if self.bloom_size == 0 || !self.bloom_size.is_power_of_two() {
            return Err(Error::InvalidData);
        }
        if self.bloom_fn_count == 0 || self.bloom_fn_count > 16 {
            return Err(Error::InvalidData);
        }
        if self.btree_power < 2 {
            return Err(Error::InvalidData);
        }
        if self.btree_min_power == 0 || self.btree_min_power * 2 > self.btree_power + 1 {
            return Err(Error::InvalidData);
        }
        if self.reader_number == 0 {
            return Err(Error::InvalidData);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        Policy::default().validate().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_bloom_size() {
        let mut p = Policy::default();
        p.bloom_size = 3;
        assert!(p.validate().is_err());
    }

    #[test]
    fn rejects_too_many_bloom_functions() {
        let mut p = Policy::default();
        p.bloom_fn_count = 17;
        assert!(p.validate().is_err());
    }
}
