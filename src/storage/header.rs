//! File header: compatibility stamp, Bloom filter bytes, the committed vs.
//! proposed transaction state, and the preserved-log pointer.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! compatibility_stamp : u64
//! bloom                : [u8; policy.bloom_size]
//! transactional_data   : { file_size: i64, free_space: i64 }   // committed
//! transaction          : { file_size: i64, free_space: i64 }   // proposed
//! transaction_crc      : u64
//! preserved_log        : i64   // chain UID of this transaction's overwrite log, or invalid
//! ```
//!
//! The root B-tree node's chunk immediately follows the header, at
//! `layout.of_root`, which also doubles as the initial `file_size` of a
//! freshly created file.
//!
//! `preserved_log` generalizes the single-slot "preserved chunk" scratch a
//! transaction with exactly one identity-preserving overwrite would need
//! into one that can carry any number of them: this crate's B-tree keeps a
//! node's NodeUid stable for its whole life (see `btree` module docs), so a
//! single cascading split or merge can rewrite several pre-existing nodes'
//! first chunk within one transaction. Each overwrite's new first-chunk
//! content is staged in a freshly allocated chunk (safe under rollback,
//! since it is new allocation); the `(target, staging head)` pairs for the
//! whole transaction are themselves serialized as one more chunk chain and
//! referenced by this single pointer. Applying a transaction copies each
//! staged chunk onto its target and reclaims the staging chunks and the log
//! chain itself back into the free list — see
//! `transaction::apply_pending_transaction`.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;
use crate::storage::chunk::ChunkUid;
use crate::Policy;

/// Computed byte offsets of every header field, derived from a [`Policy`].
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub of_compatibility_stamp: u64,
    pub of_bloom: u64,
    pub of_transactional_data: u64,
    pub of_transaction: u64,
    pub of_transaction_crc: u64,
    pub of_preserved_log: u64,
    /// Also the header's total size, and the root node's chunk offset.
    pub of_root: u64,
    pub bloom_size: u64,
}

impl Layout {
    pub fn new(policy: &Policy) -> Self {
        let of_compatibility_stamp = 0;
        let of_bloom = of_compatibility_stamp + 8;
        let of_transactional_data = of_bloom + policy.bloom_size as u64;
        let of_transaction = of_transactional_data + 16;
        let of_transaction_crc = of_transaction + 16;
        let of_preserved_log = of_transaction_crc + 8;
        let of_root = of_preserved_log + 8;
        Layout {
            of_compatibility_stamp,
            of_bloom,
            of_transactional_data,
            of_transaction,
            of_transaction_crc,
            of_preserved_log,
            of_root,
            bloom_size: policy.bloom_size as u64,
        }
    }
}

/// The committed or proposed `{file_size, free_space}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionState {
    pub file_size: i64,
    pub free_space: ChunkUid,
}

/// Hashes together every on-disk-relevant policy field. A file created
/// under one set of geometry parameters refuses to open under another.
pub fn compatibility_stamp(policy: &Policy) -> u64 {
    let mut buf = Vec::with_capacity(7 * 4);
    buf.extend_from_slice(&policy.bloom_size.to_be_bytes());
    buf.extend_from_slice(&policy.bloom_fn_count.to_be_bytes());
    buf.extend_from_slice(&policy.bloom_precision.to_be_bytes());
    buf.extend_from_slice(&(policy.btree_power as u32).to_be_bytes());
    buf.extend_from_slice(&(policy.btree_min_power as u32).to_be_bytes());
    buf.extend_from_slice(&policy.chunk_size.to_be_bytes());
    buf.extend_from_slice(&(policy.max_tree_depth as u32).to_be_bytes());
    xxhash_rust::xxh3::xxh3_64(&buf)
}

/// Hashes a proposed transaction state — this is what `transaction_crc`
/// must equal for the `transaction` slot to be considered valid and ready
/// to apply.
pub fn transaction_hash(state: TransactionState) -> u64 {
    let mut buf = [0u8; 16];
    buf[0..8].copy_from_slice(&state.file_size.to_be_bytes());
    buf[8..16].copy_from_slice(&state.free_space.to_be_bytes());
    xxhash_rust::xxh3::xxh3_64(&buf)
}

pub fn read_compatibility_stamp<F: Read + Seek>(f: &mut F, layout: &Layout) -> Result<u64> {
    f.seek(SeekFrom::Start(layout.of_compatibility_stamp))?;
    Ok(f.read_u64::<BigEndian>()?)
}

pub fn write_compatibility_stamp<F: Write + Seek>(f: &mut F, layout: &Layout, stamp: u64) -> Result<()> {
    f.seek(SeekFrom::Start(layout.of_compatibility_stamp))?;
    f.write_u64::<BigEndian>(stamp)?;
    Ok(())
}

pub fn read_bloom<F: Read + Seek>(f: &mut F, layout: &Layout, buf: &mut [u8]) -> Result<()> {
    debug_assert_eq!(buf.len() as u64, layout.bloom_size);
    f.seek(SeekFrom::Start(layout.of_bloom))?;
    f.read_exact(buf)?;
    Ok(())
}

pub fn write_bloom_byte<F: Write + Seek>(f: &mut F, layout: &Layout, byte_no: u64, byte: u8) -> Result<()> {
    f.seek(SeekFrom::Start(layout.of_bloom + byte_no))?;
    f.write_all(&[byte])?;
    Ok(())
}

pub fn write_bloom_all<F: Write + Seek>(f: &mut F, layout: &Layout, buf: &[u8]) -> Result<()> {
    f.seek(SeekFrom::Start(layout.of_bloom))?;
    f.write_all(buf)?;
    Ok(())
}

fn read_state<F: Read + Seek>(f: &mut F, offset: u64) -> Result<TransactionState> {
    f.seek(SeekFrom::Start(offset))?;
    let file_size = f.read_i64::<BigEndian>()?;
    let free_space = f.read_i64::<BigEndian>()?;
    Ok(TransactionState { file_size, free_space })
}

fn write_state<F: Write + Seek>(f: &mut F, offset: u64, state: TransactionState) -> Result<()> {
    f.seek(SeekFrom::Start(offset))?;
    f.write_i64::<BigEndian>(state.file_size)?;
    f.write_i64::<BigEndian>(state.free_space)?;
    Ok(())
}

pub fn read_transactional_data<F: Read + Seek>(f: &mut F, layout: &Layout) -> Result<TransactionState> {
    read_state(f, layout.of_transactional_data)
}

pub fn write_transactional_data<F: Write + Seek>(f: &mut F, layout: &Layout, state: TransactionState) -> Result<()> {
    write_state(f, layout.of_transactional_data, state)
}

pub fn read_transaction<F: Read + Seek>(f: &mut F, layout: &Layout) -> Result<TransactionState> {
    read_state(f, layout.of_transaction)
}

pub fn write_transaction<F: Write + Seek>(f: &mut F, layout: &Layout, state: TransactionState) -> Result<()> {
    write_state(f, layout.of_transaction, state)
}

pub fn read_transaction_crc<F: Read + Seek>(f: &mut F, layout: &Layout) -> Result<u64> {
    f.seek(SeekFrom::Start(layout.of_transaction_crc))?;
    Ok(f.read_u64::<BigEndian>()?)
}

pub fn write_transaction_crc<F: Write + Seek>(f: &mut F, layout: &Layout, crc: u64) -> Result<()> {
    f.seek(SeekFrom::Start(layout.of_transaction_crc))?;
    f.write_u64::<BigEndian>(crc)?;
    Ok(())
}

pub fn read_preserved_log<F: Read + Seek>(f: &mut F, layout: &Layout) -> Result<ChunkUid> {
    f.seek(SeekFrom::Start(layout.of_preserved_log))?;
    Ok(f.read_i64::<BigEndian>()?)
}

pub fn write_preserved_log<F: Write + Seek>(f: &mut F, layout: &Layout, log: ChunkUid) -> Result<()> {
    f.seek(SeekFrom::Start(layout.of_preserved_log))?;
    f.write_i64::<BigEndian>(log)?;
    Ok(())
}
