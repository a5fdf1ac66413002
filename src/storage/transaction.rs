//! Single-writer transactions: chunk allocation, chain writers, chain
//! erasure, and the commit/rollback protocol.
//!
//! At most one `Transaction` exists at a time per [`super::StorageFile`] —
//! enforced by the write mutex `open_transaction` locks for the
//! transaction's whole lifetime. A transaction that is dropped without
//! calling [`Transaction::commit`] truncates the file back to the last
//! committed `file_size`, undoing every chunk it allocated.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::MutexGuard;
use std::collections::HashMap;
use std::fs::File;

use crate::error::Result;
use crate::storage::chunk::{self, ChunkUid, INVALID_CHUNK_UID};
use crate::storage::header::{self, Layout, TransactionState};
use crate::storage::StorageFile;

/// An open, exclusive transaction against a [`StorageFile`].
pub struct Transaction<'a> {
    pub(crate) file: &'a StorageFile,
    pub(crate) writer: MutexGuard<'a, File>,
    pub(crate) file_size: i64,
    pub(crate) free_space: ChunkUid,
    released_head: ChunkUid,
    released_tail: ChunkUid,
    /// `target -> staging head` recorded by every chain overwriter that
    /// has been `finish`ed so far, one entry per distinct target. Applied
    /// at commit time by copying each staging chain's first chunk onto its
    /// target — see `apply_pending_transaction`. A target rewritten more
    /// than once in the same transaction (a cascading split touching the
    /// same node twice, say) replaces its entry rather than accumulating
    /// one per write — see `get_chain_overwriter` and `ChainWriter::finish`.
    pending_overwrites: HashMap<ChunkUid, ChunkUid>,
    committed: bool,
}

impl<'a> Transaction<'a> {
    pub(crate) fn begin(file: &'a StorageFile, mut writer: MutexGuard<'a, File>) -> Result<Self> {
        let committed_state = header::read_transactional_data(&mut *writer, &file.layout)?;
        Ok(Transaction {
            file,
            writer,
            file_size: committed_state.file_size,
            free_space: committed_state.free_space,
            released_head: INVALID_CHUNK_UID,
            released_tail: INVALID_CHUNK_UID,
            pending_overwrites: HashMap::new(),
            committed: false,
        })
    }

    /// Opens a streaming chain writer for a brand new chain.
    pub fn get_chain_writer(&mut self) -> ChainWriter<'a, '_> {
        ChainWriter {
            tx: self,
            first_written_chunk: INVALID_CHUNK_UID,
            last_written_chunk: INVALID_CHUNK_UID,
            overwrite_target: None,
            pending: Vec::new(),
        }
    }

    /// Opens a chain writer that rewrites chunk `uid`'s content, preserving
    /// its identity. The new content is streamed into a freshly allocated
    /// staging chain (ordinary allocation, safe under rollback); `uid`'s
    /// own on-disk bytes are left untouched until commit, when the staging
    /// chain's first chunk is copied onto `uid`. The old chain's tail
    /// (everything after the first chunk) is released immediately, since
    /// it is superseded the moment the new content is fully staged.
    ///
    /// `uid`'s committed tail is only ever erased once per transaction: if
    /// `uid` has already been overwritten earlier in this same
    /// transaction, its on-disk tail was already spliced into the
    /// released list by that first call, and the committed chunk's
    /// `next_used` has not changed since (the overwrite is staged, not
    /// applied) — reading and erasing it again would splice the very
    /// same chunk into the released list a second time, corrupting it
    /// into a self-referential free-list entry. `ChainWriter::finish`
    /// reclaims the superseded staging chain instead when this happens.
    pub fn get_chain_overwriter(&mut self, uid: ChunkUid) -> Result<ChainWriter<'a, '_>> {
        if !self.pending_overwrites.contains_key(&uid) {
            let header = chunk::read_header(&mut *self.writer, uid)?;
            if header.next_used != INVALID_CHUNK_UID {
                self.erase_chain(header.next_used)?;
            }
        }
        Ok(ChainWriter {
            tx: self,
            first_written_chunk: INVALID_CHUNK_UID,
            last_written_chunk: INVALID_CHUNK_UID,
            overwrite_target: Some(uid),
            pending: Vec::new(),
        })
    }

    /// Splices a whole chain into the transaction's pending-released list.
    /// Released chunks remain readable until commit; they only join the
    /// real free list once the transaction's new state is durable.
    pub fn erase_chain(&mut self, head: ChunkUid) -> Result<()> {
        let mut current = head;
        while current != INVALID_CHUNK_UID {
            let chunk_header = chunk::read_header(&mut *self.writer, current)?;
            if self.released_tail == INVALID_CHUNK_UID {
                self.released_tail = current;
            }
            chunk::write_next_free(&mut *self.writer, current, self.released_head)?;
            self.released_head = current;
            current = chunk_header.next_used;
        }
        Ok(())
    }

    /// Commits the transaction: serializes any pending overwrites into a
    /// log chain, splices released chunks into the free list, writes the
    /// proposed `transaction` state and its CRC, then asks the file to
    /// apply it. Once this returns `Ok`, the new state is durable and the
    /// destructor will not roll back.
    pub fn commit(mut self) -> Result<()> {
        let log_uid = self.write_overwrite_log()?;

        if self.released_head != INVALID_CHUNK_UID {
            chunk::write_next_free(&mut *self.writer, self.released_tail, self.free_space)?;
            self.free_space = self.released_head;
        }

        header::write_preserved_log(&mut *self.writer, &self.file.layout, log_uid)?;

        let state = TransactionState { file_size: self.file_size, free_space: self.free_space };
        header::write_transaction(&mut *self.writer, &self.file.layout, state)?;
        let crc = header::transaction_hash(state);
        header::write_transaction_crc(&mut *self.writer, &self.file.layout, crc)?;
        apply_pending_transaction(&mut self.writer, &self.file.layout)?;
        self.committed = true;
        Ok(())
    }

    /// Serializes `pending_overwrites` (if any) as one more chunk chain,
    /// written through the ordinary chain-writer path, and returns its
    /// head UID (or [`INVALID_CHUNK_UID`] if there was nothing to stage).
    fn write_overwrite_log(&mut self) -> Result<ChunkUid> {
        if self.pending_overwrites.is_empty() {
            return Ok(INVALID_CHUNK_UID);
        }
        let mut buf = Vec::with_capacity(4 + self.pending_overwrites.len() * 16);
        buf.write_u32::<BigEndian>(self.pending_overwrites.len() as u32)?;
        for (target, staging) in &self.pending_overwrites {
            buf.write_i64::<BigEndian>(*target)?;
            buf.write_i64::<BigEndian>(*staging)?;
        }
        let mut w = self.get_chain_writer();
        w.write_all(&buf)?;
        w.finish()
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        log::debug!("rolling back uncommitted transaction");
        if let Ok(committed) = header::read_transactional_data(&mut *self.writer, &self.file.layout) {
            let _ = self.writer.set_len(committed.file_size as u64);
        }
    }
}

/// Reads back the `(target, staging head)` pairs serialized by
/// `Transaction::write_overwrite_log`, plus every chunk UID making up the
/// log chain itself (so the caller can reclaim them).
fn read_overwrite_log(writer: &mut File, head: ChunkUid) -> Result<(Vec<(ChunkUid, ChunkUid)>, Vec<ChunkUid>)> {
    let mut log_chunks = Vec::new();
    let mut bytes = Vec::new();
    let mut current = head;
    while current != INVALID_CHUNK_UID {
        log_chunks.push(current);
        let header = chunk::read_header(writer, current)?;
        bytes.extend(chunk::read_payload(writer, current, header.used_size)?);
        current = header.next_used;
    }
    let mut cursor = std::io::Cursor::new(bytes);
    let count = cursor.read_u32::<BigEndian>()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let target = cursor.read_i64::<BigEndian>()?;
        let staging = cursor.read_i64::<BigEndian>()?;
        entries.push((target, staging));
    }
    Ok((entries, log_chunks))
}

/// Applies whatever transaction is currently staged in the header: if
/// `transaction_crc` matches the proposed state's hash, every pending
/// overwrite's staged content is copied onto its target, the staging
/// chunks and the log chain itself are reclaimed into the free list
/// alongside this transaction's own released chunks, the proposed state
/// becomes the committed state, and the CRC is invalidated so it cannot be
/// re-applied. Otherwise the file is rolled back to the last committed
/// `file_size`. Used both by `Transaction::commit` and by crash recovery
/// on open — both call sites leave the file in the same state regardless
/// of how many times this runs (copying a staged chunk onto its target
/// twice is harmless, and the free-list splice is recomputed identically),
/// which is what makes recovery idempotent.
pub(crate) fn apply_pending_transaction(writer: &mut File, layout: &Layout) -> Result<bool> {
    let proposed = header::read_transaction(writer, layout)?;
    let crc = header::read_transaction_crc(writer, layout)?;
    if crc == header::transaction_hash(proposed) {
        let log_head = header::read_preserved_log(writer, layout)?;
        let mut free_space = proposed.free_space;

        if log_head != INVALID_CHUNK_UID {
            let (entries, log_chunks) = read_overwrite_log(writer, log_head)?;
            let mut reclaimed = Vec::with_capacity(entries.len() + log_chunks.len());
            for (target, staging) in &entries {
                chunk::copy_chunk_onto(writer, *staging, *target)?;
                reclaimed.push(*staging);
            }
            reclaimed.extend(log_chunks);
            for (i, &uid) in reclaimed.iter().enumerate() {
                let next = if i + 1 < reclaimed.len() { reclaimed[i + 1] } else { free_space };
                chunk::write_next_free(writer, uid, next)?;
            }
            if let Some(&first) = reclaimed.first() {
                free_space = first;
            }
        }

        header::write_transactional_data(writer, layout, TransactionState { file_size: proposed.file_size, free_space })?;
        header::write_preserved_log(writer, layout, INVALID_CHUNK_UID)?;
        let invalid_crc = header::transaction_hash(proposed).wrapping_add(1);
        header::write_transaction_crc(writer, layout, invalid_crc)?;
        Ok(true)
    } else {
        let committed = header::read_transactional_data(writer, layout)?;
        writer.set_len(committed.file_size as u64)?;
        Ok(false)
    }
}

/// A streaming sink that serializes a chunk chain one flush at a time.
///
/// Only one `ChainWriter` can exist per transaction at once — the type
/// borrows the `Transaction` exclusively for its lifetime, which is how
/// this crate enforces "at most one writer in flight" at compile time
/// rather than with a runtime flag.
pub struct ChainWriter<'a, 'tx> {
    tx: &'tx mut Transaction<'a>,
    first_written_chunk: ChunkUid,
    last_written_chunk: ChunkUid,
    /// `Some(uid)` if this writer is staging an overwrite of a pre-existing
    /// chunk's chain rather than writing a brand-new one.
    overwrite_target: Option<ChunkUid>,
    pending: Vec<u8>,
}

impl ChainWriter<'_, '_> {
    fn next_chunk_uid(&mut self) -> Result<ChunkUid> {
        if self.tx.free_space != INVALID_CHUNK_UID {
            let uid = self.tx.free_space;
            let header = chunk::read_header(&mut *self.tx.writer, uid)?;
            self.tx.free_space = header.next_free;
            Ok(uid)
        } else {
            let uid = self.tx.file_size;
            self.tx.file_size += self.tx.file.chunk_total_len as i64;
            Ok(uid)
        }
    }

    fn flush_chunk(&mut self, payload: &[u8]) -> Result<()> {
        let uid = self.next_chunk_uid()?;
        if self.last_written_chunk != INVALID_CHUNK_UID {
            chunk::write_next_used(&mut *self.tx.writer, self.last_written_chunk, uid)?;
        }
        chunk::write_chunk(&mut *self.tx.writer, uid, payload.len() as u32, INVALID_CHUNK_UID, INVALID_CHUNK_UID, payload)?;
        if self.first_written_chunk == INVALID_CHUNK_UID {
            self.first_written_chunk = uid;
        }
        self.last_written_chunk = uid;
        Ok(())
    }

    /// Streams `data` into the chain, flushing a full chunk every time the
    /// pending buffer reaches the policy's chunk payload capacity.
    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(data);
        let cap = self.tx.file.policy.chunk_size as usize;
        while self.pending.len() >= cap {
            let rest = self.pending.split_off(cap);
            let chunk_payload = std::mem::replace(&mut self.pending, rest);
            self.flush_chunk(&chunk_payload)?;
        }
        Ok(())
    }

    /// Flushes any remaining buffered bytes as the final chunk of the
    /// chain (even if empty, so every chain has at least one chunk).
    ///
    /// For an ordinary chain writer this returns the new chain's own head
    /// UID. For a chain overwriter it instead records `target -> staged
    /// head` on the transaction and returns `target` — the caller always
    /// gets back the identity it asked to write to, never the staging
    /// chain's UID. If `target` was already staged earlier in this same
    /// transaction, the now-superseded staging chain is erased on the
    /// spot rather than left to leak: nothing outside this transaction
    /// ever observed it, so reclaiming it immediately is equivalent to
    /// never having allocated it.
    pub fn finish(mut self) -> Result<ChunkUid> {
        let remaining = std::mem::take(&mut self.pending);
        self.flush_chunk(&remaining)?;
        match self.overwrite_target {
            Some(target) => {
                if let Some(superseded) = self.tx.pending_overwrites.insert(target, self.first_written_chunk) {
                    self.tx.erase_chain(superseded)?;
                }
                Ok(target)
            }
            None => Ok(self.first_written_chunk),
        }
    }
}
