//! Chunked file layout, the single-writer transaction protocol, crash
//! recovery, and the bounded pool of streaming readers.
//!
//! [`StorageFile`] owns the physical file. Opening it acquires a named
//! inter-process lock (so a second process opening the same path fails
//! fast with [`crate::Error::AlreadyOpened`]), then either deploys a fresh
//! header or runs crash recovery against an existing one. From then on, at
//! most one [`transaction::Transaction`] can be open at a time, and up to
//! `policy.reader_number` chain reads can run concurrently.

pub mod chunk;
pub mod header;
pub mod reader;
pub mod transaction;

pub use chunk::{ChunkUid, INVALID_CHUNK_UID};
pub use reader::ChainReader;
pub use transaction::{ChainWriter, Transaction};

use fs4::fs_std::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Error, Result};
use crate::Policy;
use header::{Layout, TransactionState};

/// Tracks the first I/O failure a `StorageFile` has seen. Once set, every
/// subsequent writing operation returns the same status without touching
/// disk again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Clear,
    IoError,
    InvalidData,
}

/// A single physical volume's backing file.
pub struct StorageFile {
    policy: Policy,
    layout: Layout,
    chunk_total_len: u64,
    writer: Mutex<File>,
    readers: reader::ReaderPool,
    status: Mutex<Status>,
    newly_created: bool,
}

impl StorageFile {
    /// Opens (creating if necessary) the file at `path` under `policy`.
    ///
    /// Fails with [`Error::AlreadyOpened`] if another handle already holds
    /// the file's exclusive lock, with [`Error::IncompatibleFile`] if an
    /// existing file's compatibility stamp doesn't match `policy`, and runs
    /// crash recovery (completing or rolling back a pending transaction)
    /// before returning for an existing file.
    pub fn open<P: AsRef<Path>>(path: P, policy: Policy) -> Result<Self> {
        policy.validate()?;
        let path = path.as_ref();

        let mut writer_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(Error::UnableToOpen)?;
        writer_file
            .try_lock_exclusive()
            .map_err(|_| Error::AlreadyOpened)?;

        let mut reader_handles = Vec::with_capacity(policy.reader_number);
        for _ in 0..policy.reader_number {
            let rf = OpenOptions::new()
                .read(true)
                .open(path)
                .map_err(Error::UnableToOpen)?;
            reader_handles.push(rf);
        }

        let layout = Layout::new(&policy);
        let chunk_total_len = chunk::chunk_total_len(policy.chunk_size);
        let file_len = writer_file.metadata().map_err(Error::UnableToOpen)?.len();
        let newly_created = file_len == 0;

        if newly_created {
            log::debug!("deploying new storage file at {}", path.display());
            deploy(&mut writer_file, &layout, &policy)?;
        } else {
            let stamp = header::read_compatibility_stamp(&mut writer_file, &layout)?;
            if stamp != header::compatibility_stamp(&policy) {
                return Err(Error::IncompatibleFile);
            }
            let applied = transaction::apply_pending_transaction(&mut writer_file, &layout)?;
            if applied {
                log::debug!("completed a pending transaction found on open");
            } else {
                log::debug!("rolled back an incomplete transaction found on open");
            }
        }

        Ok(StorageFile {
            policy,
            layout,
            chunk_total_len,
            writer: Mutex::new(writer_file),
            readers: reader::ReaderPool::new(reader_handles),
            status: Mutex::new(Status::Clear),
            newly_created,
        })
    }

    /// True if `open` created the file rather than opening an existing one.
    pub fn newly_created(&self) -> bool {
        self.newly_created
    }

    /// The stable identity of the root B-tree node. This does not follow
    /// the usual "UID is the chunk's file offset at allocation time" rule
    /// quite the way later nodes do: it is pinned to `layout.of_root`
    /// permanently, and the B-tree layer treats it as always resident
    /// rather than something the cache can evict.
    pub fn root_uid(&self) -> ChunkUid {
        self.layout.of_root as ChunkUid
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// The committed `file_size` — also the boundary below which a chunk
    /// UID is known to have been written to disk.
    pub fn committed_file_size(&self) -> Result<i64> {
        self.check_status()?;
        let mut writer = self.writer.lock();
        Ok(header::read_transactional_data(&mut *writer, &self.layout)?.file_size)
    }

    /// Returns the sticky error this file has latched, if any.
    pub fn status(&self) -> Result<()> {
        self.check_status()
    }

    fn check_status(&self) -> Result<()> {
        match *self.status.lock() {
            Status::Clear => Ok(()),
            Status::IoError => Err(Error::IoError(std::io::Error::other("storage file is in a sticky error state"))),
            Status::InvalidData => Err(Error::InvalidData),
        }
    }

    fn latch_status(&self, err: Error) -> Error {
        let mut status = self.status.lock();
        if *status == Status::Clear {
            *status = match &err {
                Error::IoError(_) | Error::UnableToOpen(_) => Status::IoError,
                Error::InvalidData => Status::InvalidData,
                _ => return err,
            };
            log::warn!("storage file entering sticky error state: {err}");
        }
        err
    }

    /// Reads the whole Bloom filter bitset into `buf`.
    pub fn read_bloom(&self, buf: &mut [u8]) -> Result<()> {
        self.check_status()?;
        let mut writer = self.writer.lock();
        header::read_bloom(&mut *writer, &self.layout, buf).map_err(|e| self.latch_status(e))
    }

    /// Overwrites one byte of the Bloom filter bitset in place. Bloom
    /// updates are not part of the chunk-chain transaction protocol — the
    /// filter is allowed to be slightly ahead of a rolled-back transaction,
    /// which only risks a few extra false positives, never a false
    /// negative.
    pub fn add_bloom_digest(&self, byte_no: u64, byte: u8) -> Result<()> {
        self.check_status()?;
        let mut writer = self.writer.lock();
        header::write_bloom_byte(&mut *writer, &self.layout, byte_no, byte).map_err(|e| self.latch_status(e))
    }

    /// Opens the single outstanding transaction. Blocks if another
    /// transaction is already open on this file.
    pub fn open_transaction(&self) -> Result<Transaction<'_>> {
        self.check_status()?;
        let guard = self.writer.lock();
        Transaction::begin(self, guard)
    }

    /// Opens a streaming reader over the chunk chain starting at `uid`,
    /// borrowing one handle from the reader pool for its lifetime.
    ///
    /// A `uid` outside the file's committed bounds — the UID a dropped,
    /// uncommitted transaction handed out before rolling back its
    /// allocations away, say — yields a reader that returns EOF on its
    /// first read rather than an error: the committed file simply has
    /// nothing at that offset, which reads the same as an empty chain.
    pub fn get_chain_reader(&self, uid: ChunkUid) -> Result<ChainReader<'_>> {
        let committed_bound = self.committed_file_size()?;
        if uid == INVALID_CHUNK_UID || uid < self.layout.of_root as i64 || uid >= committed_bound {
            return Ok(ChainReader::empty(&self.readers));
        }
        ChainReader::new(&self.readers, uid).map_err(|e| self.latch_status(e))
    }
}

fn deploy(writer: &mut File, layout: &Layout, policy: &Policy) -> Result<()> {
    writer.set_len(layout.of_root).map_err(Error::from)?;
    header::write_compatibility_stamp(writer, layout, header::compatibility_stamp(policy))?;
    let initial = TransactionState { file_size: layout.of_root as i64, free_space: INVALID_CHUNK_UID };
    header::write_transactional_data(writer, layout, initial)?;
    // Deliberately invalid: no valid transaction is pending yet, and this
    // must never accidentally equal transaction_hash(initial).
    let bogus_crc = header::transaction_hash(initial).wrapping_add(1);
    header::write_transaction_crc(writer, layout, bogus_crc)?;
    header::write_preserved_log(writer, layout, INVALID_CHUNK_UID)?;
    let zero_bloom = vec![0u8; policy.bloom_size as usize];
    header::write_bloom_all(writer, layout, &zero_bloom)?;
    Ok(())
}

/// Convenience used by tests and by `StorageFile::open`'s error path:
/// reads a chunk's raw header fields without going through a transaction.
#[cfg(test)]
pub(crate) fn peek_chunk_header(writer: &mut File, uid: ChunkUid) -> Result<chunk::ChunkHeader> {
    writer.seek(SeekFrom::Start(uid as u64))?;
    chunk::read_header(writer, uid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> Policy {
        Policy { chunk_size: 31, ..Policy::default() }
    }

    #[test]
    fn open_creates_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        {
            let f = StorageFile::open(&path, policy()).unwrap();
            assert!(f.newly_created());
        }
        {
            let f = StorageFile::open(&path, policy()).unwrap();
            assert!(!f.newly_created());
        }
    }

    #[test]
    fn second_open_fails_with_already_opened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        let _first = StorageFile::open(&path, policy()).unwrap();
        let second = StorageFile::open(&path, policy());
        assert!(matches!(second, Err(Error::AlreadyOpened)));
    }

    #[test]
    fn incompatible_policy_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        {
            let _f = StorageFile::open(&path, policy()).unwrap();
        }
        let mut other = policy();
        other.chunk_size = 64;
        let reopened = StorageFile::open(&path, other);
        assert!(matches!(reopened, Err(Error::IncompatibleFile)));
    }

    #[test]
    fn rollback_without_commit_leaves_file_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        let f = StorageFile::open(&path, policy()).unwrap();
        let committed_before = f.committed_file_size().unwrap();
        {
            let mut txn = f.open_transaction().unwrap();
            let mut w = txn.get_chain_writer();
            w.write_all(b"hello world, this is more than one chunk of data").unwrap();
            let _uid = w.finish().unwrap();
            // transaction dropped without commit
        }
        let committed_after = f.committed_file_size().unwrap();
        assert_eq!(committed_before, committed_after);
    }

    #[test]
    fn commit_then_reopen_reads_back_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        let uid = {
            let f = StorageFile::open(&path, policy()).unwrap();
            let mut txn = f.open_transaction().unwrap();
            let mut w = txn.get_chain_writer();
            w.write_all(b"payload that spans several 31-byte chunks of data").unwrap();
            let uid = w.finish().unwrap();
            txn.commit().unwrap();
            uid
        };
        let f = StorageFile::open(&path, policy()).unwrap();
        let mut reader = f.get_chain_reader(uid).unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload that spans several 31-byte chunks of data");
    }

    #[test]
    fn truncated_crc_rolls_back_to_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        let layout;
        let committed_before;
        {
            let f = StorageFile::open(&path, policy()).unwrap();
            layout = f.layout;
            committed_before = f.committed_file_size().unwrap();
            let mut txn = f.open_transaction().unwrap();
            let mut w = txn.get_chain_writer();
            w.write_all(b"some bytes to extend the file with").unwrap();
            w.finish().unwrap();
            // Stage the transaction but corrupt its CRC before it can be
            // applied, simulating a crash between the two writes.
            let state = TransactionState { file_size: txn.file_size, free_space: txn.free_space };
            header::write_transaction(&mut *txn.writer, &layout, state).unwrap();
            let mut bad_crc_bytes = header::transaction_hash(state).to_be_bytes();
            bad_crc_bytes[7] ^= 0xFF;
            txn.writer.seek(SeekFrom::Start(layout.of_transaction_crc)).unwrap();
            txn.writer.write_all(&bad_crc_bytes).unwrap();
            std::mem::forget(txn); // skip rollback-on-drop; we want the staged (corrupt) state on disk
        }
        let f = StorageFile::open(&path, policy()).unwrap();
        assert_eq!(f.committed_file_size().unwrap(), committed_before);
    }

    #[test]
    fn free_list_reuse_after_erase() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        let f = StorageFile::open(&path, policy()).unwrap();

        let first_uid = {
            let mut txn = f.open_transaction().unwrap();
            let mut w = txn.get_chain_writer();
            w.write_all(&[1u8; 10]).unwrap();
            let uid = w.finish().unwrap();
            txn.commit().unwrap();
            uid
        };

        let size_after_first = f.committed_file_size().unwrap();

        {
            let mut txn = f.open_transaction().unwrap();
            txn.erase_chain(first_uid).unwrap();
            txn.commit().unwrap();
        }

        // The erased chunk should be reused rather than growing the file.
        let second_uid = {
            let mut txn = f.open_transaction().unwrap();
            let mut w = txn.get_chain_writer();
            w.write_all(&[2u8; 5]).unwrap();
            let uid = w.finish().unwrap();
            txn.commit().unwrap();
            uid
        };
        assert_eq!(second_uid, first_uid);
        assert_eq!(f.committed_file_size().unwrap(), size_after_first);
    }

    #[test]
    fn overwriting_the_same_uid_twice_in_one_transaction_does_not_corrupt_the_free_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        let small_chunks = Policy { chunk_size: 8, ..Policy::default() };
        let f = StorageFile::open(&path, small_chunks).unwrap();

        let uid = {
            let mut txn = f.open_transaction().unwrap();
            let mut w = txn.get_chain_writer();
            w.write_all(b"a payload long enough to span several 8-byte chunks").unwrap();
            let uid = w.finish().unwrap();
            txn.commit().unwrap();
            uid
        };

        {
            let mut txn = f.open_transaction().unwrap();
            {
                let mut w = txn.get_chain_overwriter(uid).unwrap();
                w.write_all(b"first overwrite, also spanning multiple chunks").unwrap();
                w.finish().unwrap();
            }
            {
                let mut w = txn.get_chain_overwriter(uid).unwrap();
                w.write_all(b"second overwrite of the same uid, different length").unwrap();
                w.finish().unwrap();
            }
            txn.commit().unwrap();
        }

        let mut reader = f.get_chain_reader(uid).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"second overwrite of the same uid, different length");

        // A corrupted (self-referential) free list would keep handing out
        // the same chunk offset forever; a healthy one hands out a fresh
        // offset every time.
        let mut seen = std::collections::HashSet::new();
        for i in 0..20u8 {
            let mut txn = f.open_transaction().unwrap();
            let mut w = txn.get_chain_writer();
            w.write_all(&[i; 3]).unwrap();
            let new_uid = w.finish().unwrap();
            txn.commit().unwrap();
            assert!(seen.insert(new_uid), "chunk uid {new_uid} handed out more than once");
        }
    }
}
