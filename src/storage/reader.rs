//! Bounded pool of independent OS read handles, plus the streaming chain
//! reader built on top of it.
//!
//! Each handle in the pool is its own `File` with its own OS-level file
//! position, so concurrent chain reads never interfere with one another —
//! only acquiring/releasing a handle from the pool is synchronized.

use parking_lot::{Condvar, Mutex};
use std::fs::File;
use std::io::Read;

use crate::storage::chunk::{self, ChunkUid, INVALID_CHUNK_UID};
use crate::Error;

/// A fixed-size stack of read handles, doled out to one caller at a time
/// per handle. Blocks when the pool is exhausted.
pub struct ReaderPool {
    handles: Mutex<Vec<File>>,
    available: Condvar,
}

impl ReaderPool {
    pub fn new(handles: Vec<File>) -> Self {
        ReaderPool {
            handles: Mutex::new(handles),
            available: Condvar::new(),
        }
    }

    /// Borrows one handle, blocking until one is free.
    pub fn take(&self) -> PooledReader<'_> {
        let mut guard = self.handles.lock();
        while guard.is_empty() {
            self.available.wait(&mut guard);
        }
        let file = guard.pop().expect("checked non-empty above");
        PooledReader { pool: self, file: Some(file) }
    }
}

/// A borrowed read handle. Returned to the pool on drop.
pub struct PooledReader<'a> {
    pool: &'a ReaderPool,
    file: Option<File>,
}

impl Drop for PooledReader<'_> {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            self.pool.handles.lock().push(file);
            self.pool.available.notify_one();
        }
    }
}

fn to_io(e: Error) -> std::io::Error {
    match e {
        Error::IoError(io) | Error::UnableToOpen(io) => io,
        other => std::io::Error::other(other.to_string()),
    }
}

/// Streams the bytes of a chunk chain, reading one chunk ahead at a time.
pub struct ChainReader<'a> {
    reader: PooledReader<'a>,
    next: ChunkUid,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> ChainReader<'a> {
    pub(crate) fn new(pool: &'a ReaderPool, head: ChunkUid) -> crate::error::Result<Self> {
        let reader = pool.take();
        let mut chain = ChainReader { reader, next: head, buf: Vec::new(), pos: 0 };
        chain.load_next()?;
        Ok(chain)
    }

    /// A reader over no chunks at all: the first `read` call yields EOF
    /// immediately. Used for a UID that names no chunk within the file's
    /// committed bounds — e.g. one handed out by a transaction that was
    /// never committed, so the chunk it would have named was truncated
    /// away by rollback.
    pub(crate) fn empty(pool: &'a ReaderPool) -> Self {
        ChainReader { reader: pool.take(), next: INVALID_CHUNK_UID, buf: Vec::new(), pos: 0 }
    }

    fn load_next(&mut self) -> crate::error::Result<()> {
        if self.next == INVALID_CHUNK_UID {
            self.buf.clear();
            self.pos = 0;
            return Ok(());
        }
        let file = self.reader.file.as_mut().expect("reader holds a handle");
        let header = chunk::read_header(file, self.next)?;
        self.buf = chunk::read_payload(file, self.next, header.used_size)?;
        self.next = header.next_used;
        self.pos = 0;
        Ok(())
    }
}

impl Read for ChainReader<'_> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.pos < self.buf.len() {
                let n = std::cmp::min(out.len(), self.buf.len() - self.pos);
                out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
                self.pos += n;
                return Ok(n);
            }
            if self.next == INVALID_CHUNK_UID {
                return Ok(0);
            }
            self.load_next().map_err(to_io)?;
        }
    }
}
