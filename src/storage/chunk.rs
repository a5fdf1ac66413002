//! Fixed-size chunk layout: the unit of allocation inside a [`super::StorageFile`].
//!
//! A chunk is `CHUNK_HEADER_LEN + payload_capacity` bytes:
//! `used_size:u32 BE, next_used:i64 BE, next_free:i64 BE, space[payload_capacity]`.
//! A *chain* is a singly linked list of chunks through `next_used`,
//! terminated by [`INVALID_CHUNK_UID`]. Free chunks are linked through
//! `next_free` into a single global free list anchored in the file header.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::error::Result;

/// Stable identity of a chunk: its byte offset in the file. Also doubles as
/// the identity of a B-tree node, since a node's first chunk IS its UID.
pub type ChunkUid = i64;

/// Sentinel meaning "no chunk" — terminates chains and the free list, and
/// marks the header's preserved-overwrite-log pointer as unused.
pub const INVALID_CHUNK_UID: ChunkUid = i64::MAX;

/// Bytes occupied by a chunk's header (`used_size` + `next_used` + `next_free`).
pub const CHUNK_HEADER_LEN: u64 = 4 + 8 + 8;

/// Total on-disk size of one chunk under the given payload capacity.
pub fn chunk_total_len(payload_capacity: u32) -> u64 {
    CHUNK_HEADER_LEN + payload_capacity as u64
}

const OF_USED_SIZE: u64 = 0;
const OF_NEXT_USED: u64 = 4;
const OF_NEXT_FREE: u64 = 12;
const OF_SPACE: u64 = 20;

/// One chunk's header fields, read independently of its payload.
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub used_size: u32,
    pub next_used: ChunkUid,
    pub next_free: ChunkUid,
}

/// Reads a chunk's header fields at `uid`.
pub fn read_header<F: Read + Seek>(f: &mut F, uid: ChunkUid) -> Result<ChunkHeader> {
    f.seek(SeekFrom::Start(uid as u64 + OF_USED_SIZE))?;
    let used_size = f.read_u32::<BigEndian>()?;
    let next_used = f.read_i64::<BigEndian>()?;
    let next_free = f.read_i64::<BigEndian>()?;
    Ok(ChunkHeader { used_size, next_used, next_free })
}

/// Reads a chunk's payload bytes (`used_size` bytes starting at `of_Space`).
pub fn read_payload<F: Read + Seek>(f: &mut F, uid: ChunkUid, used_size: u32) -> Result<Vec<u8>> {
    f.seek(SeekFrom::Start(uid as u64 + OF_SPACE))?;
    let mut buf = vec![0u8; used_size as usize];
    f.read_exact(&mut buf)?;
    Ok(buf)
}

/// Overwrites just the `next_used` link of a chunk (used when appending to a chain).
pub fn write_next_used<F: Write + Seek>(f: &mut F, uid: ChunkUid, next_used: ChunkUid) -> Result<()> {
    f.seek(SeekFrom::Start(uid as u64 + OF_NEXT_USED))?;
    f.write_i64::<BigEndian>(next_used)?;
    Ok(())
}

/// Writes a whole chunk: header plus payload (payload shorter than the
/// declared capacity is fine — only `used_size` bytes are meaningful).
pub fn write_chunk<F: Write + Seek>(
    f: &mut F,
    uid: ChunkUid,
    used_size: u32,
    next_used: ChunkUid,
    next_free: ChunkUid,
    payload: &[u8],
) -> Result<()> {
    f.seek(SeekFrom::Start(uid as u64 + OF_USED_SIZE))?;
    f.write_u32::<BigEndian>(used_size)?;
    f.write_i64::<BigEndian>(next_used)?;
    f.write_i64::<BigEndian>(next_free)?;
    f.write_all(payload)?;
    Ok(())
}

/// Overwrites only the `next_free` link (used when splicing a chunk into
/// the free list at commit time).
pub fn write_next_free<F: Write + Seek>(f: &mut F, uid: ChunkUid, next_free: ChunkUid) -> Result<()> {
    f.seek(SeekFrom::Start(uid as u64 + OF_NEXT_FREE))?;
    f.write_i64::<BigEndian>(next_free)?;
    Ok(())
}

/// Copies `src`'s `used_size` and payload bytes onto `dst`, leaving `dst`'s
/// `next_used` pointing at whatever `src`'s content said to point at. Used
/// to apply a staged overwrite: `src` is a freshly allocated chunk holding
/// the new content, `dst` is the pre-existing chunk whose identity
/// (file offset) must survive unchanged.
pub fn copy_chunk_onto<F: Read + Write + Seek>(f: &mut F, src: ChunkUid, dst: ChunkUid) -> Result<()> {
    f.seek(SeekFrom::Start(src as u64 + OF_USED_SIZE))?;
    let used_size = f.read_u32::<BigEndian>()?;
    let next_used = f.read_i64::<BigEndian>()?;
    let mut payload = vec![0u8; used_size as usize];
    f.seek(SeekFrom::Start(src as u64 + OF_SPACE))?;
    f.read_exact(&mut payload)?;

    f.seek(SeekFrom::Start(dst as u64 + OF_USED_SIZE))?;
    f.write_u32::<BigEndian>(used_size)?;
    f.write_i64::<BigEndian>(next_used)?;
    // next_free is irrelevant for a live chunk; leave dst's alone.
    f.seek(SeekFrom::Start(dst as u64 + OF_SPACE))?;
    f.write_all(&payload)?;
    Ok(())
}
