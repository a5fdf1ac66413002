//! The stored value type and its tagged, fixed-width on-disk encoding.
//!
//! [`Value`] is the in-memory representation a caller works with.
//! [`PackedValue`] is what a B-tree node actually stores: a `(type_index,
//! payload)` pair, sixteen bytes on disk, always written big-endian
//! regardless of which variant it tags. Inline variants carry their bits
//! directly in `payload`; `Str` and `Blob` carry the chunk UID of a chain
//! holding their bytes.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

use crate::error::Result;
use crate::storage::{ChunkUid, Transaction, INVALID_CHUNK_UID};

/// A value stored at one B-tree entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    U32(u32),
    U64(u64),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Str(String),
    Blob(Vec<u8>),
}

impl Value {
    /// True for the two variants whose content is serialized out-of-line
    /// as a chunk chain rather than packed directly into the entry.
    pub fn is_blob(&self) -> bool {
        matches!(self, Value::Str(_) | Value::Blob(_))
    }

    fn type_index(&self) -> u64 {
        match self {
            Value::U32(_) => 0,
            Value::U64(_) => 1,
            Value::I32(_) => 2,
            Value::I64(_) => 3,
            Value::F32(_) => 4,
            Value::F64(_) => 5,
            Value::Str(_) => 6,
            Value::Blob(_) => 7,
        }
    }
}

/// The on-disk, tagged encoding of a [`Value`]: two big-endian `u64`
/// fields, always, regardless of variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedValue {
    pub type_index: u64,
    pub payload: u64,
}

impl PackedValue {
    pub fn read<R: Read>(r: &mut R) -> Result<Self> {
        let type_index = r.read_u64::<BigEndian>()?;
        let payload = r.read_u64::<BigEndian>()?;
        Ok(PackedValue { type_index, payload })
    }

    pub fn write<W: std::io::Write>(&self, w: &mut W) -> Result<()> {
        w.write_u64::<BigEndian>(self.type_index)?;
        w.write_u64::<BigEndian>(self.payload)?;
        Ok(())
    }
}

/// Packs `value` into a [`PackedValue`], writing a fresh chain through
/// `tx` for blob variants. Each call allocates its own chain; overwriting
/// an existing entry's blob chain is the caller's responsibility (erase
/// the old chain, then pack the new value).
pub fn pack(tx: &mut Transaction<'_>, value: &Value) -> Result<PackedValue> {
    let type_index = value.type_index();
    let payload = match value {
        Value::U32(v) => *v as u64,
        Value::U64(v) => *v,
        Value::I32(v) => sign_extend(*v as i64),
        Value::I64(v) => sign_extend(*v),
        Value::F32(v) => v.to_bits() as u64,
        Value::F64(v) => v.to_bits(),
        Value::Str(s) => write_blob(tx, s.as_bytes())? as u64,
        Value::Blob(b) => write_blob(tx, b)? as u64,
    };
    Ok(PackedValue { type_index, payload })
}

/// Unpacks a [`PackedValue`] back into a [`Value`], reading a blob
/// variant's chain from `storage` if needed.
pub fn unpack(storage: &crate::storage::StorageFile, packed: &PackedValue) -> Result<Value> {
    match packed.type_index {
        0 => Ok(Value::U32(packed.payload as u32)),
        1 => Ok(Value::U64(packed.payload)),
        2 => Ok(Value::I32(un_sign_extend(packed.payload) as i32)),
        3 => Ok(Value::I64(un_sign_extend(packed.payload))),
        4 => Ok(Value::F32(f32::from_bits(packed.payload as u32))),
        5 => Ok(Value::F64(f64::from_bits(packed.payload))),
        6 => {
            let bytes = read_blob(storage, packed.payload as ChunkUid)?;
            String::from_utf8(bytes).map(Value::Str).map_err(|_| crate::Error::InvalidData)
        }
        7 => Ok(Value::Blob(read_blob(storage, packed.payload as ChunkUid)?)),
        _ => Err(crate::Error::InvalidData),
    }
}

fn sign_extend(v: i64) -> u64 {
    v as u64
}

fn un_sign_extend(v: u64) -> i64 {
    v as i64
}

fn write_blob(tx: &mut Transaction<'_>, bytes: &[u8]) -> Result<ChunkUid> {
    let mut w = tx.get_chain_writer();
    w.write_all(bytes)?;
    w.finish()
}

fn read_blob(storage: &crate::storage::StorageFile, uid: ChunkUid) -> Result<Vec<u8>> {
    if uid == INVALID_CHUNK_UID {
        return Ok(Vec::new());
    }
    let mut reader = storage.get_chain_reader(uid)?;
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageFile;
    use crate::Policy;

    fn open() -> (tempfile::TempDir, StorageFile) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vol.jb");
        let storage = StorageFile::open(&path, Policy::default()).unwrap();
        (dir, storage)
    }

    #[test]
    fn inline_numeric_round_trips() {
        let (_dir, storage) = open();
        for v in [
            Value::U32(42),
            Value::U64(u64::MAX),
            Value::I32(-7),
            Value::I64(i64::MIN),
            Value::F32(1.5),
            Value::F64(-2.25),
        ] {
            let mut txn = storage.open_transaction().unwrap();
            let packed = pack(&mut txn, &v).unwrap();
            txn.commit().unwrap();
            assert_eq!(unpack(&storage, &packed).unwrap(), v);
        }
    }

    #[test]
    fn blob_variants_round_trip_through_a_chain() {
        let (_dir, storage) = open();
        let mut txn = storage.open_transaction().unwrap();
        let s = Value::Str("a somewhat long string that spans chunks".to_string());
        let packed = pack(&mut txn, &s).unwrap();
        txn.commit().unwrap();
        assert_eq!(unpack(&storage, &packed).unwrap(), s);

        let mut txn = storage.open_transaction().unwrap();
        let blob = Value::Blob(vec![9u8; 500]);
        let packed = pack(&mut txn, &blob).unwrap();
        txn.commit().unwrap();
        assert_eq!(unpack(&storage, &packed).unwrap(), blob);
    }

    #[test]
    fn negative_float_preserves_sign_bit() {
        let (_dir, storage) = open();
        let mut txn = storage.open_transaction().unwrap();
        let v = Value::F64(-0.0);
        let packed = pack(&mut txn, &v).unwrap();
        txn.commit().unwrap();
        match unpack(&storage, &packed).unwrap() {
            Value::F64(f) => assert!(f.is_sign_negative()),
            _ => panic!("wrong variant"),
        }
    }
}
