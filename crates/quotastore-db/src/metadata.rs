//! Per-origin binary metadata records
//!
//! Every origin directory carries a small fixed record (`.metadata-v2`)
//! with the state that must survive a cache rebuild. Field order is
//! fixed and little-endian:
//!
//! ```text
//! i64  last access time (µs)
//! u8   persisted flag
//! u32  reserved = 0
//! u32  reserved = 0
//! str  (length-prefixed, unused)
//! str  (length-prefixed, unused)
//! str  (length-prefixed) storage origin
//! u8   isPrivate flag
//! ```
//!
//! The record is written to a temporary name and renamed into place. A
//! missing or corrupt record, or a directory whose leaf name no longer
//! matches the current sanitization of the recorded origin, is rebuilt
//! from the directory itself.

use crate::paths::{METADATA_FILE_NAME, METADATA_TMP_FILE_NAME};
use crate::sanitize::{is_leaf_name_current, parse_origin_leaf};
use bytes::{Buf, BufMut, BytesMut};
use quotastore_common::{
    Error, FullOriginMetadata, OriginMetadata, PersistenceType, Result,
};
use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::warn;

/// Upper bound on an embedded string; anything larger is corruption.
const MAX_STRING_LEN: usize = 1024 * 1024;

/// Serialize one metadata record.
#[must_use]
pub fn encode_origin_metadata(metadata: &FullOriginMetadata) -> Vec<u8> {
    let mut buf = BytesMut::new();

    buf.put_i64_le(metadata.last_access_time);
    buf.put_u8(u8::from(metadata.persisted));
    // Reserved data 1
    buf.put_u32_le(0);
    // Reserved data 2
    buf.put_u32_le(0);
    // Two currently unused strings (used to be suffix and group).
    put_string(&mut buf, "");
    put_string(&mut buf, "");
    put_string(&mut buf, &metadata.metadata.storage_origin);
    buf.put_u8(u8::from(metadata.metadata.is_private));

    buf.to_vec()
}

/// Parse one metadata record.
pub fn decode_origin_metadata(
    bytes: &[u8],
    persistence_type: PersistenceType,
) -> Result<FullOriginMetadata> {
    let mut buf = bytes;

    let last_access_time = take_i64(&mut buf)?;
    let persisted = take_bool(&mut buf)?;
    let _reserved1 = take_u32(&mut buf)?;
    let _reserved2 = take_u32(&mut buf)?;
    let _unused1 = take_string(&mut buf)?;
    let _unused2 = take_string(&mut buf)?;
    let storage_origin = take_string(&mut buf)?;
    let is_private = take_bool(&mut buf)?;

    if storage_origin.is_empty() {
        return Err(corrupt("empty storage origin"));
    }

    let mut origin_metadata = OriginMetadata::new(storage_origin, persistence_type);
    origin_metadata.is_private = is_private;

    Ok(FullOriginMetadata {
        metadata: origin_metadata,
        persisted,
        last_access_time,
    })
}

/// Write the record for one origin directory (tmp file + rename).
pub fn write_origin_metadata(
    origin_dir: &Path,
    metadata: &FullOriginMetadata,
) -> Result<()> {
    let tmp = origin_dir.join(METADATA_TMP_FILE_NAME);
    fs::write(&tmp, encode_origin_metadata(metadata))?;
    fs::rename(&tmp, origin_dir.join(METADATA_FILE_NAME))?;
    Ok(())
}

/// Read the record from one origin directory.
pub fn read_origin_metadata(
    origin_dir: &Path,
    persistence_type: PersistenceType,
) -> Result<FullOriginMetadata> {
    let bytes = fs::read(origin_dir.join(METADATA_FILE_NAME))?;
    decode_origin_metadata(&bytes, persistence_type)
}

/// Rebuild the record from the directory itself: access time from the
/// directory modification time, origin from the parsed leaf name.
pub fn restore_origin_metadata(
    origin_dir: &Path,
    persistence_type: PersistenceType,
) -> Result<FullOriginMetadata> {
    let leaf = origin_dir
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::InvalidOrigin(origin_dir.display().to_string()))?;
    let origin = parse_origin_leaf(leaf)?;

    let modified = fs::metadata(origin_dir)?.modified()?;
    let last_access_time = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0);

    let metadata = FullOriginMetadata {
        metadata: OriginMetadata::new(origin, persistence_type),
        persisted: false,
        last_access_time,
    };
    write_origin_metadata(origin_dir, &metadata)?;
    Ok(metadata)
}

/// Read the record, rebuilding it when it is missing, corrupt, or its
/// directory name has drifted from the current sanitization.
pub fn load_origin_metadata_with_restore(
    origin_dir: &Path,
    persistence_type: PersistenceType,
) -> Result<FullOriginMetadata> {
    match read_origin_metadata(origin_dir, persistence_type) {
        Ok(metadata) => {
            let leaf = origin_dir.file_name().and_then(|name| name.to_str());
            if leaf.is_some_and(|leaf| {
                is_leaf_name_current(&metadata.metadata.storage_origin, leaf)
            }) {
                Ok(metadata)
            } else {
                warn!(
                    dir = %origin_dir.display(),
                    origin = %metadata.metadata.storage_origin,
                    "origin directory name drifted, rebuilding metadata"
                );
                restore_origin_metadata(origin_dir, persistence_type)
            }
        }
        Err(e) if e.is_not_found() || e.is_corruption() => {
            warn!(
                dir = %origin_dir.display(),
                error = %e,
                "origin metadata unreadable, rebuilding"
            );
            restore_origin_metadata(origin_dir, persistence_type)
        }
        Err(e) => Err(e),
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32_le(u32::try_from(value.len()).unwrap_or(u32::MAX));
    buf.put_slice(value.as_bytes());
}

fn take_i64(buf: &mut &[u8]) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(corrupt("truncated record"));
    }
    Ok(buf.get_i64_le())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(corrupt("truncated record"));
    }
    Ok(buf.get_u32_le())
}

fn take_bool(buf: &mut &[u8]) -> Result<bool> {
    if buf.remaining() < 1 {
        return Err(corrupt("truncated record"));
    }
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(corrupt(format!("bad boolean value {other}"))),
    }
}

fn take_string(buf: &mut &[u8]) -> Result<String> {
    let len = take_u32(buf)? as usize;
    if len > MAX_STRING_LEN {
        return Err(corrupt(format!("string length {len} out of range")));
    }
    if buf.remaining() < len {
        return Err(corrupt("truncated record"));
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| corrupt("string is not UTF-8"))
}

fn corrupt(detail: impl Into<String>) -> Error {
    Error::corruption("origin metadata", detail)
}
