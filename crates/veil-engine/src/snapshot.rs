//! Versioned engine snapshots
//!
//! Layout, little-endian:
//!
//! | offset | field                    |
//! |--------|--------------------------|
//! | 0      | u8[4] magic = "VEIL"     |
//! | 4      | u16 version              |
//! | 6      | u16 flags                |
//! | 8      | u32 payload CRC32        |
//! | 12     | u32 payload length       |
//! | 16     | payload (JSON)           |
//!
//! A snapshot that fails any check is a cache miss for the caller, never
//! something to repair.

use serde::{Deserialize, Serialize};

use crate::hash::crc32;
use crate::list::FilterList;

/// Magic bytes: "VEIL"
pub const MAGIC: [u8; 4] = *b"VEIL";

/// Current format version
pub const VERSION: u16 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Header field byte offsets.
pub mod header {
    pub const MAGIC: usize = 0;
    pub const VERSION: usize = 4;
    pub const FLAGS: usize = 6;
    pub const PAYLOAD_CRC32: usize = 8;
    pub const PAYLOAD_LEN: usize = 12;
}

/// Error type for snapshot loading.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("Invalid magic bytes")]
    InvalidMagic,
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),
    #[error("CRC32 mismatch: stored={stored}, computed={computed}")]
    Crc32Mismatch { stored: u32, computed: u32 },
    #[error("Data too short")]
    DataTooShort,
    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct PayloadRef<'a> {
    lists: Vec<&'a FilterList>,
}

#[derive(Deserialize)]
struct Payload {
    lists: Vec<FilterList>,
}

/// Snapshot metadata, readable without decoding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub version: u16,
    pub flags: u16,
    pub crc32: u32,
    pub payload_len: usize,
}

pub(crate) fn encode<'a>(
    lists: impl IntoIterator<Item = &'a FilterList>,
) -> Result<Vec<u8>, SnapshotError> {
    let payload = serde_json::to_vec(&PayloadRef {
        lists: lists.into_iter().collect(),
    })?;

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&crc32(&payload).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Validate the header and checksum.
pub fn inspect(data: &[u8]) -> Result<SnapshotInfo, SnapshotError> {
    if data.len() < HEADER_SIZE {
        return Err(SnapshotError::DataTooShort);
    }
    if data[header::MAGIC..header::MAGIC + 4] != MAGIC {
        return Err(SnapshotError::InvalidMagic);
    }

    let version = read_u16_le(data, header::VERSION);
    if version != VERSION {
        return Err(SnapshotError::UnsupportedVersion(version));
    }

    let flags = read_u16_le(data, header::FLAGS);
    let stored = read_u32_le(data, header::PAYLOAD_CRC32);
    let payload_len = read_u32_le(data, header::PAYLOAD_LEN) as usize;
    if data.len() < HEADER_SIZE + payload_len {
        return Err(SnapshotError::DataTooShort);
    }

    let computed = crc32(&data[HEADER_SIZE..HEADER_SIZE + payload_len]);
    if stored != computed {
        return Err(SnapshotError::Crc32Mismatch { stored, computed });
    }

    Ok(SnapshotInfo {
        version,
        flags,
        crc32: stored,
        payload_len,
    })
}

pub(crate) fn decode(data: &[u8]) -> Result<Vec<FilterList>, SnapshotError> {
    let info = inspect(data)?;
    let payload_bytes = &data[HEADER_SIZE..HEADER_SIZE + info.payload_len];
    let payload: Payload = serde_json::from_slice(payload_bytes)?;
    Ok(payload.lists)
}

#[inline]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}
