//! On-disk format of the index file.
//!
//! The index is a single file: a fixed header followed by an append-only
//! record log. The header carries the committed tail offset; bytes past the
//! tail are orphans from a crashed writer and are never replayed.
//!
//! # Layout
//!
//! ```text
//! [Magic: "PMIX" 4 bytes]
//! [Version: 4 bytes]
//! [Tail offset: 8 bytes]
//! [Next UID: 4 bytes]
//! [UID validity: 4 bytes]
//! [CRC32: 4 bytes]            <- over the preceding 24 bytes
//! [Records: (len: u32, crc32: u32, bincode payload) × N]
//! ```
//!
//! A record becomes visible to readers only once the header's tail has been
//! advanced past it, and the tail is advanced only after the record bytes
//! are flushed. Readers therefore see a batch of records either completely
//! or not at all.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Index file magic bytes.
pub(crate) const INDEX_MAGIC: &[u8; 4] = b"PMIX";

/// Current index format version.
pub(crate) const INDEX_VERSION: u32 = 1;

/// Size of the fixed file header; records start here.
pub(crate) const INDEX_HEADER_LEN: u64 = 28;

/// CRC32 (IEEE 802.3 polynomial).
#[inline]
#[allow(clippy::cast_possible_truncation)] // Table index always 0-255
pub(crate) fn crc32_hash(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let idx = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[idx];
    }
    !crc
}

/// Mutable fields of the index file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IndexHeader {
    /// Committed end of the record log.
    pub tail: u64,
    /// Next UID to hand out to an appended row.
    pub next_uid: u32,
    /// UID validity value; 0 until first assigned.
    pub uid_validity: u32,
}

impl IndexHeader {
    pub(crate) fn fresh() -> Self {
        Self {
            tail: INDEX_HEADER_LEN,
            next_uid: 1,
            uid_validity: 0,
        }
    }

    fn encode(&self) -> [u8; INDEX_HEADER_LEN as usize] {
        let mut buf = [0u8; INDEX_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(INDEX_MAGIC);
        buf[4..8].copy_from_slice(&INDEX_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.tail.to_le_bytes());
        buf[16..20].copy_from_slice(&self.next_uid.to_le_bytes());
        buf[20..24].copy_from_slice(&self.uid_validity.to_le_bytes());
        let crc = crc32_hash(&buf[..24]);
        buf[24..28].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8; INDEX_HEADER_LEN as usize]) -> io::Result<Self> {
        if &buf[0..4] != INDEX_MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad magic"));
        }
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != INDEX_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported index version {version}"),
            ));
        }
        let stored_crc = u32::from_le_bytes(buf[24..28].try_into().unwrap());
        if stored_crc != crc32_hash(&buf[..24]) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "header CRC mismatch"));
        }
        Ok(Self {
            tail: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            next_uid: u32::from_le_bytes(buf[16..20].try_into().unwrap()),
            uid_validity: u32::from_le_bytes(buf[20..24].try_into().unwrap()),
        })
    }
}

/// One logged index mutation.
///
/// Rows are addressed by UID, never by sequence: sequences shift as expunges
/// replay, UIDs are stable across processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) enum LogRecord {
    /// New row with its initial extension payloads.
    Append { uid: u32, exts: Vec<(u32, Vec<u8>)> },
    /// Replace one extension payload of an existing row.
    UpdateExt { uid: u32, ext: u32, data: Vec<u8> },
    /// Add a signed delta to a fixed-width unsigned extension cell.
    ///
    /// Logged as the delta so concurrent transactions compose additively.
    AtomicIncExt { uid: u32, ext: u32, diff: i64 },
    /// Remove a row. `external` marks externally-serialized changes whose
    /// target may legitimately be gone already.
    Expunge { uid: u32, external: bool },
    /// Replace one extension's header payload.
    UpdateHeaderExt { ext: u32, data: Vec<u8> },
}

/// Reads and validates the file header.
pub(crate) fn read_header(file: &mut File) -> io::Result<IndexHeader> {
    let mut buf = [0u8; INDEX_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    IndexHeader::decode(&buf)
}

/// Writes the file header in place and flushes it to disk.
pub(crate) fn write_header(file: &mut File, header: &IndexHeader) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header.encode())?;
    file.sync_data()
}

/// Appends framed records at `tail` and returns the new tail offset.
///
/// Does not touch the header; the caller advances the tail after deciding
/// on durability. Orphan bytes a crash left past `tail` are overwritten.
pub(crate) fn append_records(
    file: &mut File,
    tail: u64,
    records: &[LogRecord],
    fsync: bool,
) -> io::Result<u64> {
    let mut buf = Vec::new();
    for record in records {
        let payload = bincode::serialize(record)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "record too large"))?;
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc32_hash(&payload).to_le_bytes());
        buf.extend_from_slice(&payload);
    }

    file.seek(SeekFrom::Start(tail))?;
    file.write_all(&buf)?;
    file.flush()?;
    if fsync {
        file.sync_data()?;
    }
    Ok(tail + buf.len() as u64)
}

/// Reads the framed records in `[from, to)`.
pub(crate) fn read_records(file: &mut File, from: u64, to: u64) -> io::Result<Vec<LogRecord>> {
    if from >= to {
        return Ok(Vec::new());
    }

    let len = usize::try_from(to - from)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "log region too large"))?;
    let mut buf = vec![0u8; len];
    file.seek(SeekFrom::Start(from))?;
    file.read_exact(&mut buf)?;

    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        if pos + 8 > buf.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated record frame"));
        }
        let rec_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        let stored_crc = u32::from_le_bytes(buf[pos + 4..pos + 8].try_into().unwrap());
        pos += 8;
        if pos + rec_len > buf.len() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated record payload"));
        }
        let payload = &buf[pos..pos + rec_len];
        if crc32_hash(payload) != stored_crc {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "record CRC mismatch"));
        }
        let record = bincode::deserialize(payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        records.push(record);
        pos += rec_len;
    }
    Ok(records)
}
