//! Read-side snapshot of the index.
//!
//! A view holds the rows materialized from the record log up to a committed
//! tail offset. Refreshing replays only the delta since the last refresh;
//! it never observes a partially committed batch because the tail is
//! advanced after the records are durable.

use tracing::warn;

use super::log::{LogRecord, INDEX_HEADER_LEN};
use super::ExtDef;

/// One live row.
#[derive(Debug, Clone)]
pub(crate) struct Row {
    pub uid: u32,
    /// Per-extension payload, indexed by extension id.
    pub exts: Vec<Option<Vec<u8>>>,
}

/// Materialized snapshot of the index, advancing monotonically.
#[derive(Debug, Clone)]
pub struct View {
    rows: Vec<Row>,
    ext_headers: Vec<Option<Vec<u8>>>,
    next_uid: u32,
    uid_validity: u32,
    /// Log offset up to which `rows` reflects the record stream.
    applied: u64,
}

impl View {
    pub(crate) fn empty(ext_count: usize) -> Self {
        Self {
            rows: Vec::new(),
            ext_headers: vec![None; ext_count],
            next_uid: 1,
            uid_validity: 0,
            applied: INDEX_HEADER_LEN,
        }
    }

    /// Number of live rows; sequences run `1..=messages_count`.
    #[must_use]
    pub fn messages_count(&self) -> u32 {
        u32::try_from(self.rows.len()).unwrap_or(u32::MAX)
    }

    /// Next UID the index will assign.
    #[must_use]
    pub fn next_uid(&self) -> u32 {
        self.next_uid
    }

    /// UID validity; 0 until first assigned.
    #[must_use]
    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub(crate) fn applied(&self) -> u64 {
        self.applied
    }

    /// UID of the row at 1-based `seq`, or `None` when out of range.
    #[must_use]
    pub fn lookup_uid(&self, seq: u32) -> Option<u32> {
        if seq == 0 {
            return None;
        }
        self.rows.get(seq as usize - 1).map(|row| row.uid)
    }

    /// Sequence of the row with `uid`.
    ///
    /// UIDs are monotone across rows, so this is a binary search.
    #[must_use]
    pub fn lookup_seq(&self, uid: u32) -> Option<u32> {
        self.rows
            .binary_search_by_key(&uid, |row| row.uid)
            .ok()
            .map(|idx| idx as u32 + 1)
    }

    /// First and last sequence whose UIDs fall inside `[uid1, uid2]`.
    #[must_use]
    pub fn lookup_seq_range(&self, uid1: u32, uid2: u32) -> Option<(u32, u32)> {
        let start = self.rows.partition_point(|row| row.uid < uid1);
        let end = self.rows.partition_point(|row| row.uid <= uid2);
        if start >= end {
            None
        } else {
            Some((start as u32 + 1, end as u32))
        }
    }

    /// Extension payload of the row at `seq`, or `None` when absent.
    #[must_use]
    pub fn lookup_ext(&self, seq: u32, ext: super::ExtId) -> Option<&[u8]> {
        if seq == 0 {
            return None;
        }
        self.rows
            .get(seq as usize - 1)
            .and_then(|row| row.exts.get(ext.0))
            .and_then(|data| data.as_deref())
    }

    /// Extension header payload; empty until first written.
    #[must_use]
    pub fn header_ext(&self, ext: super::ExtId) -> &[u8] {
        self.ext_headers
            .get(ext.0)
            .and_then(|data| data.as_deref())
            .unwrap_or(&[])
    }

    /// Replays one record into the snapshot.
    pub(crate) fn apply(&mut self, record: LogRecord, exts: &[ExtDef]) {
        match record {
            LogRecord::Append { uid, exts: payloads } => {
                let mut row = Row {
                    uid,
                    exts: vec![None; exts.len()],
                };
                for (ext, data) in payloads {
                    if let Some(slot) = row.exts.get_mut(ext as usize) {
                        *slot = Some(data);
                    }
                }
                self.rows.push(row);
                if uid >= self.next_uid {
                    self.next_uid = uid + 1;
                }
            }
            LogRecord::UpdateExt { uid, ext, data } => {
                if let Some(idx) = self.row_index(uid) {
                    if let Some(slot) = self.rows[idx].exts.get_mut(ext as usize) {
                        *slot = Some(data);
                    }
                }
            }
            LogRecord::AtomicIncExt { uid, ext, diff } => {
                let Some(idx) = self.row_index(uid) else {
                    return;
                };
                let Some(def) = exts.get(ext as usize) else {
                    return;
                };
                let width = def.record_size;
                let slot = match self.rows[idx].exts.get_mut(ext as usize) {
                    Some(slot) => slot,
                    None => return,
                };
                let current = decode_uint(slot.as_deref().unwrap_or(&[]), width);
                let updated = current.wrapping_add_signed(diff);
                *slot = Some(encode_uint(updated, width));
            }
            LogRecord::Expunge { uid, external } => {
                if let Some(idx) = self.row_index(uid) {
                    self.rows.remove(idx);
                } else if !external {
                    warn!(uid, "expunge of unknown row in record log");
                }
            }
            LogRecord::UpdateHeaderExt { ext, data } => {
                if let Some(slot) = self.ext_headers.get_mut(ext as usize) {
                    *slot = Some(data);
                }
            }
        }
    }

    pub(crate) fn set_applied(&mut self, applied: u64) {
        self.applied = applied;
    }

    pub(crate) fn set_header(&mut self, next_uid: u32, uid_validity: u32) {
        self.next_uid = next_uid;
        self.uid_validity = uid_validity;
    }

    fn row_index(&self, uid: u32) -> Option<usize> {
        self.rows.binary_search_by_key(&uid, |row| row.uid).ok()
    }
}

/// Decodes an unsigned LE integer of `width` bytes; absent data reads as 0.
fn decode_uint(data: &[u8], width: usize) -> u64 {
    let mut buf = [0u8; 8];
    let n = width.min(8).min(data.len());
    buf[..n].copy_from_slice(&data[..n]);
    u64::from_le_bytes(buf)
}

/// Encodes an unsigned LE integer truncated to `width` bytes.
fn encode_uint(value: u64, width: usize) -> Vec<u8> {
    value.to_le_bytes()[..width.min(8)].to_vec()
}
