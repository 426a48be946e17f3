//! Buffered index transactions.
//!
//! A transaction collects mutations in memory; nothing touches the log
//! until it is committed through an open [`super::SyncScope`], which holds
//! the cross-process lock. Dropping an uncommitted transaction discards it.

use rustc_hash::FxHashMap;

use super::log::LogRecord;
use super::ExtId;

/// Transaction behavior flags.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransactionFlags {
    /// Fsync the record bytes before advancing the committed tail.
    pub fsync: bool,
    /// The caller vouches that these changes are serialized externally;
    /// expunges of rows that are already gone are tolerated on replay.
    pub external: bool,
}

/// An in-memory batch of index mutations.
///
/// Existing rows are addressed by UID (stable across refreshes); rows
/// appended inside the transaction are addressed by the handle returned
/// from [`Transaction::append`].
#[derive(Debug, Default)]
pub struct Transaction {
    flags: TransactionFlags,
    ops: Vec<LogRecord>,
    /// Pending new rows: initial extension payloads per row.
    appends: Vec<Vec<(u32, Vec<u8>)>>,
    first_uid: Option<u32>,
    uid_validity: Option<u32>,
    /// Cumulative in-transaction delta per (uid, ext) cell.
    inc_totals: FxHashMap<(u32, u32), i64>,
}

impl Transaction {
    /// Starts an empty transaction.
    #[must_use]
    pub fn new(flags: TransactionFlags) -> Self {
        Self {
            flags,
            ..Self::default()
        }
    }

    pub(crate) fn flags(&self) -> TransactionFlags {
        self.flags
    }

    /// True when committing would be a no-op.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.appends.is_empty() && self.uid_validity.is_none()
    }

    /// Queues a new row and returns its handle within this transaction.
    pub fn append(&mut self) -> usize {
        self.appends.push(Vec::new());
        self.appends.len() - 1
    }

    /// Number of rows queued for append.
    #[must_use]
    pub fn append_count(&self) -> u32 {
        u32::try_from(self.appends.len()).unwrap_or(u32::MAX)
    }

    /// Sets an initial extension payload on a pending row.
    pub fn append_update_ext(&mut self, row: usize, ext: ExtId, data: &[u8]) {
        if let Some(exts) = self.appends.get_mut(row) {
            exts.retain(|(e, _)| *e != ext.0 as u32);
            exts.push((ext.0 as u32, data.to_vec()));
        }
    }

    /// Assigns consecutive UIDs starting at `first_uid` to the pending rows
    /// and returns the UID following the last assigned one.
    ///
    /// Commit verifies `first_uid` against the header's `next_uid` under the
    /// sync lock; allocation outside a sync scope is a caller bug.
    pub fn append_assign_uids(&mut self, first_uid: u32) -> u32 {
        self.first_uid = Some(first_uid);
        first_uid + self.append_count()
    }

    /// Replaces one extension payload of an existing row.
    pub fn update_ext(&mut self, uid: u32, ext: ExtId, data: &[u8]) {
        self.ops.push(LogRecord::UpdateExt {
            uid,
            ext: ext.0 as u32,
            data: data.to_vec(),
        });
    }

    /// Adds `diff` to a fixed-width unsigned extension cell and returns the
    /// cumulative delta applied to that cell within this transaction.
    ///
    /// The delta, not the result, is logged; concurrent transactions on the
    /// same cell compose additively.
    pub fn atomic_inc_ext(&mut self, uid: u32, ext: ExtId, diff: i64) -> i64 {
        self.ops.push(LogRecord::AtomicIncExt {
            uid,
            ext: ext.0 as u32,
            diff,
        });
        let total = self.inc_totals.entry((uid, ext.0 as u32)).or_insert(0);
        *total += diff;
        *total
    }

    /// Queues removal of an existing row.
    pub fn expunge(&mut self, uid: u32) {
        self.ops.push(LogRecord::Expunge {
            uid,
            external: self.flags.external,
        });
    }

    /// Replaces one extension's header payload.
    pub fn update_header_ext(&mut self, ext: ExtId, data: &[u8]) {
        self.ops.push(LogRecord::UpdateHeaderExt {
            ext: ext.0 as u32,
            data: data.to_vec(),
        });
    }

    /// Sets the header UID-validity field at commit. Must be nonzero.
    pub fn set_uid_validity(&mut self, value: u32) {
        debug_assert!(value != 0);
        self.uid_validity = Some(value);
    }

    pub(crate) fn first_uid(&self) -> Option<u32> {
        self.first_uid
    }

    pub(crate) fn uid_validity_update(&self) -> Option<u32> {
        self.uid_validity
    }

    /// Renders the batch as log records: appended rows first (so later
    /// UID-addressed updates in the same batch can target them), then the
    /// remaining mutations in insertion order.
    pub(crate) fn into_records(self) -> Vec<LogRecord> {
        let first_uid = self.first_uid.unwrap_or(0);
        let mut records = Vec::with_capacity(self.appends.len() + self.ops.len());
        for (i, exts) in self.appends.into_iter().enumerate() {
            records.push(LogRecord::Append {
                uid: first_uid + i as u32,
                exts,
            });
        }
        records.extend(self.ops);
        records
    }
}
