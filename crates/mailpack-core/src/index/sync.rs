//! Sync scope: the serialization point for all index writers.
//!
//! A sync scope pairs an in-process mutex with an exclusive advisory lock
//! on the index file, so exactly one writer per storage commits at a time,
//! across processes. UID and file-id allocation both happen inside a scope.
//!
//! On begin, the scope records the committed tail and the physical file
//! length. A difference between the two means a writer crashed after
//! appending record bytes but before advancing the tail; those orphan bytes
//! were never visible to readers and the next commit overwrites them.

use fs2::FileExt;
use std::fs::File;
use tracing::error;

use crate::error::{Error, Result};

use super::log::{self, IndexHeader};
use super::transaction::{Transaction, TransactionFlags};
use super::MapIndex;

/// An open sync scope; holds the transaction-log lock until committed or
/// dropped.
pub struct SyncScope<'a> {
    index: &'a MapIndex,
    _gate: parking_lot::MutexGuard<'a, ()>,
    file: File,
    header: IndexHeader,
    begin_tail: u64,
    begin_head: u64,
    own_trans: Option<Transaction>,
    unlocked: bool,
}

impl<'a> SyncScope<'a> {
    pub(super) fn begin(index: &'a MapIndex, gate: parking_lot::MutexGuard<'a, ()>) -> Result<Self> {
        let mut file = index.writer_handle()?;
        file.lock_exclusive()?;

        // Authoritative only now that the lock is held.
        let header = match log::read_header(&mut file) {
            Ok(header) => header,
            Err(e) => {
                let _ = FileExt::unlock(&file);
                return Err(Error::Io(e));
            }
        };
        let head = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(e) => {
                let _ = FileExt::unlock(&file);
                return Err(Error::Io(e));
            }
        };

        Ok(Self {
            index,
            _gate: gate,
            file,
            begin_tail: header.tail,
            begin_head: head.max(header.tail),
            header,
            own_trans: Some(Transaction::new(TransactionFlags {
                fsync: true,
                external: false,
            })),
            unlocked: false,
        })
    }

    /// Committed tail and physical head as observed at begin.
    #[must_use]
    pub fn offsets(&self) -> (u64, u64) {
        (self.begin_tail, self.begin_head)
    }

    /// True when a prior writer crashed mid-commit.
    #[must_use]
    pub fn is_inconsistent(&self) -> bool {
        self.begin_tail != self.begin_head
    }

    /// Next UID the index will assign, as of the locked header.
    #[must_use]
    pub fn next_uid(&self) -> u32 {
        self.header.next_uid
    }

    /// UID validity, as of the locked header.
    #[must_use]
    pub fn uid_validity(&self) -> u32 {
        self.header.uid_validity
    }

    /// The scope's own transaction, committed together with the scope.
    pub fn trans(&mut self) -> &mut Transaction {
        self.own_trans
            .as_mut()
            .expect("sync transaction taken before commit")
    }

    /// Appends a transaction's records to the log and advances the tail.
    ///
    /// The record bytes are flushed (and fsynced when the transaction asks
    /// for it) before the tail moves, so readers see all of the batch or
    /// none of it.
    pub fn commit_transaction(&mut self, trans: Transaction) -> Result<()> {
        if trans.is_empty() {
            return Ok(());
        }

        let append_count = trans.append_count();
        if append_count > 0 {
            match trans.first_uid() {
                None => {
                    return Err(Error::Internal(
                        "appended rows committed without UID assignment".into(),
                    ))
                }
                Some(first) if first != self.header.next_uid => {
                    return Err(Error::Internal(format!(
                        "UID allocation raced: assigned from {first}, header expects {}",
                        self.header.next_uid
                    )))
                }
                Some(_) => {}
            }
        }

        let fsync = trans.flags().fsync;
        let uid_validity = trans.uid_validity_update();
        let records = trans.into_records();

        let new_tail = log::append_records(&mut self.file, self.header.tail, &records, fsync)?;
        if self.begin_head > new_tail {
            // drop what remains of a crashed writer's orphan bytes
            self.file.set_len(new_tail)?;
            self.begin_head = new_tail;
        }

        let mut header = self.header;
        header.tail = new_tail;
        if append_count > 0 {
            header.next_uid += append_count;
        }
        if let Some(value) = uid_validity {
            header.uid_validity = value;
        }
        log::write_header(&mut self.file, &header)?;
        self.header = header;
        Ok(())
    }

    /// Commits the scope's own transaction and releases the log lock.
    pub fn commit(mut self) -> Result<()> {
        let own = self
            .own_trans
            .take()
            .ok_or_else(|| Error::Internal("sync scope committed twice".into()))?;
        self.commit_transaction(own)?;
        self.release();
        Ok(())
    }

    fn release(&mut self) {
        if !self.unlocked {
            if let Err(e) = FileExt::unlock(&self.file) {
                error!(path = %self.index.path().display(), ?e, "failed to unlock index file");
            }
            self.unlocked = true;
        }
    }
}

impl Drop for SyncScope<'_> {
    fn drop(&mut self) {
        // Rollback path: pending transactions are discarded untouched.
        self.release();
    }
}
