//! Refcount and expunge transactions on the map.
//!
//! A map transaction buffers ±N refcount deltas and expunges, then commits
//! them under the index sync lock. While the transaction is open the map's
//! view must stay put; a lookup that misses is therefore corruption, not a
//! reason to refresh.

use tracing::error;

use crate::error::{Error, Result};
use crate::index::{SyncScope, Transaction, TransactionFlags};

use super::{decode_refcount, Map};

/// Refcounts may not grow past this within a single entry. The on-disk cell
/// is 16-bit; refusing at half the range keeps concurrent writers from
/// racing each other across 65535.
pub(crate) const REFCOUNT_CEILING: i64 = 32768;

/// An open refcount/expunge transaction.
///
/// Dropping the transaction without a successful [`commit`](Self::commit)
/// rolls everything back as a unit.
pub struct MapTransaction<'a> {
    map: &'a Map,
    trans: Option<Transaction>,
    sync: Option<SyncScope<'a>>,
    changed: bool,
    success: bool,
}

impl<'a> MapTransaction<'a> {
    pub(super) fn begin(map: &'a Map, external: bool) -> Self {
        // Opening without create: refcounts on a missing map make no sense.
        let trans = if map.open(false).is_ok() && map.refresh().is_ok() {
            Some(Transaction::new(TransactionFlags {
                fsync: true,
                external,
            }))
        } else {
            None
        };
        Self {
            map,
            trans,
            sync: None,
            changed: false,
            success: false,
        }
    }

    /// Applies `diff` to the refcount of every listed `map_uid`.
    ///
    /// # Errors
    ///
    /// Returns a corruption error when a UID has no live entry (the held
    /// view cannot be refreshed mid-transaction), or [`Error::RefcountLimit`]
    /// when an entry would reach the ceiling.
    pub fn update_refcounts(&mut self, map_uids: &[u32], diff: i64) -> Result<()> {
        let trans = self
            .trans
            .as_mut()
            .ok_or_else(|| Error::Internal("map transaction failed to open".into()))?;

        let view = self.map.view.read();
        for &map_uid in map_uids {
            let Some(seq) = view.lookup_seq(map_uid) else {
                return Err(self
                    .map
                    .set_corrupted(format!("refcount update lost map_uid={map_uid}")));
            };
            let current = view
                .lookup_ext(seq, self.map.ref_ext)
                .map_or(0, decode_refcount);

            self.changed = true;
            let in_trans = trans.atomic_inc_ext(map_uid, self.map.ref_ext, diff);
            if i64::from(current) + in_trans >= REFCOUNT_CEILING {
                return Err(Error::RefcountLimit);
            }
        }
        Ok(())
    }

    /// Queues removal of the entry with `map_uid`.
    pub(crate) fn expunge(&mut self, map_uid: u32) {
        if let Some(trans) = self.trans.as_mut() {
            self.changed = true;
            trans.expunge(map_uid);
        }
    }

    /// Commits the buffered changes.
    ///
    /// A transaction that changed nothing is a no-op and never takes the
    /// sync lock. The sync itself is settled when the transaction drops.
    ///
    /// # Errors
    ///
    /// Returns an error when the sync cannot be opened or the commit fails;
    /// the buffered changes are discarded on drop.
    pub fn commit(mut self) -> Result<()> {
        if !self.changed {
            return Ok(());
        }
        let trans = self
            .trans
            .take()
            .ok_or_else(|| Error::Internal("map transaction failed to open".into()))?;

        // Syncing locks the transaction log, so we always see head == tail
        // unless a writer crashed.
        let mut sync = self.map.index.sync_begin()?;
        self.map.sync_handle(&sync);

        let committed = sync.commit_transaction(trans);
        self.sync = Some(sync);
        committed?;
        self.success = true;
        Ok(())
    }
}

impl Drop for MapTransaction<'_> {
    fn drop(&mut self) {
        // Settle the sync scope: commit after a successful transaction,
        // rollback otherwise. Any still-buffered transaction is discarded.
        if let Some(sync) = self.sync.take() {
            if self.success {
                if let Err(e) = sync.commit() {
                    error!(?e, "map sync commit failed");
                }
            }
            // !success: sync drops, releasing the lock without committing.
        }
        self.trans = None;
    }
}
