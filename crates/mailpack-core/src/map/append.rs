//! The append context: batched message appends into data files.
//!
//! An append batch streams message bytes into one or more data files, then
//! commits the matching map entries in one index transaction. File ids and
//! map UIDs are allocated under the sync lock, so concurrent writers in
//! other processes can never collide. Until the batch commits, every
//! touched file stays locked and its uncommitted tail can be rolled back.
//!
//! Finding a file to append to is a two-step search: files already opened
//! by this batch are preferred, then the map is scanned backwards for the
//! most recently used files, newest first. The scan gives up after probing
//! [`MAX_BACKWARDS_LOOKUPS`] distinct files; a file older than the rotation
//! stamp ends the scan early because the scan order guarantees everything
//! after it is older still.

use tracing::{debug, warn};

use crate::clock::day_begin_stamp;
use crate::dfile::{DataFile, OpenOutcome, TryLockOutcome};
use crate::error::{Error, Result};
use crate::index::{SyncScope, Transaction, TransactionFlags};
use crate::Mailbox;

use super::{clamp_nonzero, Map, MapRecord, MAP_HEADER_SIZE};

/// How many distinct files the backward scan may probe before giving up and
/// rotating to a new file.
const MAX_BACKWARDS_LOOKUPS: u32 = 10;

/// Sentinel size of an append tuple whose message is still being written.
const APPEND_SIZE_UNFINISHED: u32 = u32::MAX;

/// One queued `(file, offset, size)` tuple awaiting its map entry.
struct PendingAppend {
    file_idx: usize,
    offset: u64,
    size: u32,
}

enum Candidate {
    /// Reuse a file already opened by this batch.
    Existing(usize),
    /// A freshly locked file found by the backward scan.
    Fresh(DataFile),
}

enum TryAppend {
    Appendable(DataFile),
    KeepScanning,
    TooOld,
}

/// An open append batch. Dropping it uncommitted rolls back every touched
/// file's on-disk tail.
pub struct AppendContext<'a> {
    map: &'a Map,
    mailbox: Option<&'a Mailbox>,
    files: Vec<DataFile>,
    appends: Vec<PendingAppend>,
    /// Files below this index are known to be unappendable for this batch.
    files_nonappendable_count: usize,
    orig_next_uid: u32,
    first_new_file_id: u32,
    failed: bool,
    committed: bool,
    sync: Option<SyncScope<'a>>,
    trans: Option<Transaction>,
}

impl<'a> AppendContext<'a> {
    pub(super) fn begin(map: &'a Map, mailbox: Option<&'a Mailbox>) -> Self {
        let mut ctx = Self {
            map,
            mailbox,
            files: Vec::new(),
            appends: Vec::new(),
            files_nonappendable_count: 0,
            orig_next_uid: 0,
            first_new_file_id: u32::MAX,
            failed: false,
            committed: false,
            sync: None,
            trans: None,
        };
        if map.open(true).is_err() {
            ctx.failed = true;
        } else if let Err(e) = map.refresh() {
            // append can still work from a stale view; the sync drain will
            // catch us up before anything is committed
            debug!(?e, "append batch starting on a stale map view");
        }
        ctx
    }

    /// Picks or creates a data file with room for `mail_size` bytes and
    /// returns it with an open append stream. The caller streams the
    /// message bytes and then calls [`finish_multi_mail`](Self::finish_multi_mail).
    ///
    /// # Errors
    ///
    /// Returns an error when the context already failed, the map scan hits
    /// corruption, or file creation fails.
    pub fn append_next(&mut self, mail_size: u64) -> Result<&mut DataFile> {
        if self.failed {
            return Err(Error::Internal("append context is in a failed state".into()));
        }

        let candidate = match self.find_appendable_file(mail_size)? {
            Some(candidate) => candidate,
            None => {
                // nothing reusable: rotate to a new file
                let mut file = if self.map.env.settings.rotate_size == 0 {
                    let mailbox = self.mailbox.ok_or_else(|| {
                        Error::Internal("single-mailbox appends need a mailbox".into())
                    })?;
                    DataFile::init_single(self.map.env.clone(), mailbox, 0)
                } else {
                    DataFile::init_multi(self.map.env.clone(), 0)
                };
                let opened = file
                    .open_or_create()
                    .and_then(|_| file.append_stream(0, 0).map(|_| ()));
                if let Err(e) = opened {
                    file.unlink();
                    return Err(e);
                }
                Candidate::Fresh(file)
            }
        };

        match candidate {
            Candidate::Existing(idx) => {
                let offset = match self.files[idx].output() {
                    Some(output) => output.offset(),
                    None => return Err(Error::Internal("existing batch file lost its stream".into())),
                };
                if !self.files[idx].is_single() {
                    self.appends.push(PendingAppend {
                        file_idx: idx,
                        offset,
                        size: APPEND_SIZE_UNFINISHED,
                    });
                }
                Ok(&mut self.files[idx])
            }
            Candidate::Fresh(mut file) => {
                let offset = match file.output() {
                    Some(output) => output.offset(),
                    None => return Err(Error::Internal("fresh batch file has no stream".into())),
                };
                debug_assert_eq!(file.first_append_offset, 0);
                file.first_append_offset = offset;
                if !file.is_single() {
                    self.appends.push(PendingAppend {
                        file_idx: self.files.len(),
                        offset,
                        size: APPEND_SIZE_UNFINISHED,
                    });
                }
                let idx = self.files.len();
                self.files.push(file);
                Ok(&mut self.files[idx])
            }
        }
    }

    /// Stamps the size of the message just streamed into a multi-file.
    /// Must be called once per message, after its bytes are written.
    ///
    /// # Errors
    ///
    /// Returns an internal error when there is no open append tuple.
    pub fn finish_multi_mail(&mut self) -> Result<()> {
        let last = self
            .appends
            .last_mut()
            .ok_or_else(|| Error::Internal("no append in progress".into()))?;
        if last.size != APPEND_SIZE_UNFINISHED {
            return Err(Error::Internal("append already finished".into()));
        }
        let offset = match self.files[last.file_idx].output() {
            Some(output) => output.offset(),
            None => return Err(Error::Internal("batch file lost its stream".into())),
        };
        last.size = u32::try_from(offset - last.offset)
            .map_err(|_| Error::Internal("message larger than 4 GiB".into()))?;
        Ok(())
    }

    /// Commits map entries for every queued append and returns the assigned
    /// `(first_map_uid, last_map_uid)`, or `(0, 0)` for an empty batch.
    ///
    /// File ids are assigned first, under the sync lock; the sync stays
    /// open until [`commit`](Self::commit).
    ///
    /// # Errors
    ///
    /// Returns an error when syncing, flushing or committing fails; the
    /// batch is then rolled back on drop.
    pub fn assign_map_uids(&mut self) -> Result<(u32, u32)> {
        if self.appends.is_empty() {
            return Ok((0, 0));
        }

        self.assign_file_ids(true)?;

        let (first_uid, uid_validity) = match self.sync.as_ref() {
            Some(sync) => (sync.next_uid(), sync.uid_validity()),
            None => return Err(Error::Internal("sync scope missing after file-id assignment".into())),
        };
        let trans = self
            .trans
            .as_mut()
            .ok_or_else(|| Error::Internal("append transaction missing".into()))?;

        for append in &self.appends {
            if append.size == APPEND_SIZE_UNFINISHED {
                return Err(Error::Internal("unfinished append in batch".into()));
            }
            let rec = MapRecord {
                file_id: self.files[append.file_idx].file_id(),
                offset: u32::try_from(append.offset)
                    .map_err(|_| Error::Internal("append offset beyond 4 GiB".into()))?,
                size: append.size,
            };
            let row = trans.append();
            trans.append_update_ext(row, self.map.map_ext, &rec.encode());
            trans.append_update_ext(row, self.map.ref_ext, &1u16.to_le_bytes());
        }

        let next_uid = trans.append_assign_uids(first_uid);
        debug_assert_eq!((next_uid - first_uid) as usize, self.appends.len());

        if uid_validity == 0 {
            // we don't really care about the value, but it can't be 0
            trans.set_uid_validity(clamp_nonzero(self.map.env.clock.now()));
        }

        let trans = self
            .trans
            .take()
            .ok_or_else(|| Error::Internal("append transaction missing".into()))?;
        match self.sync.as_mut() {
            Some(sync) => sync.commit_transaction(trans)?,
            None => return Err(Error::Internal("sync scope missing at commit".into())),
        }

        Ok((first_uid, next_uid - 1))
    }

    /// Rewrites existing map entries to this batch's new locations and
    /// expunges others, as one sync transaction. Used when messages are
    /// moved during compaction.
    ///
    /// `map_uids[i]` is rewritten to the batch's i-th append; every UID must
    /// still be live — passing stale UIDs is a caller bug.
    ///
    /// # Errors
    ///
    /// Returns an error when file-id assignment fails.
    ///
    /// # Panics
    ///
    /// Panics when the number of appends differs from `map_uids`, or a UID
    /// no longer resolves to a live entry.
    pub fn append_move(
        &mut self,
        map_uids: &[u32],
        expunge_map_uids: &roaring::RoaringBitmap,
    ) -> Result<()> {
        self.assign_file_ids(false)?;
        assert_eq!(
            self.appends.len(),
            map_uids.len(),
            "one append per moved map_uid"
        );

        let mut recs = Vec::with_capacity(self.appends.len());
        for append in &self.appends {
            recs.push(MapRecord {
                file_id: self.files[append.file_idx].file_id(),
                offset: u32::try_from(append.offset)
                    .map_err(|_| Error::Internal("append offset beyond 4 GiB".into()))?,
                size: append.size,
            });
        }

        let sync = self
            .sync
            .as_mut()
            .ok_or_else(|| Error::Internal("sync scope missing after file-id assignment".into()))?;
        let view = self.map.view.read();

        for (&map_uid, rec) in map_uids.iter().zip(&recs) {
            assert!(
                view.lookup_seq(map_uid).is_some(),
                "stale map_uid {map_uid} passed to append_move"
            );
            sync.trans().update_ext(map_uid, self.map.map_ext, &rec.encode());
        }
        for map_uid in expunge_map_uids {
            assert!(
                view.lookup_seq(map_uid).is_some(),
                "stale expunge map_uid {map_uid} passed to append_move"
            );
            sync.trans().expunge(map_uid);
        }
        Ok(())
    }

    /// Assigns mailbox UIDs `first_uid..=last_uid` to this batch's
    /// single-mailbox files, in order.
    ///
    /// # Errors
    ///
    /// Returns an error when a rename fails or the range does not match the
    /// number of single-mailbox files.
    pub fn assign_uids(&mut self, first_uid: u32, last_uid: u32) -> Result<()> {
        let mut next_uid = first_uid;
        for file in &mut self.files {
            if !file.is_single() {
                continue;
            }
            file.flush_append()?;
            file.assign_id(next_uid)?;
            next_uid += 1;
        }
        if next_uid != last_uid + 1 {
            return Err(Error::Internal(format!(
                "single-mailbox uid range mismatch: next {next_uid}, expected {}",
                last_uid + 1
            )));
        }
        Ok(())
    }

    /// Commits the batch: closes the sync scope, making the new map entries
    /// visible to other processes and keeping every streamed byte.
    ///
    /// # Errors
    ///
    /// Returns an error when an index transaction is still open or the sync
    /// commit fails.
    pub fn commit(&mut self) -> Result<()> {
        if self.trans.is_some() {
            return Err(Error::Internal("append transaction still open at commit".into()));
        }
        if let Some(sync) = self.sync.take() {
            sync.commit()?;
        }
        self.committed = true;
        Ok(())
    }

    /// Finds room for `mail_size` bytes among this batch's files or the
    /// map's recent files. `Ok(None)` means the caller should rotate.
    fn find_appendable_file(&mut self, mail_size: u64) -> Result<Option<Candidate>> {
        let rotate_size = self.map.env.settings.rotate_size;
        if mail_size >= rotate_size {
            return Ok(None);
        }

        // first try to use files already opened by this batch
        for idx in (self.files_nonappendable_count..self.files.len()).rev() {
            let file = &mut self.files[idx];
            if !file.has_output() {
                // we already decided we can't append to this
                continue;
            }
            let append_offset = file.next_append_offset()?;
            if append_offset + mail_size <= rotate_size && file.append_stream(0, 0).is_ok() {
                return Ok(Some(Candidate::Existing(idx)));
            }
        }
        self.files_nonappendable_count = self.files.len();

        // backward scan: most recent map entries name the files most likely
        // to still have room
        let stamp = day_begin_stamp(&self.map.env.clock, self.map.env.settings.rotate_days);
        let mut seq;
        {
            let view = self.map.view.read();
            seq = view.messages_count();
            self.orig_next_uid = view.next_uid();
        }
        let mut min_seen_file_id = u32::MAX;
        let mut backwards_lookup_count = 0u32;

        while seq > 0 {
            let (file_id, offset, size, uid) = {
                let view = self.map.view.read();
                if seq > view.messages_count() {
                    break;
                }
                let rec = self.map.lookup_seq_record(&view, seq)?;
                let uid = view
                    .lookup_uid(seq)
                    .ok_or_else(|| Error::Internal(format!("seq {seq} out of range")))?;
                (rec.file_id, rec.offset, rec.size, uid)
            };

            // only the newest entry of each file matters
            if file_id >= min_seen_file_id {
                seq -= 1;
                continue;
            }
            min_seen_file_id = file_id;

            backwards_lookup_count += 1;
            if backwards_lookup_count > MAX_BACKWARDS_LOOKUPS {
                // we've wasted enough time here
                break;
            }

            if u64::from(offset) + u64::from(size) + mail_size >= rotate_size {
                seq -= 1;
                continue;
            }
            if self.is_appending(file_id) {
                seq -= 1;
                continue;
            }

            match self.try_append(file_id, stamp, mail_size) {
                TryAppend::Appendable(file) => return Ok(Some(Candidate::Fresh(file))),
                TryAppend::TooOld => {
                    // the rest of the scan is older still
                    break;
                }
                TryAppend::KeepScanning => {
                    // try_append refreshed the view; sequences moved, so
                    // reposition just before the candidate's UID
                    let view = self.map.view.read();
                    if uid == 1 {
                        break;
                    }
                    match view.lookup_seq_range(1, uid - 1) {
                        Some((_, seq2)) => seq = seq2,
                        None => break,
                    }
                }
            }
        }
        Ok(None)
    }

    /// Probes one candidate file: open, age-check, lock, re-verify, and
    /// position an append stream after its true last message.
    fn try_append(&self, file_id: u32, stamp: i64, mail_size: u64) -> TryAppend {
        let map = self.map;
        let mut file = DataFile::init_multi(map.env.clone(), file_id);
        match file.open_or_create() {
            Ok(OpenOutcome::Opened) => {}
            Ok(_) | Err(_) => {
                // deleted or unreadable: concurrent cleanup got there first
                return TryAppend::KeepScanning;
            }
        }

        if file.create_time() < stamp {
            return TryAppend::TooOld;
        }
        match file.try_lock() {
            Ok(TryLockOutcome::Obtained) => {}
            Ok(TryLockOutcome::Contended) => return TryAppend::KeepScanning,
            Err(e) => {
                warn!(path = %file.path().display(), ?e, "locking append candidate failed");
                return TryAppend::KeepScanning;
            }
        }
        // the file may have been unlinked between opening and locking it
        match file.exists() {
            Ok(true) => {}
            _ => return TryAppend::KeepScanning,
        }
        if map.refresh().is_err() {
            return TryAppend::KeepScanning;
        }

        // with the lock held and the map fresh, find the file's true last
        // message; other appenders may have extended it meanwhile
        let (last_offset, last_size) = {
            let view = map.view.read();
            let mut last: Option<(u32, u32)> = None;
            for seq in 1..=view.messages_count() {
                let Ok(rec) = map.lookup_seq_record(&view, seq) else {
                    return TryAppend::KeepScanning;
                };
                if rec.file_id == file_id && last.map_or(true, |(offset, _)| offset < rec.offset) {
                    last = Some((rec.offset, rec.size));
                }
            }
            match last {
                Some(last) => last,
                // every entry moved away while we waited for the lock
                None => return TryAppend::KeepScanning,
            }
        };

        let new_size = u64::from(last_offset) + u64::from(last_size) + mail_size;
        if new_size <= map.env.settings.rotate_size
            && file
                .append_stream(u64::from(last_offset), u64::from(last_size))
                .is_ok()
        {
            TryAppend::Appendable(file)
        } else {
            TryAppend::KeepScanning
        }
    }

    fn is_appending(&self, file_id: u32) -> bool {
        // there shouldn't be many files open, don't bother with anything
        // faster
        self.files
            .iter()
            .any(|file| !file.is_single() && file.file_id() == file_id)
    }

    /// Opens the sync scope, flushes this batch's writers and assigns fresh
    /// file ids from `highest_file_id + 1`.
    fn assign_file_ids(&mut self, separate_transaction: bool) -> Result<()> {
        // the sync is needed even when no file ids are to be assigned: map
        // UID allocation happens under the same lock
        let mut sync = self.map.index.sync_begin()?;
        self.map.sync_handle(&sync);

        let mut file_id = self.next_file_id()?;
        let first_file_id = file_id;

        for file in &mut self.files {
            if file.is_single() {
                continue;
            }
            if file.has_output() {
                file.flush_append()?;
            }
            if file.file_id() == 0 {
                file.assign_id(file_id)?;
                file_id += 1;
            }
        }

        if separate_transaction {
            self.trans = Some(Transaction::new(TransactionFlags {
                fsync: true,
                external: false,
            }));
        }

        if file_id != first_file_id {
            self.first_new_file_id = first_file_id;
            let highest = file_id - 1;
            debug!(first_file_id, highest, "assigned new multi-file ids");
            match self.trans.as_mut() {
                Some(trans) => trans.update_header_ext(self.map.map_ext, &highest.to_le_bytes()),
                None => sync.trans().update_header_ext(self.map.map_ext, &highest.to_le_bytes()),
            }
        }
        // errors above dropped `sync`, rolling the scope back
        self.sync = Some(sync);
        Ok(())
    }

    /// Next file id to assign: `highest_file_id + 1` from the map extension
    /// header, or 1 for a map with no files yet.
    fn next_file_id(&self) -> Result<u32> {
        let view = self.map.view.read();
        let data = view.header_ext(self.map.map_ext);
        match data.len() {
            0 => Ok(1),
            MAP_HEADER_SIZE => {
                let highest = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                Ok(highest + 1)
            }
            size => Err(self.map.set_corrupted(format!("map header size={size}"))),
        }
    }
}

impl Drop for AppendContext<'_> {
    fn drop(&mut self) {
        // rollback any open index transaction and sync scope first; the
        // lock order matches commit
        self.trans = None;
        self.sync = None;

        for file in &mut self.files {
            if !self.committed {
                file.rollback_tail();
            }
            file.first_append_offset = 0;
            file.unlock();
        }
        self.files.clear();
        self.appends.clear();
    }
}
