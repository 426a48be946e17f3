//! The shared-message map.
//!
//! The map is the deduplication index of the storage: for every logically
//! distinct message body it records which data file holds the bytes, at
//! what offset and size, and how many mailbox references point at it. A
//! "copy" is a refcount increment; a file whose every entry has refcount
//! zero is reclaimable.
//!
//! # Module Structure
//!
//! - [`Map`]: handle, lookups, refresh, zero-ref enumeration
//! - [`transaction`]: refcount and expunge transactions
//! - [`append`]: the append context (file selection, streaming, commit)
//!
//! Persisted state lives in two index extensions plus a header:
//!
//! | Extension | Header | Record | Contents |
//! |-----------|--------|--------|----------|
//! | `map`     | 4      | 12     | `(file_id: u32, offset: u32, size: u32)` |
//! | `ref`     | 0      | 2      | `refcount: u16` |
//!
//! The `map` extension header holds `highest_file_id: u32`.

mod append;
mod transaction;

#[cfg(test)]
mod map_tests;

pub use append::AppendContext;
pub use transaction::MapTransaction;

use parking_lot::{Mutex, RwLock};
use roaring::RoaringBitmap;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::index::{ExtId, MapIndex, SyncScope, View};
use crate::{Mailbox, StorageEnv};

/// File name of the shared map index inside the storage directory.
pub const GLOBAL_INDEX_NAME: &str = "map.index";

/// Size of a serialized map record.
pub(crate) const MAP_RECORD_SIZE: usize = 12;

/// Size of a serialized map extension header.
pub(crate) const MAP_HEADER_SIZE: usize = 4;

/// Size of a serialized refcount cell.
pub(crate) const REF_RECORD_SIZE: usize = 2;

/// Location of one message body: data file, byte offset, byte size.
///
/// `file_id == 0` is reserved and marks an unassigned or corrupt record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRecord {
    /// Data file holding the message bytes.
    pub file_id: u32,
    /// Byte offset of the message within the file.
    pub offset: u32,
    /// Byte size of the message.
    pub size: u32,
}

impl MapRecord {
    pub(crate) fn encode(&self) -> [u8; MAP_RECORD_SIZE] {
        let mut buf = [0u8; MAP_RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.file_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.offset.to_le_bytes());
        buf[8..12].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    pub(crate) fn decode(data: &[u8]) -> Option<Self> {
        if data.len() != MAP_RECORD_SIZE {
            return None;
        }
        Some(Self {
            file_id: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            offset: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            size: u32::from_le_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

pub(crate) fn decode_refcount(data: &[u8]) -> u16 {
    if data.len() == REF_RECORD_SIZE {
        u16::from_le_bytes([data[0], data[1]])
    } else {
        0
    }
}

/// Full map entry as seen through a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupRec {
    /// The entry's map UID.
    pub map_uid: u32,
    /// Where the message body lives.
    pub rec: MapRecord,
    /// Number of mailbox references to the entry.
    pub refcount: u16,
}

/// One message of a particular data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMsg {
    /// The entry's map UID.
    pub map_uid: u32,
    /// Byte offset of the message within the file.
    pub offset: u32,
    /// Number of mailbox references to the entry.
    pub refcount: u16,
}

/// Process-wide handle to the shared-message map of one storage root.
pub struct Map {
    pub(crate) env: Arc<StorageEnv>,
    pub(crate) index: MapIndex,
    pub(crate) view: RwLock<View>,
    pub(crate) map_ext: ExtId,
    pub(crate) ref_ext: ExtId,
    created_uid_validity: u32,
    ref0_file_ids: Mutex<RoaringBitmap>,
}

impl Map {
    /// Creates the map handle; the index opens lazily.
    #[must_use]
    pub fn new(env: Arc<StorageEnv>) -> Self {
        let mut index = MapIndex::new(env.storage_dir.join(GLOBAL_INDEX_NAME));
        let map_ext = index.ext_register("map", MAP_HEADER_SIZE, MAP_RECORD_SIZE, 4);
        let ref_ext = index.ext_register("ref", 0, REF_RECORD_SIZE, 2);
        let view = RwLock::new(index.create_view());
        let created_uid_validity = clamp_nonzero(env.clock.now());
        Self {
            env,
            index,
            view,
            map_ext,
            ref_ext,
            created_uid_validity,
            ref0_file_ids: Mutex::new(RoaringBitmap::new()),
        }
    }

    /// Opens the map index, optionally creating the storage directory and
    /// index file. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the index is missing and
    /// `create_missing` is not set, or an I/O error.
    pub fn open(&self, create_missing: bool) -> Result<()> {
        if self.index.is_open() {
            return Ok(());
        }
        if create_missing {
            std::fs::create_dir_all(&self.env.storage_dir)?;
        }
        if !self.index.open(create_missing)? {
            return Err(Error::Storage(format!(
                "map index not found: {}",
                self.index.path().display()
            )));
        }
        self.refresh()
    }

    /// Advances the map's view to the committed index tail.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be read.
    pub fn refresh(&self) -> Result<()> {
        let mut view = self.view.write();
        self.index.refresh_view(&mut view)
    }

    /// Resolves a `map_uid` to its data-file location.
    ///
    /// A miss is retried once after a refresh; `Ok(None)` means the entry
    /// does not exist (it may have been moved and expunged).
    ///
    /// # Errors
    ///
    /// Returns a corruption error when the entry exists but its record is
    /// missing or has `file_id == 0`.
    pub fn lookup(&self, map_uid: u32) -> Result<Option<(u32, u64)>> {
        self.open(true)?;

        let Some(seq) = self.get_seq(map_uid)? else {
            return Ok(None);
        };
        let view = self.view.read();
        let rec = self.lookup_seq_record(&view, seq)?;
        Ok(Some((rec.file_id, u64::from(rec.offset))))
    }

    /// Full map entry at 1-based `seq` in the map's current view.
    ///
    /// # Errors
    ///
    /// Returns a corruption error when either extension payload is missing.
    pub fn lookup_rec(&self, seq: u32) -> Result<LookupRec> {
        let view = self.view.read();
        self.lookup_rec_in(&view, seq)
    }

    /// All messages stored in data file `file_id`, in sequence order.
    ///
    /// # Errors
    ///
    /// Returns an error when the map cannot be refreshed or an entry is
    /// corrupt.
    pub fn get_file_msgs(&self, file_id: u32) -> Result<Vec<FileMsg>> {
        self.refresh()?;
        let view = self.view.read();

        let mut msgs = Vec::new();
        for seq in 1..=view.messages_count() {
            let rec = self.lookup_rec_in(&view, seq)?;
            if rec.rec.file_id == file_id {
                msgs.push(FileMsg {
                    map_uid: rec.map_uid,
                    offset: rec.rec.offset,
                    refcount: rec.refcount,
                });
            }
        }
        Ok(msgs)
    }

    /// File ids whose every live entry has refcount zero: the reclamation
    /// candidates.
    ///
    /// Failures yield an empty (open failure) or stale (refresh failure)
    /// result; stale data is acceptable for garbage collection.
    #[must_use]
    pub fn get_zero_ref_files(&self) -> RoaringBitmap {
        let mut ref0 = self.ref0_file_ids.lock();
        ref0.clear();

        if self.open(false).is_err() {
            return ref0.clone();
        }
        if let Err(e) = self.refresh() {
            warn!(?e, "zero-ref scan running on a stale view");
        }

        // a file is reclaimable only when every live entry in it is at zero
        let mut referenced = RoaringBitmap::new();
        let view = self.view.read();
        for seq in 1..=view.messages_count() {
            let zero = view
                .lookup_ext(seq, self.ref_ext)
                .map_or(true, |data| decode_refcount(data) == 0);
            if let Some(data) = view.lookup_ext(seq, self.map_ext) {
                if let Some(rec) = MapRecord::decode(data) {
                    if zero {
                        ref0.insert(rec.file_id);
                    } else {
                        referenced.insert(rec.file_id);
                    }
                }
            }
        }
        *ref0 -= referenced;
        ref0.clone()
    }

    /// The map's UID validity; never zero.
    ///
    /// Falls back to the map's creation stamp until a value is committed.
    #[must_use]
    pub fn uid_validity(&self) -> u32 {
        let stored = self.view.read().uid_validity();
        if stored != 0 {
            stored
        } else {
            self.created_uid_validity
        }
    }

    /// Begins a refcount/expunge transaction.
    ///
    /// `external` vouches that the changes are serialized outside the map
    /// (e.g. per-file cleanup holding the file lock).
    #[must_use]
    pub fn transaction_begin(&self, external: bool) -> MapTransaction<'_> {
        MapTransaction::begin(self, external)
    }

    /// Expunges every map entry pointing at data file `file_id`.
    ///
    /// Used after a file's messages have been moved elsewhere; the map is
    /// refreshed first so entries already moved by others are not lost.
    ///
    /// # Errors
    ///
    /// Returns a corruption error when an entry has no map record.
    pub fn remove_file_id(&self, file_id: u32) -> Result<()> {
        let mut trans = self.transaction_begin(true);

        {
            let view = self.view.read();
            for seq in 1..=view.messages_count() {
                let Some(data) = view.lookup_ext(seq, self.map_ext) else {
                    return Err(self.set_corrupted(format!("missing map record for seq={seq}")));
                };
                let Some(rec) = MapRecord::decode(data) else {
                    return Err(self.set_corrupted(format!("malformed map record for seq={seq}")));
                };
                if rec.file_id == file_id {
                    let uid = view
                        .lookup_uid(seq)
                        .ok_or_else(|| Error::Internal(format!("seq {seq} out of range")))?;
                    trans.expunge(uid);
                }
            }
        }
        trans.commit()
    }

    /// Begins an append batch for multi-files.
    #[must_use]
    pub fn append_begin(&self) -> AppendContext<'_> {
        AppendContext::begin(self, None)
    }

    /// Begins an append batch on behalf of one mailbox, enabling
    /// single-mailbox files when `rotate_size == 0`.
    #[must_use]
    pub fn append_begin_mailbox<'a>(&'a self, mailbox: &'a Mailbox) -> AppendContext<'a> {
        AppendContext::begin(self, Some(mailbox))
    }

    /// Translates `map_uid` to a sequence, refreshing once on a miss.
    pub(crate) fn get_seq(&self, map_uid: u32) -> Result<Option<u32>> {
        if let Some(seq) = self.view.read().lookup_seq(map_uid) {
            return Ok(Some(seq));
        }
        self.refresh()?;
        Ok(self.view.read().lookup_seq(map_uid))
    }

    /// Decodes the map record at `seq`; `file_id == 0` and missing payloads
    /// are corruption.
    pub(crate) fn lookup_seq_record(&self, view: &View, seq: u32) -> Result<MapRecord> {
        let rec = view
            .lookup_ext(seq, self.map_ext)
            .and_then(MapRecord::decode);
        match rec {
            Some(rec) if rec.file_id != 0 => Ok(rec),
            _ => {
                let uid = view.lookup_uid(seq).unwrap_or(0);
                Err(self.set_corrupted(format!("file_id=0 for map_uid={uid}")))
            }
        }
    }

    pub(crate) fn lookup_rec_in(&self, view: &View, seq: u32) -> Result<LookupRec> {
        let map_uid = view
            .lookup_uid(seq)
            .ok_or_else(|| Error::Internal(format!("seq {seq} out of range")))?;

        let rec = view
            .lookup_ext(seq, self.map_ext)
            .and_then(MapRecord::decode)
            .ok_or_else(|| self.set_corrupted(format!("missing map record for map_uid={map_uid}")))?;

        let refcount = view
            .lookup_ext(seq, self.ref_ext)
            .map(decode_refcount)
            .ok_or_else(|| self.set_corrupted(format!("missing refcount for map_uid={map_uid}")))?;

        Ok(LookupRec {
            map_uid,
            rec,
            refcount,
        })
    }

    /// Handles the start of a sync scope: a tail/head mismatch means a
    /// writer crashed mid-commit, so schedule a rebuild and leave the orphan
    /// bytes alone; otherwise drain the committed records into our view.
    pub(crate) fn sync_handle(&self, sync: &SyncScope<'_>) {
        if sync.is_inconsistent() {
            let (tail, head) = sync.offsets();
            warn!(
                storage = %self.env.storage_dir.display(),
                tail,
                head,
                "inconsistency in map index, scheduling rebuild"
            );
            self.env
                .sync_rebuild
                .store(true, std::sync::atomic::Ordering::Relaxed);
        } else if let Err(e) = self.refresh() {
            error!(?e, "map refresh under sync lock failed");
        }
    }

    /// Logs and returns a corruption error for this map's index file.
    pub(crate) fn set_corrupted(&self, detail: String) -> Error {
        let path = self.index.path().display().to_string();
        error!(path = %path, detail = %detail, "map index corrupted");
        Error::MapCorrupted { path, detail }
    }
}

pub(crate) fn clamp_nonzero(stamp: i64) -> u32 {
    u32::try_from(stamp).ok().filter(|v| *v != 0).unwrap_or(1)
}
