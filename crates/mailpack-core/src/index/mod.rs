//! Transactional index engine.
//!
//! A small single-file index: rows keyed by monotone UIDs, carrying
//! fixed-size payloads for named extensions, persisted as an append-only
//! record log behind a committed-tail header.
//!
//! # Module Structure
//!
//! - `log`: on-disk header and record framing
//! - [`View`]: replayed read snapshot
//! - [`Transaction`]: buffered mutations
//! - [`SyncScope`]: cross-process writer serialization
//!
//! Writers commit only inside a [`SyncScope`], which holds an exclusive
//! advisory lock on the index file. Readers never block: they replay the
//! record stream up to the committed tail.

mod log;
mod sync;
mod transaction;
mod view;


pub use sync::SyncScope;
pub use transaction::{Transaction, TransactionFlags};
pub use view::View;

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Handle to a registered extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtId(pub(crate) usize);

/// A named extension: fixed-size per-row payload plus an optional header
/// payload.
#[derive(Debug, Clone)]
pub struct ExtDef {
    /// Extension name.
    pub name: String,
    /// Size of the extension's header payload.
    pub header_size: usize,
    /// Fixed size of the per-row payload.
    pub record_size: usize,
    /// Alignment of the per-row payload.
    pub align: usize,
}

/// The index engine bound to one file on disk.
pub struct MapIndex {
    path: PathBuf,
    exts: Vec<ExtDef>,
    file: Mutex<Option<File>>,
    sync_gate: Mutex<()>,
}

impl MapIndex {
    /// Creates an engine for `path`; nothing is opened yet.
    #[must_use]
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            exts: Vec::new(),
            file: Mutex::new(None),
            sync_gate: Mutex::new(()),
        }
    }

    /// Registers an extension. Must happen before `open`, in the same order
    /// in every process sharing the index.
    pub fn ext_register(
        &mut self,
        name: &str,
        header_size: usize,
        record_size: usize,
        align: usize,
    ) -> ExtId {
        self.exts.push(ExtDef {
            name: name.to_string(),
            header_size,
            record_size,
            align,
        });
        ExtId(self.exts.len() - 1)
    }

    /// Path of the index file, for error messages.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once `open` has succeeded.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.file.lock().is_some()
    }

    /// Opens the index file, optionally creating it (and its parent
    /// directories) when missing.
    ///
    /// Returns `true` when opened, `false` when the file is missing and
    /// `create_missing` was not set. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be opened or its header is
    /// invalid.
    pub fn open(&self, create_missing: bool) -> Result<bool> {
        let mut guard = self.file.lock();
        if guard.is_some() {
            return Ok(true);
        }

        if !self.path.exists() {
            if !create_missing {
                return Ok(false);
            }
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_missing)
            .open(&self.path)?;

        if file.metadata()?.len() == 0 {
            log::write_header(&mut file, &log::IndexHeader::fresh())?;
        } else {
            log::read_header(&mut file).map_err(Error::Io)?;
        }

        *guard = Some(file);
        Ok(true)
    }

    /// Closes the file handle; a later `open` reopens it.
    pub fn close(&self) {
        *self.file.lock() = None;
    }

    /// Creates an empty view positioned before the first record.
    #[must_use]
    pub fn create_view(&self) -> View {
        View::empty(self.exts.len())
    }

    /// Advances `view` to the committed tail.
    ///
    /// Opens an independent read handle so a concurrent writer's seek
    /// position is never disturbed. The header is re-read on CRC mismatch a
    /// couple of times to ride out another process's in-place header write.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the header stays invalid or the record
    /// stream is malformed.
    pub fn refresh_view(&self, view: &mut View) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Internal("map index is not open".into()));
        }

        let mut file = File::open(&self.path)?;
        let header = Self::read_header_retry(&mut file)?;

        if header.tail > view.applied() {
            let records = log::read_records(&mut file, view.applied(), header.tail)?;
            for record in records {
                view.apply(record, &self.exts);
            }
            view.set_applied(header.tail);
        }
        view.set_header(header.next_uid, header.uid_validity);
        Ok(())
    }

    /// Begins a sync scope, blocking on the cross-process file lock.
    ///
    /// # Errors
    ///
    /// Returns an error when the index is not open or locking fails.
    pub fn sync_begin(&self) -> Result<SyncScope<'_>> {
        let gate = self.sync_gate.lock();
        SyncScope::begin(self, gate)
    }

    pub(crate) fn writer_handle(&self) -> Result<File> {
        let guard = self.file.lock();
        let file = guard
            .as_ref()
            .ok_or_else(|| Error::Internal("map index is not open".into()))?;
        Ok(file.try_clone()?)
    }

    fn read_header_retry(file: &mut File) -> Result<log::IndexHeader> {
        let mut last_err: Option<io::Error> = None;
        for _ in 0..3 {
            match log::read_header(file) {
                Ok(header) => return Ok(header),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => last_err = Some(e),
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Err(Error::Io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "index header unreadable")
        })))
    }
}

#[cfg(test)]
pub(crate) use log::{append_records, read_header, LogRecord};
