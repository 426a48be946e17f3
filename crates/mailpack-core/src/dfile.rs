//! Data files holding packed message bodies.
//!
//! Multi-files (`m.<file_id>`) hold many messages concatenated; single-
//! mailbox files (`u.<uid>`) hold one message of one mailbox. Both start
//! with a fixed 16-byte header:
//!
//! ```text
//! [Magic: "PKMF" 4 bytes]
//! [Version: 4 bytes]
//! [Created: epoch seconds, 8 bytes]
//! ```
//!
//! New files are created under a process-unique `tmp.*` name and renamed
//! into place by [`DataFile::assign_id`] once their id is allocated under
//! the sync lock. Appended bytes are flushed and fsynced before the index
//! commit that references them; an uncommitted tail is truncated away (or
//! the whole file unlinked) on rollback.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::{Mailbox, StorageEnv};

/// Data file magic bytes.
pub(crate) const FILE_MAGIC: &[u8; 4] = b"PKMF";

/// Current data-file format version.
pub(crate) const FILE_VERSION: u32 = 1;

/// Size of the fixed data-file header.
pub const FILE_HEADER_SIZE: u64 = 16;

/// Outcome of [`DataFile::open_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Existing file opened.
    Opened,
    /// New file created under its temp name.
    Created,
    /// The file was deleted under us (concurrent cleanup).
    Deleted,
}

/// Outcome of [`DataFile::try_lock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLockOutcome {
    /// Exclusive lock obtained.
    Obtained,
    /// Another writer holds the lock.
    Contended,
}

enum FileKind {
    Multi { file_id: u32 },
    Single { mailbox: Mailbox, uid: u32 },
}

/// Positioned append stream over a data file.
pub struct AppendStream {
    writer: io::BufWriter<File>,
    offset: u64,
}

impl AppendStream {
    /// Byte offset the next write lands at.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Appends `buf` at the current offset.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.writer.write_all(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }
}

/// One data file participating in an append batch.
pub struct DataFile {
    env: Arc<StorageEnv>,
    kind: FileKind,
    path: PathBuf,
    file: Option<File>,
    locked: bool,
    create_time: i64,
    output: Option<AppendStream>,
    pub(crate) first_append_offset: u64,
}

impl DataFile {
    /// A multi-file; `file_id == 0` means "not yet assigned" and resolves to
    /// a process-unique temp path.
    pub(crate) fn init_multi(env: Arc<StorageEnv>, file_id: u32) -> Self {
        let path = if file_id == 0 {
            env.storage_dir.join(temp_name(&env, "m"))
        } else {
            env.storage_dir.join(format!("m.{file_id}"))
        };
        Self {
            env,
            kind: FileKind::Multi { file_id },
            path,
            file: None,
            locked: false,
            create_time: 0,
            output: None,
            first_append_offset: 0,
        }
    }

    /// A single-mailbox file; `uid == 0` means "not yet assigned".
    pub(crate) fn init_single(env: Arc<StorageEnv>, mailbox: &Mailbox, uid: u32) -> Self {
        let path = if uid == 0 {
            mailbox.dir().join(temp_name(&env, "u"))
        } else {
            mailbox.dir().join(format!("u.{uid}"))
        };
        Self {
            env,
            kind: FileKind::Single {
                mailbox: mailbox.clone(),
                uid,
            },
            path,
            file: None,
            locked: false,
            create_time: 0,
            output: None,
            first_append_offset: 0,
        }
    }

    /// The file's id; 0 for single-mailbox and unassigned files.
    #[must_use]
    pub fn file_id(&self) -> u32 {
        match self.kind {
            FileKind::Multi { file_id } => file_id,
            FileKind::Single { .. } => 0,
        }
    }

    /// True for single-mailbox files.
    #[must_use]
    pub fn is_single(&self) -> bool {
        matches!(self.kind, FileKind::Single { .. })
    }

    /// Creation stamp from the file header (epoch seconds).
    #[must_use]
    pub fn create_time(&self) -> i64 {
        self.create_time
    }

    /// Current path on disk.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Opens the file, creating it (with a fresh header) when it has no id
    /// yet.
    ///
    /// # Errors
    ///
    /// Returns an I/O error on open/create failure, or a corruption error
    /// when the header is malformed.
    pub fn open_or_create(&mut self) -> Result<OpenOutcome> {
        if self.file.is_some() {
            return Ok(OpenOutcome::Opened);
        }

        let expect_existing = match self.kind {
            FileKind::Multi { file_id } => file_id != 0,
            FileKind::Single { uid, .. } => uid != 0,
        };

        if expect_existing || self.path.exists() {
            match OpenOptions::new().read(true).write(true).open(&self.path) {
                Ok(mut file) => {
                    self.create_time = read_file_header(&mut file, &self.path)?;
                    self.file = Some(file);
                    return Ok(OpenOutcome::Opened);
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if expect_existing {
                        return Ok(OpenOutcome::Deleted);
                    }
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        let now = self.env.clock.now();
        write_file_header(&mut file, now)?;
        self.create_time = now;
        self.file = Some(file);
        Ok(OpenOutcome::Created)
    }

    /// Attempts a non-blocking exclusive lock.
    ///
    /// # Errors
    ///
    /// Returns an I/O error for anything other than contention.
    pub fn try_lock(&mut self) -> Result<TryLockOutcome> {
        let file = self.open_file()?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                self.locked = true;
                Ok(TryLockOutcome::Obtained)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(TryLockOutcome::Contended),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Releases the lock. Idempotent.
    pub fn unlock(&mut self) {
        if self.locked {
            if let Some(file) = self.file.as_ref() {
                if let Err(e) = FileExt::unlock(file) {
                    error!(path = %self.path.display(), ?e, "failed to unlock data file");
                }
            }
            self.locked = false;
        }
    }

    /// True while the file still exists at its current path (it may have
    /// been unlinked between opening and locking).
    ///
    /// # Errors
    ///
    /// Returns an I/O error for anything other than `NotFound`.
    pub fn exists(&self) -> Result<bool> {
        match std::fs::metadata(&self.path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Positions an append stream after the last committed message.
    ///
    /// `last_offset`/`last_size` describe the file's last message as the map
    /// records it; 0/0 means "append wherever the file ends". Orphan bytes
    /// past the expected tail (a crashed writer's uncommitted append) are
    /// truncated away; a file shorter than expected is corrupt.
    ///
    /// # Errors
    ///
    /// Returns a corruption error when the physical length is shorter than
    /// the expected tail, or an I/O error.
    pub fn append_stream(&mut self, last_offset: u64, last_size: u64) -> Result<&mut AppendStream> {
        if self.output.is_some() {
            return Ok(self.output.as_mut().unwrap());
        }

        let path = self.path.clone();
        let file = self.open_file()?;
        let len = file.metadata()?.len();
        let expected = if last_offset > 0 {
            last_offset + last_size
        } else {
            len.max(FILE_HEADER_SIZE)
        };

        if len < expected {
            return Err(Error::FileCorrupted {
                path: path.display().to_string(),
                detail: format!("file length {len} shorter than expected tail {expected}"),
            });
        }
        if len > expected {
            warn!(
                path = %path.display(),
                orphan_bytes = len - expected,
                "truncating uncommitted tail"
            );
            file.set_len(expected)?;
        }

        let mut writer_file = file.try_clone()?;
        writer_file.seek(SeekFrom::Start(expected))?;
        self.output = Some(AppendStream {
            writer: io::BufWriter::new(writer_file),
            offset: expected,
        });
        Ok(self.output.as_mut().unwrap())
    }

    /// The open append stream, if any.
    pub fn output(&mut self) -> Option<&mut AppendStream> {
        self.output.as_mut()
    }

    /// Appends message bytes through the open stream.
    ///
    /// # Errors
    ///
    /// Returns an internal error when no stream is open, or an I/O error.
    pub fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| Error::Internal("no append stream open".into()))?;
        output.write_all(buf)?;
        Ok(())
    }

    /// True once an append stream has been opened.
    #[must_use]
    pub fn has_output(&self) -> bool {
        self.output.is_some()
    }

    /// Where the next appended byte would land.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file length cannot be read.
    pub fn next_append_offset(&mut self) -> Result<u64> {
        if let Some(output) = self.output.as_ref() {
            return Ok(output.offset);
        }
        let file = self.open_file()?;
        Ok(file.metadata()?.len().max(FILE_HEADER_SIZE))
    }

    /// Flushes and fsyncs buffered appended bytes.
    ///
    /// Data bytes must be durable before the index commit that points at
    /// them.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the flush fails.
    pub fn flush_append(&mut self) -> Result<()> {
        if let Some(output) = self.output.as_mut() {
            output.flush_sync()?;
        }
        Ok(())
    }

    /// Renames the file from its temp name to its final id-keyed name.
    ///
    /// Multi-files take a `file_id` (allocated under the sync lock);
    /// single-mailbox files take a mailbox UID.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the rename fails.
    pub fn assign_id(&mut self, id: u32) -> Result<()> {
        let new_path = match &mut self.kind {
            FileKind::Multi { file_id } => {
                *file_id = id;
                self.env.storage_dir.join(format!("m.{id}"))
            }
            FileKind::Single { mailbox, uid } => {
                *uid = id;
                mailbox.dir().join(format!("u.{id}"))
            }
        };
        if new_path != self.path {
            std::fs::rename(&self.path, &new_path)?;
            self.path = new_path;
        }
        Ok(())
    }

    /// Rolls back the on-disk tail of an uncommitted batch: truncate back to
    /// the batch's first append, or unlink a file that never received a
    /// committed id.
    pub(crate) fn rollback_tail(&mut self) {
        if let Some(output) = self.output.as_mut() {
            // flush before truncating
            if let Err(e) = output.flush_sync() {
                error!(path = %self.path.display(), ?e, "flush before rollback failed");
            }
        }
        self.output = None;

        if self.file_id() != 0 && self.first_append_offset > FILE_HEADER_SIZE {
            if let Some(file) = self.file.as_ref() {
                if let Err(e) = file.set_len(self.first_append_offset) {
                    error!(
                        path = %self.path.display(),
                        offset = self.first_append_offset,
                        ?e,
                        "truncating uncommitted append failed"
                    );
                }
            }
        } else if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!(path = %self.path.display(), ?e, "unlinking uncommitted file failed");
            }
        }
    }

    /// Unlinks the file (append-next failure path for fresh files).
    pub(crate) fn unlink(&mut self) {
        self.output = None;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                error!(path = %self.path.display(), ?e, "unlink failed");
            }
        }
    }

    fn open_file(&mut self) -> Result<&File> {
        if self.file.is_none() {
            let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            self.create_time = read_file_header(&mut file, &self.path)?;
            self.file = Some(file);
        }
        Ok(self.file.as_ref().unwrap())
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn temp_name(env: &StorageEnv, kind: &str) -> String {
    let n = env.temp_counter.fetch_add(1, Ordering::Relaxed);
    format!("tmp.{kind}.{}.{n}", std::process::id())
}

fn read_file_header(file: &mut File, path: &std::path::Path) -> Result<i64> {
    let mut buf = [0u8; FILE_HEADER_SIZE as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf).map_err(|_| Error::FileCorrupted {
        path: path.display().to_string(),
        detail: "file shorter than its header".into(),
    })?;
    if &buf[0..4] != FILE_MAGIC {
        return Err(Error::FileCorrupted {
            path: path.display().to_string(),
            detail: "bad magic".into(),
        });
    }
    let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    if version != FILE_VERSION {
        return Err(Error::FileCorrupted {
            path: path.display().to_string(),
            detail: format!("unsupported version {version}"),
        });
    }
    Ok(i64::from_le_bytes(buf[8..16].try_into().unwrap()))
}

fn write_file_header(file: &mut File, created: i64) -> io::Result<()> {
    let mut buf = [0u8; FILE_HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(FILE_MAGIC);
    buf[4..8].copy_from_slice(&FILE_VERSION.to_le_bytes());
    buf[8..16].copy_from_slice(&created.to_le_bytes());
    file.write_all(&buf)?;
    file.sync_data()
}
