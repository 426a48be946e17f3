//! # Mailpack Core
//!
//! Deduplicated packed-message storage with a crash-safe shared map.
//!
//! Message bodies are appended into a small number of large data files
//! ("multi-files"); the shared map records where each logically distinct
//! body lives and how many mailbox references point at it. Copying a
//! message only increments a refcount; files whose every entry has dropped
//! to zero references can be enumerated for reclamation.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mailpack_core::{Settings, Storage};
//!
//! let storage = Storage::open("./mail", Settings::default())?;
//! let map = storage.map();
//!
//! let mut batch = map.append_begin();
//! let file = batch.append_next(body.len() as u64)?;
//! file.write_all(body)?;
//! batch.finish_multi_mail()?;
//! let (first_uid, last_uid) = batch.assign_map_uids()?;
//! batch.commit()?;
//!
//! let location = map.lookup(first_uid)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod dfile;
pub mod error;
pub mod index;
pub mod map;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub use clock::{Clock, SystemClock};
pub use config::Settings;
pub use dfile::DataFile;
pub use error::{Error, Result};
pub use map::{AppendContext, FileMsg, LookupRec, Map, MapRecord, MapTransaction};

/// Shared environment of one storage root.
pub(crate) struct StorageEnv {
    pub(crate) storage_dir: PathBuf,
    pub(crate) settings: Settings,
    pub(crate) clock: Arc<dyn Clock>,
    /// Set when a crashed writer is detected; a rebuild pass should run.
    pub(crate) sync_rebuild: AtomicBool,
    /// Process-unique suffix source for temp file names.
    pub(crate) temp_counter: AtomicU64,
}

/// One mailbox of the storage; the home of single-mailbox data files.
#[derive(Debug, Clone)]
pub struct Mailbox {
    name: String,
    dir: PathBuf,
}

impl Mailbox {
    /// Mailbox name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Directory holding this mailbox's data files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Storage instance bound to one directory tree.
pub struct Storage {
    env: Arc<StorageEnv>,
    map: Map,
}

impl Storage {
    /// Opens or creates a storage rooted at `dir`, using the system clock.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `settings` fail validation.
    pub fn open<P: AsRef<Path>>(dir: P, settings: Settings) -> Result<Self> {
        Self::open_with_clock(dir, settings, Arc::new(SystemClock))
    }

    /// Opens or creates a storage with an injected clock.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when `settings` fail validation.
    pub fn open_with_clock<P: AsRef<Path>>(
        dir: P,
        settings: Settings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        settings.validate()?;
        let env = Arc::new(StorageEnv {
            storage_dir: dir.as_ref().to_path_buf(),
            settings,
            clock,
            sync_rebuild: AtomicBool::new(false),
            temp_counter: AtomicU64::new(0),
        });
        let map = Map::new(Arc::clone(&env));
        Ok(Self { env, map })
    }

    /// The storage's shared-message map.
    #[must_use]
    pub fn map(&self) -> &Map {
        &self.map
    }

    /// Root directory of the storage.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.env.storage_dir
    }

    /// Returns a mailbox handle, creating its directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the directory cannot be created.
    pub fn mailbox(&self, name: &str) -> Result<Mailbox> {
        let dir = self.env.storage_dir.join("mailboxes").join(name);
        std::fs::create_dir_all(&dir)?;
        Ok(Mailbox {
            name: name.to_string(),
            dir,
        })
    }

    /// True when a crashed writer was detected and the map needs a rebuild
    /// pass.
    #[must_use]
    pub fn needs_rebuild(&self) -> bool {
        self.env.sync_rebuild.load(Ordering::Relaxed)
    }
}
