//! Error types for Mailpack.
//!
//! This module provides a unified error type for all map and storage
//! operations. Error codes follow the pattern `PACK-XXX` for easy debugging.

use thiserror::Error;

/// Result type alias for Mailpack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Mailpack operations.
///
/// Each variant includes a descriptive error message suitable for end-users.
#[derive(Error, Debug)]
pub enum Error {
    /// Map index corrupted (PACK-001).
    ///
    /// A structural invariant is broken on disk. The index needs a rebuild.
    #[error("[PACK-001] map index {path} corrupted: {detail}")]
    MapCorrupted {
        /// Path of the index file.
        path: String,
        /// What exactly was found broken.
        detail: String,
    },

    /// Data file corrupted (PACK-002).
    #[error("[PACK-002] data file {path} corrupted: {detail}")]
    FileCorrupted {
        /// Path of the data file.
        path: String,
        /// What exactly was found broken.
        detail: String,
    },

    /// IO error (PACK-003).
    #[error("[PACK-003] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage error (PACK-004).
    #[error("[PACK-004] storage error: {0}")]
    Storage(String),

    /// Refcount ceiling reached (PACK-005).
    ///
    /// Incrementing further would risk crossing the on-disk 16-bit limit
    /// when several writers race, so the writer refuses early. This is the
    /// user-visible "copied too many times" condition.
    #[error("[PACK-005] message has been copied too many times")]
    RefcountLimit,

    /// Configuration error (PACK-006).
    #[error("[PACK-006] configuration error: {0}")]
    Config(String),

    /// Internal error (PACK-007).
    ///
    /// Indicates an unexpected internal error. Please report if encountered.
    #[error("[PACK-007] internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code (e.g., "PACK-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MapCorrupted { .. } => "PACK-001",
            Self::FileCorrupted { .. } => "PACK-002",
            Self::Io(_) => "PACK-003",
            Self::Storage(_) => "PACK-004",
            Self::RefcountLimit => "PACK-005",
            Self::Config(_) => "PACK-006",
            Self::Internal(_) => "PACK-007",
        }
    }

    /// Returns true if this error is recoverable.
    ///
    /// Corruption and internal errors require a rebuild or a bug report;
    /// everything else can be retried by the caller.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::MapCorrupted { .. } | Self::FileCorrupted { .. } | Self::Internal(_)
        )
    }
}
