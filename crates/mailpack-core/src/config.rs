//! Mailpack configuration.
//!
//! Provides configuration file support via `mailpack.toml`, environment
//! variables, and runtime overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Runtime overrides (embedding application)
//! 2. Environment variables (`MAILPACK_*`)
//! 3. Configuration file (`mailpack.toml`)
//! 4. Default values

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Default byte ceiling per multi-file before rotation (2 MiB).
const DEFAULT_ROTATE_SIZE: u64 = 2 * 1024 * 1024;

/// Storage settings.
///
/// `rotate_size == 0` selects single-mailbox files instead of multi-files;
/// `rotate_days == 0` disables the age cutoff on append candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Byte ceiling per multi-file; appends rotate to a new file beyond it.
    pub rotate_size: u64,
    /// Files older than this many days are never appended to further.
    pub rotate_days: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rotate_size: DEFAULT_ROTATE_SIZE,
            rotate_days: 0,
        }
    }
}

impl Settings {
    /// Loads settings from `mailpack.toml` (if present) and `MAILPACK_*`
    /// environment variables, layered over the defaults.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a layer fails to parse or a value
    /// fails validation.
    pub fn load<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path.as_ref()));
        }
        let settings: Self = figment
            .merge(Env::prefixed("MAILPACK_"))
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates the settings.
    ///
    /// Map records hold offsets and sizes as `u32`, so a multi-file may
    /// never grow past `u32::MAX` bytes.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a value is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.rotate_size > u64::from(u32::MAX) {
            return Err(Error::Config(format!(
                "rotate_size {} exceeds the 4 GiB record limit",
                self.rotate_size
            )));
        }
        Ok(())
    }

    /// Serializes the settings to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}
