//! # Profile
//!
//! The explicit configuration value handed to every entry point. Nothing in
//! the library reads configuration from the environment; the binary loads a
//! profile and passes it down.
//!
//! ```toml
//! database = "provarc.redb"
//! repository = "repository"
//! batch_size = 999
//! default_user_email = "curator@example.org"
//! scratch_dir = "/var/tmp"
//! ```

use crate::primitives::DEFAULT_BATCH_SIZE;
use crate::types::ProvarcError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the record store inside a profile directory.
pub const DATABASE_FILE: &str = "provarc.redb";

/// Name of the payload repository inside a profile directory.
pub const REPOSITORY_DIR: &str = "repository";

/// Store locations and tuning for one provarc installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Path of the redb record store.
    pub database: PathBuf,
    /// Root of the payload repository.
    pub repository: PathBuf,
    /// Maximum identifiers per "identifier in set" lookup.
    pub batch_size: usize,
    /// Owner of bookkeeping groups created by imports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_user_email: Option<String>,
    /// Parent of scratch folders (system temp folder when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DATABASE_FILE),
            repository: PathBuf::from(REPOSITORY_DIR),
            batch_size: DEFAULT_BATCH_SIZE,
            default_user_email: None,
            scratch_dir: None,
        }
    }
}

impl Profile {
    /// A profile keeping its store and repository under `root`.
    #[must_use]
    pub fn in_dir(root: &Path) -> Self {
        Self {
            database: root.join(DATABASE_FILE),
            repository: root.join(REPOSITORY_DIR),
            ..Self::default()
        }
    }

    /// Load a profile from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ProvarcError> {
        if !path.exists() {
            debug!(path = %path.display(), "no profile file, using defaults");
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .map_err(|e| ProvarcError::Config(format!("{}: {}", path.display(), e)))?;
        let profile: Self = toml::from_str(&text)
            .map_err(|e| ProvarcError::Config(format!("{}: {}", path.display(), e)))?;
        profile.validate()?;
        Ok(profile)
    }

    /// Write the profile as TOML.
    pub fn save(&self, path: &Path) -> Result<(), ProvarcError> {
        let text = toml::to_string(self).map_err(|e| ProvarcError::Config(e.to_string()))?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ProvarcError::Config(format!("{}: {}", parent.display(), e)))?;
        }
        fs::write(path, text).map_err(|e| ProvarcError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn validate(&self) -> Result<(), ProvarcError> {
        if self.batch_size == 0 {
            return Err(ProvarcError::Config("batch_size must be at least 1".to_string()));
        }
        if self.database.as_os_str().is_empty() {
            return Err(ProvarcError::Config("database path cannot be empty".to_string()));
        }
        if self.repository.as_os_str().is_empty() {
            return Err(ProvarcError::Config("repository path cannot be empty".to_string()));
        }
        Ok(())
    }
}
