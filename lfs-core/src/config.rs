//! Repository layout and transfer configuration
//!
//! An LFS storage root looks like:
//! ```text
//! {lfs}/
//!   objects/{id[0..2]}/{id[2..4]}/{id}   content-addressed objects
//!   locks/{sha256(path)}                lock records (JSON)
//!   tmp/                                scratch space for uploads
//!   incomplete/                         reserved for partial transfers
//!   lfs-transfer.json                   optional configuration
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Largest payload a single packet can carry.
pub const MAX_CHUNK_SIZE: usize = 65531;

/// Bytes per data packet when nothing else is configured.
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

const CONFIG_FILE: &str = "lfs-transfer.json";

/// Errors raised while preparing a transfer
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("unknown operation '{0}' (expected 'upload' or 'download')")]
    UnknownOperation(String),
}

/// Transfer direction, fixed for the whole session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Download,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Upload => "upload",
            Operation::Download => "download",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "upload" => Ok(Operation::Upload),
            "download" => Ok(Operation::Download),
            other => Err(ConfigError::UnknownOperation(other.to_string())),
        }
    }
}

/// Resolve the LFS storage root for the repository argument passed by ssh.
///
/// The argument may arrive wrapped in single quotes. Work trees keep LFS data
/// in `.git/lfs`, bare repositories in `lfs`.
pub fn resolve_lfs_dir(repo_arg: &str) -> PathBuf {
    let repo = PathBuf::from(repo_arg.trim().trim_matches('\''));
    let dot_git = repo.join(".git");
    if dot_git.is_dir() {
        return dot_git.join("lfs");
    }
    if repo.join("HEAD").is_file() {
        return repo.join("lfs");
    }
    dot_git.join("lfs")
}

/// Directory layout of an LFS storage root
#[derive(Debug, Clone)]
pub struct LfsLayout {
    root: PathBuf,
}

impl LfsLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join("objects")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.root.join("locks")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn incomplete_dir(&self) -> PathBuf {
        self.root.join("incomplete")
    }

    /// Create the root and every directory the store expects.
    pub fn bootstrap(&self) -> Result<(), ConfigError> {
        for dir in [
            self.objects_dir(),
            self.incomplete_dir(),
            self.tmp_dir(),
            self.locks_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        tracing::debug!("LFS layout ready at {}", self.root.display());
        Ok(())
    }
}

/// Tunables read from `{lfs}/lfs-transfer.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per data packet when streaming objects to the client.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Permission bits applied to stored objects.
    #[serde(default = "default_object_mode")]
    pub object_mode: u32,

    /// Permission bits applied to lock records. Other users sharing the
    /// repository must be able to read them.
    #[serde(default = "default_lock_mode")]
    pub lock_mode: u32,
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_object_mode() -> u32 {
    0o775
}

fn default_lock_mode() -> u32 {
    0o644
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            object_mode: default_object_mode(),
            lock_mode: default_lock_mode(),
        }
    }
}

impl TransferConfig {
    /// Load the config for an LFS root, falling back to defaults when absent.
    pub fn load(lfs_root: &Path) -> Result<Self, ConfigError> {
        let config_path = lfs_root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(&config_path)?;
        let config: TransferConfig =
            serde_json::from_str(&data).map_err(|e| ConfigError::Parse {
                path: config_path.clone(),
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(ConfigError::Invalid(format!(
                "chunk_size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        for (name, mode) in [("object_mode", self.object_mode), ("lock_mode", self.lock_mode)] {
            if mode > 0o7777 {
                return Err(ConfigError::Invalid(format!(
                    "{} {:o} is not a permission mode",
                    name, mode
                )));
            }
        }
        Ok(())
    }
}
