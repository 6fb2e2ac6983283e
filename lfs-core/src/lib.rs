//! git-lfs-transfer core library
//!
//! Storage side of an LFS transfer session:
//! - Object identifiers (SHA-256, lower-case hex)
//! - Repository layout, bootstrap and transfer configuration
//! - Content-addressed object store with sharded directories and atomic writes
//! - Path-keyed lock registry
//! - OS identity resolution for lock ownership

pub mod config;
pub mod identity;
pub mod locks;
pub mod object;
pub mod storage;

pub use config::{ConfigError, LfsLayout, Operation, TransferConfig, resolve_lfs_dir};
pub use identity::{Identity, OsIdentity, StaticIdentity};
pub use locks::{LockEntry, LockError, LockFilter, LockRecord, LockRegistry, Ownership};
pub use object::{ObjectId, ObjectIdError};
pub use storage::{ObjectChunks, ObjectContent, ObjectStore, PutOutcome, Result, StorageError};

/// The only hash algorithm this server speaks.
pub const HASH_ALGORITHM: &str = "sha256";
