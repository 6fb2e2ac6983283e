//! Path-keyed lock registry
//!
//! Each lock is one JSON file at `locks/{sha256(path)}`. The file's existence
//! is the lock; it is linked into place with a no-clobber persist, so two
//! sessions racing for the same path cannot both win.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tracing::info;

use crate::config::{LfsLayout, TransferConfig};
use crate::identity::Identity;
use crate::object::ObjectId;

/// Errors raised by lock operations
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// `existing` is the record already holding the path, when it could be read.
    #[error("lock already exists")]
    AlreadyLocked {
        id: ObjectId,
        path: String,
        existing: Option<LockRecord>,
    },

    #[error("lock does not exist")]
    NotFound(ObjectId),

    #[error("corrupt lock record {id}: {message}")]
    InvalidRecord { id: String, message: String },

    #[error("cannot resolve user: {0}")]
    Identity(io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Contents of a lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub path: String,
    #[serde(rename = "locked-at")]
    pub locked_at: String,
    #[serde(rename = "ownername")]
    pub owner: String,
}

impl LockRecord {
    /// Lock id for this record's path
    pub fn id(&self) -> ObjectId {
        ObjectId::from_data(self.path.as_bytes())
    }
}

/// Whether a listed lock belongs to the user running the session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Ours,
    Theirs,
}

impl Ownership {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ownership::Ours => "ours",
            Ownership::Theirs => "theirs",
        }
    }
}

/// One row of a lock listing
#[derive(Debug, Clone)]
pub struct LockEntry {
    pub id: ObjectId,
    pub record: LockRecord,
    pub ownership: Ownership,
}

/// Optional narrowing for `list`
#[derive(Debug, Clone, Default)]
pub struct LockFilter {
    pub path: Option<String>,
    pub id: Option<ObjectId>,
    pub limit: Option<usize>,
}

impl LockFilter {
    fn matches(&self, entry: &LockEntry) -> bool {
        if let Some(path) = &self.path {
            if entry.record.path != *path {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if entry.id != *id {
                return false;
            }
        }
        true
    }
}

/// Lock registry over `{lfs}/locks`
#[derive(Clone)]
pub struct LockRegistry {
    layout: LfsLayout,
    lock_mode: u32,
    identity: Arc<dyn Identity>,
}

impl std::fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockRegistry")
            .field("layout", &self.layout)
            .field("lock_mode", &format_args!("{:o}", self.lock_mode))
            .finish_non_exhaustive()
    }
}

impl LockRegistry {
    pub fn new(layout: LfsLayout, config: &TransferConfig, identity: Arc<dyn Identity>) -> Self {
        Self {
            layout,
            lock_mode: config.lock_mode,
            identity,
        }
    }

    /// Lock `path` for the current user.
    pub fn acquire(&self, path: &str) -> Result<LockRecord, LockError> {
        let id = ObjectId::from_data(path.as_bytes());
        let lock_path = self.layout.locks_dir().join(id.to_hex());
        if lock_path.exists() {
            return Err(self.conflict(id, path));
        }

        let owner = self.identity.current_user().map_err(LockError::Identity)?;
        let record = LockRecord {
            path: path.to_string(),
            locked_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            owner,
        };
        let json = serde_json::to_vec(&record).map_err(|e| LockError::InvalidRecord {
            id: id.to_hex(),
            message: e.to_string(),
        })?;

        let mut tmp = tempfile::Builder::new()
            .prefix("lock")
            .tempfile_in(self.layout.tmp_dir())?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        // Tempfiles are created 0600; other users must be able to list the lock
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(self.lock_mode))?;

        match tmp.persist_noclobber(&lock_path) {
            Ok(_) => {}
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                return Err(self.conflict(id, path));
            }
            Err(e) => return Err(LockError::Io(e.error)),
        }

        info!("Locked {} as {} for {}", record.path, id, record.owner);
        Ok(record)
    }

    /// List locks sorted by id.
    pub fn list(&self, filter: &LockFilter) -> Result<Vec<LockEntry>, LockError> {
        let current = self.identity.current_user().map_err(LockError::Identity)?;

        let mut names = Vec::new();
        for entry in fs::read_dir(self.layout.locks_dir())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();

        let mut entries = Vec::new();
        for name in names {
            if filter.limit.is_some_and(|limit| entries.len() >= limit) {
                break;
            }
            let id = ObjectId::from_hex(&name).map_err(|e| LockError::InvalidRecord {
                id: name.clone(),
                message: e.to_string(),
            })?;
            let lock_path = self.layout.locks_dir().join(&name);
            // Released by another session since the directory was read
            let (record, metadata) = match (self.read_record(&id), fs::metadata(&lock_path)) {
                (Err(LockError::NotFound(_)), _) => continue,
                (_, Err(e)) if e.kind() == io::ErrorKind::NotFound => continue,
                (record, metadata) => (record?, metadata?),
            };
            let file_owner = self
                .identity
                .owner_of(&metadata)
                .map_err(LockError::Identity)?;
            let ownership = if file_owner == current {
                Ownership::Ours
            } else {
                Ownership::Theirs
            };

            let entry = LockEntry {
                id,
                record,
                ownership,
            };
            if !filter.matches(&entry) {
                continue;
            }
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Remove a lock, returning the record it held.
    pub fn release(&self, id: &ObjectId) -> Result<LockRecord, LockError> {
        let record = self.read_record(id)?;
        let lock_path = self.layout.locks_dir().join(id.to_hex());
        match fs::remove_file(&lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LockError::NotFound(*id)),
            Err(e) => return Err(e.into()),
        }
        info!("Unlocked {} ({})", record.path, id);
        Ok(record)
    }

    fn conflict(&self, id: ObjectId, path: &str) -> LockError {
        LockError::AlreadyLocked {
            id,
            path: path.to_string(),
            existing: self.read_record(&id).ok(),
        }
    }

    fn read_record(&self, id: &ObjectId) -> Result<LockRecord, LockError> {
        let lock_path = self.layout.locks_dir().join(id.to_hex());
        let data = match fs::read(&lock_path) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LockError::NotFound(*id)),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&data).map_err(|e| LockError::InvalidRecord {
            id: id.to_hex(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::StaticIdentity;
    use tempfile::TempDir;

    const TEST_ZIP_ID: &str = "c7b8de23fd238fe5e16f6f03b844022f9f72fd168a0704d82d58f19cf72b7aa3";

    fn make_registry(tmp: &TempDir, identity: StaticIdentity) -> LockRegistry {
        let layout = LfsLayout::new(tmp.path());
        layout.bootstrap().unwrap();
        LockRegistry::new(layout, &TransferConfig::default(), Arc::new(identity))
    }

    #[test]
    fn test_acquire_and_list() {
        let tmp = TempDir::new().unwrap();
        let registry = make_registry(&tmp, StaticIdentity::new("jan"));

        let record = registry.acquire("test.zip").unwrap();
        assert_eq!(record.path, "test.zip");
        assert_eq!(record.owner, "jan");
        assert_eq!(record.id().to_hex(), TEST_ZIP_ID);
        assert!(record.locked_at.ends_with('Z'));
        assert!(tmp.path().join("locks").join(TEST_ZIP_ID).is_file());

        let entries = registry.list(&LockFilter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id.to_hex(), TEST_ZIP_ID);
        assert_eq!(entries[0].record, record);
        assert_eq!(entries[0].ownership, Ownership::Ours);
    }

    #[test]
    fn test_record_is_json() {
        let tmp = TempDir::new().unwrap();
        let registry = make_registry(&tmp, StaticIdentity::new("jan"));
        registry.acquire("test.zip").unwrap();

        let raw = fs::read_to_string(tmp.path().join("locks").join(TEST_ZIP_ID)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["path"], "test.zip");
        assert_eq!(value["ownername"], "jan");
        assert!(value["locked-at"].is_string());
    }

    #[test]
    fn test_second_acquire_conflicts() {
        let tmp = TempDir::new().unwrap();
        let registry = make_registry(&tmp, StaticIdentity::new("jan"));

        let first = registry.acquire("test.zip").unwrap();
        let err = registry.acquire("test.zip").unwrap_err();
        match err {
            LockError::AlreadyLocked { id, path, existing } => {
                assert_eq!(id.to_hex(), TEST_ZIP_ID);
                assert_eq!(path, "test.zip");
                assert_eq!(existing.as_ref(), Some(&first));
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        // The original record is untouched
        let entries = registry.list(&LockFilter::default()).unwrap();
        assert_eq!(entries[0].record, first);
    }

    #[test]
    fn test_lock_file_is_readable_by_others() {
        let tmp = TempDir::new().unwrap();
        let registry = make_registry(&tmp, StaticIdentity::new("jan"));
        registry.acquire("test.zip").unwrap();

        let metadata = fs::metadata(tmp.path().join("locks").join(TEST_ZIP_ID)).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o644);
    }

    #[test]
    fn test_lock_mode_from_config() {
        let tmp = TempDir::new().unwrap();
        let layout = LfsLayout::new(tmp.path());
        layout.bootstrap().unwrap();
        let config = TransferConfig {
            lock_mode: 0o640,
            ..TransferConfig::default()
        };
        let registry = LockRegistry::new(layout, &config, Arc::new(StaticIdentity::new("jan")));
        registry.acquire("test.zip").unwrap();

        let metadata = fs::metadata(tmp.path().join("locks").join(TEST_ZIP_ID)).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o640);
    }

    #[test]
    fn test_release() {
        let tmp = TempDir::new().unwrap();
        let registry = make_registry(&tmp, StaticIdentity::new("jan"));
        let record = registry.acquire("test.zip").unwrap();

        let released = registry.release(&record.id()).unwrap();
        assert_eq!(released, record);
        assert!(registry.list(&LockFilter::default()).unwrap().is_empty());

        let err = registry.release(&record.id()).unwrap_err();
        assert_eq!(err.to_string(), "lock does not exist");

        // Released paths can be locked again
        registry.acquire("test.zip").unwrap();
    }

    #[test]
    fn test_ownership_follows_file_owner() {
        let tmp = TempDir::new().unwrap();
        let registry = make_registry(&tmp, StaticIdentity::with_file_owner("jan", "kim"));
        registry.acquire("test.zip").unwrap();

        let entries = registry.list(&LockFilter::default()).unwrap();
        assert_eq!(entries[0].ownership, Ownership::Theirs);
        // The stored owner name is informational only
        assert_eq!(entries[0].record.owner, "jan");
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        let registry = make_registry(&tmp, StaticIdentity::new("jan"));
        for path in ["a.bin", "b.bin", "c.bin", "test.zip"] {
            registry.acquire(path).unwrap();
        }

        let all = registry.list(&LockFilter::default()).unwrap();
        assert_eq!(all.len(), 4);
        assert!(all.windows(2).all(|w| w[0].id < w[1].id));

        let by_path = registry
            .list(&LockFilter {
                path: Some("b.bin".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_path.len(), 1);
        assert_eq!(by_path[0].record.path, "b.bin");

        let by_id = registry
            .list(&LockFilter {
                id: Some(ObjectId::from_hex(TEST_ZIP_ID).unwrap()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(by_id.len(), 1);
        assert_eq!(by_id[0].record.path, "test.zip");

        let limited = registry
            .list(&LockFilter {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_corrupt_record() {
        let tmp = TempDir::new().unwrap();
        let registry = make_registry(&tmp, StaticIdentity::new("jan"));
        fs::write(tmp.path().join("locks").join(TEST_ZIP_ID), "garbage").unwrap();

        let err = registry.list(&LockFilter::default()).unwrap_err();
        assert!(matches!(err, LockError::InvalidRecord { .. }));
    }

    #[test]
    fn test_concurrent_acquire_has_one_winner() {
        let tmp = TempDir::new().unwrap();
        let registry = make_registry(&tmp, StaticIdentity::new("jan"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.acquire("contended.psd").is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }
}
