//! Content-addressed object store
//!
//! Objects live at `objects/{id[0..2]}/{id[2..4]}/{id}` below the LFS root.
//! Uploads are written to a temp file in `tmp/`, hashed on the way in, and
//! renamed into place only after size and digest both check out, so a
//! partially written object is never visible at its final path.

use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::config::{LfsLayout, TransferConfig, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE};
use crate::object::ObjectId;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound(ObjectId),

    #[error("can not verify file size after upload (expected {expected} bytes, found {actual})")]
    SizeMismatch {
        id: ObjectId,
        expected: u64,
        actual: u64,
    },

    #[error("expected OID {expected}, got {actual} after {written} bytes written")]
    HashMismatch {
        expected: ObjectId,
        actual: ObjectId,
        written: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// What `put` did with an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// An object of the declared size was already stored; the source was not read.
    AlreadyPresent,
    /// The upload was verified and moved into place.
    Stored { written: u64 },
}

/// A stored object opened for streaming
#[derive(Debug)]
pub struct ObjectContent {
    pub size: u64,
    pub chunks: ObjectChunks,
}

/// Forward-only reader yielding an object in bounded chunks
#[derive(Debug)]
pub struct ObjectChunks {
    file: File,
    chunk_size: usize,
    finished: bool,
}

impl Iterator for ObjectChunks {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let mut chunk = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < chunk.len() {
            match self.file.read(&mut chunk[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
        if filled < chunk.len() {
            self.finished = true;
        }
        if filled == 0 {
            return None;
        }
        chunk.truncate(filled);
        Some(Ok(chunk))
    }
}

/// Filesystem object store rooted at an LFS layout
#[derive(Debug, Clone)]
pub struct ObjectStore {
    layout: LfsLayout,
    chunk_size: usize,
    object_mode: u32,
}

impl ObjectStore {
    /// Chunk sizes outside `1..=MAX_CHUNK_SIZE` fall back to the default.
    pub fn new(layout: LfsLayout, config: &TransferConfig) -> Self {
        let chunk_size = if (1..=MAX_CHUNK_SIZE).contains(&config.chunk_size) {
            config.chunk_size
        } else {
            DEFAULT_CHUNK_SIZE
        };
        Self {
            layout,
            chunk_size,
            object_mode: config.object_mode,
        }
    }

    /// Final on-disk location of an object
    pub fn object_path(&self, id: &ObjectId) -> PathBuf {
        self.layout.objects_dir().join(id.shard_path())
    }

    fn stored_size(&self, id: &ObjectId) -> Option<u64> {
        fs::metadata(self.object_path(id)).ok().map(|m| m.len())
    }

    /// Open an object for streaming.
    pub fn get(&self, id: &ObjectId) -> Result<ObjectContent> {
        let path = self.object_path(id);
        let size = fs::metadata(&path)
            .map_err(|_| StorageError::NotFound(*id))?
            .len();
        let file = File::open(&path)?;
        debug!("Streaming object {} ({} bytes)", id, size);
        Ok(ObjectContent {
            size,
            chunks: ObjectChunks {
                file,
                chunk_size: self.chunk_size,
                finished: false,
            },
        })
    }

    /// Store an object read from `source`.
    ///
    /// An existing object with the declared size short-circuits without
    /// touching `source`; the caller is responsible for discarding any
    /// unread input.
    pub fn put(&self, id: &ObjectId, declared_size: u64, source: &mut dyn Read) -> Result<PutOutcome> {
        let path = self.object_path(id);
        if self.stored_size(id) == Some(declared_size) {
            debug!("Object {} already stored", id);
            return Ok(PutOutcome::AlreadyPresent);
        }

        // Dropping the temp file on any early return removes it
        let mut tmp = tempfile::Builder::new()
            .prefix("dst")
            .tempfile_in(self.layout.tmp_dir())?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut written = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            hasher.update(&buf[..n]);
            tmp.write_all(&buf[..n])?;
            written += n as u64;
        }
        tmp.as_file().sync_all()?;

        if written != declared_size {
            return Err(StorageError::SizeMismatch {
                id: *id,
                expected: declared_size,
                actual: written,
            });
        }
        let actual = ObjectId::from_hasher(hasher);
        if actual != *id {
            return Err(StorageError::HashMismatch {
                expected: *id,
                actual,
                written,
            });
        }

        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(self.object_mode))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        tmp.persist(&path).map_err(|e| StorageError::Io(e.error))?;

        info!("Stored object {} ({} bytes)", id, written);
        Ok(PutOutcome::Stored { written })
    }

    /// Check that an object exists with the expected size. Does not re-hash.
    pub fn verify(&self, id: &ObjectId, expected_size: u64) -> Result<()> {
        let actual = self.stored_size(id).ok_or(StorageError::NotFound(*id))?;
        if actual != expected_size {
            return Err(StorageError::SizeMismatch {
                id: *id,
                expected: expected_size,
                actual,
            });
        }
        Ok(())
    }

    /// Presence and size check used for batch planning.
    pub fn exists(&self, id: &ObjectId, expected_size: u64) -> bool {
        self.stored_size(id) == Some(expected_size)
    }
}
