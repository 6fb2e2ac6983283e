//! OS identity resolution
//!
//! Lock records remember who created them, and `list-lock` classifies each
//! lock as ours or theirs by comparing the lock file's owner with the user
//! running this session.

use std::ffi::CStr;
use std::fs::Metadata;
use std::io;
use std::os::unix::fs::MetadataExt;

/// Resolves user names for lock bookkeeping
pub trait Identity: Send + Sync {
    /// Name of the user running this process.
    fn current_user(&self) -> io::Result<String>;

    /// Name of the user owning a file on disk.
    fn owner_of(&self, metadata: &Metadata) -> io::Result<String>;
}

/// Identity backed by the system user database
#[derive(Debug, Clone, Copy, Default)]
pub struct OsIdentity;

impl Identity for OsIdentity {
    fn current_user(&self) -> io::Result<String> {
        // SAFETY: getuid has no preconditions and cannot fail.
        let uid = unsafe { libc::getuid() };
        user_name(uid)
    }

    fn owner_of(&self, metadata: &Metadata) -> io::Result<String> {
        user_name(metadata.uid())
    }
}

/// Look up the login name for a uid, falling back to the numeric uid when
/// the user database has no entry (containers often run as anonymous uids).
fn user_name(uid: libc::uid_t) -> io::Result<String> {
    let mut buf: Vec<libc::c_char> = vec![0; 1024];
    loop {
        // SAFETY: passwd is plain old data; getpwuid_r fills it in.
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        // SAFETY: every pointer refers to live, correctly sized storage owned
        // by this frame, and buf.len() is the true length of buf.
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
        };
        if rc == libc::ERANGE && buf.len() < 1 << 20 {
            buf.resize(buf.len() * 2, 0);
            continue;
        }
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc));
        }
        if result.is_null() || pwd.pw_name.is_null() {
            return Ok(uid.to_string());
        }
        // SAFETY: on success pw_name points at a NUL-terminated string inside buf.
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };
        return Ok(name.to_string_lossy().into_owned());
    }
}

/// Fixed identities, for tests and embedding
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    current: String,
    file_owner: String,
}

impl StaticIdentity {
    /// Every file is owned by the current user.
    pub fn new(user: impl Into<String>) -> Self {
        let user = user.into();
        Self {
            file_owner: user.clone(),
            current: user,
        }
    }

    /// The current user differs from whoever owns the files on disk.
    pub fn with_file_owner(user: impl Into<String>, file_owner: impl Into<String>) -> Self {
        Self {
            current: user.into(),
            file_owner: file_owner.into(),
        }
    }
}

impl Identity for StaticIdentity {
    fn current_user(&self) -> io::Result<String> {
        Ok(self.current.clone())
    }

    fn owner_of(&self, _metadata: &Metadata) -> io::Result<String> {
        Ok(self.file_owner.clone())
    }
}
