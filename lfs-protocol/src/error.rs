use lfs_core::{LockError, ObjectIdError, StorageError};
use thiserror::Error;

/// Framing errors. All of them leave the stream out of sync.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid packet header: {0:?}")]
    InvalidHeader(String),

    #[error("packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    #[error("unexpected flush packet")]
    UnexpectedFlush,

    #[error("unexpected delimiter packet")]
    UnexpectedDelimiter,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("packet is not valid UTF-8")]
    InvalidText,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProtocolResult<T> = Result<T, ProtocolError>;

impl From<ProtocolError> for std::io::Error {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => e,
            ProtocolError::UnexpectedEof => {
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err)
            }
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

/// Bad or missing request arguments
#[derive(Debug, Error)]
pub enum ArgumentError {
    #[error("missing object id")]
    MissingObjectId,

    #[error("invalid object id: {0}")]
    InvalidObjectId(#[from] ObjectIdError),

    #[error("missing {0} argument")]
    Missing(&'static str),

    #[error("invalid {key} value: {value}")]
    InvalidValue { key: &'static str, value: String },

    #[error("malformed batch line: {0}")]
    MalformedBatchLine(String),

    #[error("path too long: {len} bytes (max {max})")]
    PathTooLong { len: usize, max: usize },
}

/// Anything a command can fail with
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Argument(#[from] ArgumentError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl SessionError {
    /// Fatal errors end the session; everything else is reported to the
    /// client and the session carries on.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SessionError::Protocol(_)
                | SessionError::Storage(StorageError::Io(_))
                | SessionError::Lock(LockError::Io(_))
        )
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::Protocol(ProtocolError::Io(err))
    }
}
