//! Error handling and errno mapping for the host adapter.
//!
//! Nothing crosses the host boundary except an errno: every core error and
//! every adapter error is converted with [`ToErrno`].

use nimbus_core::{ItemError, TransportError};
use thiserror::Error;

/// Adapter-level errors.
#[derive(Debug, Error)]
pub enum MountError {
    /// Error from the item cache.
    #[error(transparent)]
    Item(#[from] ItemError),

    /// Unknown or already released file handle.
    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    /// Negative offset or size from the host.
    #[error("Invalid offset: {0}")]
    InvalidOffset(i64),

    /// Exclusive create of a name that is taken.
    #[error("File already exists: {0}")]
    AlreadyExists(String),

    /// Configuration could not be parsed.
    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// Upload lanes could not be started.
    #[error("Could not start upload workers: {0}")]
    Workers(#[from] std::io::Error),
}

impl From<TransportError> for MountError {
    fn from(e: TransportError) -> Self {
        MountError::Item(ItemError::Transport(e))
    }
}

/// Result type for adapter operations.
pub type MountResult<T> = Result<T, MountError>;

/// Extension trait to convert errors to errno.
pub trait ToErrno {
    /// Converts this error to a libc error code.
    fn to_errno(&self) -> i32;
}

impl ToErrno for TransportError {
    fn to_errno(&self) -> i32 {
        match self {
            TransportError::AlreadyExists { .. } => libc::EEXIST,
            TransportError::NotFound { .. } => libc::ENOENT,
            TransportError::Unauthorized => libc::EACCES,
            TransportError::Status { .. }
            | TransportError::Network(_)
            | TransportError::Decode(_) => libc::EIO,
        }
    }
}

impl ToErrno for ItemError {
    fn to_errno(&self) -> i32 {
        match self {
            ItemError::Transport(e) => e.to_errno(),
            ItemError::NotFound(_) | ItemError::StaleHandle(_) => libc::ENOENT,
            ItemError::OutOfBounds { .. } | ItemError::InvalidMove(_) => libc::EINVAL,
            ItemError::FileTooLarge { .. } => libc::EFBIG,
            ItemError::NotADirectory(_) => libc::ENOTDIR,
            ItemError::IsADirectory(_) => libc::EISDIR,
            ItemError::UnresolvedParent(_) | ItemError::Inconsistent(_) | ItemError::Decode(_) => {
                libc::EIO
            }
        }
    }
}

impl ToErrno for MountError {
    fn to_errno(&self) -> i32 {
        match self {
            MountError::Item(e) => e.to_errno(),
            MountError::InvalidHandle(_) => libc::EBADF,
            MountError::InvalidOffset(_) => libc::EINVAL,
            MountError::AlreadyExists(_) => libc::EEXIST,
            MountError::Config(_) | MountError::Workers(_) => libc::EIO,
        }
    }
}
