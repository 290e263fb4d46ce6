//! Error types for stackfs

use std::ffi::OsString;
use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the shadow layer and its lower collaborators.
///
/// Lower-filesystem I/O errors pass through as [`Error::Io`] and are never
/// reinterpreted.
#[derive(Debug, Error)]
pub enum Error {
    /// Name does not exist in the lower tree. The resolver treats this as
    /// a valid negative result, not a failure.
    #[error("not found: {0:?}")]
    NotFound(OsString),

    /// The lower object belongs to a different lower filesystem instance
    /// than the one this session was mounted on.
    #[error("lower object crosses a mount boundary")]
    CrossMount,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("resource busy")]
    Busy,

    /// The shadow entry cache is at its configured capacity.
    #[error("shadow entry cache exhausted")]
    OutOfMemory,

    #[error("already exists: {0:?}")]
    AlreadyExists(OsString),

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    /// The lower object went away between two steps of an operation.
    #[error("stale lower object")]
    Stale,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Map to an errno value for the FUSE dispatch layer.
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::CrossMount => libc::EXDEV,
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::DirectoryNotEmpty => libc::ENOTEMPTY,
            Error::Busy => libc::EBUSY,
            Error::OutOfMemory => libc::ENOMEM,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::NotADirectory => libc::ENOTDIR,
            Error::IsADirectory => libc::EISDIR,
            Error::Stale => libc::ESTALE,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// True for the resolver's "name does not exist" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::CrossMount.errno(), libc::EXDEV);
        assert_eq!(Error::DirectoryNotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(Error::NotFound("x".into()).errno(), libc::ENOENT);
        let io = Error::Io(std::io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(io.errno(), libc::EACCES);
    }
}
