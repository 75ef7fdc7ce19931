//! Errors surfaced by the public API, each carrying its legacy `errno` code.

use thiserror::Error;

/// Result alias for segment operations.
pub type Result<T> = std::result::Result<T, ShmError>;

/// Failure of a get/attach/detach/control call.
///
/// Every variant maps to the `errno` value the legacy API reports for it, and
/// travels over the wire as that value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShmError {
    /// A segment already exists for the key and `CREATE | EXCL` was given.
    #[error("segment already exists")]
    Exists,
    /// No segment exists for the key and `CREATE` was not given.
    #[error("no segment for key")]
    NotFound,
    /// The caller lacks a read or write permission bit.
    #[error("permission denied")]
    PermissionDenied,
    /// The caller is neither owner nor creator of the segment.
    #[error("operation not permitted")]
    NotPermitted,
    /// Bad id, size, address or command.
    #[error("invalid argument")]
    InvalidArgument,
    /// The segment table reached its configured capacity.
    #[error("segment table full")]
    NoSpace,
    #[error("out of memory")]
    NoMemory,
    /// The manager could not be reached, even after reconnecting.
    #[error("shared memory manager unavailable")]
    NotSupported,
    /// The manager does not handle the request's service id.
    #[error("request not handled")]
    NotHandled,
    /// Any other OS error, by raw `errno`.
    #[error("os error {0}")]
    Os(i32),
}

impl ShmError {
    /// The legacy `errno` code for this error.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::Exists => libc::EEXIST,
            Self::NotFound => libc::ENOENT,
            Self::PermissionDenied => libc::EACCES,
            Self::NotPermitted => libc::EPERM,
            Self::InvalidArgument => libc::EINVAL,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMemory => libc::ENOMEM,
            Self::NotSupported => libc::ENOTSUP,
            Self::NotHandled => libc::ENOSYS,
            Self::Os(code) => code,
        }
    }

    /// Inverse of [`errno`](Self::errno).
    #[must_use]
    pub const fn from_errno(code: i32) -> Self {
        match code {
            libc::EEXIST => Self::Exists,
            libc::ENOENT => Self::NotFound,
            libc::EACCES => Self::PermissionDenied,
            libc::EPERM => Self::NotPermitted,
            libc::EINVAL => Self::InvalidArgument,
            libc::ENOSPC => Self::NoSpace,
            libc::ENOMEM => Self::NoMemory,
            libc::ENOTSUP => Self::NotSupported,
            libc::ENOSYS => Self::NotHandled,
            other => Self::Os(other),
        }
    }

    /// True for both flavours of permission failure.
    #[must_use]
    pub const fn is_permission(self) -> bool {
        matches!(self, Self::PermissionDenied | Self::NotPermitted)
    }
}

impl From<rustix::io::Errno> for ShmError {
    fn from(err: rustix::io::Errno) -> Self {
        Self::from_errno(err.raw_os_error())
    }
}
