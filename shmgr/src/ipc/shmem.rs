//! POSIX shared memory objects backing emulated segments.
//!
//! Every live segment is backed by one named object created by the manager and
//! opened by each attaching client:
//!
//! - [`Backing<Creator>`] - created by the manager, unlinked on drop
//! - [`Backing<Opener>`] - opened by a client, never unlinks
//! - [`Mapping`] - a client's view of an opened backing object, unmapped on drop
//!
//! # Naming
//!
//! Names are derived from the manager instance tag, the segment id and the
//! slot sequence number (see [`backing_name`]). A slot that is freed and
//! reused gets a new sequence, so a client still mapping the old object never
//! sees the new one, and a restarted manager never collides with names left
//! behind by a crashed one.
//!
//! ```text
//! Manager                          Client
//! ┌─────────────────────┐          ┌────────────────────────┐
//! │ Backing<Creator>    │ shm name │ Backing<Opener>        │
//! │ shm_open(CREAT|EXCL)│ ───────> │ shm_open(RDONLY|RDWR)  │
//! │ ftruncate(size)     │          │ fstat == size          │
//! │ drop: shm_unlink    │          │ Mapping: mmap / munmap │
//! └─────────────────────┘          └────────────────────────┘
//! ```
//!
//! Unlinking only removes the name. Mappings that already exist stay valid
//! until they are unmapped, which is what lets a removed segment outlive its
//! manager-side descriptor.

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr::{NonNull, null_mut};

use rustix::fs::{Mode, fchmod, fstat, ftruncate};
use rustix::mm::{MapFlags, ProtFlags, mmap, munmap};
use rustix::{io, shm};

use crate::error::ShmError;
use crate::types::SegmentId;

/// Result alias for backing store operations.
pub type Result<T> = std::result::Result<T, BackingError>;

/// Prefix shared by every backing object name.
pub const NAME_PREFIX: &str = "/shmgr-";

const POSIX_NAME_MAX: usize = 255;

/// Contextual errors produced while creating, opening or mapping a backing object.
#[derive(Debug)]
pub enum BackingError {
    /// The POSIX shared memory name is invalid.
    InvalidPath { path: String, reason: &'static str },
    /// `shm_open`, `ftruncate`, `mmap`, etc. failed with an errno.
    PosixError {
        op: &'static str,
        path: String,
        source: io::Errno,
    },
    /// The object exists but does not have the size the manager reported.
    SizeMismatch {
        path: String,
        expected: u64,
        actual: i64,
    },
    /// A fixed mapping could not be placed at the requested address.
    Misplaced { path: String },
}

impl BackingError {
    fn posix(op: &'static str, path: &str, err: io::Errno) -> Self {
        Self::PosixError {
            op,
            path: path.to_string(),
            source: err,
        }
    }
}

impl fmt::Display for BackingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackingError::InvalidPath { path, reason } => {
                write!(f, "invalid shared memory path `{path}`: {reason}")
            }
            BackingError::PosixError { op, path, source } => {
                write!(f, "{op} failed for `{path}`: {source}")
            }
            BackingError::SizeMismatch {
                path,
                expected,
                actual,
            } => write!(
                f,
                "shared memory `{path}` size mismatch: expected {expected} bytes, got {actual}"
            ),
            BackingError::Misplaced { path } => {
                write!(f, "shared memory `{path}` was not mapped at the requested address")
            }
        }
    }
}

impl std::error::Error for BackingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackingError::PosixError { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<BackingError> for ShmError {
    fn from(err: BackingError) -> Self {
        match err {
            BackingError::PosixError { source, .. } => ShmError::from(source),
            BackingError::InvalidPath { .. }
            | BackingError::SizeMismatch { .. }
            | BackingError::Misplaced { .. } => ShmError::InvalidArgument,
        }
    }
}

/// Name of the backing object for slot `id` at sequence `seq`, created by the
/// manager instance tagged `instance`.
#[must_use]
pub fn backing_name(instance: u32, id: SegmentId, seq: u32) -> String {
    format!("{NAME_PREFIX}{instance:08x}-{id}-{seq}")
}

/// Validates that a path meets POSIX shm_open requirements.
fn validate_shm_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(BackingError::InvalidPath {
            path: path.to_string(),
            reason: "path must start with '/'",
        });
    }

    if path[1..].contains('/') {
        return Err(BackingError::InvalidPath {
            path: path.to_string(),
            reason: "path must not contain additional '/' characters",
        });
    }

    if path.len() > POSIX_NAME_MAX {
        return Err(BackingError::InvalidPath {
            path: path.to_string(),
            reason: "path length must be <= 255 bytes",
        });
    }

    Ok(())
}

/// Cleanup behavior of a [`Backing`].
pub trait BackingMode {
    /// Whether to unlink the name on drop.
    const SHOULD_UNLINK: bool;
}

/// Typestate marker for the manager, which creates backing objects and
/// unlinks them when the segment is removed.
pub struct Creator;
impl BackingMode for Creator {
    const SHOULD_UNLINK: bool = true;
}

/// Typestate marker for clients, which only open existing objects.
pub struct Opener;
impl BackingMode for Opener {
    const SHOULD_UNLINK: bool = false;
}

/// An open POSIX shared memory object.
pub struct Backing<M: BackingMode> {
    fd: OwnedFd,
    path: String,
    size: u64,
    writable: bool,
    _mode: PhantomData<M>,
}

impl Backing<Creator> {
    /// Creates a new object of `size` bytes with permission bits `mode`.
    ///
    /// The mode is applied with `fchmod` after creation, so the process umask
    /// does not narrow it.
    ///
    /// # Errors
    ///
    /// Fails if the name is invalid, already exists (`EEXIST`), or the object
    /// cannot be sized. Nothing is left behind on failure.
    pub fn create(path: &str, size: u64, mode: u32) -> Result<Self> {
        validate_shm_path(path)?;

        let fd = shm::open(
            path,
            shm::OFlags::CREATE | shm::OFlags::EXCL | shm::OFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|err| BackingError::posix("shm_open", path, err))?;

        let sized = fchmod(&fd, Mode::from_raw_mode(mode))
            .map_err(|err| BackingError::posix("fchmod", path, err))
            .and_then(|()| {
                ftruncate(&fd, size).map_err(|err| BackingError::posix("ftruncate", path, err))
            });
        if let Err(err) = sized {
            drop(fd);
            let _ = shm::unlink(path);
            return Err(err);
        }

        Ok(Self {
            fd,
            path: path.to_string(),
            size,
            writable: true,
            _mode: PhantomData,
        })
    }
}

impl Backing<Opener> {
    /// Opens an existing object, read-write or read-only, and checks that it
    /// has exactly `expected_size` bytes.
    ///
    /// # Errors
    ///
    /// Fails if the object does not exist (`ENOENT`), the caller may not open
    /// it with the requested access (`EACCES`), or its size differs.
    pub fn open(path: &str, expected_size: u64, writable: bool) -> Result<Self> {
        validate_shm_path(path)?;

        let flags = if writable {
            shm::OFlags::RDWR
        } else {
            shm::OFlags::RDONLY
        };
        let fd = shm::open(path, flags, Mode::empty())
            .map_err(|err| BackingError::posix("shm_open", path, err))?;

        let stat = fstat(&fd).map_err(|err| BackingError::posix("fstat", path, err))?;
        if u64::try_from(stat.st_size).ok() != Some(expected_size) {
            return Err(BackingError::SizeMismatch {
                path: path.to_string(),
                expected: expected_size,
                actual: stat.st_size,
            });
        }

        Ok(Self {
            fd,
            path: path.to_string(),
            size: expected_size,
            writable,
            _mode: PhantomData,
        })
    }

    /// Maps the whole object, consuming the handle.
    ///
    /// The mapping is shared and readable; writable if the object was opened
    /// read-write; executable if `exec` is set.
    ///
    /// # Errors
    ///
    /// Fails if `mmap` fails, including when a [`Placement::At`] address is
    /// already occupied.
    pub fn map(self, placement: Placement, exec: bool) -> Result<Mapping> {
        let len = usize::try_from(self.size).map_err(|_| BackingError::SizeMismatch {
            path: self.path.clone(),
            expected: self.size,
            actual: -1,
        })?;

        let mut prot = ProtFlags::READ;
        if self.writable {
            prot |= ProtFlags::WRITE;
        }
        if exec {
            prot |= ProtFlags::EXEC;
        }

        let (hint, flags) = match placement {
            Placement::Anywhere => (null_mut(), MapFlags::SHARED),
            Placement::At(addr) => (
                addr.as_ptr(),
                MapFlags::SHARED | MapFlags::from_bits_retain(libc::MAP_FIXED_NOREPLACE as u32),
            ),
            Placement::Replace(addr) => (
                addr.as_ptr(),
                MapFlags::SHARED | MapFlags::from_bits_retain(libc::MAP_FIXED as u32),
            ),
        };

        // SAFETY: The object was sized by its creator and fstat confirmed it
        // holds `len` bytes. `Anywhere` and `At` never overlay existing
        // mappings; `Replace` is only requested by callers that asked to
        // replace whatever lives at the address.
        let ptr = match unsafe { mmap(hint, len, prot, flags, &self.fd, 0) } {
            Ok(ptr) => ptr,
            Err(io::Errno::EXIST) => {
                return Err(BackingError::Misplaced {
                    path: self.path.clone(),
                });
            }
            Err(err) => return Err(BackingError::posix("mmap", &self.path, err)),
        };

        // Kernels without MAP_FIXED_NOREPLACE treat the address as a hint.
        if !hint.is_null() && ptr != hint {
            // SAFETY: `ptr` is the fresh mapping of `len` bytes made above.
            unsafe {
                let _ = munmap(ptr, len);
            }
            return Err(BackingError::Misplaced {
                path: self.path.clone(),
            });
        }

        // SAFETY: mmap never returns null on success.
        let ptr = unsafe { NonNull::new_unchecked(ptr) };

        Ok(Mapping {
            ptr,
            len,
            backing: self,
        })
    }
}

impl<M: BackingMode> Backing<M> {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }
}

impl<M: BackingMode> AsFd for Backing<M> {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl<M: BackingMode> fmt::Debug for Backing<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backing")
            .field("path", &self.path)
            .field("size", &self.size)
            .field("unlink_on_drop", &M::SHOULD_UNLINK)
            .finish()
    }
}

impl<M: BackingMode> Drop for Backing<M> {
    fn drop(&mut self) {
        if M::SHOULD_UNLINK {
            let _ = shm::unlink(&self.path);
        }
    }
}

/// Where to place a new mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Let the kernel choose.
    Anywhere,
    /// Exactly this address; fail if anything is mapped there.
    At(NonNull<c_void>),
    /// Exactly this address, replacing whatever is mapped there.
    Replace(NonNull<c_void>),
}

/// A mapped backing object together with its descriptor.
///
/// Dropping the mapping unmaps it and closes the descriptor.
pub struct Mapping {
    ptr: NonNull<c_void>,
    len: usize,
    backing: Backing<Opener>,
}

// SAFETY: The mapping is plain shared memory owned by this handle; the handle
// only exposes the address, never a reference into it.
unsafe impl Send for Mapping {}
// SAFETY: See above; `&Mapping` gives no access to the mapped bytes.
unsafe impl Sync for Mapping {}

impl Mapping {
    #[must_use]
    pub const fn addr(&self) -> NonNull<c_void> {
        self.ptr
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Descriptor number of the backing object, unique among this process's
    /// open mappings.
    #[must_use]
    pub fn raw_fd(&self) -> RawFd {
        self.backing.fd.as_raw_fd()
    }

    /// Whether `addr` is the start of this mapping.
    #[must_use]
    pub fn starts_at(&self, addr: *const c_void) -> bool {
        std::ptr::eq(self.ptr.as_ptr().cast_const(), addr)
    }
}

impl fmt::Debug for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mapping")
            .field("addr", &self.ptr)
            .field("len", &self.len)
            .field("path", &self.backing.path)
            .field("fd", &self.backing.fd.as_raw_fd())
            .finish()
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` describe the mapping created in `Backing::map`,
        // which nothing else unmaps.
        unsafe {
            let _ = munmap(self.ptr.as_ptr(), self.len);
        }
    }
}
