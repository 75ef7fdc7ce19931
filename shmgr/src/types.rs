//! Core types shared by the client library, the wire protocol and the manager.

use std::fmt;

use bitflags::bitflags;

use crate::error::ShmError;

/// Application-chosen token that lets unrelated processes agree on a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Key(i32);

impl Key {
    /// The anonymous key: every creating Get with it yields a fresh segment.
    pub const PRIVATE: Self = Self(0);

    #[must_use]
    pub const fn new(key: i32) -> Self {
        Self(key)
    }

    #[must_use]
    pub const fn is_private(self) -> bool {
        self.0 == Self::PRIVATE.0
    }

    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl From<i32> for Key {
    fn from(key: i32) -> Self {
        Self(key)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_private() {
            f.write_str("private")
        } else {
            write!(f, "{:#x}", self.0)
        }
    }
}

/// Public segment identifier. Equal to the segment's slot in the manager table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct SegmentId(u32);

impl SegmentId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for SegmentId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<SegmentId> for u32 {
    fn from(id: SegmentId) -> Self {
        id.0
    }
}

impl TryFrom<i32> for SegmentId {
    type Error = ShmError;

    fn try_from(id: i32) -> Result<Self, Self::Error> {
        u32::try_from(id)
            .map(Self)
            .map_err(|_| ShmError::InvalidArgument)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a message sender, as reported by the connection it arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

impl Credentials {
    #[must_use]
    pub const fn new(uid: u32, gid: u32, pid: i32) -> Self {
        Self { uid, gid, pid }
    }

    /// Superuser requests bypass every permission check.
    #[must_use]
    pub const fn is_superuser(&self) -> bool {
        self.uid == 0
    }

    /// Credentials of the calling process.
    #[must_use]
    pub fn current() -> Self {
        Self {
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            pid: rustix::process::getpid().as_raw_nonzero().get(),
        }
    }
}

/// Mode word layout of a segment.
pub mod mode {
    /// Read/write bits for owner, group and others.
    pub const PERM_MASK: u32 = 0o777;
    /// Set while the segment is locked via [`ControlCommand::Lock`](super::ControlCommand::Lock).
    pub const LOCKED: u32 = 0o2000;

    pub const READ: u32 = 0o4;
    pub const WRITE: u32 = 0o2;
}

bitflags! {
    /// Flags for [`get`](crate::client::ShmContext::get).
    ///
    /// The low nine bits carry the permission mode of a segment created by the call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GetFlags: u32 {
        /// Create the segment if the key has none.
        const CREATE = 0o1000;
        /// With `CREATE`, fail if the key already has a segment.
        const EXCL = 0o2000;
        const _ = mode::PERM_MASK;
    }
}

impl GetFlags {
    /// Adds permission bits (`0o640` and the like) to the flags.
    #[must_use]
    pub const fn with_mode(self, perm: u32) -> Self {
        Self::from_bits_retain(self.bits() | (perm & mode::PERM_MASK))
    }

    #[must_use]
    pub const fn perm(self) -> u32 {
        self.bits() & mode::PERM_MASK
    }
}

bitflags! {
    /// Flags for [`attach`](crate::client::ShmContext::attach).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttachFlags: u32 {
        /// Map read-only; only read permission is required.
        const RDONLY = 0o10000;
        /// Round a requested address down to the mapping granularity.
        const RND = 0o20000;
        /// Allow replacing mappings already present at the requested address.
        const REMAP = 0o40000;
        /// Map executable.
        const EXEC = 0o100000;
    }
}

/// Control operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ControlCommand {
    /// Destroy the segment. Existing mappings stay valid until detached.
    Remove = 0,
    /// Change owner uid/gid and permission bits.
    Set = 1,
    /// Read the full descriptor.
    Stat = 2,
    Lock = 11,
    Unlock = 12,
}

impl TryFrom<i32> for ControlCommand {
    type Error = ShmError;

    fn try_from(cmd: i32) -> Result<Self, Self::Error> {
        match cmd {
            0 => Ok(Self::Remove),
            1 => Ok(Self::Set),
            2 => Ok(Self::Stat),
            11 => Ok(Self::Lock),
            12 => Ok(Self::Unlock),
            _ => Err(ShmError::InvalidArgument),
        }
    }
}

/// Ownership and permission block of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct IpcPerm {
    pub key: i32,
    /// Owner.
    pub uid: u32,
    pub gid: u32,
    /// Creator.
    pub cuid: u32,
    pub cgid: u32,
    /// Permission bits plus [`mode::LOCKED`].
    pub mode: u32,
    /// Slot sequence number; changes every time the slot is freed.
    pub seq: u32,
}

/// Full segment descriptor as returned by [`ControlCommand::Stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct SegmentStat {
    pub perm: IpcPerm,
    pub size: u64,
    /// Last attach, last detach and last change, in seconds since the epoch.
    pub atime: i64,
    pub dtime: i64,
    pub ctime: i64,
    /// Creator pid.
    pub cpid: i32,
    /// Pid of the last attach or detach.
    pub lpid: i32,
    pub nattch: u64,
}
