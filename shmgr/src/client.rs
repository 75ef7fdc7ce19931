//! Client library: the four segment operations on an explicit context.
//!
//! A [`ShmContext`] owns one cached manager channel and the table of segments
//! this process has attached through it. Every call is synchronous: it sends
//! one request, waits for the reply and, for attach and detach, maps or
//! unmaps the backing object locally.
//!
//! # Example
//!
//! ```no_run
//! use shmgr::client::ShmContext;
//! use shmgr::types::{AttachFlags, GetFlags, Key};
//!
//! let ctx = ShmContext::new();
//! let id = ctx.get(Key::new(42), 4096, GetFlags::CREATE.with_mode(0o600))?;
//! let addr = ctx.attach(id, None, AttachFlags::empty())?;
//! unsafe { addr.cast::<u64>().write(7) };
//! ctx.detach(addr.as_ptr())?;
//! ctx.remove(id)?;
//! # Ok::<(), shmgr::error::ShmError>(())
//! ```

mod channel;
mod table;

use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use crate::error::{Result, ShmError};
use crate::ipc::shmem::{Backing, Opener, Placement, backing_name};
use crate::manager::default_socket_path;
use crate::protocol::{
    AttachReply, AttachRequest, ControlRequest, DetachRequest, GetRequest, Reply, Request,
};
use crate::trace::{debug, warn};
use crate::types::{AttachFlags, ControlCommand, GetFlags, IpcPerm, Key, SegmentId, SegmentStat};

use channel::ChannelCache;
use table::{AttachEntry, AttachTable};

/// Per-process client state.
///
/// Cheap to create: the manager is first contacted by the first operation.
/// Dropping the context detaches every segment still attached through it.
pub struct ShmContext {
    channel: ChannelCache,
    attached: Mutex<AttachTable>,
}

impl Default for ShmContext {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ShmContext {
    fn drop(&mut self) {
        let entries = self
            .attached
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take_all();
        for entry in entries {
            if let Err(err) = self.send_detach(entry.id, entry.seq) {
                debug!(id = %entry.id, error = %err, "detach on drop not delivered");
            }
        }
    }
}

impl ShmContext {
    /// Context for the manager at `SHMGR_SOCKET`, or the default socket path.
    #[must_use]
    pub fn new() -> Self {
        Self::connect_to(default_socket_path())
    }

    /// Context for the manager listening on `socket_path`.
    #[must_use]
    pub fn connect_to(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            channel: ChannelCache::new(socket_path.into()),
            attached: Mutex::new(AttachTable::default()),
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        self.channel.path()
    }

    /// Number of segments currently attached through this context.
    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.attached_table().len()
    }

    fn attached_table(&self) -> std::sync::MutexGuard<'_, AttachTable> {
        self.attached.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the id of the segment for `key`, creating it when `flags`
    /// contains [`GetFlags::CREATE`] and no segment exists yet.
    /// [`Key::PRIVATE`] always creates a new segment.
    ///
    /// # Errors
    ///
    /// - [`ShmError::Exists`]: `CREATE | EXCL` and the key has a segment
    /// - [`ShmError::NotFound`]: no segment and no `CREATE`
    /// - [`ShmError::PermissionDenied`]: the mode bits in `flags` are not granted
    /// - [`ShmError::InvalidArgument`]: `size` is larger than the existing
    ///   segment, or outside the manager's limits for a new one
    /// - [`ShmError::NoSpace`]: the manager's table is full
    pub fn get(&self, key: Key, size: usize, flags: GetFlags) -> Result<SegmentId> {
        let size = u64::try_from(size).map_err(|_| ShmError::InvalidArgument)?;
        match self.channel.call(&Request::Get(GetRequest { key, size, flags }))? {
            Reply::Get(id) => Ok(id),
            _ => Err(ShmError::NotSupported),
        }
    }

    /// Maps segment `id` into this process and returns its address.
    ///
    /// With `addr` the mapping is placed exactly there: the address must be
    /// page-aligned unless [`AttachFlags::RND`] rounds it down, and it must
    /// be free unless [`AttachFlags::REMAP`] allows replacing what is mapped.
    ///
    /// # Errors
    ///
    /// - [`ShmError::InvalidArgument`]: bad id, misaligned address, or
    ///   `REMAP` without an address or over a segment attached through this
    ///   context
    /// - [`ShmError::PermissionDenied`]: read (or write, without `RDONLY`)
    ///   permission is not granted
    /// - any OS error from opening or mapping the backing object
    pub fn attach(
        &self,
        id: SegmentId,
        addr: Option<NonNull<c_void>>,
        flags: AttachFlags,
    ) -> Result<NonNull<c_void>> {
        let placement = placement(addr, flags, rustix::param::page_size())?;

        let reply = match self.channel.call(&Request::Attach(AttachRequest { id, flags }))? {
            Reply::Attach(reply) => reply,
            _ => return Err(ShmError::NotSupported),
        };

        let mapped = self
            .check_replace(placement, reply.size)
            .and_then(|()| map_segment(id, &reply, placement, flags));
        let mapping = match mapped {
            Ok(mapping) => mapping,
            Err(err) => {
                // The manager already counted this attach.
                if let Err(undo) = self.send_detach(id, reply.seq) {
                    warn!(%id, error = %undo, "failed to undo attach");
                }
                return Err(err);
            }
        };

        let base = mapping.addr();
        debug!(%id, seq = reply.seq, addr = ?base, len = mapping.len(), "attached");
        self.attached_table().insert(AttachEntry {
            id,
            seq: reply.seq,
            mapping,
        });
        Ok(base)
    }

    /// `REMAP` may replace foreign mappings but never a segment attached
    /// through this context, whose entry would otherwise dangle.
    fn check_replace(&self, placement: Placement, size: u64) -> Result<()> {
        let Placement::Replace(addr) = placement else {
            return Ok(());
        };
        let len = usize::try_from(size).map_err(|_| ShmError::InvalidArgument)?;
        if self.attached_table().overlaps(addr.as_ptr().addr(), len) {
            return Err(ShmError::InvalidArgument);
        }
        Ok(())
    }

    /// Unmaps the segment attached at `addr`.
    ///
    /// The mapping is torn down even if the manager cannot be told; the
    /// transport error is returned afterwards.
    ///
    /// # Errors
    ///
    /// - [`ShmError::InvalidArgument`]: nothing is attached at `addr`
    /// - [`ShmError::NotSupported`]: the manager could not be reached
    pub fn detach(&self, addr: *const c_void) -> Result<()> {
        let entry = self
            .attached_table()
            .remove_by_addr(addr)
            .ok_or(ShmError::InvalidArgument)?;

        let outcome = self.send_detach(entry.id, entry.seq);
        debug!(id = %entry.id, seq = entry.seq, "detached");
        drop(entry);
        outcome
    }

    fn send_detach(&self, id: SegmentId, seq: u32) -> Result<()> {
        match self.channel.call(&Request::Detach(DetachRequest { id, seq }))? {
            Reply::Detach => Ok(()),
            _ => Err(ShmError::NotSupported),
        }
    }

    /// Runs a control command on segment `id`.
    ///
    /// - [`ControlCommand::Stat`] fills `stat` with the segment's descriptor.
    /// - [`ControlCommand::Set`] applies `stat.perm.uid`, `stat.perm.gid` and
    ///   the permission bits of `stat.perm.mode`.
    /// - [`ControlCommand::Remove`] destroys the segment; existing mappings
    ///   stay valid until detached.
    /// - [`ControlCommand::Lock`] / [`ControlCommand::Unlock`] toggle the
    ///   segment's locked flag.
    ///
    /// # Errors
    ///
    /// - [`ShmError::InvalidArgument`]: bad id
    /// - [`ShmError::PermissionDenied`]: `Stat` without read permission
    /// - [`ShmError::NotPermitted`]: any other command by neither owner nor creator
    pub fn control(&self, id: SegmentId, command: ControlCommand, stat: &mut SegmentStat) -> Result<()> {
        let request = Request::Control(ControlRequest {
            id,
            command: command as i32,
            stat: *stat,
        });
        match self.channel.call(&request)? {
            Reply::Control(reply) => {
                if command == ControlCommand::Stat {
                    *stat = reply;
                }
                Ok(())
            }
            _ => Err(ShmError::NotSupported),
        }
    }

    /// Reads the descriptor of segment `id`.
    ///
    /// # Errors
    ///
    /// See [`control`](Self::control).
    pub fn stat(&self, id: SegmentId) -> Result<SegmentStat> {
        let mut stat = SegmentStat::default();
        self.control(id, ControlCommand::Stat, &mut stat)?;
        Ok(stat)
    }

    /// Changes owner and permission bits of segment `id`.
    ///
    /// # Errors
    ///
    /// See [`control`](Self::control).
    pub fn set(&self, id: SegmentId, uid: u32, gid: u32, mode: u32) -> Result<()> {
        let mut stat = SegmentStat {
            perm: IpcPerm {
                uid,
                gid,
                mode,
                ..IpcPerm::default()
            },
            ..SegmentStat::default()
        };
        self.control(id, ControlCommand::Set, &mut stat)
    }

    /// Destroys segment `id`.
    ///
    /// # Errors
    ///
    /// See [`control`](Self::control).
    pub fn remove(&self, id: SegmentId) -> Result<()> {
        self.control(id, ControlCommand::Remove, &mut SegmentStat::default())
    }
}

/// Resolves the requested address into a placement, checking alignment
/// against `granularity`.
fn placement(
    addr: Option<NonNull<c_void>>,
    flags: AttachFlags,
    granularity: usize,
) -> Result<Placement> {
    let remap = flags.contains(AttachFlags::REMAP);
    let Some(addr) = addr else {
        return if remap {
            Err(ShmError::InvalidArgument)
        } else {
            Ok(Placement::Anywhere)
        };
    };

    let mut raw = addr.as_ptr();
    let misalignment = raw.addr() % granularity;
    if misalignment != 0 {
        if !flags.contains(AttachFlags::RND) {
            return Err(ShmError::InvalidArgument);
        }
        raw = raw.wrapping_byte_sub(misalignment);
    }

    match NonNull::new(raw) {
        Some(addr) if remap => Ok(Placement::Replace(addr)),
        Some(addr) => Ok(Placement::At(addr)),
        // Rounded down to zero.
        None if remap => Err(ShmError::InvalidArgument),
        None => Ok(Placement::Anywhere),
    }
}

fn map_segment(
    id: SegmentId,
    reply: &AttachReply,
    placement: Placement,
    flags: AttachFlags,
) -> Result<crate::ipc::shmem::Mapping> {
    let name = backing_name(reply.instance, id, reply.seq);
    let writable = !flags.contains(AttachFlags::RDONLY);
    Backing::<Opener>::open(&name, reply.size, writable)
        .and_then(|backing| backing.map(placement, flags.contains(AttachFlags::EXEC)))
        .map_err(|err| {
            warn!(%id, error = %err, "failed to map segment");
            ShmError::from(err)
        })
}
