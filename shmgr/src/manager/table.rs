//! Authoritative segment table.
//!
//! The table is an arena of slots indexed by segment id. A slot is either free
//! (`segment == None`) or holds one live descriptor. Free slots are kept in an
//! ordered set so allocation always reuses the lowest index. Every slot carries
//! a sequence number that is bumped when its segment is removed; the sequence
//! is part of the backing object name and of every Detach, which keeps a
//! reused slot apart from mappings of the segment it used to hold.
//!
//! ```text
//! slots:  [ 0: live(key 42) | 1: free seq 1 | 2: live(private) | 3: free seq 0 ]
//! free:   {1, 3}
//! keys:   {42 -> 0}
//! ```

use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ShmError;
use crate::ipc::shmem::{Backing, Creator, backing_name};
use crate::protocol::AttachReply;
use crate::trace::{debug, info, warn};
use crate::types::{
    AttachFlags, ControlCommand, Credentials, GetFlags, IpcPerm, Key, SegmentId, SegmentStat,
    mode,
};

use super::perm::{check_access, check_manage};

/// Creates the backing object of a new segment.
///
/// Dropping the handle must destroy the object.
pub trait BackingStore {
    type Handle;

    fn create(&mut self, name: &str, size: u64) -> Result<Self::Handle, ShmError>;
}

/// Backing objects in POSIX shared memory.
#[derive(Debug, Clone, Copy)]
pub struct PosixStore {
    mode: u32,
}

impl PosixStore {
    /// Objects are created with permission bits `mode`.
    #[must_use]
    pub const fn new(mode: u32) -> Self {
        Self { mode }
    }
}

impl BackingStore for PosixStore {
    type Handle = Backing<Creator>;

    fn create(&mut self, name: &str, size: u64) -> Result<Self::Handle, ShmError> {
        Backing::<Creator>::create(name, size, self.mode).map_err(|err| {
            warn!(error = %err, "failed to create backing object");
            ShmError::from(err)
        })
    }
}

/// Size and capacity limits of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Upper bound on the number of slots.
    pub max_segments: usize,
    /// Slots added each time the arena runs out of free slots.
    pub grow_increment: usize,
    /// Smallest segment a Get may create.
    pub shmmin: u64,
    /// Largest segment a Get may create.
    pub shmmax: u64,
}

struct Segment<H> {
    key: Key,
    uid: u32,
    gid: u32,
    cuid: u32,
    cgid: u32,
    mode: u32,
    size: u64,
    cpid: i32,
    lpid: i32,
    atime: i64,
    dtime: i64,
    ctime: i64,
    nattch: u64,
    _backing: H,
}

impl<H> Segment<H> {
    fn perm(&self, seq: u32) -> IpcPerm {
        IpcPerm {
            key: self.key.as_raw(),
            uid: self.uid,
            gid: self.gid,
            cuid: self.cuid,
            cgid: self.cgid,
            mode: self.mode,
            seq,
        }
    }

    fn stat(&self, seq: u32) -> SegmentStat {
        SegmentStat {
            perm: self.perm(seq),
            size: self.size,
            atime: self.atime,
            dtime: self.dtime,
            ctime: self.ctime,
            cpid: self.cpid,
            lpid: self.lpid,
            nattch: self.nattch,
        }
    }
}

struct Slot<H> {
    seq: u32,
    segment: Option<Segment<H>>,
}

/// The manager's segment table.
pub struct SegmentTable<S: BackingStore = PosixStore> {
    slots: Vec<Slot<S::Handle>>,
    free: BTreeSet<usize>,
    keys: HashMap<Key, usize>,
    limits: Limits,
    instance: u32,
    store: S,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

impl<S: BackingStore> SegmentTable<S> {
    /// Creates an empty table. `instance` tags every backing object name.
    pub fn new(limits: Limits, instance: u32, store: S) -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            keys: HashMap::new(),
            limits,
            instance,
            store,
        }
    }

    #[must_use]
    pub const fn instance(&self) -> u32 {
        self.instance
    }

    /// Number of live segments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots currently allocated in the arena.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Looks up the segment for `key`, creating it if allowed.
    pub fn get(
        &mut self,
        who: &Credentials,
        key: Key,
        size: u64,
        flags: GetFlags,
    ) -> Result<SegmentId, ShmError> {
        if !key.is_private() {
            if let Some(&index) = self.keys.get(&key) {
                return self.get_existing(who, index, size, flags);
            }
            if !flags.contains(GetFlags::CREATE) {
                return Err(ShmError::NotFound);
            }
        }
        self.create(who, key, size, flags.perm())
    }

    fn get_existing(
        &self,
        who: &Credentials,
        index: usize,
        size: u64,
        flags: GetFlags,
    ) -> Result<SegmentId, ShmError> {
        if flags.contains(GetFlags::CREATE | GetFlags::EXCL) {
            return Err(ShmError::Exists);
        }
        let slot = &self.slots[index];
        let segment = slot.segment.as_ref().ok_or(ShmError::InvalidArgument)?;
        check_access(&segment.perm(slot.seq), who, flags.perm())?;
        if size > segment.size {
            return Err(ShmError::InvalidArgument);
        }
        Ok(segment_id(index))
    }

    fn create(
        &mut self,
        who: &Credentials,
        key: Key,
        size: u64,
        perm: u32,
    ) -> Result<SegmentId, ShmError> {
        if size < self.limits.shmmin || size > self.limits.shmmax {
            return Err(ShmError::InvalidArgument);
        }

        let index = self.take_free_slot()?;
        let seq = self.slots[index].seq;
        let name = backing_name(self.instance, segment_id(index), seq);
        let backing = match self.store.create(&name, size) {
            Ok(backing) => backing,
            Err(err) => {
                self.free.insert(index);
                return Err(err);
            }
        };

        self.slots[index].segment = Some(Segment {
            key,
            uid: who.uid,
            gid: who.gid,
            cuid: who.uid,
            cgid: who.gid,
            mode: perm & mode::PERM_MASK,
            size,
            cpid: who.pid,
            lpid: 0,
            atime: 0,
            dtime: 0,
            ctime: now(),
            nattch: 0,
            _backing: backing,
        });
        if !key.is_private() {
            self.keys.insert(key, index);
        }

        info!(id = index, seq, %key, size, uid = who.uid, "segment created");
        Ok(segment_id(index))
    }

    fn take_free_slot(&mut self) -> Result<usize, ShmError> {
        if let Some(index) = self.free.pop_first() {
            return Ok(index);
        }

        let len = self.slots.len();
        let new_len = len
            .saturating_add(self.limits.grow_increment.max(1))
            .min(self.limits.max_segments);
        if new_len <= len {
            warn!(max_segments = self.limits.max_segments, "segment table full");
            return Err(ShmError::NoSpace);
        }

        self.slots.resize_with(new_len, || Slot {
            seq: 0,
            segment: None,
        });
        self.free.extend(len + 1..new_len);
        debug!(from = len, to = new_len, "segment table grown");
        Ok(len)
    }

    fn live(&self, id: SegmentId) -> Result<(&Segment<S::Handle>, u32), ShmError> {
        let slot = self.slots.get(id.index()).ok_or(ShmError::InvalidArgument)?;
        let segment = slot.segment.as_ref().ok_or(ShmError::InvalidArgument)?;
        Ok((segment, slot.seq))
    }

    fn live_mut(&mut self, id: SegmentId) -> Result<(&mut Segment<S::Handle>, u32), ShmError> {
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or(ShmError::InvalidArgument)?;
        let seq = slot.seq;
        let segment = slot.segment.as_mut().ok_or(ShmError::InvalidArgument)?;
        Ok((segment, seq))
    }

    /// Counts an attach and returns what the client needs to map the segment.
    pub fn attach(
        &mut self,
        who: &Credentials,
        id: SegmentId,
        flags: AttachFlags,
    ) -> Result<AttachReply, ShmError> {
        let instance = self.instance;
        let (segment, seq) = self.live_mut(id)?;

        let mut wanted = mode::READ;
        if !flags.contains(AttachFlags::RDONLY) {
            wanted |= mode::WRITE;
        }
        check_access(&segment.perm(seq), who, wanted)?;

        segment.nattch += 1;
        segment.lpid = who.pid;
        segment.atime = now();
        debug!(%id, seq, nattch = segment.nattch, pid = who.pid, "attach");

        Ok(AttachReply {
            size: segment.size,
            seq,
            instance,
        })
    }

    /// Undoes one attach of the segment that held slot `id` at sequence `seq`.
    ///
    /// If the segment has been removed since, nothing is counted and the call
    /// succeeds.
    pub fn detach(&mut self, who: &Credentials, id: SegmentId, seq: u32) -> Result<(), ShmError> {
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or(ShmError::InvalidArgument)?;
        if slot.seq != seq {
            debug!(%id, seq, current = slot.seq, "detach of removed segment");
            return Ok(());
        }
        let segment = slot.segment.as_mut().ok_or(ShmError::InvalidArgument)?;

        segment.nattch = segment.nattch.saturating_sub(1);
        segment.lpid = who.pid;
        segment.dtime = now();
        debug!(%id, seq, nattch = segment.nattch, pid = who.pid, "detach");
        Ok(())
    }

    /// Runs a control command. `arg` supplies the new owner and mode for
    /// [`ControlCommand::Set`]; the reply carries the resulting descriptor,
    /// or a zeroed one after [`ControlCommand::Remove`].
    pub fn control(
        &mut self,
        who: &Credentials,
        id: SegmentId,
        command: ControlCommand,
        arg: &SegmentStat,
    ) -> Result<SegmentStat, ShmError> {
        match command {
            ControlCommand::Stat => self.stat(who, id),
            ControlCommand::Set => self.set(who, id, &arg.perm),
            ControlCommand::Remove => self.remove(who, id).map(|()| SegmentStat::default()),
            ControlCommand::Lock => self.set_locked(who, id, true),
            ControlCommand::Unlock => self.set_locked(who, id, false),
        }
    }

    pub fn stat(&self, who: &Credentials, id: SegmentId) -> Result<SegmentStat, ShmError> {
        let (segment, seq) = self.live(id)?;
        check_access(&segment.perm(seq), who, mode::READ)?;
        Ok(segment.stat(seq))
    }

    /// Replaces owner uid/gid and permission bits; everything else in `perm`
    /// is ignored.
    pub fn set(
        &mut self,
        who: &Credentials,
        id: SegmentId,
        perm: &IpcPerm,
    ) -> Result<SegmentStat, ShmError> {
        let (segment, seq) = self.live_mut(id)?;
        check_manage(&segment.perm(seq), who)?;

        segment.uid = perm.uid;
        segment.gid = perm.gid;
        segment.mode = (segment.mode & !mode::PERM_MASK) | (perm.mode & mode::PERM_MASK);
        segment.ctime = now();
        info!(%id, uid = perm.uid, gid = perm.gid, mode = segment.mode, "segment updated");
        Ok(segment.stat(seq))
    }

    /// Destroys the segment immediately, whatever its attach count. Existing
    /// mappings stay valid; the key becomes free for a new segment.
    pub fn remove(&mut self, who: &Credentials, id: SegmentId) -> Result<(), ShmError> {
        let (segment, seq) = self.live(id)?;
        check_manage(&segment.perm(seq), who)?;

        let index = id.index();
        let slot = &mut self.slots[index];
        let Some(segment) = slot.segment.take() else {
            return Err(ShmError::InvalidArgument);
        };
        slot.seq = slot.seq.wrapping_add(1);
        if !segment.key.is_private() {
            self.keys.remove(&segment.key);
        }
        self.free.insert(index);

        info!(%id, seq, key = %segment.key, nattch = segment.nattch, "segment removed");
        Ok(())
    }

    fn set_locked(
        &mut self,
        who: &Credentials,
        id: SegmentId,
        locked: bool,
    ) -> Result<SegmentStat, ShmError> {
        let (segment, seq) = self.live_mut(id)?;
        check_manage(&segment.perm(seq), who)?;

        if locked {
            segment.mode |= mode::LOCKED;
        } else {
            segment.mode &= !mode::LOCKED;
        }
        segment.ctime = now();
        Ok(segment.stat(seq))
    }
}

fn segment_id(index: usize) -> SegmentId {
    // Indices never exceed `max_segments`, which the manager bounds to u32.
    SegmentId::new(u32::try_from(index).unwrap_or(u32::MAX))
}
