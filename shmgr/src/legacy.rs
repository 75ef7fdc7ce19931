//! Drop-in replacements for the classic `shmget`/`shmat`/`shmdt`/`shmctl`
//! calls.
//!
//! All four share one process-wide [`ShmContext`], created on first use for
//! the manager at `SHMGR_SOCKET` or the default socket path. Failures are
//! reported the legacy way: `-1` (or `(void *)-1` from [`shmat`]) with the
//! code in `errno`.
//!
//! Flag and command values are the Linux ones (`IPC_CREAT`, `SHM_RDONLY`,
//! `IPC_STAT`, ...). The descriptor passed to [`shmctl`] is a
//! [`SegmentStat`], not the platform's `shmid_ds`.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::OnceLock;

use libc::{c_int, key_t, size_t};

use crate::client::ShmContext;
use crate::error::ShmError;
use crate::types::{AttachFlags, ControlCommand, GetFlags, Key, SegmentId, SegmentStat};

static CONTEXT: OnceLock<ShmContext> = OnceLock::new();

/// The process-wide context behind the legacy calls.
pub fn context() -> &'static ShmContext {
    CONTEXT.get_or_init(ShmContext::new)
}

fn set_errno(code: c_int) {
    // SAFETY: `__errno_location` returns this thread's errno slot.
    unsafe {
        *libc::__errno_location() = code;
    }
}

fn fail<T>(err: ShmError, failed: T) -> T {
    set_errno(err.errno());
    failed
}

/// Value [`shmat`] returns on failure.
pub const SHMAT_FAILED: *mut c_void = std::ptr::without_provenance_mut(usize::MAX);

/// Returns the id of the segment for `key`, creating it per `shmflg`.
pub fn shmget(key: key_t, size: size_t, shmflg: c_int) -> c_int {
    let flags = GetFlags::from_bits_truncate(shmflg as u32);
    match context().get(Key::new(key), size, flags) {
        Ok(id) => c_int::try_from(id.as_u32()).unwrap_or_else(|_| fail(ShmError::NoSpace, -1)),
        Err(err) => fail(err, -1),
    }
}

/// Attaches segment `shmid` at `shmaddr` (or anywhere if null).
///
/// Returns the mapped address, or [`SHMAT_FAILED`].
pub fn shmat(shmid: c_int, shmaddr: *const c_void, shmflg: c_int) -> *mut c_void {
    let id = match SegmentId::try_from(shmid) {
        Ok(id) => id,
        Err(err) => return fail(err, SHMAT_FAILED),
    };
    let flags = AttachFlags::from_bits_truncate(shmflg as u32);
    match context().attach(id, NonNull::new(shmaddr.cast_mut()), flags) {
        Ok(addr) => addr.as_ptr(),
        Err(err) => fail(err, SHMAT_FAILED),
    }
}

/// Detaches the segment attached at `shmaddr`.
///
/// # Safety
///
/// No reference into the segment may be used after this call.
pub unsafe fn shmdt(shmaddr: *const c_void) -> c_int {
    match context().detach(shmaddr) {
        Ok(()) => 0,
        Err(err) => fail(err, -1),
    }
}

/// Runs control command `cmd` on segment `shmid`.
///
/// `buf` is read by `IPC_SET`, written by `IPC_STAT` and ignored otherwise.
///
/// # Safety
///
/// For `IPC_STAT` and `IPC_SET`, `buf` must be null or valid for reads and
/// writes of a [`SegmentStat`].
pub unsafe fn shmctl(shmid: c_int, cmd: c_int, buf: *mut SegmentStat) -> c_int {
    let parsed = SegmentId::try_from(shmid).and_then(|id| Ok((id, ControlCommand::try_from(cmd)?)));
    let (id, command) = match parsed {
        Ok(parsed) => parsed,
        Err(err) => return fail(err, -1),
    };

    let outcome = match command {
        ControlCommand::Stat | ControlCommand::Set => {
            if buf.is_null() {
                return fail(ShmError::Os(libc::EFAULT), -1);
            }
            // SAFETY: Non-null and valid per the caller's contract.
            let stat = unsafe { &mut *buf };
            context().control(id, command, stat)
        }
        _ => context().control(id, command, &mut SegmentStat::default()),
    };

    match outcome {
        Ok(()) => 0,
        Err(err) => fail(err, -1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values_match_platform() {
        assert_eq!(GetFlags::CREATE.bits(), libc::IPC_CREAT as u32);
        assert_eq!(GetFlags::EXCL.bits(), libc::IPC_EXCL as u32);
        assert_eq!(AttachFlags::RDONLY.bits(), libc::SHM_RDONLY as u32);
        assert_eq!(AttachFlags::RND.bits(), libc::SHM_RND as u32);
        assert_eq!(ControlCommand::Remove as c_int, libc::IPC_RMID);
        assert_eq!(ControlCommand::Set as c_int, libc::IPC_SET);
        assert_eq!(ControlCommand::Stat as c_int, libc::IPC_STAT);
        assert_eq!(ControlCommand::Lock as c_int, libc::SHM_LOCK);
        assert_eq!(ControlCommand::Unlock as c_int, libc::SHM_UNLOCK);
    }

    #[test]
    fn bad_arguments_set_errno_without_manager() {
        assert_eq!(unsafe { shmctl(-1, libc::IPC_STAT, std::ptr::null_mut()) }, -1);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EINVAL));

        assert_eq!(unsafe { shmctl(0, 99, std::ptr::null_mut()) }, -1);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EINVAL));

        assert_eq!(unsafe { shmctl(0, libc::IPC_STAT, std::ptr::null_mut()) }, -1);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EFAULT));

        assert_eq!(shmat(-5, std::ptr::null(), 0), SHMAT_FAILED);
        assert_eq!(std::io::Error::last_os_error().raw_os_error(), Some(libc::EINVAL));
    }
}
