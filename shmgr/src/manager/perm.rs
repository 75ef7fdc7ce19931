//! Legacy permission model: owner/group/other class bits plus owner-or-creator
//! management rights, with the superuser bypassing both.

use crate::error::ShmError;
use crate::types::{Credentials, IpcPerm, mode};

/// Folds a mode word (either class bits like [`mode::READ`] or full `rwx`
/// triplets like `0o640`) into the single class the check compares against.
const fn requested_bits(flag: u32) -> u32 {
    ((flag >> 6) | (flag >> 3) | flag) & 0o7
}

/// Checks that `who` holds every bit of `flag` on a segment with `perm`.
///
/// The caller's class is owner if its uid matches the owner or creator uid,
/// else group if its gid matches the owner or creator gid, else other.
pub fn check_access(perm: &IpcPerm, who: &Credentials, flag: u32) -> Result<(), ShmError> {
    if who.is_superuser() {
        return Ok(());
    }

    let requested = requested_bits(flag);
    let mut granted = perm.mode & mode::PERM_MASK;
    if who.uid == perm.uid || who.uid == perm.cuid {
        granted >>= 6;
    } else if who.gid == perm.gid || who.gid == perm.cgid {
        granted >>= 3;
    }

    if requested & !granted & 0o7 != 0 {
        return Err(ShmError::PermissionDenied);
    }
    Ok(())
}

/// Checks that `who` may change or destroy the segment: owner, creator or root.
pub fn check_manage(perm: &IpcPerm, who: &Credentials) -> Result<(), ShmError> {
    if who.is_superuser() || who.uid == perm.uid || who.uid == perm.cuid {
        Ok(())
    } else {
        Err(ShmError::NotPermitted)
    }
}
