//! Per-process table of attached segments.
//!
//! Entries are indexed by the descriptor number of their backing object, which
//! the OS keeps unique among open descriptors, so the table never needs its
//! own index allocator. Lookup by address is a linear scan.

use std::ffi::c_void;
use std::os::fd::RawFd;

use crate::ipc::shmem::Mapping;
use crate::types::SegmentId;

/// One attached segment. Dropping it unmaps the segment and closes its
/// backing descriptor.
#[derive(Debug)]
pub(crate) struct AttachEntry {
    pub(crate) id: SegmentId,
    pub(crate) seq: u32,
    pub(crate) mapping: Mapping,
}

#[derive(Debug, Default)]
pub(crate) struct AttachTable {
    entries: Vec<Option<AttachEntry>>,
}

impl AttachTable {
    pub(crate) fn insert(&mut self, entry: AttachEntry) {
        let index = fd_index(entry.mapping.raw_fd());
        if self.entries.len() <= index {
            self.entries.resize_with(index + 1, || None);
        }
        debug_assert!(self.entries[index].is_none(), "descriptor {index} already attached");
        self.entries[index] = Some(entry);
    }

    /// Removes the entry whose mapping starts at `addr`.
    pub(crate) fn remove_by_addr(&mut self, addr: *const c_void) -> Option<AttachEntry> {
        let index = self
            .entries
            .iter()
            .position(|e| e.as_ref().is_some_and(|e| e.mapping.starts_at(addr)))?;
        let entry = self.entries[index].take();
        while matches!(self.entries.last(), Some(None)) {
            self.entries.pop();
        }
        entry
    }

    /// Removes every entry.
    pub(crate) fn take_all(&mut self) -> Vec<AttachEntry> {
        std::mem::take(&mut self.entries).into_iter().flatten().collect()
    }

    /// Whether any attached mapping intersects `[start, start + len)`.
    pub(crate) fn overlaps(&self, start: usize, len: usize) -> bool {
        let end = start.saturating_add(len);
        self.entries.iter().flatten().any(|e| {
            let base = e.mapping.addr().as_ptr().addr();
            base < end && start < base.saturating_add(e.mapping.len())
        })
    }

    #[cfg(test)]
    pub(crate) fn get(&self, fd: RawFd) -> Option<&AttachEntry> {
        self.entries.get(fd_index(fd))?.as_ref()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.iter().flatten().count()
    }
}

fn fd_index(fd: RawFd) -> usize {
    // Open descriptors are never negative.
    usize::try_from(fd).unwrap_or(0)
}
