// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! System V shared memory segment management.
//!
//! Provides safe wrappers around `shmget`, `shmat`, `shmdt` and `shmctl`
//! for creating and attaching the segments that back process-shared
//! buffers.
//!
//! # Segment lifecycle
//!
//! 1. The creating process calls [`ShmSegment::create`]; the kernel hands
//!    out an integer segment id.
//! 2. The id travels to other participants out-of-band (pipe, argv,
//!    config); they call [`ShmSegment::attach`].
//! 3. Dropping a segment detaches the mapping and marks the segment for
//!    removal. Under System V semantics removal is deferred until the last
//!    attachment goes away, and marking an already removed segment is a
//!    harmless error, so the drop order of participants does not matter.
//!
//! System V ids rather than POSIX names are used because an integer id
//! needs no namespace coordination between unrelated processes and cannot
//! collide; the "create" path always mints a fresh private segment.

use crate::{Error, Result};
use std::io;
use std::mem;
use std::ptr;

/// Attached System V shared memory segment.
pub struct ShmSegment {
    /// Kernel segment id, valid until removal completes.
    id: i32,
    /// Attachment address.
    ptr: *mut u8,
    /// Segment size in bytes.
    size: usize,
    /// Mark the segment for removal when dropped. Creators start out
    /// owning removal; attachers opt in once they have validated the
    /// control block, so a failed attach never tears down a live buffer.
    remove_on_drop: bool,
}

// SAFETY: the mapping is plain shared memory; all concurrent access to it
// goes through the atomic control structures layered on top by the buffer.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

impl ShmSegment {
    /// Create and attach a fresh private segment of `size` bytes with the
    /// given permission bits (e.g. `0o600`).
    pub fn create(size: usize, mode: u32) -> Result<Self> {
        // SAFETY: shmget with IPC_PRIVATE mints a new segment; arguments
        // are plain integers and the call has no memory-safety obligations.
        let id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | mode as i32,
            )
        };
        if id < 0 {
            return Err(Error::SegmentCreate(io::Error::last_os_error()));
        }

        let mut seg = Self::attach_id(id, size).map_err(|e| {
            // Creation succeeded but mapping failed: do not leak the id.
            // SAFETY: id is a valid segment id from the shmget above;
            // IPC_RMID only marks it for removal.
            unsafe { libc::shmctl(id, libc::IPC_RMID, ptr::null_mut()) };
            e
        })?;

        // A fresh System V segment is zero-filled by the kernel; clear it
        // anyway so a recycled id can never leak stale control state.
        // SAFETY: seg.ptr points to a writable mapping of exactly `size`
        // bytes and nothing else references it yet.
        unsafe { ptr::write_bytes(seg.ptr, 0, size) };
        seg.remove_on_drop = true;

        log::debug!("[RING] created shm segment id={} size={}", id, size);
        Ok(seg)
    }

    /// Attach an existing segment by id, adopting its size from the kernel.
    pub fn attach(id: i32) -> Result<Self> {
        let mut ds: libc::shmid_ds =
            // SAFETY: shmid_ds is a plain C struct; the zero pattern is a
            // valid (if meaningless) value for IPC_STAT to overwrite.
            unsafe { mem::zeroed() };
        // SAFETY: IPC_STAT writes the descriptor through a valid pointer.
        let ret = unsafe { libc::shmctl(id, libc::IPC_STAT, &mut ds) };
        if ret < 0 {
            return Err(Error::SegmentAttach(io::Error::last_os_error()));
        }

        let seg = Self::attach_id(id, ds.shm_segsz as usize)?;
        log::debug!("[RING] attached shm segment id={} size={}", id, seg.size);
        Ok(seg)
    }

    fn attach_id(id: i32, size: usize) -> Result<Self> {
        // SAFETY: shmat maps the whole segment at a kernel-chosen address;
        // a (void*)-1 return signals failure and is checked below.
        let ptr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if ptr == usize::MAX as *mut libc::c_void {
            return Err(Error::SegmentAttach(io::Error::last_os_error()));
        }
        Ok(Self {
            id,
            ptr: ptr as *mut u8,
            size,
            remove_on_drop: false,
        })
    }

    /// Take over removal of the segment: mark it removed when this
    /// attachment is dropped.
    pub(crate) fn mark_remove_on_drop(&mut self) {
        self.remove_on_drop = true;
    }

    /// Kernel segment id, for handing to other participants.
    #[inline]
    #[must_use]
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Raw pointer to the mapped bytes.
    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Size of the mapping.
    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: self.ptr came from a successful shmat and is detached
        // exactly once. Marking for removal afterwards is idempotent: if
        // another participant already did it, shmctl fails harmlessly; the
        // kernel frees the segment when the last attachment is gone.
        unsafe {
            libc::shmdt(self.ptr as *const libc::c_void);
            if self.remove_on_drop {
                libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut());
            }
        }
        log::debug!("[RING] detached shm segment id={}", self.id);
    }
}
