// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffer lifecycle and buffer-wide operations.
//!
//! # Allocation layout
//!
//! ```text
//! +--------------------+--------------------+------------------------+
//! | BufferState        | StatsBlock         | arena bytes            |
//! | (64-byte aligned)  | (iff STATS)        | (size from BufferAttr) |
//! +--------------------+--------------------+------------------------+
//! ```
//!
//! The same layout is used for both backings. A process-private buffer
//! carves it out of a 64-byte aligned zeroed heap allocation; a PSHARED
//! buffer puts it in one System V segment so that attached processes see
//! the identical control block and arena. There is no version field in the
//! layout; participants must agree on the build out-of-band. An attacher
//! does, however, adopt the arena size and the STATS flag from the
//! initialized control block rather than trusting its own attributes.

use crate::arena::{Arena, FLAG_READ, HEADER_SIZE};
use crate::attr::BufferAttr;
use crate::segment::ShmSegment;
use crate::state::{BufferState, CANCELLED, PSHARED, STATS};
use crate::stats::{monotonic_ns, StatsBlock, StatsSnapshot};
use crate::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::io;
use std::mem;
use std::sync::atomic::Ordering;

/// Storage behind a buffer: private heap memory or a shared segment.
enum Backing {
    Heap { ptr: *mut u8, layout: Layout },
    Shared(ShmSegment),
}

/// Thread-safe variable-sized packet ring buffer.
///
/// The buffer owns the arena and the shared control state; all packet
/// traffic goes through [`crate::Packet`] handles borrowing it. Dropping
/// the buffer destroys it (and, for a shared buffer, detaches and removes
/// the segment); the borrow checker guarantees no handle of this process
/// outlives it, and the caller is responsible for the same across
/// processes.
pub struct PacketBuffer {
    backing: Backing,
    state: *mut BufferState,
    /// Null when STATS is off.
    stats: *mut StatsBlock,
    arena: Arena,
}

// SAFETY: all shared mutable state behind the raw pointers is made of
// atomics and futex words, or is accessed under the control block's
// mutexes and semaphore hand-offs per the field access rules documented
// on BufferState.
unsafe impl Send for PacketBuffer {}
unsafe impl Sync for PacketBuffer {}

/// Offset of the arena within the allocation, given the STATS flag.
fn arena_offset(has_stats: bool) -> usize {
    let mut offset = mem::size_of::<BufferState>();
    if has_stats {
        offset += mem::size_of::<StatsBlock>();
    }
    offset
}

impl PacketBuffer {
    /// Create a buffer, or attach to an existing shared one.
    ///
    /// With `shm_id` unset this creates and initializes fresh storage
    /// (heap, or a new segment when PSHARED is requested). With `shm_id`
    /// set it attaches to an already initialized segment: PSHARED must be
    /// requested, the control block must carry READY, and the arena size
    /// and STATS flag are adopted from it.
    pub fn new(attr: &BufferAttr) -> Result<Self> {
        match attr.shm_id() {
            Some(id) => Self::attach(attr, id),
            None => Self::create(attr),
        }
    }

    fn create(attr: &BufferAttr) -> Result<Self> {
        if (attr.size() as u64) < 2 * HEADER_SIZE {
            return Err(Error::InvalidArgument);
        }
        let total = arena_offset(attr.flags() & STATS != 0) + attr.size();

        let (backing, base) = if attr.is_shared() {
            let segment = ShmSegment::create(total, attr.shm_mode())?;
            let base = segment.as_ptr();
            (Backing::Shared(segment), base)
        } else {
            let layout =
                Layout::from_size_align(total, 64).map_err(|_| Error::InvalidArgument)?;
            // SAFETY: layout has non-zero size (at least one BufferState).
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::OutOfMemory);
            }
            (Backing::Heap { ptr, layout }, ptr)
        };

        let state = base as *mut BufferState;
        // SAFETY: base points to at least `total` zeroed bytes with 64-byte
        // alignment (heap layout above; shm attachments are page aligned),
        // and nothing else references the allocation yet, so taking a
        // unique reference for initialization is sound.
        unsafe {
            (*state).initialize(attr.size() as u64, attr.flags(), monotonic_ns());
        }

        Ok(Self::assemble(backing, base, attr.size(), attr.flags() & STATS != 0))
    }

    fn attach(attr: &BufferAttr, id: i32) -> Result<Self> {
        if !attr.is_shared() {
            return Err(Error::InvalidArgument);
        }
        let mut segment = ShmSegment::attach(id)?;
        if segment.size() < mem::size_of::<BufferState>() {
            return Err(Error::InvalidArgument);
        }

        let base = segment.as_ptr();
        // SAFETY: the mapping holds at least one BufferState (checked
        // above); concurrent access is fine because the fields read here
        // are atomics or immutable once READY is observed with acquire
        // ordering.
        let state = unsafe { &*(base as *const BufferState) };
        if !state.is_ready() || state.load_flags() & PSHARED == 0 {
            return Err(Error::InvalidArgument);
        }
        let arena_size = state.size as usize;
        let has_stats = state.has_stats();
        if segment.size() < arena_offset(has_stats) + arena_size {
            return Err(Error::InvalidArgument);
        }

        segment.mark_remove_on_drop();
        Ok(Self::assemble(
            Backing::Shared(segment),
            base,
            arena_size,
            has_stats,
        ))
    }

    fn assemble(backing: Backing, base: *mut u8, arena_size: usize, has_stats: bool) -> Self {
        let stats = if has_stats {
            // SAFETY: the allocation holds BufferState followed by
            // StatsBlock; both are 64-byte sized-and-aligned blocks.
            unsafe { base.add(mem::size_of::<BufferState>()) as *mut StatsBlock }
        } else {
            std::ptr::null_mut()
        };
        // SAFETY: the arena region starts past the control structures and
        // spans `arena_size` bytes of the allocation.
        let arena_base = unsafe { base.add(arena_offset(has_stats)) };
        Self {
            backing,
            state: base as *mut BufferState,
            stats,
            arena: Arena::new(arena_base, arena_size as u64),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> &BufferState {
        // SAFETY: self.state points into the live backing allocation for
        // as long as the buffer exists.
        unsafe { &*self.state }
    }

    #[inline]
    pub(crate) fn arena(&self) -> Arena {
        self.arena
    }

    #[inline]
    pub(crate) fn stats_block(&self) -> Option<&StatsBlock> {
        if self.stats.is_null() {
            None
        } else {
            // SAFETY: non-null stats points into the live backing
            // allocation, right after the control block.
            Some(unsafe { &*self.stats })
        }
    }

    /// Arena capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.size() as usize
    }

    /// Current free-space account. Advisory; may be mid-reservation.
    #[must_use]
    pub fn free_bytes(&self) -> i64 {
        self.state().free_bytes.load(Ordering::Relaxed)
    }

    /// Whether the buffer has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state().is_cancelled()
    }

    /// Segment id of a shared buffer, for other participants to attach.
    pub fn shm_id(&self) -> Result<i32> {
        match &self.backing {
            Backing::Shared(segment) => Ok(segment.id()),
            Backing::Heap { .. } => Err(Error::InvalidArgument),
        }
    }

    /// Cancel the buffer: terminal, out-of-band shutdown.
    ///
    /// Sets CANCELLED and posts both semaphores. Every blocked operation
    /// re-checks the flag when it wakes, re-posts the unit it consumed so
    /// the wake reaches all other waiters, releases whatever mutex it
    /// holds and returns [`Error::Interrupted`]. After cancellation only
    /// destruction succeeds.
    pub fn cancel(&self) {
        self.state().flags.fetch_or(CANCELLED, Ordering::AcqRel);
        self.state().written_packets.post();
        self.state().read_packets.post();
        log::debug!("[RING] buffer cancelled");
    }

    /// Mark every currently readable packet as read without exposing it to
    /// any reader, then reclaim all reclaimable space. Returns how many
    /// packets were drained; draining an already drained buffer returns 0.
    pub fn drain(&self) -> Result<usize> {
        let state = self.state();
        if state.is_cancelled() {
            return Err(Error::Interrupted);
        }
        state.read_mutex.lock();
        if state.is_cancelled() {
            state.read_mutex.unlock();
            return Err(Error::Interrupted);
        }
        state.read_close_mutex.lock();

        let mut drained = 0usize;
        while state.written_packets.try_wait() {
            let pos = state.read_next.load(Ordering::Relaxed);
            let header = self.arena.header(pos);
            self.arena.set_header_flags(pos, FLAG_READ);
            let next = self.arena.advance(pos, header.size).pos;
            state.read_next.store(next, Ordering::Relaxed);
            // Contiguity with read_pos means no older read is still open;
            // the packet is immediately reclaimable.
            if state.read_pos.load(Ordering::Relaxed) == pos {
                state.read_pos.store(next, Ordering::Relaxed);
                state.read_packets.post();
            }
            drained += 1;
        }

        // Consume the reclaimable backlog (what we just drained plus any
        // packets readers closed earlier) so the space is free on return.
        state.write_close_mutex.lock();
        while state.read_packets.try_wait() {
            self.reclaim_one();
        }
        state.write_close_mutex.unlock();

        state.read_close_mutex.unlock();
        state.read_mutex.unlock();

        if drained > 0 {
            log::debug!("[RING] drained {} packets", drained);
        }
        Ok(drained)
    }

    /// Reclaim the packet at `read_first`, crediting its header, payload
    /// and any wrap padding back to the free-space account.
    ///
    /// Caller must hold `write_close_mutex` and have taken one
    /// `read_packets` unit for this step.
    pub(crate) fn reclaim_one(&self) {
        let state = self.state();
        let pos = state.read_first.load(Ordering::Relaxed);
        let header = self.arena.header(pos);
        let advance = self.arena.advance(pos, header.size);
        state.read_first.store(advance.pos, Ordering::Relaxed);
        state.free_bytes.fetch_add(
            (HEADER_SIZE + u64::from(header.size) + advance.padding) as i64,
            Ordering::AcqRel,
        );
    }

    /// Statistics snapshot plus the buffer's age. Requires STATS.
    pub fn stats(&self) -> Result<StatsSnapshot> {
        let block = self.stats_block().ok_or(Error::NotSupported)?;
        let age = monotonic_ns().saturating_sub(self.state().create_time);
        Ok(block.snapshot(age))
    }

    /// Write a human-readable control state summary.
    ///
    /// The dump takes no locks; it is an advisory snapshot for debugging
    /// and monitoring tools.
    pub fn state_dump<W: io::Write>(&self, out: &mut W) -> io::Result<()> {
        let state = self.state();
        let read_first = state.read_first.load(Ordering::Relaxed);
        let read_pos = state.read_pos.load(Ordering::Relaxed);
        let read_next = state.read_next.load(Ordering::Relaxed);
        let write_pos = state.write_pos.load(Ordering::Relaxed);
        let write_next = state.write_next.load(Ordering::Relaxed);

        writeln!(
            out,
            "packet buffer: size={} flags={:#06x} free_bytes={}",
            self.arena.size(),
            state.load_flags(),
            state.free_bytes.load(Ordering::Relaxed),
        )?;
        writeln!(
            out,
            "  read_first={} read_pos={} read_next={}",
            read_first, read_pos, read_next
        )?;
        writeln!(out, "  write_pos={} write_next={}", write_pos, write_next)?;

        let (count, bytes) = self.walk_region(read_next, write_pos);
        writeln!(out, "  unread packets: {} ({} bytes)", count, bytes)?;
        let (count, bytes) = self.walk_region(read_first, read_pos);
        writeln!(out, "  pending free packets: {} ({} bytes)", count, bytes)?;
        Ok(())
    }

    /// Count packets and payload bytes from `from` up to (not including)
    /// `to`, following the framing rule. Iteration is bounded so a racing
    /// or corrupt snapshot cannot loop forever.
    fn walk_region(&self, from: u64, to: u64) -> (u64, u64) {
        let mut count = 0u64;
        let mut bytes = 0u64;
        let mut pos = from;
        let max_steps = self.arena.size() / HEADER_SIZE + 1;
        let mut steps = 0;
        while pos != to && steps < max_steps {
            let header = self.arena.header(pos);
            count += 1;
            bytes += u64::from(header.size);
            pos = self.arena.advance(pos, header.size).pos;
            steps += 1;
        }
        (count, bytes)
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        if let Backing::Heap { ptr, layout } = &self.backing {
            // SAFETY: ptr/layout are exactly what alloc_zeroed returned in
            // create(); Drop runs once. A shared backing is torn down by
            // the ShmSegment drop instead.
            unsafe { dealloc(*ptr, *layout) };
        }
    }
}
