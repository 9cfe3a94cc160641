// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Buffer control block.
//!
//! One `BufferState` lives at the head of every buffer allocation, heap or
//! shared segment. Everything a participant needs to cooperate on the ring
//! is inside it: the position pointers, the free-space account, the four
//! mutexes and the two packet-flow semaphores.
//!
//! # Position pointers
//!
//! ```text
//!   read_first ──► read_pos ──► read_next ──► write_pos ──► write_next
//!   |  reclaimable  |   open    |   readable  |  closing    |
//!   |  (READ set)   |   reads   |  (WRITTEN)  |  out of     | next write
//!   |               |           |             |  order      | claim slot
//! ```
//!
//! All five advance monotonically around the ring via the shared framing
//! rule. `read_packets` counts the first region, `written_packets` the
//! readable one.
//!
//! # Field access rules
//!
//! - `write_next`, and a packet's reservation account, change only under
//!   `write_mutex`.
//! - `read_next` changes only under `read_mutex`.
//! - `write_pos` changes only under `write_close_mutex`; `read_pos` only
//!   under `read_close_mutex`.
//! - `read_first` and padding credits change only under
//!   `write_close_mutex` (a reserving writer and `drain` both reclaim).
//! - `free_bytes` is updated with atomic arithmetic and needs no lock.
//! - `size` and `create_time` are written once before READY is published.

use crate::sync::{RawMutex, Semaphore};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Buffer flag: control block fully initialized (set last, with release
/// ordering, by the creator; checked by shared-memory attachers).
pub const READY: u32 = 0x1;
/// Buffer flag: terminally cancelled, only destruction remains legal.
pub const CANCELLED: u32 = 0x2;
/// Buffer flag: backed by a shared memory segment, usable across processes.
pub const PSHARED: u32 = 0x4;
/// Buffer flag: statistics block present and maintained.
pub const STATS: u32 = 0x8;

/// Flags a caller may request at construction time.
pub(crate) const ATTR_FLAGS: u32 = PSHARED | STATS;

/// Shared control block. Lives at offset 0 of the buffer allocation;
/// `repr(C)` with fixed-width fields so independently built processes agree
/// on the layout.
#[repr(C, align(64))]
pub struct BufferState {
    /// READY | CANCELLED | PSHARED | STATS
    pub flags: AtomicU32,
    _pad: u32,
    /// Arena size in bytes. Immutable once READY.
    pub size: u64,
    /// Monotonic clock at initialization, nanoseconds. Immutable once READY.
    pub create_time: u64,
    /// Oldest packet open for read, or next to be read when none is open.
    pub read_pos: AtomicU64,
    /// Oldest packet open for write, or next to be written.
    pub write_pos: AtomicU64,
    /// Next packet a reader will claim.
    pub read_next: AtomicU64,
    /// Next slot a writer will claim.
    pub write_next: AtomicU64,
    /// Oldest read packet whose space has not been reclaimed yet.
    pub read_first: AtomicU64,
    /// Bytes available to reserve. Transiently negative while a writer is
    /// inside a reservation.
    pub free_bytes: AtomicI64,
    /// Serializes the writer claim phase (open through set-size).
    pub write_mutex: RawMutex,
    /// Serializes the reader claim phase (open-read).
    pub read_mutex: RawMutex,
    /// Serializes the writer commit walk and all space reclamation.
    pub write_close_mutex: RawMutex,
    /// Serializes the reader commit walk.
    pub read_close_mutex: RawMutex,
    /// Counts packets visible to readers (posted by the writer commit walk).
    pub written_packets: Semaphore,
    /// Counts packets whose space may be reclaimed (posted by the reader
    /// commit walk).
    pub read_packets: Semaphore,
}

impl BufferState {
    /// Initialize a zeroed control block in place. The caller has exclusive
    /// access (the allocation is not yet published to other participants).
    ///
    /// The zeroed state already encodes unlocked mutexes, empty semaphores
    /// and all positions at offset 0; only the scalar fields and the flag
    /// word need explicit stores. READY is published with release ordering
    /// so an attacher that observes it also observes every earlier store.
    pub(crate) fn initialize(&mut self, size: u64, flags: u32, now_ns: u64) {
        self.size = size;
        self.create_time = now_ns;
        self.free_bytes
            .store(size as i64 - crate::arena::HEADER_SIZE as i64, Ordering::Relaxed);
        self.flags.store(flags | READY, Ordering::Release);
    }

    #[inline]
    pub(crate) fn load_flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.load_flags() & READY != 0
    }

    #[inline]
    pub(crate) fn is_cancelled(&self) -> bool {
        self.load_flags() & CANCELLED != 0
    }

    #[inline]
    pub(crate) fn has_stats(&self) -> bool {
        self.load_flags() & STATS != 0
    }
}
