// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Optional run-time statistics.
//!
//! When a buffer is constructed with the STATS flag, a `StatsBlock` sits
//! between the control block and the arena. Counters are bumped at packet
//! close; wait-time accounting brackets the two blocking semaphore waits
//! (a writer waiting for reclaimable space, a reader waiting for a
//! readable packet). All counters use relaxed atomics; snapshots are
//! eventually consistent, which is all a monitoring surface needs.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared statistics block, maintained when STATS is set.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct StatsBlock {
    /// Packets committed by writers.
    pub packets_written: AtomicU64,
    /// Payload bytes committed by writers.
    pub bytes_written: AtomicU64,
    /// Packets closed by readers.
    pub packets_read: AtomicU64,
    /// Payload bytes closed by readers.
    pub bytes_read: AtomicU64,
    /// Nanoseconds writers spent blocked waiting for reclaimable space.
    pub write_wait_ns: AtomicU64,
    /// Nanoseconds readers spent blocked waiting for readable packets.
    pub read_wait_ns: AtomicU64,
}

impl StatsBlock {
    pub(crate) fn snapshot(&self, age_ns: u64) -> StatsSnapshot {
        StatsSnapshot {
            packets_written: self.packets_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            packets_read: self.packets_read.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            write_wait_ns: self.write_wait_ns.load(Ordering::Relaxed),
            read_wait_ns: self.read_wait_ns.load(Ordering::Relaxed),
            age_ns,
        }
    }
}

/// Point-in-time copy of the counters plus the buffer's age.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub packets_written: u64,
    pub bytes_written: u64,
    pub packets_read: u64,
    pub bytes_read: u64,
    pub write_wait_ns: u64,
    pub read_wait_ns: u64,
    /// Monotonic nanoseconds since the buffer was initialized.
    pub age_ns: u64,
}

/// Monotonic clock in nanoseconds. System-wide (unlike `Instant`, which is
/// process-local and cannot be stored in a shared control block), so ages
/// computed by attached processes agree with the creator's baseline.
pub(crate) fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime writes the valid timespec pointed to by `ts`;
    // CLOCK_MONOTONIC is always available on the supported platforms.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
