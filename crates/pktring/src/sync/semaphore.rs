// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Futex-backed counting semaphore embeddable in a shared control block.
//!
//! The buffer uses two of these as its packet-flow signals: one counts
//! packets made visible to readers, the other counts packets whose space a
//! writer may reclaim. Every packet transition posts exactly once, so the
//! counter value always equals the number of packets in the corresponding
//! region of the ring.
//!
//! `wait()` absorbs spurious futex wake-ups internally; it only returns
//! once a unit has actually been taken. Interruption is layered on top by
//! the caller: cancellation posts the semaphore, and a woken waiter that
//! observes the cancelled flag re-posts its unit so the wake cascades to
//! every other waiter.

use super::{park, unpark};
use std::sync::atomic::{AtomicU32, Ordering};

/// Process-shared counting semaphore. All-zero bytes are a valid semaphore
/// with count zero, so a freshly zeroed control block needs no explicit
/// initialization.
#[repr(C)]
pub struct Semaphore {
    count: AtomicU32,
}

impl Semaphore {
    /// New semaphore with count zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicU32::new(0),
        }
    }

    /// Take one unit without blocking. Returns `true` on success.
    pub fn try_wait(&self) -> bool {
        let mut current = self.count.load(Ordering::Relaxed);
        loop {
            if current == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                current,
                current - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Take one unit, parking while the count is zero.
    pub fn wait(&self) {
        loop {
            if self.try_wait() {
                return;
            }
            // Parks only if the count is still zero; a post slipping in
            // between makes the kernel refuse the sleep and we retry.
            park(&self.count, 0);
        }
    }

    /// Release one unit and wake one parked waiter.
    ///
    /// # Aborts
    ///
    /// A counter at `u32::MAX` means more packets have been posted than the
    /// arena can physically hold. That is an accounting invariant failure
    /// the process cannot recover from locally, so it aborts.
    pub fn post(&self) {
        let prev = self.count.fetch_add(1, Ordering::Release);
        if prev == u32::MAX {
            log::error!("[RING] semaphore overflow while posting, control state is corrupt");
            std::process::abort();
        }
        unpark(&self.count, 1);
    }

    /// Current count (racy, diagnostics only).
    #[must_use]
    pub fn value(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
