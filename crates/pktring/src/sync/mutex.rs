// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Futex-backed mutex that lives inside a shared control block.
//!
//! `std::sync::Mutex` cannot be placed in shared memory (its state is not
//! `repr(C)` and its parking lists are process-local), so the buffer embeds
//! this three-state futex mutex instead:
//!
//! - `0` unlocked
//! - `1` locked, no waiters
//! - `2` locked, at least one waiter parked in the kernel
//!
//! The wake syscall is only issued when the word was observed in state `2`,
//! so the uncontended lock/unlock path is two atomic operations and no
//! syscalls.
//!
//! There is intentionally no poisoning and no owner tracking: a participant
//! that dies while holding the lock leaves it held forever, which is the
//! documented stall behavior of an abandoned packet.

use super::{park, unpark};
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// Process-shared mutex. All-zero bytes are a valid unlocked mutex, so a
/// freshly zeroed control block needs no explicit initialization.
#[repr(C)]
pub struct RawMutex {
    word: AtomicU32,
}

impl RawMutex {
    /// New unlocked mutex.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(UNLOCKED),
        }
    }

    /// Acquire the mutex, parking on the futex under contention.
    pub fn lock(&self) {
        if self
            .word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        // Slow path: advertise contention, then park until the word drops
        // back to UNLOCKED. swap() re-asserts CONTENDED on every wake so an
        // unlocker always knows someone may still be parked.
        while self.word.swap(CONTENDED, Ordering::Acquire) != UNLOCKED {
            park(&self.word, CONTENDED);
        }
    }

    /// Acquire without blocking. Returns `true` on success.
    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Release the mutex, waking one parked waiter if any.
    pub fn unlock(&self) {
        if self.word.swap(UNLOCKED, Ordering::Release) == CONTENDED {
            unpark(&self.word, 1);
        }
    }

    /// Whether the mutex is currently held (racy, diagnostics only).
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.word.load(Ordering::Relaxed) != UNLOCKED
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}
