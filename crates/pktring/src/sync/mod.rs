// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-shared synchronization primitives.
//!
//! The buffer's control block embeds four mutexes and two counting
//! semaphores. Because the control block may live in a shared memory
//! segment mapped by several processes, these primitives are built directly
//! on `AtomicU32` words rather than on `std::sync` types (whose state is
//! process-local and not `repr(C)`). Their all-zero state is their initial
//! state, which lets a zeroed segment come up ready to use.
//!
//! Both primitives funnel their kernel sleeps through [`park`] and their
//! wakes through [`unpark`]. The futex op codes used are the cross-process
//! ones (0 and 1, no `FUTEX_PRIVATE_FLAG`): the private variants pin the
//! wait queue to one address space, and a waiter in an attached process
//! would never be woken by them.

mod mutex;
mod semaphore;

pub use mutex::RawMutex;
pub use semaphore::Semaphore;

use std::sync::atomic::AtomicU32;

/// `FUTEX_WAIT`: sleep while the word still holds the expected value.
#[cfg(target_os = "linux")]
const OP_WAIT: i32 = 0;
/// `FUTEX_WAKE`: release up to n sleepers queued on the word.
#[cfg(target_os = "linux")]
const OP_WAKE: i32 = 1;

/// Sleep in the kernel until `word` is unparked or no longer holds
/// `expected`. May also return on signal delivery or spuriously; callers
/// sit in a predicate loop, so every return is just a hint to re-check.
#[cfg(target_os = "linux")]
fn park(word: &AtomicU32, expected: u32) {
    // SAFETY: `word` outlives the call. FUTEX_WAIT reads the word and the
    // timeout pointer only; a null timeout means sleep until woken.
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            OP_WAIT,
            expected,
            std::ptr::null::<libc::timespec>(),
        );
    }
}

/// Wake up to `count` threads parked on `word`. Harmless when nobody is
/// parked.
#[cfg(target_os = "linux")]
fn unpark(word: &AtomicU32, count: u32) {
    // SAFETY: `word` outlives the call. FUTEX_WAKE inspects no pointers
    // beyond the word address itself.
    unsafe {
        libc::syscall(libc::SYS_futex, word.as_ptr(), OP_WAKE, count);
    }
}

// Futex-less platforms degrade to polling: parked threads nap briefly and
// re-check. Fine for development and tests, not for production latency.
#[cfg(not(target_os = "linux"))]
fn park(word: &AtomicU32, expected: u32) {
    use std::sync::atomic::Ordering;
    if word.load(Ordering::Acquire) == expected {
        std::thread::sleep(std::time::Duration::from_micros(100));
    }
}

#[cfg(not(target_os = "linux"))]
fn unpark(_word: &AtomicU32, _count: u32) {}
