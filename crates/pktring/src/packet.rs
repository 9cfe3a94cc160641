// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet handles: the producer and consumer paths.
//!
//! # Writer protocol
//!
//! ```text
//! open(WRITE)          claim write_next under write_mutex, zero header
//! write / dma / seek   stream payload, growing the reservation
//! set_size(n)          settle the reservation, zero the next header slot,
//!                      advance write_next, RELEASE write_mutex
//! close()              commit staged spans, set WRITTEN, run the in-order
//!                      commit walk under write_close_mutex
//! ```
//!
//! Releasing `write_mutex` at set-size rather than at close is what lets
//! the next writer stream its payload while this one is still finishing:
//! writers are serialized only through the claim phase. The commit walk
//! then re-serializes completions, so readers always observe packets in
//! claim order no matter which writer closed first.
//!
//! # Reader protocol
//!
//! ```text
//! open(READ)           take a written_packets unit under read_mutex,
//!                      claim read_next, advance it, release read_mutex
//! read / dma / seek    consume payload, bounded by the declared size
//! close()              set READ, run the mirror commit walk under
//!                      read_close_mutex, posting read_packets per packet
//! ```
//!
//! # Reservation
//!
//! `free_bytes` is the single space account. A writer that cannot cover
//! its reservation takes `read_packets` units and reclaims read packets
//! starting at `read_first`, blocking when none are available. Because
//! reservations are granted in ring order and reclamation advances
//! `read_first` in ring order, a non-negative account guarantees the
//! reserved span (payload, wrap padding and the next header slot) lies
//! entirely in reclaimed territory.

use crate::arena::{FLAG_READ, FLAG_WRITTEN, HEADER_SIZE};
use crate::buffer::PacketBuffer;
use crate::staging::Staging;
use crate::stats::monotonic_ns;
use crate::sync::Semaphore;
use crate::{Error, Result};
use std::mem;
use std::sync::atomic::Ordering;

/// Open the packet for reading.
pub const OPEN_READ: u32 = 0x1;
/// Open the packet for writing.
pub const OPEN_WRITE: u32 = 0x2;
/// Convert every blocking acquisition on this handle into a busy error.
pub const OPEN_TRY: u32 = 0x4;

/// Allow `dma` to return a staged bounce buffer when the requested span
/// crosses the arena wrap.
pub const DMA_ACCEPT_FAKE: u32 = 0x1;

/// Handle is attached to a claimed packet.
const STATE_OPEN: u32 = 0x10;
/// Final payload size has been latched.
const STATE_SIZE_SET: u32 = 0x20;

const OPEN_FLAGS: u32 = OPEN_READ | OPEN_WRITE | OPEN_TRY;

/// In-progress read or write of one packet.
///
/// A handle is reusable: after `close` or `cancel` it can be opened again.
/// Dropping a handle that is still open does not close or cancel the
/// packet; the claimed slot stays pending forever, exactly as if the owner
/// had crashed mid-packet, and stalls the commit walk behind it.
pub struct Packet<'a> {
    buffer: &'a PacketBuffer,
    flags: u32,
    /// Arena offset of this packet's header.
    buffer_pos: u64,
    /// Payload cursor.
    pos: u64,
    /// Bytes debited from `free_bytes` on behalf of this packet.
    reserved: u64,
    staging: Staging,
}

impl<'a> Packet<'a> {
    /// New handle bound to `buffer`, not yet open.
    #[must_use]
    pub fn new(buffer: &'a PacketBuffer) -> Self {
        Self {
            buffer,
            flags: 0,
            buffer_pos: 0,
            pos: 0,
            reserved: 0,
            staging: Staging::default(),
        }
    }

    /// Claim the next packet slot for writing, or the next readable packet
    /// for reading. `flags` must contain exactly one of [`OPEN_READ`] and
    /// [`OPEN_WRITE`], plus optionally [`OPEN_TRY`].
    pub fn open(&mut self, flags: u32) -> Result<()> {
        if self.flags & STATE_OPEN != 0 || flags & !OPEN_FLAGS != 0 {
            return Err(Error::InvalidArgument);
        }
        let mode = flags & (OPEN_READ | OPEN_WRITE);
        if mode != OPEN_READ && mode != OPEN_WRITE {
            return Err(Error::InvalidArgument);
        }
        if !self.buffer.state().is_ready() {
            return Err(Error::InvalidArgument);
        }
        if self.buffer.state().is_cancelled() {
            return Err(Error::Interrupted);
        }
        if mode == OPEN_WRITE {
            self.open_write(flags)
        } else {
            self.open_read(flags)
        }
    }

    fn open_write(&mut self, flags: u32) -> Result<()> {
        let state = self.buffer.state();
        if flags & OPEN_TRY != 0 {
            if !state.write_mutex.try_lock() {
                return Err(Error::Busy);
            }
        } else {
            state.write_mutex.lock();
        }
        if state.is_cancelled() {
            state.write_mutex.unlock();
            return Err(Error::Interrupted);
        }

        let pos = state.write_next.load(Ordering::Relaxed);
        self.buffer.arena().zero_header(pos);
        self.buffer_pos = pos;
        self.pos = 0;
        self.reserved = 0;
        self.flags = flags | STATE_OPEN;
        Ok(())
    }

    fn open_read(&mut self, flags: u32) -> Result<()> {
        let state = self.buffer.state();
        if flags & OPEN_TRY != 0 {
            if !state.read_mutex.try_lock() {
                return Err(Error::Busy);
            }
            if state.is_cancelled() {
                state.read_mutex.unlock();
                return Err(Error::Interrupted);
            }
            if !state.written_packets.try_wait() {
                state.read_mutex.unlock();
                return Err(Error::Busy);
            }
        } else {
            state.read_mutex.lock();
            if state.is_cancelled() {
                state.read_mutex.unlock();
                return Err(Error::Interrupted);
            }
            self.wait_counted(&state.written_packets, false);
        }
        if state.is_cancelled() {
            // Cascade the wake to any other blocked reader.
            state.written_packets.post();
            state.read_mutex.unlock();
            return Err(Error::Interrupted);
        }

        let arena = self.buffer.arena();
        let pos = state.read_next.load(Ordering::Relaxed);
        let header = arena.header(pos);
        state
            .read_next
            .store(arena.advance(pos, header.size).pos, Ordering::Relaxed);
        state.read_mutex.unlock();

        self.buffer_pos = pos;
        self.pos = 0;
        self.reserved = 0;
        self.flags = flags | STATE_OPEN;
        Ok(())
    }

    /// Blocking semaphore wait, with wait-time accounting when STATS.
    fn wait_counted(&self, sem: &Semaphore, writer_side: bool) {
        match self.buffer.stats_block() {
            Some(stats) => {
                let start = monotonic_ns();
                sem.wait();
                let elapsed = monotonic_ns().saturating_sub(start);
                let counter = if writer_side {
                    &stats.write_wait_ns
                } else {
                    &stats.read_wait_ns
                };
                counter.fetch_add(elapsed, Ordering::Relaxed);
            }
            None => sem.wait(),
        }
    }

    /// Grow this packet's reservation to `len` bytes, reclaiming read
    /// packets while the free-space account is negative.
    ///
    /// On [`Error::Busy`] (TRY handles) the debit is rolled back and the
    /// packet stays usable. On [`Error::Interrupted`] the buffer is
    /// cancelled: the debit is rolled back, `write_mutex` is released and
    /// the handle is dead.
    fn reserve(&mut self, len: u64) -> Result<()> {
        if len <= self.reserved {
            return Ok(());
        }
        let state = self.buffer.state();
        let delta = (len - self.reserved) as i64;
        let mut free = state.free_bytes.fetch_sub(delta, Ordering::AcqRel) - delta;

        while free < 0 {
            if state.is_cancelled() {
                return self.reserve_interrupted(delta);
            }
            if self.flags & OPEN_TRY != 0 {
                if !state.read_packets.try_wait() {
                    state.free_bytes.fetch_add(delta, Ordering::AcqRel);
                    return Err(Error::Busy);
                }
            } else {
                self.wait_counted(&state.read_packets, true);
            }
            if state.is_cancelled() {
                // Cascade the wake to any other blocked writer.
                state.read_packets.post();
                return self.reserve_interrupted(delta);
            }

            // One unit taken: reclaim that packet, then sweep up whatever
            // else is already reclaimable without blocking again.
            state.write_close_mutex.lock();
            self.buffer.reclaim_one();
            while state.read_packets.try_wait() {
                self.buffer.reclaim_one();
            }
            state.write_close_mutex.unlock();

            free = state.free_bytes.load(Ordering::Acquire);
        }

        self.reserved = len;
        Ok(())
    }

    fn reserve_interrupted(&mut self, delta: i64) -> Result<()> {
        let state = self.buffer.state();
        state.free_bytes.fetch_add(delta, Ordering::AcqRel);
        state.write_mutex.unlock();
        self.staging.free_all();
        self.flags = 0;
        Err(Error::Interrupted)
    }

    /// Copy `src` into the packet at the cursor, splitting at the wrap.
    ///
    /// Before `set_size` the reservation grows as needed (which may block
    /// on space) and the packet's provisional size tracks the high-water
    /// mark of the cursor. After `set_size` the write must fit within the
    /// declared size.
    pub fn write(&mut self, src: &[u8]) -> Result<()> {
        self.ensure_mode(OPEN_WRITE)?;
        let arena = self.buffer.arena();
        let end = self.pos + src.len() as u64;

        if self.flags & STATE_SIZE_SET != 0 {
            if end > u64::from(arena.header(self.buffer_pos).size) {
                return Err(Error::InvalidArgument);
            }
        } else {
            if end > arena.size() - 2 * HEADER_SIZE {
                return Err(Error::NoBufferSpace {
                    requested: end as usize,
                    capacity: arena.size() as usize,
                });
            }
            self.reserve(end)?;
        }

        arena.copy_in(arena.payload_offset(self.buffer_pos, self.pos), src);
        self.pos = end;
        if self.flags & STATE_SIZE_SET == 0 {
            self.extend_high_water(end);
        }
        Ok(())
    }

    /// Copy payload bytes at the cursor into `dst`, splitting at the wrap.
    /// The request must lie within the declared packet size.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<()> {
        self.ensure_mode(OPEN_READ)?;
        let arena = self.buffer.arena();
        let end = self.pos + dst.len() as u64;
        if end > u64::from(arena.header(self.buffer_pos).size) {
            return Err(Error::InvalidArgument);
        }
        arena.copy_out(arena.payload_offset(self.buffer_pos, self.pos), dst);
        self.pos = end;
        Ok(())
    }

    /// Contiguous view of the next `len` payload bytes, advancing the
    /// cursor past them.
    ///
    /// When the span does not cross the arena wrap this is a direct view
    /// of the arena. When it does, the call fails with
    /// [`Error::WouldWrap`] unless `flags` contains [`DMA_ACCEPT_FAKE`],
    /// in which case a staged bounce buffer is returned instead: on a
    /// writer its content is committed into the arena at close, on a
    /// reader it arrives pre-filled with the packet bytes.
    pub fn dma(&mut self, len: usize, flags: u32) -> Result<&mut [u8]> {
        if self.flags & STATE_OPEN == 0 || flags & !DMA_ACCEPT_FAKE != 0 {
            return Err(Error::InvalidArgument);
        }
        let arena = self.buffer.arena();
        let writing = self.flags & OPEN_WRITE != 0;
        let end = self.pos + len as u64;

        if writing && self.flags & STATE_SIZE_SET == 0 {
            if end > arena.size() - 2 * HEADER_SIZE {
                return Err(Error::NoBufferSpace {
                    requested: end as usize,
                    capacity: arena.size() as usize,
                });
            }
        } else if end > u64::from(arena.header(self.buffer_pos).size) {
            return Err(Error::InvalidArgument);
        }

        let start = arena.payload_offset(self.buffer_pos, self.pos);
        if start + len as u64 <= arena.size() {
            if writing && self.flags & STATE_SIZE_SET == 0 {
                self.reserve(end)?;
                self.extend_high_water(end);
            }
            self.pos = end;
            // SAFETY: the span [start, start + len) is in bounds (it does
            // not cross the wrap) and belongs exclusively to this packet:
            // a writer has reserved through `end`, a reader's claim covers
            // the declared size. The returned borrow of self prevents any
            // further use of the handle while the slice is alive.
            return Ok(unsafe { std::slice::from_raw_parts_mut(arena.ptr_at(start), len) });
        }

        if flags & DMA_ACCEPT_FAKE == 0 {
            return Err(Error::WouldWrap);
        }
        if writing && self.flags & STATE_SIZE_SET == 0 {
            self.reserve(end)?;
            self.extend_high_water(end);
        }
        let index = self.staging.alloc(len, self.pos)?;
        if !writing {
            arena.copy_out(start, self.staging.buf_mut(index));
        }
        self.pos = end;
        Ok(self.staging.buf_mut(index))
    }

    /// Raise the provisional packet size to `end` if the cursor moved past
    /// it. Only meaningful before `set_size`.
    fn extend_high_water(&mut self, end: u64) {
        let arena = self.buffer.arena();
        let mut header = arena.header(self.buffer_pos);
        if end > u64::from(header.size) {
            header.size = end as u32;
            arena.set_header(self.buffer_pos, header);
        }
    }

    /// Latch the final payload size and release the writer claim.
    ///
    /// Settles the reservation at the packet's true footprint (payload,
    /// wrap padding and the next header slot, which is zeroed here so the
    /// commit walk terminates on it), advances `write_next`, releases
    /// `write_mutex` so the next writer can claim, and trims staged spans
    /// past the final size. Payload bytes written beyond `size` are zeroed.
    pub fn set_size(&mut self, size: usize) -> Result<()> {
        self.ensure_mode(OPEN_WRITE)?;
        if self.flags & STATE_SIZE_SET != 0 {
            return Err(Error::InvalidArgument);
        }
        if self.buffer.state().is_cancelled() {
            return Err(self.interrupted_unwind());
        }
        let arena = self.buffer.arena();
        let capacity = arena.size();
        if size as u64 > capacity - 2 * HEADER_SIZE || size as u64 > u64::from(u32::MAX) {
            return Err(Error::NoBufferSpace {
                requested: size,
                capacity: capacity as usize,
            });
        }

        let advance = arena.advance(self.buffer_pos, size as u32);
        let need = size as u64 + HEADER_SIZE + advance.padding;
        // With wrap padding the footprint can exceed what reclamation can
        // ever return; refuse instead of blocking forever.
        if need > capacity - HEADER_SIZE {
            return Err(Error::NoBufferSpace {
                requested: size,
                capacity: capacity as usize,
            });
        }
        if need > self.reserved {
            self.reserve(need)?;
        } else {
            let state = self.buffer.state();
            state
                .free_bytes
                .fetch_add((self.reserved - need) as i64, Ordering::AcqRel);
            self.reserved = need;
        }

        let mut header = arena.header(self.buffer_pos);
        if u64::from(header.size) > size as u64 {
            // Bytes past the final size stay outside every consumer's view
            // but would survive in the arena; scrub them.
            arena.zero_range(
                arena.payload_offset(self.buffer_pos, size as u64),
                u64::from(header.size) - size as u64,
            );
        }
        header.size = size as u32;
        arena.set_header(self.buffer_pos, header);
        arena.zero_header(advance.pos);

        let state = self.buffer.state();
        state.write_next.store(advance.pos, Ordering::Relaxed);
        self.flags |= STATE_SIZE_SET;
        state.write_mutex.unlock();
        self.staging.cut(size as u64);
        Ok(())
    }

    /// Close the packet.
    ///
    /// A writer that has not latched a size gets an implicit
    /// `set_size(high_water)`. Staged spans are committed, then the packet
    /// is flagged and the in-order commit walk makes every contiguous
    /// finished packet visible (writer) or reclaimable (reader).
    pub fn close(&mut self) -> Result<()> {
        if self.flags & STATE_OPEN == 0 {
            return Err(Error::InvalidArgument);
        }
        if self.buffer.state().is_cancelled() {
            return Err(self.interrupted_unwind());
        }
        if self.flags & OPEN_WRITE != 0 {
            self.close_write()
        } else {
            self.close_read()
        }
    }

    /// Unwind a handle that observed cancellation: return the reservation
    /// and release `write_mutex` if this is a writer still in its claim
    /// phase, discard staged spans and kill the handle.
    fn interrupted_unwind(&mut self) -> Error {
        if self.flags & OPEN_WRITE != 0 && self.flags & STATE_SIZE_SET == 0 {
            let state = self.buffer.state();
            state
                .free_bytes
                .fetch_add(self.reserved as i64, Ordering::AcqRel);
            self.buffer.arena().zero_header(self.buffer_pos);
            state.write_mutex.unlock();
            self.reserved = 0;
        }
        self.staging.free_all();
        self.flags = 0;
        Error::Interrupted
    }

    fn close_write(&mut self) -> Result<()> {
        if self.flags & STATE_SIZE_SET == 0 {
            let high_water = self.buffer.arena().header(self.buffer_pos).size;
            self.set_size(high_water as usize)?;
        }

        // Commit staged spans into the arena. Ranges are disjoint and
        // inside the declared size, so order does not matter.
        let staging = mem::take(&mut self.staging);
        for (pos, bytes) in staging.live() {
            self.seek(pos as usize)?;
            self.write(bytes)?;
        }
        let mut staging = staging;
        staging.free_all();
        self.staging = staging;

        let state = self.buffer.state();
        let arena = self.buffer.arena();
        let size = arena.header(self.buffer_pos).size;

        state.write_close_mutex.lock();
        arena.set_header_flags(self.buffer_pos, FLAG_WRITTEN);
        if state.write_pos.load(Ordering::Relaxed) == self.buffer_pos {
            // In-order commit walk: everything contiguous that finished
            // (possibly out of order) becomes visible now, one semaphore
            // unit per packet. Terminates on the zeroed header at
            // write_next at the latest.
            let mut pos = self.buffer_pos;
            loop {
                let header = arena.header(pos);
                if header.flags & FLAG_WRITTEN == 0 {
                    break;
                }
                state.written_packets.post();
                pos = arena.advance(pos, header.size).pos;
            }
            state.write_pos.store(pos, Ordering::Relaxed);
        }
        state.write_close_mutex.unlock();

        if let Some(stats) = self.buffer.stats_block() {
            stats.packets_written.fetch_add(1, Ordering::Relaxed);
            stats.bytes_written.fetch_add(u64::from(size), Ordering::Relaxed);
        }
        self.flags = 0;
        Ok(())
    }

    fn close_read(&mut self) -> Result<()> {
        let state = self.buffer.state();
        let arena = self.buffer.arena();
        let size = arena.header(self.buffer_pos).size;

        state.read_close_mutex.lock();
        arena.set_header_flags(self.buffer_pos, FLAG_READ);
        if state.read_pos.load(Ordering::Relaxed) == self.buffer_pos {
            // Mirror of the writer commit walk: contiguous read packets
            // become reclaimable, one semaphore unit per packet.
            let mut pos = self.buffer_pos;
            loop {
                let header = arena.header(pos);
                if header.flags & FLAG_READ == 0 {
                    break;
                }
                state.read_packets.post();
                pos = arena.advance(pos, header.size).pos;
            }
            state.read_pos.store(pos, Ordering::Relaxed);
        }
        state.read_close_mutex.unlock();

        if let Some(stats) = self.buffer.stats_block() {
            stats.packets_read.fetch_add(1, Ordering::Relaxed);
            stats.bytes_read.fetch_add(u64::from(size), Ordering::Relaxed);
        }
        self.staging.free_all();
        self.flags = 0;
        Ok(())
    }

    /// Abandon an in-progress write before its size is latched, returning
    /// the reservation and the claimed slot.
    pub fn cancel(&mut self) -> Result<()> {
        if self.flags & STATE_OPEN == 0
            || self.flags & OPEN_WRITE == 0
            || self.flags & STATE_SIZE_SET != 0
        {
            return Err(Error::InvalidArgument);
        }
        let state = self.buffer.state();
        state
            .free_bytes
            .fetch_add(self.reserved as i64, Ordering::AcqRel);
        self.buffer.arena().zero_header(self.buffer_pos);
        state.write_mutex.unlock();
        self.staging.free_all();
        self.reserved = 0;
        self.flags = 0;
        Ok(())
    }

    /// Declared size of the packet (for a writer before `set_size`, the
    /// high-water mark written so far).
    pub fn size(&self) -> Result<usize> {
        if self.flags & STATE_OPEN == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(self.buffer.arena().header(self.buffer_pos).size as usize)
    }

    /// Current payload cursor.
    pub fn tell(&self) -> Result<usize> {
        if self.flags & STATE_OPEN == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(self.pos as usize)
    }

    /// Move the payload cursor. The target must lie within the packet's
    /// current size.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if self.flags & STATE_OPEN == 0 {
            return Err(Error::InvalidArgument);
        }
        if pos as u64 > u64::from(self.buffer.arena().header(self.buffer_pos).size) {
            return Err(Error::InvalidArgument);
        }
        self.pos = pos as u64;
        Ok(())
    }

    fn ensure_mode(&self, mode: u32) -> Result<()> {
        if self.flags & STATE_OPEN == 0 || self.flags & mode == 0 {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

impl Drop for Packet<'_> {
    fn drop(&mut self) {
        if self.flags & STATE_OPEN != 0 {
            // Deliberately no auto-close: an abandoned packet behaves like
            // a crashed participant and stalls the ring at its offset.
            log::warn!(
                "[RING] packet handle dropped while open at offset {}; the slot stays pending",
                self.buffer_pos
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attr::BufferAttr;
    use crate::state::STATS;

    fn buffer(size: usize) -> PacketBuffer {
        let mut attr = BufferAttr::new();
        attr.set_size(size).expect("size");
        PacketBuffer::new(&attr).expect("buffer creation failed")
    }

    fn stats_buffer(size: usize) -> PacketBuffer {
        let mut attr = BufferAttr::new();
        attr.set_size(size).expect("size");
        attr.set_flags(STATS).expect("flags");
        PacketBuffer::new(&attr).expect("buffer creation failed")
    }

    #[test]
    fn write_then_read_roundtrip() {
        let buf = buffer(4096);

        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        tx.write(b"hello packet ring").expect("write");
        tx.close().expect("close write");

        let mut rx = Packet::new(&buf);
        rx.open(OPEN_READ).expect("open read");
        assert_eq!(rx.size().expect("size"), 17);
        let mut data = vec![0u8; 17];
        rx.read(&mut data).expect("read");
        rx.close().expect("close read");

        assert_eq!(&data, b"hello packet ring");
    }

    #[test]
    fn open_requires_exactly_one_mode() {
        let buf = buffer(4096);
        let mut pkt = Packet::new(&buf);
        assert!(matches!(pkt.open(0), Err(Error::InvalidArgument)));
        assert!(matches!(pkt.open(OPEN_TRY), Err(Error::InvalidArgument)));
        assert!(matches!(
            pkt.open(OPEN_READ | OPEN_WRITE),
            Err(Error::InvalidArgument)
        ));
        assert!(matches!(pkt.open(0x40), Err(Error::InvalidArgument)));
    }

    #[test]
    fn try_open_write_is_busy_while_claimed() {
        let buf = buffer(4096);
        let mut first = Packet::new(&buf);
        first.open(OPEN_WRITE).expect("open write");

        let mut second = Packet::new(&buf);
        assert!(matches!(
            second.open(OPEN_WRITE | OPEN_TRY),
            Err(Error::Busy)
        ));

        // set_size releases the claim; the next writer may proceed while
        // the first packet is still open.
        first.set_size(8).expect("set size");
        second.open(OPEN_WRITE | OPEN_TRY).expect("open write");
        second.cancel().expect("cancel");
        first.close().expect("close");
    }

    #[test]
    fn try_open_read_is_busy_when_empty() {
        let buf = buffer(4096);
        let mut rx = Packet::new(&buf);
        assert!(matches!(rx.open(OPEN_READ | OPEN_TRY), Err(Error::Busy)));
    }

    #[test]
    fn set_size_twice_is_invalid() {
        let buf = buffer(4096);
        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        tx.set_size(16).expect("set size");
        assert!(matches!(tx.set_size(16), Err(Error::InvalidArgument)));
        tx.close().expect("close");
    }

    #[test]
    fn oversized_packet_is_refused() {
        let buf = buffer(64);
        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        assert!(matches!(
            tx.set_size(49),
            Err(Error::NoBufferSpace { .. })
        ));
        assert!(matches!(
            tx.write(&[0u8; 49]),
            Err(Error::NoBufferSpace { .. })
        ));
        tx.set_size(48).expect("max size fits");
        tx.close().expect("close");
    }

    #[test]
    fn cancel_returns_reservation() {
        let buf = buffer(4096);
        let before = buf.free_bytes();

        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        tx.write(&[1u8; 100]).expect("write");
        assert_eq!(buf.free_bytes(), before - 100);
        tx.cancel().expect("cancel");

        assert_eq!(buf.free_bytes(), before);
        // The slot is claimable again.
        tx.open(OPEN_WRITE).expect("reopen");
        tx.cancel().expect("cancel again");
    }

    #[test]
    fn cancel_after_set_size_is_invalid() {
        let buf = buffer(4096);
        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        tx.set_size(4).expect("set size");
        assert!(matches!(tx.cancel(), Err(Error::InvalidArgument)));
        tx.close().expect("close");
    }

    #[test]
    fn seek_and_tell_move_the_cursor() {
        let buf = buffer(4096);
        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        tx.write(b"abcdef").expect("write");
        assert_eq!(tx.tell().expect("tell"), 6);
        tx.seek(2).expect("seek");
        assert_eq!(tx.tell().expect("tell"), 2);
        tx.write(b"XY").expect("overwrite");
        assert!(matches!(tx.seek(7), Err(Error::InvalidArgument)));
        tx.close().expect("close");

        let mut rx = Packet::new(&buf);
        rx.open(OPEN_READ).expect("open read");
        let mut data = vec![0u8; 6];
        rx.read(&mut data).expect("read");
        assert_eq!(&data, b"abXYef");
        rx.close().expect("close read");
    }

    #[test]
    fn reads_are_bounded_by_declared_size() {
        let buf = buffer(4096);
        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        tx.write(&[9u8; 10]).expect("write");
        tx.close().expect("close");

        let mut rx = Packet::new(&buf);
        rx.open(OPEN_READ).expect("open read");
        let mut too_much = vec![0u8; 11];
        assert!(matches!(
            rx.read(&mut too_much),
            Err(Error::InvalidArgument)
        ));
        let mut exact = vec![0u8; 10];
        rx.read(&mut exact).expect("read");
        rx.close().expect("close read");
    }

    #[test]
    fn shrinking_set_size_zeroes_the_tail() {
        let buf = buffer(4096);
        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        tx.write(&[0xFFu8; 32]).expect("write");
        tx.set_size(8).expect("shrink");
        tx.close().expect("close");

        let mut rx = Packet::new(&buf);
        rx.open(OPEN_READ).expect("open read");
        assert_eq!(rx.size().expect("size"), 8);
        let mut data = vec![0u8; 8];
        rx.read(&mut data).expect("read");
        assert_eq!(data, [0xFF; 8]);
        rx.close().expect("close read");

        // The scrubbed tail never reaches a reader, but it must not
        // survive in the arena either.
        let arena = buf.arena();
        let mut tail = vec![0u8; 24];
        arena.copy_out(arena.payload_offset(0, 8), &mut tail);
        assert!(tail.iter().all(|&b| b == 0));
    }

    #[test]
    fn out_of_order_closes_deliver_in_claim_order() {
        let buf = buffer(4096);

        let mut first = Packet::new(&buf);
        first.open(OPEN_WRITE).expect("open first");
        first.write(b"first").expect("write");
        first.set_size(5).expect("set size");

        let mut second = Packet::new(&buf);
        second.open(OPEN_WRITE).expect("open second");
        second.write(b"second").expect("write");
        second.set_size(6).expect("set size");

        // Close in reverse order; nothing is readable until the packet at
        // write_pos closes.
        second.close().expect("close second");
        let mut probe = Packet::new(&buf);
        assert!(matches!(
            probe.open(OPEN_READ | OPEN_TRY),
            Err(Error::Busy)
        ));
        first.close().expect("close first");

        for expected in [&b"first"[..], &b"second"[..]] {
            let mut rx = Packet::new(&buf);
            rx.open(OPEN_READ).expect("open read");
            let mut data = vec![0u8; expected.len()];
            rx.read(&mut data).expect("read");
            rx.close().expect("close read");
            assert_eq!(data, expected);
        }
    }

    #[test]
    fn dma_direct_when_contiguous() {
        let buf = buffer(4096);
        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        let span = tx.dma(8, 0).expect("dma");
        span.copy_from_slice(b"direct!!");
        tx.close().expect("close");

        let mut rx = Packet::new(&buf);
        rx.open(OPEN_READ).expect("open read");
        let view = rx.dma(8, 0).expect("dma read");
        assert_eq!(view, b"direct!!");
        rx.close().expect("close read");
    }

    #[test]
    fn stats_count_closed_packets() {
        let buf = stats_buffer(4096);
        let mut tx = Packet::new(&buf);
        tx.open(OPEN_WRITE).expect("open write");
        tx.write(&[7u8; 64]).expect("write");
        tx.close().expect("close");

        let mut rx = Packet::new(&buf);
        rx.open(OPEN_READ).expect("open read");
        let mut data = vec![0u8; 64];
        rx.read(&mut data).expect("read");
        rx.close().expect("close read");

        let snap = buf.stats().expect("stats");
        assert_eq!(snap.packets_written, 1);
        assert_eq!(snap.bytes_written, 64);
        assert_eq!(snap.packets_read, 1);
        assert_eq!(snap.bytes_read, 64);
    }

    #[test]
    fn operations_on_closed_handle_are_invalid() {
        let buf = buffer(4096);
        let mut pkt = Packet::new(&buf);
        assert!(matches!(pkt.write(b"x"), Err(Error::InvalidArgument)));
        assert!(matches!(pkt.close(), Err(Error::InvalidArgument)));
        assert!(matches!(pkt.tell(), Err(Error::InvalidArgument)));
        assert!(matches!(pkt.size(), Err(Error::InvalidArgument)));
        assert!(matches!(pkt.cancel(), Err(Error::InvalidArgument)));
        let mut data = [0u8; 1];
        assert!(matches!(
            pkt.read(&mut data),
            Err(Error::InvalidArgument)
        ));
    }
}
