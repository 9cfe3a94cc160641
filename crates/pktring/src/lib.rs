// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # pktring - variable-sized packet ring buffer
//!
//! A thread-safe producer/consumer channel carrying self-delimiting
//! packets through a fixed circular byte arena, usable between threads or,
//! with the shared-memory backing, between cooperating processes.
//!
//! ## Architecture
//!
//! ```text
//! +---------------------+                     +---------------------+
//! |  Writer thread(s)   |                     |  Reader thread(s)   |
//! |  Packet::open(WRITE)|   written_packets   |  Packet::open(READ) |
//! |  write/dma/set_size +--------------------->  read/dma/close     |
//! |  close (commit walk)|                     |  (commit walk)      |
//! +----------+----------+                     +----------+----------+
//!            |            read_packets                   |
//!            +<------------------------------------------+
//!            |        (space reclamation)
//! +----------v-------------------------------------------------------+
//! | PacketBuffer:  [ BufferState | StatsBlock? | circular arena ]    |
//! |                 heap allocation or System V shared segment       |
//! +------------------------------------------------------------------+
//! ```
//!
//! Packets are framed in place: an 8-byte header (flags and payload size)
//! followed by the payload, which may wrap around the arena end. Writers
//! need not know a packet's length up front; the reservation account
//! blocks them only when the arena genuinely has no reclaimable space.
//! Consumers always observe packets in the order writers claimed their
//! slots, regardless of the order the writers finished.
//!
//! ## Quick start
//!
//! ```
//! use pktring::{BufferAttr, PacketBuffer, Packet, OPEN_READ, OPEN_WRITE};
//!
//! fn main() -> pktring::Result<()> {
//!     let mut attr = BufferAttr::new();
//!     attr.set_size(64 * 1024)?;
//!     let buffer = PacketBuffer::new(&attr)?;
//!
//!     let mut tx = Packet::new(&buffer);
//!     tx.open(OPEN_WRITE)?;
//!     tx.write(b"payload bytes")?;
//!     tx.close()?;
//!
//!     let mut rx = Packet::new(&buffer);
//!     rx.open(OPEN_READ)?;
//!     let mut data = vec![0u8; rx.size()?];
//!     rx.read(&mut data)?;
//!     rx.close()?;
//!     assert_eq!(&data, b"payload bytes");
//!     Ok(())
//! }
//! ```
//!
//! ## Key types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`BufferAttr`] | Construction parameters (size, flags, segment id) |
//! | [`PacketBuffer`] | The ring: arena, control state, lifecycle |
//! | [`Packet`] | One in-progress read or write |
//! | [`StatsSnapshot`] | Counters copy when STATS is enabled |
//!
//! ## Concurrency model
//!
//! Preemptive OS threads, optionally across processes sharing one
//! segment. Writers serialize only through the claim phase (open through
//! `set_size`), readers only through `open`; payload streaming runs in
//! parallel on disjoint packets. Two counting semaphores connect the
//! sides: `written_packets` (producer to consumer) and `read_packets`
//! (consumer back to producer, for space reclamation). Every blocking
//! point has a TRY variant and honors [`PacketBuffer::cancel`].

mod arena;
mod attr;
mod buffer;
mod packet;
mod segment;
mod staging;
mod state;
mod stats;
mod sync;

pub use attr::{BufferAttr, DEFAULT_BUFFER_SIZE, DEFAULT_SHM_MODE};
pub use buffer::PacketBuffer;
pub use packet::{Packet, DMA_ACCEPT_FAKE, OPEN_READ, OPEN_TRY, OPEN_WRITE};
pub use state::{CANCELLED, PSHARED, READY, STATS};
pub use stats::StatsSnapshot;

use std::fmt;
use std::io;

/// Errors reported by buffer and packet operations.
#[derive(Debug)]
pub enum Error {
    /// Malformed request: bad flags, handle not open, cursor out of
    /// bounds, buffer not ready.
    InvalidArgument,

    /// A TRY acquisition could not proceed without blocking.
    Busy,

    /// The packet can never fit: it exceeds the arena capacity less two
    /// headers.
    NoBufferSpace { requested: usize, capacity: usize },

    /// The DMA span crosses the arena wrap and the caller did not accept
    /// a staged bounce buffer.
    WouldWrap,

    /// The buffer was cancelled while the operation was blocked or before
    /// it could commit.
    Interrupted,

    /// Bounce buffer allocation failed. The packet remains usable.
    OutOfMemory,

    /// The buffer was not built with the requested capability.
    NotSupported,

    /// Shared memory segment creation failed.
    SegmentCreate(io::Error),

    /// Shared memory segment attach failed.
    SegmentAttach(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::Busy => write!(f, "resource busy, try again"),
            Self::NoBufferSpace { requested, capacity } => {
                write!(
                    f,
                    "packet of {requested} bytes can never fit an arena of {capacity} bytes"
                )
            }
            Self::WouldWrap => {
                write!(f, "span crosses the arena wrap and fake DMA was not accepted")
            }
            Self::Interrupted => write!(f, "buffer cancelled"),
            Self::OutOfMemory => write!(f, "bounce buffer allocation failed"),
            Self::NotSupported => write!(f, "capability not enabled for this buffer"),
            Self::SegmentCreate(e) => write!(f, "shared memory segment creation failed: {e}"),
            Self::SegmentAttach(e) => write!(f, "shared memory segment attach failed: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::SegmentCreate(e) | Self::SegmentAttach(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for buffer and packet operations.
pub type Result<T> = std::result::Result<T, Error>;
