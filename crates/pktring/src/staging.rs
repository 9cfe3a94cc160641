// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bounce buffer staging for contiguous views of wrap-crossing spans.
//!
//! A DMA request wants one contiguous slice, but a span of a packet whose
//! payload crosses the arena wrap has no contiguous backing. When the
//! caller opts in, the handle hands out a staged bounce buffer instead and
//! remembers which payload range it stands for. On a writer the staged
//! bytes are committed into the arena just before close; on a reader they
//! were filled from the arena before being handed out and are simply
//! discarded.
//!
//! Entries live in a flat growable sequence with a free bit and are reused
//! across successive DMA requests of the same handle. Live entries always
//! cover disjoint payload ranges: each allocation starts at the handle's
//! cursor and advances it past the span, and [`Staging::cut`] re-enforces
//! the bound when the final packet size is set.

use crate::{Error, Result};

#[derive(Debug, Default)]
struct StageEntry {
    /// Bounce storage, retained across reuse.
    data: Vec<u8>,
    /// Bytes of `data` currently staged.
    len: usize,
    /// Payload offset this entry stands for.
    pos: u64,
    free: bool,
}

/// Per-handle staging area.
#[derive(Debug, Default)]
pub(crate) struct Staging {
    entries: Vec<StageEntry>,
}

impl Staging {
    /// Stage `len` bytes for payload offset `pos`, reusing the first free
    /// entry (growing its storage if needed) or appending a new one.
    /// Returns the entry index.
    pub(crate) fn alloc(&mut self, len: usize, pos: u64) -> Result<usize> {
        let index = match self.entries.iter().position(|e| e.free) {
            Some(i) => i,
            None => {
                self.entries.push(StageEntry {
                    data: Vec::new(),
                    len: 0,
                    pos: 0,
                    free: true,
                });
                self.entries.len() - 1
            }
        };

        let entry = &mut self.entries[index];
        if entry.data.len() < len {
            let additional = len - entry.data.len();
            entry
                .data
                .try_reserve(additional)
                .map_err(|_| Error::OutOfMemory)?;
            entry.data.resize(len, 0);
        }
        entry.len = len;
        entry.pos = pos;
        entry.free = false;
        Ok(index)
    }

    /// Mutable view of a staged entry's bytes.
    pub(crate) fn buf_mut(&mut self, index: usize) -> &mut [u8] {
        let entry = &mut self.entries[index];
        debug_assert!(!entry.free);
        &mut entry.data[..entry.len]
    }

    /// Live entries as `(payload_pos, bytes)`, for the writer-side commit.
    pub(crate) fn live(&self) -> impl Iterator<Item = (u64, &[u8])> {
        self.entries
            .iter()
            .filter(|e| !e.free)
            .map(|e| (e.pos, &e.data[..e.len]))
    }

    /// Drop or truncate entries past the final payload size, keeping the
    /// disjoint-range invariant intact for the commit.
    pub(crate) fn cut(&mut self, size: u64) {
        for entry in &mut self.entries {
            if entry.free {
                continue;
            }
            if entry.pos >= size {
                entry.free = true;
            } else if entry.pos + entry.len as u64 > size {
                entry.len = (size - entry.pos) as usize;
            }
        }
    }

    /// Discard every live entry without committing. Storage is retained
    /// for reuse by later packets on the same handle.
    pub(crate) fn free_all(&mut self) {
        for entry in &mut self.entries {
            entry.free = true;
        }
    }

    #[cfg(test)]
    fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.free).count()
    }
}
