// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Round-trip laws and single-threaded boundary scenarios.

use pktring::{
    BufferAttr, Error, Packet, PacketBuffer, DMA_ACCEPT_FAKE, OPEN_READ, OPEN_TRY, OPEN_WRITE,
    PSHARED,
};
use std::thread;
use std::time::Duration;

const HEADER_SIZE: usize = 8;

fn buffer(size: usize) -> PacketBuffer {
    let mut attr = BufferAttr::new();
    attr.set_size(size).expect("arena size");
    PacketBuffer::new(&attr).expect("buffer creation failed")
}

fn write_packet(buf: &PacketBuffer, payload: &[u8]) {
    let mut tx = Packet::new(buf);
    tx.open(OPEN_WRITE).expect("open write");
    tx.write(payload).expect("write");
    tx.close().expect("close write");
}

fn read_packet(buf: &PacketBuffer) -> Vec<u8> {
    let mut rx = Packet::new(buf);
    rx.open(OPEN_READ).expect("open read");
    let mut data = vec![0u8; rx.size().expect("size")];
    rx.read(&mut data).expect("read");
    rx.close().expect("close read");
    data
}

/// Move `write_next` to `target` by pushing one filler packet through the
/// ring and consuming it.
fn position_write_next(buf: &PacketBuffer, target: usize) {
    let mut filler = Packet::new(buf);
    filler.open(OPEN_WRITE).expect("open filler");
    filler.set_size(target - HEADER_SIZE).expect("filler size");
    filler.close().expect("close filler");

    let mut rx = Packet::new(buf);
    rx.open(OPEN_READ).expect("open filler read");
    rx.close().expect("close filler read");
}

#[test]
fn write_then_read_is_identity() {
    let buf = buffer(64 * 1024);
    fastrand::seed(7);

    for len in [0usize, 1, 255, 4096, 64 * 1024 - 2 * HEADER_SIZE] {
        let payload: Vec<u8> = (0..len).map(|_| fastrand::u8(..)).collect();
        write_packet(&buf, &payload);
        assert_eq!(read_packet(&buf), payload);
        // Return the space so the next (possibly maximal) packet fits.
        buf.drain().expect("drain");
    }
}

#[test]
fn chunked_writes_and_dma_reassemble() {
    let n = 64 * 1024;
    let buf = buffer(n);
    fastrand::seed(11);

    // Start the packet so that the arena wrap falls 500 bytes into the
    // payload, inside one of the DMA chunks below.
    position_write_next(&buf, n - HEADER_SIZE - 500);

    let payload: Vec<u8> = (0..2000).map(|_| fastrand::u8(..)).collect();

    let mut tx = Packet::new(&buf);
    tx.open(OPEN_WRITE).expect("open write");
    for (i, chunk) in payload.chunks(150).enumerate() {
        if i % 2 == 0 {
            tx.write(chunk).expect("write chunk");
        } else {
            // Direct DMA where possible; fall back to a staged bounce
            // buffer for the span that crosses the wrap.
            match tx.dma(chunk.len(), 0) {
                Ok(span) => span.copy_from_slice(chunk),
                Err(Error::WouldWrap) => {
                    let span = tx.dma(chunk.len(), DMA_ACCEPT_FAKE).expect("fake dma");
                    span.copy_from_slice(chunk);
                }
                Err(e) => panic!("dma failed: {e}"),
            }
        }
    }
    tx.close().expect("close write");

    assert_eq!(read_packet(&buf), payload);
}

#[test]
fn fifty_packets_then_drain() {
    let n = 64 * 1024;
    let buf = buffer(n);

    for i in 0..50u32 {
        let payload = vec![i as u8; 1000];
        write_packet(&buf, &payload);
    }

    let mut dump = Vec::new();
    buf.state_dump(&mut dump).expect("state dump");
    let text = String::from_utf8(dump).expect("utf8 dump");
    assert!(text.contains("unread packets: 50 (50000 bytes)"), "{text}");

    assert_eq!(buf.drain().expect("drain"), 50);

    let mut dump = Vec::new();
    buf.state_dump(&mut dump).expect("state dump");
    let text = String::from_utf8(dump).expect("utf8 dump");
    assert!(text.contains("unread packets: 0 (0 bytes)"), "{text}");
    assert!(text.contains("pending free packets: 0 (0 bytes)"), "{text}");
    assert_eq!(buf.free_bytes(), (n - HEADER_SIZE) as i64);

    // Drain after drain finds nothing.
    assert_eq!(buf.drain().expect("drain"), 0);
}

#[test]
fn minimal_arena_blocks_until_reclaim() {
    // Smallest arena that can carry a one-byte packet.
    let n = 2 * HEADER_SIZE + 1;
    let buf = buffer(n);

    let mut tx = Packet::new(&buf);
    tx.open(OPEN_WRITE).expect("open write");
    assert!(matches!(tx.set_size(2), Err(Error::NoBufferSpace { .. })));
    tx.set_size(1).expect("one byte fits");
    tx.write(b"x").expect("write");
    tx.close().expect("close write");

    // The arena is now full: the next packet cannot settle its size until
    // the first one has been read and reclaimed.
    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            let mut tx = Packet::new(&buf);
            tx.open(OPEN_WRITE).expect("open second write");
            tx.set_size(1).expect("blocks for space, then fits");
            tx.write(b"y").expect("write");
            tx.close().expect("close second write");
        });

        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished(), "writer should be blocked on space");

        assert_eq!(read_packet(&buf), b"x");
        writer.join().expect("writer panicked");
    });

    assert_eq!(read_packet(&buf), b"y");
}

#[test]
fn huge_dma_near_wrap_needs_fake() {
    let n = 64 * 1024;
    let buf = buffer(n);
    fastrand::seed(13);

    // Park the next packet close to the arena end, then ask for a span
    // larger than the remaining contiguous tail.
    position_write_next(&buf, 65000);
    let len = n / 2 + 1;
    let payload: Vec<u8> = (0..len).map(|_| fastrand::u8(..)).collect();

    let mut tx = Packet::new(&buf);
    tx.open(OPEN_WRITE).expect("open write");
    assert!(matches!(tx.dma(len, 0), Err(Error::WouldWrap)));

    let span = tx.dma(len, DMA_ACCEPT_FAKE).expect("fake dma");
    span.copy_from_slice(&payload);
    tx.close().expect("close write");

    assert_eq!(read_packet(&buf), payload);
}

#[test]
fn try_variants_report_busy_without_side_effects() {
    let buf = buffer(4096);
    let free_before = buf.free_bytes();

    let mut rx = Packet::new(&buf);
    assert!(matches!(rx.open(OPEN_READ | OPEN_TRY), Err(Error::Busy)));

    let mut holder = Packet::new(&buf);
    holder.open(OPEN_WRITE).expect("open write");
    let mut contender = Packet::new(&buf);
    assert!(matches!(
        contender.open(OPEN_WRITE | OPEN_TRY),
        Err(Error::Busy)
    ));
    holder.cancel().expect("cancel");

    assert_eq!(buf.free_bytes(), free_before);
}

#[cfg(target_os = "linux")]
#[test]
fn shared_segment_roundtrip_across_attachments() {
    let mut attr = BufferAttr::new();
    attr.set_size(16 * 1024).expect("arena size");
    attr.set_flags(PSHARED).expect("flags");
    let creator = PacketBuffer::new(&attr).expect("create shared buffer");

    let mut attach_attr = BufferAttr::new();
    attach_attr.set_flags(PSHARED).expect("flags");
    attach_attr
        .set_shm_id(Some(creator.shm_id().expect("shm id")))
        .expect("shm id");
    let attached = PacketBuffer::new(&attach_attr).expect("attach shared buffer");

    // Written through one mapping, read through the other.
    write_packet(&creator, b"cross-mapping payload");
    assert_eq!(read_packet(&attached), b"cross-mapping payload");

    write_packet(&attached, b"and back");
    assert_eq!(read_packet(&creator), b"and back");
}
