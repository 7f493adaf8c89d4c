//! Lock-free single-producer/single-consumer byte FIFO.
//!
//! A fixed-size byte array with two monotonic indices, one byte sacrificed
//! so empty and full are distinguishable, and release/acquire ordering on
//! the indices, no other synchronization. `head` and `tail` are padded onto
//! separate cache lines via [`crossbeam_utils::CachePadded`] to avoid false
//! sharing between the producer and consumer threads.
//!
//! The storage cells are `UnsafeCell<u8>` rather than a plain `Box<[u8]>`:
//! `write`/`read` both take `&self`, so the only sound way to mutate through
//! that shared reference is interior mutability. This is the one module in
//! the crate allowed to use `unsafe`.
#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Fixed-capacity lock-free byte ring buffer with exactly one producer and
/// one consumer. Never blocks: `write`/`read` return the count actually
/// transferred, which may be less than requested (or zero) under
/// back-pressure or starvation. Partial transfers are the normal signal of
/// that condition, not an error.
pub struct RingBuffer {
    buffer: Box<[UnsafeCell<u8>]>,
    capacity: usize,
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
}

impl RingBuffer {
    /// Creates a ring buffer of the given byte capacity. One byte of
    /// capacity is permanently unusable (it disambiguates full from empty),
    /// so a writer can never fill more than `capacity - 1` bytes.
    pub fn new(capacity_bytes: usize) -> Self {
        let capacity = capacity_bytes.max(1);
        let buffer = (0..capacity)
            .map(|_| UnsafeCell::new(0u8))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer,
            capacity,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Total capacity in bytes, including the one sacrificial byte.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently available to read. Producer-side callers should not
    /// rely on this (it is consumer state); it is exposed read-only so
    /// either side, or a status observer, can snapshot FIFO depth.
    pub fn available_read(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);
        if head >= tail {
            head - tail
        } else {
            self.capacity - tail + head
        }
    }

    /// Bytes currently available to write.
    pub fn available_write(&self) -> usize {
        self.capacity - 1 - self.available_read()
    }

    /// Producer: copies up to `min(src.len(), available_write())` bytes
    /// into the buffer, wrapping once if the span crosses the capacity
    /// boundary, then advances `head` with a release store. Returns the
    /// number of bytes actually written.
    pub fn write(&self, src: &[u8]) -> usize {
        let avail = self.available_write();
        let to_write = src.len().min(avail);
        if to_write == 0 {
            return 0;
        }

        let head = self.head.load(Ordering::Relaxed);
        let first_part = to_write.min(self.capacity - head);

        // SAFETY: only the producer ever writes into [head, head+to_write),
        // and the consumer's acquire load of `head` happens-before this
        // range is read back, so this is not a data race. `UnsafeCell<u8>`
        // has the same layout as `u8`, so treating the first cell's pointer
        // as the base of a contiguous run is valid.
        unsafe {
            let base = self.buffer[head].get();
            std::ptr::copy_nonoverlapping(src.as_ptr(), base, first_part);
            if to_write > first_part {
                let wrap = self.buffer[0].get();
                std::ptr::copy_nonoverlapping(src.as_ptr().add(first_part), wrap, to_write - first_part);
            }
        }

        let new_head = (head + to_write) % self.capacity;
        self.head.store(new_head, Ordering::Release);
        to_write
    }

    /// Consumer: symmetric to [`write`](Self::write); advances `tail` with
    /// a release store after copying. Returns the number of bytes actually
    /// read.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let avail = self.available_read();
        let to_read = dst.len().min(avail);
        if to_read == 0 {
            return 0;
        }

        let tail = self.tail.load(Ordering::Relaxed);
        let first_part = to_read.min(self.capacity - tail);

        // SAFETY: symmetric to the producer side above — only the consumer
        // reads [tail, tail+to_read), and the producer's release store of
        // `head` happens-before this range was written.
        unsafe {
            let base = self.buffer[tail].get();
            std::ptr::copy_nonoverlapping(base, dst.as_mut_ptr(), first_part);
            if to_read > first_part {
                let wrap = self.buffer[0].get();
                std::ptr::copy_nonoverlapping(wrap, dst.as_mut_ptr().add(first_part), to_read - first_part);
            }
        }

        let new_tail = (tail + to_read) % self.capacity;
        self.tail.store(new_tail, Ordering::Release);
        to_read
    }

    /// Resets both indices to zero. Callers must ensure neither the
    /// producer nor the consumer is active when this is called (spec.md
    /// §4.1).
    pub fn reset(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }
}

// SAFETY: `UnsafeCell<u8>` is `!Sync`, so `RingBuffer` would not be `Sync`
// without this impl — and it needs to be, since the producer and consumer
// threads share it behind an `Arc`. The SPSC contract makes it sound: exactly
// one producer thread calls `write`, exactly one consumer thread calls
// `read`, and each only ever touches the index range the other side's
// acquire/release on `head`/`tail` has already made visible to it, so the
// two sides never race on the same byte.
unsafe impl Sync for RingBuffer {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_buffer_reads_nothing() {
        let rb = RingBuffer::new(16);
        let mut dst = [0u8; 4];
        assert_eq!(rb.read(&mut dst), 0);
    }

    #[test]
    fn write_then_read_round_trip() {
        let rb = RingBuffer::new(16);
        let src = [1, 2, 3, 4, 5];
        assert_eq!(rb.write(&src), 5);
        let mut dst = [0u8; 5];
        assert_eq!(rb.read(&mut dst), 5);
        assert_eq!(dst, src);
    }

    #[test]
    fn boundedness_invariant_holds_after_partial_fill() {
        let rb = RingBuffer::new(8);
        let src = [0u8; 5];
        rb.write(&src);
        assert_eq!(rb.available_read() + rb.available_write(), rb.capacity() - 1);
        let mut dst = [0u8; 2];
        rb.read(&mut dst);
        assert_eq!(rb.available_read() + rb.available_write(), rb.capacity() - 1);
    }

    #[test]
    fn write_saturates_at_available_capacity() {
        let rb = RingBuffer::new(8);
        let src = [0u8; 20];
        // Only capacity - 1 bytes can ever be held.
        assert_eq!(rb.write(&src), 7);
        assert_eq!(rb.write(&src), 0);
    }

    #[test]
    fn wraps_across_the_capacity_boundary() {
        let rb = RingBuffer::new(8);
        rb.write(&[1, 2, 3, 4, 5, 6]);
        let mut dst = [0u8; 4];
        rb.read(&mut dst); // tail now at 4
        rb.write(&[7, 8, 9, 10]); // wraps: 2 bytes at tail end, 2 at start
        let mut out = [0u8; 6];
        assert_eq!(rb.read(&mut out), 6);
        assert_eq!(out, [5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn reset_requires_quiescence_but_then_zeros_indices() {
        let rb = RingBuffer::new(8);
        rb.write(&[1, 2, 3]);
        rb.reset();
        assert_eq!(rb.available_read(), 0);
        assert_eq!(rb.available_write(), rb.capacity() - 1);
    }

    /// Property 1 (spec.md §8): concatenated reads are a prefix of
    /// concatenated writes — no duplication, no reordering — even when the
    /// producer and consumer run on separate threads with arbitrary
    /// interleaving and back-pressure drops some bytes.
    #[test]
    fn concurrent_spsc_preserves_order_with_no_duplication() {
        let rb = Arc::new(RingBuffer::new(997)); // odd, non-power-of-two capacity
        let total: usize = 200_000;
        let expected: Vec<u8> = (0..total).map(|i| (i % 256) as u8).collect();

        let producer = {
            let rb = Arc::clone(&rb);
            let expected = expected.clone();
            thread::spawn(move || {
                let mut offset = 0;
                while offset < expected.len() {
                    let wrote = rb.write(&expected[offset..]);
                    offset += wrote;
                    if wrote == 0 {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let rb = Arc::clone(&rb);
            thread::spawn(move || {
                let mut received = Vec::with_capacity(total);
                let mut scratch = [0u8; 256];
                while received.len() < total {
                    let got = rb.read(&mut scratch);
                    received.extend_from_slice(&scratch[..got]);
                    if got == 0 {
                        thread::yield_now();
                    }
                }
                received
            })
        };

        producer.join().unwrap();
        let received = consumer.join().unwrap();
        assert_eq!(received, expected);
    }
}
