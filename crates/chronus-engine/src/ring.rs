//! Lock-free SPSC rings connecting workers to the audio callback.
//!
//! Two ring kinds: a frame ring whose cells are whole audio buffers stored
//! contiguously, and a generic record ring for `Copy` command cells. Both
//! use power-of-two capacities with monotonic u64 head/tail counters in
//! cache-padded atomics; the producer publishes with a release store, the
//! consumer acquires before reading, and occupancy is derived from counter
//! snapshots. Nothing in here waits: `write` fails with `Full`, `read` with
//! `Empty`, and the callers own the fallback policy.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ring operation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// Producer side: `head - tail` reached capacity.
    Full,
    /// Consumer side: `head == tail`.
    Empty,
}

struct Inner<T> {
    /// Producer writes at `head`.
    head: CachePadded<AtomicU64>,
    /// Consumer reads at `tail`.
    tail: CachePadded<AtomicU64>,
    mask: u64,
    cells: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// The head/tail protocol guarantees a cell is never read while written.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn occupancy(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail).min(self.mask + 1) as usize
    }
}

/// Producer half of a record ring. Exactly one exists per ring at any time.
pub struct Producer<T: Copy> {
    inner: Arc<Inner<T>>,
}

/// Consumer half of a record ring.
pub struct Consumer<T: Copy> {
    inner: Arc<Inner<T>>,
}

impl<T: Copy> Producer<T> {
    /// Write one record. Fails with `Full` when the ring holds `capacity`
    /// unread records.
    #[inline]
    pub fn write(&mut self, value: T) -> Result<(), RingError> {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        if head - tail > self.inner.mask {
            return Err(RingError::Full);
        }
        let idx = (head & self.inner.mask) as usize;
        unsafe {
            (*self.inner.cells[idx].get()).write(value);
        }
        self.inner.head.store(head + 1, Ordering::Release);
        Ok(())
    }

    /// Records currently in the ring. A lower bound under concurrent reads.
    pub fn occupancy(&self) -> usize {
        self.inner.occupancy()
    }

    /// Free cells. An upper bound under concurrent reads.
    pub fn free(&self) -> usize {
        (self.inner.mask as usize + 1) - self.inner.occupancy()
    }
}

impl<T: Copy> Consumer<T> {
    /// Read one record. Fails with `Empty` when caught up with the producer.
    #[inline]
    pub fn read(&mut self) -> Result<T, RingError> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if head == tail {
            return Err(RingError::Empty);
        }
        let idx = (tail & self.inner.mask) as usize;
        let value = unsafe { (*self.inner.cells[idx].get()).assume_init_read() };
        self.inner.tail.store(tail + 1, Ordering::Release);
        Ok(value)
    }

    pub fn occupancy(&self) -> usize {
        self.inner.occupancy()
    }
}

/// Supervisor-held handle used to re-arm the producer side after a worker
/// death. Cloning the handle never creates a producer by itself.
pub struct RingHandle<T: Copy> {
    inner: Arc<Inner<T>>,
}

impl<T: Copy> Clone for RingHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Copy> RingHandle<T> {
    /// Construct a fresh producer for this ring.
    ///
    /// # Safety
    /// The caller must guarantee no other producer exists: the previous
    /// producer's thread has exited and its handle has been dropped. Two
    /// live producers break the SPSC protocol.
    pub unsafe fn attach_producer(&self) -> Producer<T> {
        Producer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Construct a fresh consumer for this ring.
    ///
    /// # Safety
    /// Mirror of [`Self::attach_producer`]: the previous consumer must be
    /// gone before a new one is created.
    pub unsafe fn attach_consumer(&self) -> Consumer<T> {
        Consumer {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Create a record ring. `capacity` must be a power of two.
pub fn record_ring<T: Copy>(capacity: usize) -> (Producer<T>, Consumer<T>, RingHandle<T>) {
    assert!(capacity.is_power_of_two(), "ring capacity must be 2^n");
    let mut cells = Vec::with_capacity(capacity);
    cells.resize_with(capacity, || UnsafeCell::new(MaybeUninit::uninit()));
    let inner = Arc::new(Inner {
        head: CachePadded::new(AtomicU64::new(0)),
        tail: CachePadded::new(AtomicU64::new(0)),
        mask: capacity as u64 - 1,
        cells: cells.into_boxed_slice(),
    });
    (
        Producer {
            inner: Arc::clone(&inner),
        },
        Consumer {
            inner: Arc::clone(&inner),
        },
        RingHandle { inner },
    )
}

struct FrameInner {
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    mask: u64,
    frame_len: usize,
    /// `capacity * frame_len` samples, zero-initialized.
    samples: UnsafeCell<Box<[f32]>>,
}

unsafe impl Send for FrameInner {}
unsafe impl Sync for FrameInner {}

impl FrameInner {
    fn occupancy(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail).min(self.mask + 1) as usize
    }
}

/// Producer half of an audio frame ring; owned by one worker thread.
pub struct FrameProducer {
    inner: Arc<FrameInner>,
}

/// Consumer half of an audio frame ring; owned by the audio callback.
pub struct FrameConsumer {
    inner: Arc<FrameInner>,
}

impl FrameProducer {
    /// Write one frame of exactly `frame_len` samples.
    #[inline]
    pub fn write(&mut self, frame: &[f32]) -> Result<(), RingError> {
        debug_assert_eq!(frame.len(), self.inner.frame_len);
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        if head - tail > self.inner.mask {
            return Err(RingError::Full);
        }
        let idx = (head & self.inner.mask) as usize * self.inner.frame_len;
        unsafe {
            let cells = &mut *self.inner.samples.get();
            cells[idx..idx + self.inner.frame_len].copy_from_slice(frame);
        }
        self.inner.head.store(head + 1, Ordering::Release);
        Ok(())
    }

    pub fn occupancy(&self) -> usize {
        self.inner.occupancy()
    }
}

impl FrameConsumer {
    /// Drop all but the freshest `keep` frames by advancing the tail.
    ///
    /// Used when the callback switches slots: the newly active ring has been
    /// accumulating frames nobody consumed, and replaying that backlog would
    /// play stale audio. Pure counter arithmetic, safe in the callback.
    pub fn discard_to_latest(&mut self, keep: usize) {
        let head = self.inner.head.load(Ordering::Acquire);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let occupancy = head.saturating_sub(tail);
        if occupancy > keep as u64 {
            self.inner.tail.store(head - keep as u64, Ordering::Release);
        }
    }

    /// Read one frame into `out`, which must be exactly `frame_len` long.
    #[inline]
    pub fn read_into(&mut self, out: &mut [f32]) -> Result<(), RingError> {
        debug_assert_eq!(out.len(), self.inner.frame_len);
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if head == tail {
            return Err(RingError::Empty);
        }
        let idx = (tail & self.inner.mask) as usize * self.inner.frame_len;
        unsafe {
            let cells = &*self.inner.samples.get();
            out.copy_from_slice(&cells[idx..idx + self.inner.frame_len]);
        }
        self.inner.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    pub fn occupancy(&self) -> usize {
        self.inner.occupancy()
    }
}

/// Supervisor-held handle for re-arming a frame producer after respawn.
pub struct FrameRingHandle {
    inner: Arc<FrameInner>,
}

impl Clone for FrameRingHandle {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl FrameRingHandle {
    /// # Safety
    /// Same contract as [`RingHandle::attach_producer`]: the previous
    /// producer must be gone.
    pub unsafe fn attach_producer(&self) -> FrameProducer {
        FrameProducer {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Create a frame ring of `capacity` frames of `frame_len` samples.
pub fn frame_ring(
    capacity: usize,
    frame_len: usize,
) -> (FrameProducer, FrameConsumer, FrameRingHandle) {
    assert!(capacity.is_power_of_two(), "ring capacity must be 2^n");
    let inner = Arc::new(FrameInner {
        head: CachePadded::new(AtomicU64::new(0)),
        tail: CachePadded::new(AtomicU64::new(0)),
        mask: capacity as u64 - 1,
        frame_len,
        samples: UnsafeCell::new(vec![0.0; capacity * frame_len].into_boxed_slice()),
    });
    (
        FrameProducer {
            inner: Arc::clone(&inner),
        },
        FrameConsumer {
            inner: Arc::clone(&inner),
        },
        FrameRingHandle { inner },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_ring_full_and_empty() {
        let (mut tx, mut rx, _) = record_ring::<u32>(4);
        assert_eq!(rx.read(), Err(RingError::Empty));
        for i in 0..4 {
            tx.write(i).expect("fits");
        }
        assert_eq!(tx.write(99), Err(RingError::Full));
        for i in 0..4 {
            assert_eq!(rx.read(), Ok(i));
        }
        assert_eq!(rx.read(), Err(RingError::Empty));
    }

    #[test]
    fn record_ring_preserves_order_across_wrap() {
        let (mut tx, mut rx, _) = record_ring::<u64>(8);
        for round in 0..100u64 {
            for i in 0..5 {
                tx.write(round * 5 + i).expect("fits");
            }
            for i in 0..5 {
                assert_eq!(rx.read(), Ok(round * 5 + i));
            }
        }
    }

    #[test]
    fn occupancy_stays_in_bounds() {
        let (mut tx, mut rx, _) = record_ring::<u8>(4);
        assert_eq!(tx.occupancy(), 0);
        assert_eq!(tx.free(), 4);
        tx.write(1).expect("fits");
        tx.write(2).expect("fits");
        assert_eq!(tx.occupancy(), 2);
        assert_eq!(rx.occupancy(), 2);
        rx.read().expect("has");
        assert_eq!(tx.free(), 3);
    }

    #[test]
    fn frame_ring_round_trips_frames() {
        let (mut tx, mut rx, _) = frame_ring(4, 8);
        let frame: Vec<f32> = (0..8).map(|i| i as f32).collect();
        tx.write(&frame).expect("fits");
        let mut out = vec![0.0; 8];
        rx.read_into(&mut out).expect("has frame");
        assert_eq!(out, frame);
        assert_eq!(rx.read_into(&mut out), Err(RingError::Empty));
    }

    #[test]
    fn discard_to_latest_keeps_only_fresh_frames() {
        let (mut tx, mut rx, _) = frame_ring(8, 2);
        for i in 0..6 {
            tx.write(&[i as f32, i as f32]).expect("fits");
        }
        rx.discard_to_latest(2);
        assert_eq!(rx.occupancy(), 2);
        let mut out = [0.0; 2];
        rx.read_into(&mut out).expect("has frame");
        assert_eq!(out, [4.0, 4.0]);
        rx.read_into(&mut out).expect("has frame");
        assert_eq!(out, [5.0, 5.0]);
        assert_eq!(rx.read_into(&mut out), Err(RingError::Empty));

        // Keeping more than present is a no-op.
        tx.write(&[9.0, 9.0]).expect("fits");
        rx.discard_to_latest(4);
        assert_eq!(rx.occupancy(), 1);
    }

    #[test]
    fn frame_ring_rejects_overfill() {
        let (mut tx, _rx, _) = frame_ring(2, 4);
        let frame = [0.5; 4];
        tx.write(&frame).expect("fits");
        tx.write(&frame).expect("fits");
        assert_eq!(tx.write(&frame), Err(RingError::Full));
    }

    #[test]
    fn cross_thread_transfer_keeps_order() {
        let (mut tx, mut rx, _) = record_ring::<u64>(64);
        let producer = std::thread::spawn(move || {
            let mut next = 0u64;
            while next < 10_000 {
                if tx.write(next).is_ok() {
                    next += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });
        let mut expected = 0u64;
        while expected < 10_000 {
            match rx.read() {
                Ok(v) => {
                    assert_eq!(v, expected);
                    expected += 1;
                }
                Err(RingError::Empty) => std::thread::yield_now(),
                Err(e) => panic!("unexpected {e:?}"),
            }
        }
        producer.join().expect("producer finished");
    }

    #[test]
    fn reattached_producer_continues_sequence() {
        let (mut tx, mut rx, handle) = record_ring::<u32>(8);
        tx.write(1).expect("fits");
        drop(tx);
        // Worker respawn path: previous producer is gone, re-arm.
        let mut tx = unsafe { handle.attach_producer() };
        tx.write(2).expect("fits");
        assert_eq!(rx.read(), Ok(1));
        assert_eq!(rx.read(), Ok(2));
    }
}
