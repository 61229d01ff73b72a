//! Lock-free single-producer single-consumer queue.
//!
//! Fixed element type, power-of-two capacity, no allocation after
//! construction. Indices are free-running; masking with `capacity - 1`
//! replaces any modulo. The producer publishes with a release store of its
//! write index and the consumer acquires it (and symmetrically for the read
//! index), so element writes are visible before the slot is observable.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct RingBuffer<T> {
    write_idx: AtomicUsize,
    read_idx: AtomicUsize,
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// The producer/consumer split below guarantees exclusive slot access.
unsafe impl<T: Send> Send for RingBuffer<T> {}
unsafe impl<T: Send> Sync for RingBuffer<T> {}

impl<T> RingBuffer<T> {
    fn with_capacity(capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Arc::new(Self {
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            mask: capacity - 1,
            slots,
        })
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }
}

impl<T> Drop for RingBuffer<T> {
    fn drop(&mut self) {
        let read = *self.read_idx.get_mut();
        let write = *self.write_idx.get_mut();
        for idx in read..write {
            let slot = self.slots[idx & self.mask].get();
            unsafe { (*slot).assume_init_drop() };
        }
    }
}

/// Create a SPSC queue holding at least `capacity` elements (rounded up to
/// a power of two).
pub fn ring_buffer<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    let ring = RingBuffer::with_capacity(capacity);
    (Producer { ring: ring.clone() }, Consumer { ring })
}

pub struct Producer<T> {
    ring: Arc<RingBuffer<T>>,
}

pub struct Consumer<T> {
    ring: Arc<RingBuffer<T>>,
}

impl<T> Producer<T> {
    /// Slots currently free for writing.
    pub fn write_space(&self) -> usize {
        let write = self.ring.write_idx.load(Ordering::Relaxed);
        let read = self.ring.read_idx.load(Ordering::Acquire);
        self.ring.capacity() - write.wrapping_sub(read)
    }

    /// Enqueue one element. Returns it back when the queue is full; nothing
    /// is overwritten.
    pub fn push(&mut self, value: T) -> std::result::Result<(), T> {
        let write = self.ring.write_idx.load(Ordering::Relaxed);
        let read = self.ring.read_idx.load(Ordering::Acquire);
        if write.wrapping_sub(read) == self.ring.capacity() {
            return Err(value);
        }
        let slot = self.ring.slots[write & self.ring.mask].get();
        unsafe { (*slot).write(value) };
        self.ring.write_idx.store(write.wrapping_add(1), Ordering::Release);
        Ok(())
    }
}

impl<T: Copy> Producer<T> {
    /// Copy as much of `src` as fits, returning the number of elements
    /// enqueued. Wrapping across the ring edge is handled internally; the
    /// copy lands as one or two contiguous segments.
    pub fn write_from(&mut self, src: &[T]) -> usize {
        let write = self.ring.write_idx.load(Ordering::Relaxed);
        let read = self.ring.read_idx.load(Ordering::Acquire);
        let space = self.ring.capacity() - write.wrapping_sub(read);
        let count = src.len().min(space);
        for (i, value) in src[..count].iter().enumerate() {
            let slot = self.ring.slots[(write + i) & self.ring.mask].get();
            unsafe { (*slot).write(*value) };
        }
        self.ring
            .write_idx
            .store(write.wrapping_add(count), Ordering::Release);
        count
    }
}

impl<T> Consumer<T> {
    /// Elements currently queued.
    pub fn read_space(&self) -> usize {
        let read = self.ring.read_idx.load(Ordering::Relaxed);
        let write = self.ring.write_idx.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    pub fn pop(&mut self) -> Option<T> {
        let read = self.ring.read_idx.load(Ordering::Relaxed);
        let write = self.ring.write_idx.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let slot = self.ring.slots[read & self.ring.mask].get();
        let value = unsafe { (*slot).assume_init_read() };
        self.ring.read_idx.store(read.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T: Copy> Consumer<T> {
    /// Copy up to `dst.len()` queued elements out, returning the count read.
    pub fn read_into(&mut self, dst: &mut [T]) -> usize {
        let read = self.ring.read_idx.load(Ordering::Relaxed);
        let write = self.ring.write_idx.load(Ordering::Acquire);
        let avail = write.wrapping_sub(read);
        let count = dst.len().min(avail);
        for (i, out) in dst[..count].iter_mut().enumerate() {
            let slot = self.ring.slots[(read + i) & self.ring.mask].get();
            *out = unsafe { (*slot).assume_init_read() };
        }
        self.ring.read_idx.store(read.wrapping_add(count), Ordering::Release);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_preserved() {
        let (mut prod, mut cons) = ring_buffer::<u32>(8);
        for i in 0..8 {
            prod.push(i).unwrap();
        }
        for i in 0..8 {
            assert_eq!(cons.pop(), Some(i));
        }
        assert_eq!(cons.pop(), None);
    }

    #[test]
    fn rejects_writes_past_capacity() {
        let (mut prod, mut cons) = ring_buffer::<u32>(4);
        for i in 0..4 {
            prod.push(i).unwrap();
        }
        assert_eq!(prod.push(99), Err(99));
        assert_eq!(prod.write_space(), 0);
        // Queue contents survive the rejected write.
        for i in 0..4 {
            assert_eq!(cons.pop(), Some(i));
        }
    }

    #[test]
    fn batch_copy_wraps_cleanly() {
        let (mut prod, mut cons) = ring_buffer::<f32>(8);
        // Advance the indices so the next batch write wraps the ring edge.
        prod.write_from(&[0.0; 6]);
        let mut sink = [0.0; 6];
        cons.read_into(&mut sink);

        let data: Vec<f32> = (0..8).map(|i| i as f32).collect();
        assert_eq!(prod.write_from(&data), 8);
        let mut out = [0.0f32; 8];
        assert_eq!(cons.read_into(&mut out), 8);
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn spsc_threads_transfer_sequence() {
        let (mut prod, mut cons) = ring_buffer::<u64>(64);
        const N: u64 = 10_000;
        let writer = std::thread::spawn(move || {
            let mut next = 0u64;
            while next < N {
                if prod.push(next).is_ok() {
                    next += 1;
                }
            }
        });
        let mut expect = 0u64;
        while expect < N {
            if let Some(got) = cons.pop() {
                assert_eq!(got, expect);
                expect += 1;
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn read_space_tracks_occupancy() {
        let (mut prod, mut cons) = ring_buffer::<u8>(4);
        assert_eq!(cons.read_space(), 0);
        prod.push(1).unwrap();
        prod.push(2).unwrap();
        assert_eq!(cons.read_space(), 2);
        assert_eq!(prod.write_space(), 2);
        cons.pop();
        assert_eq!(cons.read_space(), 1);
        assert_eq!(prod.write_space(), 3);
    }
}
