//! Lock-free property hand-off between API threads and the mixer.
//!
//! Every mutable entity (context, listener, voice, effect slot) owns one
//! `UpdateSlot`. API-side writers build a fresh property block and swap it
//! in with a release exchange; the mixer drains the slot with an acquire
//! exchange at the start of each render quantum. Publishing twice before
//! the mixer runs recycles the earlier block unread; only the latest
//! snapshot survives, which is the intended real-time coalescing.
//!
//! Consumed blocks go back to a per-entity-type free list (a Treiber stack
//! threaded through the blocks themselves), so neither side touches the
//! allocator in steady state. The single-free-direction discipline (blocks
//! only ever move slot -> pool -> publisher) keeps node identity stable and
//! sidesteps ABA.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// A heap block carrying one property snapshot plus the intrusive free-list
/// link used while it sits in a [`PropsPool`].
pub struct PropsBlock<T> {
    next: *mut PropsBlock<T>,
    pub props: T,
}

impl<T> PropsBlock<T> {
    pub fn new(props: T) -> Box<Self> {
        Box::new(Self {
            next: ptr::null_mut(),
            props,
        })
    }
}

unsafe impl<T: Send> Send for PropsBlock<T> {}

/// Single-entry mailbox holding at most one pending property block.
pub struct UpdateSlot<T> {
    pending: AtomicPtr<PropsBlock<T>>,
}

impl<T> UpdateSlot<T> {
    pub fn new() -> Self {
        Self {
            pending: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Publish a block, making every write to it visible to the consumer.
    /// Returns the block that was displaced without being consumed, if any,
    /// so the caller can recycle it.
    pub fn publish(&self, props: Box<PropsBlock<T>>) -> Option<Box<PropsBlock<T>>> {
        let fresh = Box::into_raw(props);
        let old = self.pending.swap(fresh, Ordering::AcqRel);
        if old.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(old) })
        }
    }

    /// Take the pending block, if one was published since the last consume.
    pub fn consume(&self) -> Option<Box<PropsBlock<T>>> {
        if self.pending.load(Ordering::Relaxed).is_null() {
            return None;
        }
        let taken = self.pending.swap(ptr::null_mut(), Ordering::AcqRel);
        if taken.is_null() {
            None
        } else {
            Some(unsafe { Box::from_raw(taken) })
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for UpdateSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for UpdateSlot<T> {
    fn drop(&mut self) {
        let ptr = *self.pending.get_mut();
        if !ptr.is_null() {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

unsafe impl<T: Send> Send for UpdateSlot<T> {}
unsafe impl<T: Send> Sync for UpdateSlot<T> {}

/// Treiber stack recycling property blocks between consumer and publisher.
pub struct PropsPool<T> {
    head: AtomicPtr<PropsBlock<T>>,
}

impl<T> PropsPool<T> {
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Return a consumed or displaced block for reuse. Allocation-free, so
    /// the mixer may call this.
    pub fn recycle(&self, block: Box<PropsBlock<T>>) {
        let node = Box::into_raw(block);
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Grab a recycled block, or fall back to `init` when the pool is dry.
    /// Only API threads call this; they are allowed to allocate.
    pub fn acquire(&self, init: impl FnOnce() -> T) -> Box<PropsBlock<T>> {
        let mut head = self.head.load(Ordering::Acquire);
        while !head.is_null() {
            let next = unsafe { (*head).next };
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let mut block = unsafe { Box::from_raw(head) };
                    block.next = ptr::null_mut();
                    return block;
                }
                Err(current) => head = current,
            }
        }
        PropsBlock::new(init())
    }
}

impl<T> Default for PropsPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for PropsPool<T> {
    fn drop(&mut self) {
        let mut head = *self.head.get_mut();
        while !head.is_null() {
            let node = unsafe { Box::from_raw(head) };
            head = node.next;
        }
    }
}

unsafe impl<T: Send> Send for PropsPool<T> {}
unsafe impl<T: Send> Sync for PropsPool<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn publish_then_consume_sees_latest_fields() {
        let slot = UpdateSlot::new();
        assert!(slot.publish(PropsBlock::new((1u32, 2.0f32))).is_none());
        let got = slot.consume().unwrap();
        assert_eq!(got.props, (1, 2.0));
        assert!(slot.consume().is_none());
    }

    #[test]
    fn double_publish_coalesces_to_latest() {
        let slot = UpdateSlot::new();
        assert!(slot.publish(PropsBlock::new(10)).is_none());
        let displaced = slot.publish(PropsBlock::new(20)).unwrap();
        assert_eq!(displaced.props, 10);
        assert_eq!(slot.consume().unwrap().props, 20);
    }

    #[test]
    fn pool_round_trips_blocks() {
        let pool = PropsPool::new();
        let block = pool.acquire(|| 7u32);
        assert_eq!(block.props, 7);
        pool.recycle(block);
        // Recycled blocks keep their old contents; publishers overwrite.
        let again = pool.acquire(|| unreachable!());
        assert_eq!(again.props, 7);
    }

    #[test]
    fn cross_thread_publish_consume() {
        let slot = Arc::new(UpdateSlot::new());
        let pool = Arc::new(PropsPool::new());
        let (writer_slot, writer_pool) = (slot.clone(), pool.clone());
        let writer = std::thread::spawn(move || {
            for i in 0..1000u64 {
                let mut block = writer_pool.acquire(|| 0);
                block.props = i;
                if let Some(stale) = writer_slot.publish(block) {
                    writer_pool.recycle(stale);
                }
            }
        });
        let mut last_seen = None;
        for _ in 0..100_000 {
            if let Some(block) = slot.consume() {
                if let Some(prev) = last_seen {
                    assert!(block.props > prev, "updates must be observed in order");
                }
                last_seen = Some(block.props);
                pool.recycle(block);
            }
        }
        writer.join().unwrap();
        if let Some(block) = slot.consume() {
            last_seen = Some(block.props);
            pool.recycle(block);
        }
        assert_eq!(last_seen, Some(999));
    }
}
