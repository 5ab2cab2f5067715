//! Bounded single-producer/single-consumer queue.
//!
//! The per-client RX and TX-confirmation FIFOs carry packets from the
//! deferred dispatch jobs to client threads. They are lock-free: one atomic
//! head, one atomic tail, a power-of-two slot array, and - the part that
//! matters - **non-cloneable** [`Producer`] and [`Consumer`] handles. The
//! single-producer/single-consumer discipline is enforced by ownership, not
//! by documentation: there is exactly one of each handle and neither is
//! `Clone` or `Sync`.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

struct Inner<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    capacity: usize,
    /// Next slot to read; written only by the consumer.
    head: AtomicUsize,
    /// Next slot to write; written only by the producer.
    tail: AtomicUsize,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        for i in head..tail {
            unsafe {
                (*self.slots[i & self.mask].get()).assume_init_drop();
            }
        }
    }
}

/// The write end of a bounded SPSC queue.
///
/// Not `Clone`: a second producer cannot exist.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

/// The read end of a bounded SPSC queue.
///
/// Not `Clone`: a second consumer cannot exist.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

// The handles may move between threads, but each is used from one thread at
// a time (guaranteed by &mut self on the accessors).
unsafe impl<T: Send> Send for Producer<T> {}
unsafe impl<T: Send> Send for Consumer<T> {}

/// Creates a bounded SPSC queue holding up to `capacity` items.
///
/// The slot array is rounded up to a power of two internally; `capacity`
/// itself is the exact full threshold.
///
/// # Panics
///
/// Panics if `capacity` is zero.
pub fn channel<T>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "spsc capacity must be non-zero");
    let slots_len = capacity.next_power_of_two();
    let mut slots = Vec::with_capacity(slots_len);
    slots.resize_with(slots_len, || UnsafeCell::new(MaybeUninit::uninit()));

    let inner = Arc::new(Inner {
        slots: slots.into_boxed_slice(),
        mask: slots_len - 1,
        capacity,
        head: AtomicUsize::new(0),
        tail: AtomicUsize::new(0),
    });

    (
        Producer {
            inner: Arc::clone(&inner),
        },
        Consumer { inner },
    )
}

impl<T> Producer<T> {
    /// Appends one item, or hands it back when the queue is full.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) >= self.inner.capacity {
            return Err(value);
        }
        unsafe {
            (*self.inner.slots[tail & self.inner.mask].get()).write(value);
        }
        self.inner.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Current fill level as seen from the producer side.
    pub fn len(&self) -> usize {
        let tail = self.inner.tail.load(Ordering::Relaxed);
        let head = self.inner.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items the queue holds.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl<T> Consumer<T> {
    /// Removes and returns the oldest item, if any.
    pub fn pop(&mut self) -> Option<T> {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = unsafe { (*self.inner.slots[head & self.inner.mask].get()).assume_init_read() };
        self.inner.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    /// Current fill level as seen from the consumer side.
    pub fn len(&self) -> usize {
        let head = self.inner.head.load(Ordering::Relaxed);
        let tail = self.inner.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of items the queue holds.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}
