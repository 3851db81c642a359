//! Lock-free SPSC queue for cross-agent events and commands.
//!
//! A wait-free bounded queue over a heap-allocated ring with atomic
//! indices. Each inter-agent edge in the driver (conductor → sender,
//! conductor → receiver, receiver → conductor) is one of these queues.
//!
//! # Example
//!
//! ```
//! use aqueduct::concurrent::spsc;
//!
//! let (producer, consumer) = spsc::channel::<u64>(1024);
//!
//! producer.push(42).expect("queue full");
//! assert_eq!(consumer.pop(), Some(42));
//! ```

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[repr(align(64))]
struct CachePadded<T>(T);

struct Ring<T: Send> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// SAFETY: slots are only touched according to the SPSC protocol; the
// atomics mediate all cross-thread visibility.
unsafe impl<T: Send> Send for Ring<T> {}
unsafe impl<T: Send> Sync for Ring<T> {}

/// Marker type to opt out of `Sync` while remaining `Send`.
type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// Write end of the queue. Exactly one producer per queue.
pub struct Producer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Read end of the queue. Exactly one consumer per queue.
pub struct Consumer<T: Send> {
    ring: Arc<Ring<T>>,
    _unsync: PhantomUnsync,
}

/// Creates a new SPSC channel.
///
/// `capacity` is rounded up to the next power of two.
///
/// # Panics
///
/// Panics if `capacity` is zero.
#[must_use]
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "queue capacity must be greater than 0");
    let capacity = capacity.next_power_of_two();

    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect::<Vec<_>>()
        .into_boxed_slice();

    let ring = Arc::new(Ring {
        head: CachePadded(AtomicUsize::new(0)),
        tail: CachePadded(AtomicUsize::new(0)),
        mask: capacity - 1,
        slots,
    });

    (
        Producer {
            ring: Arc::clone(&ring),
            _unsync: PhantomData,
        },
        Consumer {
            ring,
            _unsync: PhantomData,
        },
    )
}

impl<T: Send> Producer<T> {
    /// Attempts to push an item (wait-free).
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the queue is full, allowing retry.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        let ring = &*self.ring;
        let tail = ring.tail.0.load(Ordering::Relaxed);
        let head = ring.head.0.load(Ordering::Acquire);

        if tail.wrapping_sub(head) > ring.mask {
            return Err(item);
        }

        // SAFETY: [head, tail) are occupied, so slot `tail` is free and the
        // single producer has exclusive write access to it.
        unsafe {
            (*ring.slots[tail & ring.mask].get()).write(item);
        }
        ring.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }
}

impl<T: Send> Consumer<T> {
    /// Attempts to pop an item (wait-free). Returns `None` when empty.
    #[inline]
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let ring = &*self.ring;
        let head = ring.head.0.load(Ordering::Relaxed);
        let tail = ring.tail.0.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: the acquire load of tail guarantees the producer's write
        // to slot `head` is visible; the single consumer has exclusive
        // read access to it.
        let item = unsafe { (*ring.slots[head & ring.mask].get()).assume_init_read() };
        ring.head.0.store(head.wrapping_add(1), Ordering::Release);
        Some(item)
    }
}

impl<T: Send> Drop for Ring<T> {
    fn drop(&mut self) {
        let head = self.head.0.load(Ordering::Relaxed);
        let tail = self.tail.0.load(Ordering::Relaxed);
        let mut index = head;
        while index != tail {
            // SAFETY: [head, tail) hold initialized items not yet consumed.
            unsafe {
                (*self.slots[index & self.mask].get()).assume_init_drop();
            }
            index = index.wrapping_add(1);
        }
    }
}
