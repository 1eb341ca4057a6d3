//! Bounded single-producer single-consumer queue.
//!
//! Carries management datagrams from the Nexus listener thread into each
//! endpoint's event loop. FastForward-style design: head and tail indices
//! are local to their thread, and per-slot validity flags determine
//! empty/full, so the two sides never contend on a shared index.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

struct Slot<T> {
    /// true = data present, false = empty.
    full: AtomicBool,
    data: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            full: AtomicBool::new(false),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }
}

struct Inner<T> {
    slots: Box<[Slot<T>]>,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

/// The producing half.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
    head: usize,
    mask: usize,
}

/// The consuming half.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
    tail: usize,
    mask: usize,
}

/// Create a bounded SPSC queue. Capacity is rounded up to a power of two.
///
/// # Panics
/// Panics if `capacity` is 0.
pub fn channel<T: Copy + Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(capacity > 0, "queue capacity must be greater than 0");

    let cap = capacity.next_power_of_two();
    let mask = cap - 1;
    let slots: Box<[Slot<T>]> = (0..cap).map(|_| Slot::new()).collect();
    let inner = Arc::new(Inner { slots });

    (
        Producer {
            inner: Arc::clone(&inner),
            head: 0,
            mask,
        },
        Consumer {
            inner,
            tail: 0,
            mask,
        },
    )
}

impl<T: Copy + Send> Producer<T> {
    /// Enqueue a value. Returns `Err(value)` if the queue is full.
    /// Ownership of the value transfers to the consumer on success.
    #[inline]
    pub fn try_send(&mut self, value: T) -> Result<(), T> {
        let slot = &self.inner.slots[self.head];
        if slot.full.load(Ordering::Acquire) {
            return Err(value);
        }
        unsafe {
            (*slot.data.get()).write(value);
        }
        slot.full.store(true, Ordering::Release);
        self.head = (self.head + 1) & self.mask;
        Ok(())
    }
}

impl<T: Copy + Send> Consumer<T> {
    /// Dequeue a value, or `None` if the queue is empty.
    #[inline]
    pub fn try_recv(&mut self) -> Option<T> {
        let slot = &self.inner.slots[self.tail];
        if !slot.full.load(Ordering::Acquire) {
            return None;
        }
        let value = unsafe { (*slot.data.get()).assume_init() };
        slot.full.store(false, Ordering::Release);
        self.tail = (self.tail + 1) & self.mask;
        Some(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_and_capacity() {
        let (mut tx, mut rx) = channel::<u32>(4);

        for i in 0..4 {
            tx.try_send(i).unwrap();
        }
        assert_eq!(tx.try_send(99), Err(99));

        for i in 0..4 {
            assert_eq!(rx.try_recv(), Some(i));
        }
        assert_eq!(rx.try_recv(), None);
    }

    #[test]
    fn test_wraparound() {
        let (mut tx, mut rx) = channel::<u64>(2);
        for i in 0..100u64 {
            tx.try_send(i).unwrap();
            assert_eq!(rx.try_recv(), Some(i));
        }
    }

    #[test]
    fn test_cross_thread() {
        let (mut tx, mut rx) = channel::<u64>(64);
        let producer = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                loop {
                    if tx.try_send(i).is_ok() {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = rx.try_recv() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
    }
}
