//! Bounded many-producer/single-consumer ring over POSIX shared memory.
//!
//! Clients push commands, the driver pops them.
//!
//! # Algorithm
//!
//! ```text
//! producer                               consumer (creator only)
//! ─────────────────────────────────      ──────────────────────────────
//! head = load(head)                      tail = load(tail)
//! if head - load(tail) >= N: full        slot = slots[tail % N]
//! CAS head -> head + 1                   if slot.seq != tail + 1: empty
//! write slot[head % N]                   read value
//! slot.seq = head + 1   (Release)        store(tail, tail + 1) (Release)
//! ```
//!
//! Every field starts at zero, so the creator maps the object zero-filled
//! and never runs an initializer over the slots. A producer that dies between
//! reserving a slot and publishing it stalls the ring; clients only push
//! small `Copy` records, so that window is a handful of stores.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use super::shmem::{Creator, Opener, SharedMemorySafe, Shm, ShmError, ShmMode, ShmPath};

/// Capacity of the driver's command ring.
pub const TO_DRIVER_CAPACITY: usize = 1024;

#[repr(C, align(64))]
struct Cursor(AtomicU64);

#[repr(C, align(64))]
struct Slot<T> {
    sequence: AtomicU64,
    value: UnsafeCell<MaybeUninit<T>>,
}

#[repr(C)]
struct RingLayout<T, const N: usize> {
    head: Cursor,
    tail: Cursor,
    slots: [Slot<T>; N],
}

// SAFETY: repr(C); the cursors and sequences are atomics, and a slot value is
// only touched by the producer that reserved it or by the consumer after the
// sequence handoff.
unsafe impl<T: SharedMemorySafe, const N: usize> SharedMemorySafe for RingLayout<T, N> {}

// SAFETY: see the SharedMemorySafe impl.
unsafe impl<T: SharedMemorySafe, const N: usize> Send for RingLayout<T, N> {}
unsafe impl<T: SharedMemorySafe, const N: usize> Sync for RingLayout<T, N> {}

type PhantomUnsync = PhantomData<Cell<&'static ()>>;

/// One end of a command ring.
///
/// Any number of handles may push, across threads and processes. Popping is
/// only offered on the [`Creator`] handle, which the driver owns.
///
/// `CommandRing` is [`Send`] but not [`Sync`]: a handle can move to another
/// thread, but concurrent pushers each need their own handle.
pub struct CommandRing<T: SharedMemorySafe + Copy, const N: usize, Mode: ShmMode> {
    shm: Shm<RingLayout<T, N>, Mode>,
    _unsync: PhantomUnsync,
}

impl<T: SharedMemorySafe + Copy, const N: usize> CommandRing<T, N, Creator> {
    /// Creates an empty ring; the name is unlinked when this handle drops.
    ///
    /// # Errors
    ///
    /// `EEXIST` (path exists), `EACCES` (permissions), `ENOMEM` (resources).
    pub fn create(path: &ShmPath) -> Result<Self, ShmError> {
        // SAFETY: zero cursors and sequences describe an empty ring, and the
        // slot values are `MaybeUninit`.
        let shm = unsafe { Shm::<RingLayout<T, N>, Creator>::create_zeroed(path)? };
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }

    /// Takes the oldest published command.
    #[inline]
    pub fn pop(&self) -> Option<T> {
        let ring = &*self.shm;
        let tail = ring.tail.0.load(Ordering::Relaxed);
        let slot = &ring.slots[(tail % N as u64) as usize];

        if slot.sequence.load(Ordering::Acquire) != tail.wrapping_add(1) {
            return None;
        }

        // SAFETY: the sequence handoff says the producer finished writing,
        // and no producer reuses the slot until tail moves past it.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        ring.tail.0.store(tail.wrapping_add(1), Ordering::Release);
        Some(value)
    }
}

impl<T: SharedMemorySafe + Copy, const N: usize> CommandRing<T, N, Opener> {
    /// Maps a ring created by the driver.
    ///
    /// # Errors
    ///
    /// `ENOENT` (doesn't exist), `EACCES` (permissions), size mismatch.
    pub fn open(path: &ShmPath) -> Result<Self, ShmError> {
        let shm = Shm::<RingLayout<T, N>, Opener>::open(path)?;
        Ok(Self {
            shm,
            _unsync: PhantomData,
        })
    }
}

impl<T: SharedMemorySafe + Copy, const N: usize, Mode: ShmMode> CommandRing<T, N, Mode> {
    /// Attempts to push without waiting.
    ///
    /// # Errors
    ///
    /// Returns `Err(item)` if the ring is full, allowing retry.
    #[inline]
    pub fn push(&self, item: T) -> Result<(), T> {
        let ring = &*self.shm;
        loop {
            let head = ring.head.0.load(Ordering::Relaxed);
            let tail = ring.tail.0.load(Ordering::Acquire);
            if head.wrapping_sub(tail) >= N as u64 {
                return Err(item);
            }

            if ring
                .head
                .0
                .compare_exchange_weak(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                let slot = &ring.slots[(head % N as u64) as usize];
                // SAFETY: the CAS gave us position `head` exclusively, and the
                // consumer released the slot's previous lap before tail
                // reached `head - N + 1`.
                unsafe {
                    (*slot.value.get()).write(item);
                }
                slot.sequence.store(head.wrapping_add(1), Ordering::Release);
                return Ok(());
            }
            std::hint::spin_loop();
        }
    }

    /// Commands pushed but not yet popped.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.shm.head.0.load(Ordering::Acquire);
        let tail = self.shm.tail.0.load(Ordering::Acquire);
        head.wrapping_sub(tail) as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::shmem::{is_unavailable, unique_test_path};
    use std::thread;

    fn ring<const N: usize>(tag: &str) -> Option<(ShmPath, CommandRing<u64, N, Creator>)> {
        let path = unique_test_path(tag);
        match CommandRing::<u64, N, Creator>::create(&path) {
            Ok(ring) => Some((path, ring)),
            Err(err) if is_unavailable(&err) => None,
            Err(err) => panic!("create failed: {err}"),
        }
    }

    #[test]
    fn test_basic_push_pop() {
        let Some((path, consumer)) = ring::<8>("ring-basic") else {
            return;
        };
        let producer = CommandRing::<u64, 8, Opener>::open(&path).unwrap();

        assert!(producer.push(42).is_ok());
        assert_eq!(producer.len(), 1);
        assert_eq!(consumer.pop(), Some(42));
        assert_eq!(consumer.pop(), None);
        assert!(consumer.is_empty());
    }

    #[test]
    fn test_ring_full() {
        let Some((path, consumer)) = ring::<4>("ring-full") else {
            return;
        };
        let producer = CommandRing::<u64, 4, Opener>::open(&path).unwrap();

        for i in 0..4 {
            assert!(producer.push(i).is_ok(), "Failed to push item {i}");
        }
        assert_eq!(producer.push(999), Err(999));

        assert_eq!(consumer.pop(), Some(0));
        assert!(producer.push(4).is_ok());
        assert_eq!(producer.push(1000), Err(1000));
    }

    #[test]
    fn test_wraparound() {
        let Some((path, consumer)) = ring::<4>("ring-wrap") else {
            return;
        };
        let producer = CommandRing::<u64, 4, Opener>::open(&path).unwrap();

        for round in 0..5 {
            for i in 0..4 {
                assert!(producer.push(round * 10 + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(consumer.pop(), Some(round * 10 + i));
            }
            assert_eq!(consumer.pop(), None);
        }
    }

    #[test]
    fn test_concurrent_producers() {
        let Some((path, consumer)) = ring::<64>("ring-concurrent") else {
            return;
        };
        let producers = 4;
        let per_producer = 100;

        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let path = path.clone();
                thread::spawn(move || {
                    let producer = CommandRing::<u64, 64, Opener>::open(&path).unwrap();
                    for i in 0..per_producer {
                        let value = (p * 1000 + i) as u64;
                        while producer.push(value).is_err() {
                            thread::yield_now();
                        }
                    }
                })
            })
            .collect();

        let mut items = Vec::new();
        while items.len() < producers * per_producer {
            match consumer.pop() {
                Some(item) => items.push(item),
                None => thread::yield_now(),
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        items.sort_unstable();
        items.dedup();
        assert_eq!(items.len(), producers * per_producer);
    }
}
