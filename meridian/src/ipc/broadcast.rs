//! Single-writer, many-reader broadcast buffer over POSIX shared memory.
//!
//! The driver transmits fixed-size records; every client reads all of them
//! at its own pace. The transmitter never waits for receivers: a receiver
//! that falls more than one lap behind loses records and skips forward to
//! the newest position, counting the event.
//!
//! Each slot is a small seqlock. For record position `p` the transmitter
//! writes sequence `2p + 1`, the words, then `2p + 2`; a receiver accepts
//! the words only if it sees `2p + 2` both before and after copying them.

use std::sync::atomic::{AtomicU64, Ordering, fence};

use super::shmem::{Creator, Opener, Shm, ShmError, ShmPath};
use crate::SharedMemorySafe;
use crate::control::types::EVENT_WORDS;
use crate::trace::warn;

/// Capacity of the driver's event broadcast buffer.
pub const TO_CLIENTS_CAPACITY: usize = 1024;

#[derive(SharedMemorySafe)]
#[repr(C, align(64))]
struct Slot {
    sequence: AtomicU64,
    words: [AtomicU64; EVENT_WORDS],
}

#[derive(SharedMemorySafe)]
#[repr(C)]
struct BroadcastLayout<const N: usize> {
    tail: AtomicU64,
    _pad: [u64; 7],
    slots: [Slot; N],
}

/// Writing end, owned by the driver.
pub struct BroadcastTransmitter<const N: usize> {
    shm: Shm<BroadcastLayout<N>, Creator>,
}

impl<const N: usize> BroadcastTransmitter<N> {
    /// # Errors
    ///
    /// `EEXIST` (path exists), `EACCES` (permissions), `ENOMEM` (resources).
    pub fn create(path: &ShmPath) -> Result<Self, ShmError> {
        // SAFETY: the layout is atomics and padding only; all-zero is an
        // empty buffer.
        let shm = unsafe { Shm::<BroadcastLayout<N>, Creator>::create_zeroed(path)? };
        Ok(Self { shm })
    }

    pub fn transmit(&self, record: &[u64; EVENT_WORDS]) {
        let layout = &*self.shm;
        let position = layout.tail.load(Ordering::Relaxed);
        let slot = &layout.slots[(position % N as u64) as usize];

        slot.sequence.store(2 * position + 1, Ordering::Relaxed);
        fence(Ordering::Release);
        for (word, value) in slot.words.iter().zip(record) {
            word.store(*value, Ordering::Relaxed);
        }
        slot.sequence.store(2 * position + 2, Ordering::Release);
        layout.tail.store(position + 1, Ordering::Release);
    }

    /// Records transmitted since creation.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.shm.tail.load(Ordering::Acquire)
    }
}

/// Reading end, one per client.
pub struct BroadcastReceiver<const N: usize> {
    shm: Shm<BroadcastLayout<N>, Opener>,
    cursor: u64,
    lapped: u64,
}

impl<const N: usize> BroadcastReceiver<N> {
    /// Opens the buffer positioned at the newest record, so only records
    /// transmitted from now on are received.
    ///
    /// # Errors
    ///
    /// `ENOENT` (doesn't exist), `EACCES` (permissions), size mismatch.
    pub fn open(path: &ShmPath) -> Result<Self, ShmError> {
        let shm = Shm::<BroadcastLayout<N>, Opener>::open(path)?;
        let cursor = shm.tail.load(Ordering::Acquire);
        Ok(Self {
            shm,
            cursor,
            lapped: 0,
        })
    }

    /// Next record, or `None` if caught up (or just lapped).
    pub fn receive(&mut self) -> Option<[u64; EVENT_WORDS]> {
        let layout = &*self.shm;
        let tail = layout.tail.load(Ordering::Acquire);
        if self.cursor == tail {
            return None;
        }
        if tail.wrapping_sub(self.cursor) > N as u64 {
            self.skip_to(tail);
            return None;
        }

        let slot = &layout.slots[(self.cursor % N as u64) as usize];
        let expected = 2 * self.cursor + 2;
        if slot.sequence.load(Ordering::Acquire) != expected {
            self.skip_to(tail);
            return None;
        }

        let mut record = [0u64; EVENT_WORDS];
        for (value, word) in record.iter_mut().zip(&slot.words) {
            *value = word.load(Ordering::Relaxed);
        }
        fence(Ordering::Acquire);
        if slot.sequence.load(Ordering::Relaxed) != expected {
            self.skip_to(tail);
            return None;
        }

        self.cursor += 1;
        Some(record)
    }

    fn skip_to(&mut self, tail: u64) {
        warn!(
            missed = tail.wrapping_sub(self.cursor),
            "broadcast receiver lapped by transmitter"
        );
        self.lapped += 1;
        self.cursor = tail;
    }

    /// Times this receiver fell a full lap behind and skipped records.
    #[must_use]
    pub fn lapped_count(&self) -> u64 {
        self.lapped
    }
}
