//! Driver-side allocator for the counters region.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::time::Duration;

use minstant::Instant;

use super::atomic::AtomicCounter;
use super::layout::{
    CounterState, CountersBuffer, HeapCounters, MAX_KEY_LENGTH, MAX_LABEL_LENGTH, store_bytes,
};
use super::reader::{CounterSnapshot, CountersReader};
use super::{CounterError, CounterId, CounterTypeId, RegistrationId};
use crate::control::types::ClientId;
use crate::trace::{debug, info, warn};

/// Result of a successful allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatedCounter {
    pub id: CounterId,
    pub registration_id: RegistrationId,
}

#[derive(Debug, Clone, Copy)]
struct FreeSlot {
    id: CounterId,
    reusable_at: Instant,
}

/// Sole writer of counter metadata.
///
/// Slots are handed out from a high-water mark first, then from a FIFO of
/// freed slots once each has waited out the reuse timeout. Registration ids
/// come from a per-store sequence starting at 1.
pub struct CounterStore {
    buffer: Arc<dyn CountersBuffer>,
    reader: CountersReader,
    next_registration_id: i64,
    high_water_mark: usize,
    free_list: VecDeque<FreeSlot>,
    reuse_timeout: Duration,
}

impl CounterStore {
    #[must_use]
    pub fn new(buffer: Arc<dyn CountersBuffer>, reuse_timeout: Duration) -> Self {
        let reader = CountersReader::new(buffer.clone());
        Self {
            buffer,
            reader,
            next_registration_id: 1,
            high_water_mark: 0,
            free_list: VecDeque::new(),
            reuse_timeout,
        }
    }

    /// Store over a private heap region; freed slots are reusable at once.
    #[must_use]
    pub fn with_heap(capacity: usize) -> Self {
        Self::new(Arc::new(HeapCounters::new(capacity)), Duration::ZERO)
    }

    #[must_use]
    pub fn reader(&self) -> &CountersReader {
        &self.reader
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Allocates a slot and publishes it as ALLOCATED.
    ///
    /// Labels longer than [`MAX_LABEL_LENGTH`] bytes are cut at the last
    /// character boundary that fits.
    ///
    /// # Errors
    ///
    /// [`CounterError::KeyTooLong`] if `key` does not fit the record,
    /// [`CounterError::ResourceExhausted`] if no slot is free.
    pub fn allocate(
        &mut self,
        type_id: CounterTypeId,
        key: &[u8],
        label: &str,
        owner: ClientId,
    ) -> Result<AllocatedCounter, CounterError> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(CounterError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LENGTH,
            });
        }

        let Some(id) = self.next_free_slot(Instant::now()) else {
            warn!(capacity = self.capacity(), %owner, "counters region exhausted");
            return Err(CounterError::ResourceExhausted {
                capacity: self.capacity(),
            });
        };

        let registration_id = RegistrationId::new(self.next_registration_id);
        self.next_registration_id += 1;

        let label = truncate_label(label);
        let record = &self.buffer.metadata()[id.index()];

        // Readers re-validate the registration id after copying, so it must
        // change before any other field does.
        record
            .registration_id
            .store(registration_id.as_i64(), Ordering::Release);
        fence(Ordering::Release);

        record.type_id.store(type_id.as_i32(), Ordering::Relaxed);
        record.owner_id.store(owner.to_raw(), Ordering::Relaxed);
        record.key_length.store(key.len() as u32, Ordering::Relaxed);
        store_bytes(&record.key, key);
        record.label_length.store(label.len() as u32, Ordering::Relaxed);
        store_bytes(&record.label, label.as_bytes());
        self.buffer.values()[id.index()]
            .value
            .store(0, Ordering::Relaxed);

        record
            .state
            .store(CounterState::Allocated as i32, Ordering::Release);

        info!(counter = %id, registration = %registration_id, %owner, %type_id, label, "counter allocated");
        Ok(AllocatedCounter {
            id,
            registration_id,
        })
    }

    fn next_free_slot(&mut self, now: Instant) -> Option<CounterId> {
        if let Some(front) = self.free_list.front()
            && front.reusable_at <= now
        {
            return self.free_list.pop_front().map(|slot| slot.id);
        }
        if self.high_water_mark < self.capacity() {
            let id = CounterId::new(self.high_water_mark as u32);
            self.high_water_mark += 1;
            return Some(id);
        }
        None
    }

    /// Frees a counter on behalf of `requester`.
    ///
    /// # Errors
    ///
    /// [`CounterError::UnknownCounter`] or [`CounterError::NotAllocated`]
    /// for slots without a live counter, [`CounterError::Unauthorized`] if
    /// `requester` does not own it. A failed call changes nothing.
    pub fn free(
        &mut self,
        id: CounterId,
        requester: ClientId,
    ) -> Result<RegistrationId, CounterError> {
        let record = self
            .buffer
            .metadata()
            .get(id.index())
            .ok_or(CounterError::UnknownCounter(id))?;
        if record.state() != CounterState::Allocated {
            return Err(CounterError::NotAllocated(id));
        }

        let owner = ClientId::from_raw(record.owner_id.load(Ordering::Relaxed));
        if owner != requester {
            warn!(counter = %id, %owner, %requester, "unauthorized counter free rejected");
            return Err(CounterError::Unauthorized {
                counter: id,
                requester,
                owner,
            });
        }

        let registration_id = self.release(id, Instant::now());
        info!(counter = %id, registration = %registration_id, %owner, "counter freed");
        Ok(registration_id)
    }

    /// Frees every counter owned by `owner`, returning how many were freed.
    pub fn reclaim_all_for(&mut self, owner: ClientId) -> usize {
        let now = Instant::now();
        let raw_owner = owner.to_raw();
        let mut reclaimed = 0;

        for index in 0..self.high_water_mark {
            let record = &self.buffer.metadata()[index];
            if record.state() == CounterState::Allocated
                && record.owner_id.load(Ordering::Relaxed) == raw_owner
            {
                let registration = self.release(CounterId::new(index as u32), now);
                debug!(counter = index, %registration, %owner, "counter reclaimed");
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            info!(%owner, reclaimed, "reclaimed counters of closed client");
        }
        reclaimed
    }

    fn release(&mut self, id: CounterId, now: Instant) -> RegistrationId {
        let record = &self.buffer.metadata()[id.index()];
        let registration_id = RegistrationId::new(record.registration_id.load(Ordering::Relaxed));

        record
            .state
            .store(CounterState::Reclaimed as i32, Ordering::Release);
        self.buffer.values()[id.index()]
            .value
            .store(0, Ordering::Release);

        self.free_list.push_back(FreeSlot {
            id,
            reusable_at: now + self.reuse_timeout,
        });
        registration_id
    }

    /// Visits every allocated counter.
    pub fn iterate(&self, visitor: impl FnMut(&CounterSnapshot)) {
        self.reader.for_each(visitor);
    }

    /// Value handle for a counter allocated by this store.
    #[must_use]
    pub fn counter(&self, allocated: AllocatedCounter) -> AtomicCounter {
        AtomicCounter::from_parts(
            self.buffer.clone(),
            allocated.id,
            allocated.registration_id,
        )
    }

    /// Owner of an allocated counter.
    ///
    /// # Errors
    ///
    /// Same as [`CountersReader::label`].
    pub fn owner(&self, id: CounterId) -> Result<ClientId, CounterError> {
        self.reader
            .snapshot(id)
            .map(|snapshot| snapshot.owner)
            .ok_or_else(|| match self.reader.state(id) {
                Err(err) => err,
                Ok(_) => CounterError::NotAllocated(id),
            })
    }

    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.reader.allocated_count()
    }
}

fn truncate_label(label: &str) -> &str {
    if label.len() <= MAX_LABEL_LENGTH {
        return label;
    }
    let mut end = MAX_LABEL_LENGTH;
    while !label.is_char_boundary(end) {
        end -= 1;
    }
    &label[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPE: CounterTypeId = CounterTypeId::new(1101);

    fn client(nonce: u32) -> ClientId {
        ClientId::new(4242, nonce)
    }

    #[test]
    fn test_allocate_publishes_metadata() {
        let mut store = CounterStore::with_heap(8);
        let owner = client(1);

        let allocated = store
            .allocate(TYPE, b"key", "counter label", owner)
            .expect("allocate");

        assert_eq!(allocated.registration_id, RegistrationId::new(1));
        let snapshot = store.reader().snapshot(allocated.id).expect("visible");
        assert_eq!(snapshot.type_id, TYPE);
        assert_eq!(snapshot.owner, owner);
        assert_eq!(snapshot.key, b"key");
        assert_eq!(snapshot.label, "counter label");
        assert_eq!(store.owner(allocated.id), Ok(owner));
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let mut store = CounterStore::with_heap(2);
        store.allocate(TYPE, b"", "a", client(1)).expect("first");
        store.allocate(TYPE, b"", "b", client(1)).expect("second");

        assert_eq!(
            store.allocate(TYPE, b"", "c", client(1)),
            Err(CounterError::ResourceExhausted { capacity: 2 })
        );
    }

    #[test]
    fn test_key_too_long_rejected() {
        let mut store = CounterStore::with_heap(2);
        let key = [0u8; MAX_KEY_LENGTH + 1];
        assert_eq!(
            store.allocate(TYPE, &key, "x", client(1)),
            Err(CounterError::KeyTooLong {
                len: MAX_KEY_LENGTH + 1,
                max: MAX_KEY_LENGTH
            })
        );
        assert_eq!(store.allocated_count(), 0);
    }

    #[test]
    fn test_long_label_truncated_on_char_boundary() {
        let mut store = CounterStore::with_heap(1);
        // 'é' is two bytes, so MAX_LABEL_LENGTH - 1 ASCII bytes leave no room.
        let label = format!("{}é", "a".repeat(MAX_LABEL_LENGTH - 1));
        let allocated = store.allocate(TYPE, b"", &label, client(1)).expect("allocate");

        let stored = store.reader().label(allocated.id).expect("label");
        assert_eq!(stored.len(), MAX_LABEL_LENGTH - 1);
        assert!(stored.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_free_by_non_owner_is_unauthorized() {
        let mut store = CounterStore::with_heap(4);
        let owner = client(1);
        let intruder = client(2);
        let allocated = store.allocate(TYPE, b"", "x", owner).expect("allocate");

        assert_eq!(
            store.free(allocated.id, intruder),
            Err(CounterError::Unauthorized {
                counter: allocated.id,
                requester: intruder,
                owner
            })
        );
        assert_eq!(
            store.reader().live_registration(allocated.id),
            Some(allocated.registration_id)
        );
    }

    #[test]
    fn test_free_resets_value_and_state() {
        let mut store = CounterStore::with_heap(4);
        let owner = client(1);
        let allocated = store.allocate(TYPE, b"", "x", owner).expect("allocate");
        store.counter(allocated).set(77);

        assert_eq!(store.free(allocated.id, owner), Ok(allocated.registration_id));
        assert_eq!(store.reader().state(allocated.id), Ok(CounterState::Reclaimed));
        assert_eq!(store.reader().value(allocated.id), Ok(0));
        assert_eq!(
            store.free(allocated.id, owner),
            Err(CounterError::NotAllocated(allocated.id))
        );
    }

    #[test]
    fn test_registration_ids_strictly_increase_across_reuse() {
        let mut store = CounterStore::with_heap(2);
        let owner = client(1);
        let mut last = RegistrationId::NULL;

        for _ in 0..50 {
            let allocated = store.allocate(TYPE, b"", "cycle", owner).expect("allocate");
            assert!(allocated.registration_id > last);
            last = allocated.registration_id;
            store.free(allocated.id, owner).expect("free");
        }
    }

    #[test]
    fn test_reuse_waits_for_timeout() {
        let buffer = Arc::new(HeapCounters::new(1));
        let mut store = CounterStore::new(buffer, Duration::from_secs(3600));
        let owner = client(1);

        let allocated = store.allocate(TYPE, b"", "x", owner).expect("allocate");
        store.free(allocated.id, owner).expect("free");

        assert_eq!(
            store.allocate(TYPE, b"", "y", owner),
            Err(CounterError::ResourceExhausted { capacity: 1 })
        );
    }

    #[test]
    fn test_reclaim_all_for_frees_only_owned() {
        let mut store = CounterStore::with_heap(8);
        let dead = client(1);
        let alive = client(2);
        let a = store.allocate(TYPE, b"", "a", dead).expect("a");
        let b = store.allocate(TYPE, b"", "b", alive).expect("b");
        let c = store.allocate(TYPE, b"", "c", dead).expect("c");

        assert_eq!(store.reclaim_all_for(dead), 2);
        assert_eq!(store.reader().live_registration(a.id), None);
        assert_eq!(store.reader().live_registration(c.id), None);
        assert_eq!(
            store.reader().live_registration(b.id),
            Some(b.registration_id)
        );
        assert_eq!(store.reclaim_all_for(dead), 0);
    }

    #[test]
    fn test_iterate_sees_allocated_counters() {
        let mut store = CounterStore::with_heap(4);
        store
            .allocate(TYPE, b"", "Resolver neighbors: name=A", ClientId::DRIVER)
            .expect("a");
        store.allocate(TYPE, b"", "other", client(1)).expect("b");

        let mut labels = Vec::new();
        store.iterate(|snapshot| labels.push(snapshot.label.clone()));
        assert_eq!(labels.len(), 2);
        assert!(labels.iter().any(|l| l.starts_with("Resolver neighbors")));
    }
}
