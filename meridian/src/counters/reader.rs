//! Lock-free read access to a counters region.
//!
//! # Consistency
//!
//! The driver publishes an allocation in this order:
//!
//! ```text
//! registration_id.store(new, Release)   // orders the earlier RECLAIMED store
//! fence(Release)
//! type, owner, key, label (Relaxed)
//! state.store(ALLOCATED, Release)
//! ```
//!
//! A reader loads the registration id, then the state, copies the fields,
//! issues an acquire fence and re-loads the registration id. If any byte it
//! copied came from a newer allocation, the fence pairing guarantees the
//! re-load sees the newer id, and the copy is discarded.

use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};

use super::layout::{CounterState, CountersBuffer, MetadataRecord, load_bytes};
use super::{CounterError, CounterId, CounterTypeId, RegistrationId};
use crate::control::types::ClientId;

/// Attempts made to read a slot that keeps changing underneath the reader.
const READ_ATTEMPTS: usize = 4;

/// Consistent copy of one allocated slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub id: CounterId,
    pub registration_id: RegistrationId,
    pub type_id: CounterTypeId,
    pub owner: ClientId,
    pub key: Vec<u8>,
    pub label: String,
}

/// Read-only view of a counters region, cheap to clone.
#[derive(Clone)]
pub struct CountersReader {
    buffer: Arc<dyn CountersBuffer>,
}

impl CountersReader {
    #[must_use]
    pub fn new(buffer: Arc<dyn CountersBuffer>) -> Self {
        Self { buffer }
    }

    pub(crate) fn buffer(&self) -> &Arc<dyn CountersBuffer> {
        &self.buffer
    }

    /// Number of slots in the region.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    fn record(&self, id: CounterId) -> Result<&MetadataRecord, CounterError> {
        self.buffer
            .metadata()
            .get(id.index())
            .filter(|_| id.index() < self.capacity())
            .ok_or(CounterError::UnknownCounter(id))
    }

    /// Current state of a slot.
    ///
    /// # Errors
    ///
    /// [`CounterError::UnknownCounter`] if `id` is outside the region.
    pub fn state(&self, id: CounterId) -> Result<CounterState, CounterError> {
        Ok(self.record(id)?.state())
    }

    /// Registration held by the slot if it is currently allocated.
    ///
    /// Returns `None` for unused or reclaimed slots, and for slots being
    /// reused at this very moment.
    #[must_use]
    pub fn live_registration(&self, id: CounterId) -> Option<RegistrationId> {
        let record = self.record(id).ok()?;
        for _ in 0..READ_ATTEMPTS {
            let registration = record.registration_id.load(Ordering::Acquire);
            if record.state() != CounterState::Allocated {
                return None;
            }
            if record.registration_id.load(Ordering::Acquire) == registration {
                return Some(RegistrationId::new(registration));
            }
        }
        None
    }

    /// Registration id last written to the slot, whatever its state.
    ///
    /// # Errors
    ///
    /// [`CounterError::UnknownCounter`] if `id` is outside the region.
    pub fn registration_id(&self, id: CounterId) -> Result<RegistrationId, CounterError> {
        let raw = self.record(id)?.registration_id.load(Ordering::Acquire);
        Ok(RegistrationId::new(raw))
    }

    /// Current value of a slot.
    ///
    /// Values are single 64-bit atomics, so they may be stale but never torn.
    ///
    /// # Errors
    ///
    /// [`CounterError::UnknownCounter`] if `id` is outside the region.
    pub fn value(&self, id: CounterId) -> Result<i64, CounterError> {
        self.record(id)?;
        Ok(self.buffer.values()[id.index()].value.load(Ordering::Acquire))
    }

    /// Consistent copy of an allocated slot's metadata.
    ///
    /// Returns `None` if the slot is outside the region or not allocated.
    #[must_use]
    pub fn snapshot(&self, id: CounterId) -> Option<CounterSnapshot> {
        let record = self.record(id).ok()?;
        let mut key = Vec::new();
        let mut label = Vec::new();

        for _ in 0..READ_ATTEMPTS {
            let registration = record.registration_id.load(Ordering::Acquire);
            if record.state() != CounterState::Allocated {
                return None;
            }

            let type_id = record.type_id.load(Ordering::Relaxed);
            let owner = record.owner_id.load(Ordering::Relaxed);
            let key_length = record.key_length.load(Ordering::Relaxed) as usize;
            let label_length = record.label_length.load(Ordering::Relaxed) as usize;
            load_bytes(&record.key, key_length, &mut key);
            load_bytes(&record.label, label_length, &mut label);

            fence(Ordering::Acquire);
            if record.registration_id.load(Ordering::Relaxed) != registration {
                continue;
            }

            return Some(CounterSnapshot {
                id,
                registration_id: RegistrationId::new(registration),
                type_id: CounterTypeId::new(type_id),
                owner: ClientId::from_raw(owner),
                key,
                label: String::from_utf8_lossy(&label).into_owned(),
            });
        }
        None
    }

    /// Label of an allocated counter.
    ///
    /// # Errors
    ///
    /// [`CounterError::UnknownCounter`] for ids outside the region,
    /// [`CounterError::NotAllocated`] for slots without a live counter.
    pub fn label(&self, id: CounterId) -> Result<String, CounterError> {
        self.record(id)?;
        self.snapshot(id)
            .map(|snapshot| snapshot.label)
            .ok_or(CounterError::NotAllocated(id))
    }

    /// Visits every allocated counter in slot order.
    pub fn for_each(&self, mut visitor: impl FnMut(&CounterSnapshot)) {
        for index in 0..self.capacity() {
            if let Some(snapshot) = self.snapshot(CounterId::new(index as u32)) {
                visitor(&snapshot);
            }
        }
    }

    /// First allocated counter whose label starts with `prefix`.
    ///
    /// Well-known counters (for example "Resolver neighbors") are located
    /// this way by external tooling.
    #[must_use]
    pub fn find_by_label_prefix(&self, prefix: &str) -> Option<CounterId> {
        (0..self.capacity())
            .map(|index| CounterId::new(index as u32))
            .find(|&id| {
                self.snapshot(id)
                    .is_some_and(|snapshot| snapshot.label.starts_with(prefix))
            })
    }

    /// Number of allocated slots right now.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.buffer
            .metadata()
            .iter()
            .filter(|record| record.state() == CounterState::Allocated)
            .count()
    }
}
