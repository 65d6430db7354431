use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use super::layout::{CounterState, CountersBuffer};
use super::{CounterError, CounterId, RegistrationId};

/// Writable value of one counter.
///
/// Only the owner of a counter should write through this handle; any number
/// of processes may read the same value through a [`CountersReader`].
///
/// [`CountersReader`]: super::CountersReader
#[derive(Clone)]
pub struct AtomicCounter {
    buffer: Arc<dyn CountersBuffer>,
    id: CounterId,
    registration_id: RegistrationId,
}

impl AtomicCounter {
    /// Handle for slot `id` of `buffer`.
    ///
    /// # Errors
    ///
    /// [`CounterError::UnknownCounter`] if `id` is outside the region.
    pub fn new(
        buffer: Arc<dyn CountersBuffer>,
        id: CounterId,
        registration_id: RegistrationId,
    ) -> Result<Self, CounterError> {
        if id.index() >= buffer.capacity() {
            return Err(CounterError::UnknownCounter(id));
        }
        Ok(Self::from_parts(buffer, id, registration_id))
    }

    pub(crate) fn from_parts(
        buffer: Arc<dyn CountersBuffer>,
        id: CounterId,
        registration_id: RegistrationId,
    ) -> Self {
        Self {
            buffer,
            id,
            registration_id,
        }
    }

    #[must_use]
    pub fn id(&self) -> CounterId {
        self.id
    }

    #[must_use]
    pub fn registration_id(&self) -> RegistrationId {
        self.registration_id
    }

    fn cell(&self) -> &AtomicI64 {
        &self.buffer.values()[self.id.index()].value
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> i64 {
        self.cell().load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.cell().store(value, Ordering::Release);
    }

    /// Adds one, returning the previous value.
    #[inline]
    pub fn increment(&self) -> i64 {
        self.cell().fetch_add(1, Ordering::AcqRel)
    }

    /// Adds `delta`, returning the previous value.
    #[inline]
    pub fn add(&self, delta: i64) -> i64 {
        self.cell().fetch_add(delta, Ordering::AcqRel)
    }

    /// True while the slot still holds this handle's registration.
    #[must_use]
    pub fn is_live(&self) -> bool {
        let record = &self.buffer.metadata()[self.id.index()];
        record.state() == CounterState::Allocated
            && record.registration_id.load(Ordering::Acquire) == self.registration_id.as_i64()
    }
}

impl std::fmt::Debug for AtomicCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtomicCounter")
            .field("id", &self.id)
            .field("registration_id", &self.registration_id)
            .field("value", &self.get())
            .finish()
    }
}
