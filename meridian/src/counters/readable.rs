use std::sync::atomic::{AtomicBool, Ordering};

use super::reader::CountersReader;
use super::{CounterError, CounterId, RegistrationId};

/// Read-only view of one registration.
///
/// Closed is derived rather than stored: the handle reports closed once the
/// slot stops holding the registration captured at construction (freed, or
/// reused by a newer allocation), or after an explicit [`close`](Self::close).
pub struct ReadableCounter {
    reader: CountersReader,
    id: CounterId,
    registration_id: RegistrationId,
    closed: AtomicBool,
}

impl ReadableCounter {
    /// # Errors
    ///
    /// [`CounterError::UnknownCounter`] if `id` is outside the region,
    /// [`CounterError::AlreadyClosed`] if the slot no longer holds
    /// `registration_id`.
    pub fn new(
        reader: &CountersReader,
        registration_id: RegistrationId,
        id: CounterId,
    ) -> Result<Self, CounterError> {
        reader.state(id)?;
        if reader.live_registration(id) != Some(registration_id) {
            return Err(CounterError::AlreadyClosed {
                counter: id,
                registration: registration_id,
            });
        }
        Ok(Self {
            reader: reader.clone(),
            id,
            registration_id,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn id(&self) -> CounterId {
        self.id
    }

    #[must_use]
    pub fn registration_id(&self) -> RegistrationId {
        self.registration_id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self.reader.live_registration(self.id) != Some(self.registration_id)
    }

    /// Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Current value, or `None` once closed.
    ///
    /// The registration is checked again after the read, so a value written
    /// by a newer owner of the slot is never returned.
    #[must_use]
    pub fn get(&self) -> Option<i64> {
        if self.is_closed() {
            return None;
        }
        let value = self.reader.value(self.id).ok()?;
        (!self.is_closed()).then_some(value)
    }

    #[must_use]
    pub fn label(&self) -> Option<String> {
        self.reader
            .snapshot(self.id)
            .filter(|snapshot| snapshot.registration_id == self.registration_id)
            .map(|snapshot| snapshot.label)
    }
}
