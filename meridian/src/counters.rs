//! Shared-memory counters.
//!
//! The driver owns a fixed-capacity region of counter slots. It is the only
//! writer of slot metadata; each counter's value is written only by its
//! owning client. Every process that maps the region reads it without locks.
//!
//! ```text
//!  metadata region (512 B per slot)        value region (64 B per slot)
//! ┌───────┬──────┬─────┬───────┬────────┐  ┌──────────────┐
//! │ state │ type │ reg │ owner │ key... │  │ value (i64)  │  slot 0
//! ├───────┼──────┼─────┼───────┼────────┤  ├──────────────┤
//! │  ...  │      │     │       │        │  │     ...      │  slot 1
//! ```
//!
//! - [`CounterStore`]: driver-side allocator (allocate, free, reclaim by owner)
//! - [`CountersReader`]: read-only view used by every process
//! - [`AtomicCounter`]: value handle for the owner of a counter
//! - [`CounterObserver`]: per-process poller that reports counters appearing
//!   and disappearing
//! - [`ReadableCounter`]: view of one registration that notices when it is
//!   freed or its slot is reused

mod atomic;
mod layout;
pub(crate) mod observer;
mod readable;
mod reader;
mod store;

pub use atomic::AtomicCounter;
pub use layout::{
    CounterState, CountersBuffer, HeapCounters, MAX_KEY_LENGTH, MAX_LABEL_LENGTH,
    METADATA_RECORD_LENGTH, MetadataRecord, ShmCounters, VALUE_RECORD_LENGTH, ValueRecord,
};
pub use observer::{CounterListener, CounterObserver, HandlerId};
pub use readable::ReadableCounter;
pub use reader::{CounterSnapshot, CountersReader};
pub use store::{AllocatedCounter, CounterStore};

use std::fmt;

use thiserror::Error;

use crate::SharedMemorySafe;
use crate::control::types::ClientId;

/// Slot index of a counter; stable for the lifetime of one allocation.
#[derive(SharedMemorySafe, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CounterId(u32);

impl CounterId {
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CounterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one allocation.
///
/// Strictly increasing per [`CounterStore`] and never reused, so it tells
/// successive uses of the same slot apart.
#[derive(SharedMemorySafe, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RegistrationId(i64);

impl RegistrationId {
    /// Value held by slots that were never allocated.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Caller-defined classification of a counter.
#[derive(SharedMemorySafe, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CounterTypeId(i32);

impl CounterTypeId {
    #[must_use]
    pub const fn new(id: i32) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }
}

impl fmt::Display for CounterTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors from counter allocation, release and handle construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CounterError {
    /// Every slot is allocated or still waiting out its reuse delay.
    #[error("counters region exhausted: no free slot among {capacity}")]
    ResourceExhausted { capacity: usize },
    /// Only the owning client may free a counter.
    #[error("client {requester} may not free counter {counter} owned by {owner}")]
    Unauthorized {
        counter: CounterId,
        requester: ClientId,
        owner: ClientId,
    },
    /// The slot no longer holds the expected registration.
    #[error("counter {counter} (registration {registration}) is already closed")]
    AlreadyClosed {
        counter: CounterId,
        registration: RegistrationId,
    },
    /// The id is outside the region.
    #[error("counter id {0} is outside the counters region")]
    UnknownCounter(CounterId),
    /// The slot exists but holds no live counter.
    #[error("counter {0} is not allocated")]
    NotAllocated(CounterId),
    /// Keys are fixed-capacity and never truncated.
    #[error("counter key of {len} bytes exceeds the {max} byte limit")]
    KeyTooLong { len: usize, max: usize },
}
