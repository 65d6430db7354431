//! Record layout of the counters region and the memory that backs it.
//!
//! Metadata and values live in two separate arrays indexed by the same slot
//! id. Key and label bytes are packed into atomic words so that a reader
//! racing a slot reuse sees stale bytes, never a data race; the
//! registration-id check in the reader discards such a read.

use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::SharedMemorySafe;
use crate::ipc::shmem::{Creator, Opener, Shm, ShmError, ShmMode, ShmPath};

pub const METADATA_RECORD_LENGTH: usize = 512;
pub const VALUE_RECORD_LENGTH: usize = 64;
pub const MAX_KEY_LENGTH: usize = 112;
pub const MAX_LABEL_LENGTH: usize = 352;

const KEY_WORDS: usize = MAX_KEY_LENGTH / 8;
const LABEL_WORDS: usize = MAX_LABEL_LENGTH / 8;

/// Lifecycle state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum CounterState {
    /// Never allocated since the region was created.
    Unused = 0,
    Allocated = 1,
    /// Freed; the slot waits out its reuse delay before it is handed out again.
    Reclaimed = -1,
}

impl CounterState {
    pub(crate) const fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::Allocated,
            -1 => Self::Reclaimed,
            _ => Self::Unused,
        }
    }
}

/// Metadata of one slot. Written only by the driver.
#[derive(SharedMemorySafe)]
#[repr(C, align(64))]
pub struct MetadataRecord {
    pub(crate) state: AtomicI32,
    pub(crate) type_id: AtomicI32,
    pub(crate) registration_id: AtomicI64,
    pub(crate) owner_id: AtomicI64,
    pub(crate) key_length: AtomicU32,
    pub(crate) label_length: AtomicU32,
    pub(crate) key: [AtomicU64; KEY_WORDS],
    pub(crate) label: [AtomicU64; LABEL_WORDS],
}

const _: () = assert!(size_of::<MetadataRecord>() == METADATA_RECORD_LENGTH);

impl Default for MetadataRecord {
    fn default() -> Self {
        Self {
            state: AtomicI32::new(CounterState::Unused as i32),
            type_id: AtomicI32::new(0),
            registration_id: AtomicI64::new(0),
            owner_id: AtomicI64::new(0),
            key_length: AtomicU32::new(0),
            label_length: AtomicU32::new(0),
            key: std::array::from_fn(|_| AtomicU64::new(0)),
            label: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl MetadataRecord {
    pub(crate) fn state(&self) -> CounterState {
        CounterState::from_raw(self.state.load(Ordering::Acquire))
    }
}

/// Value of one slot, alone on its cache line.
#[derive(SharedMemorySafe, Default)]
#[repr(C, align(64))]
pub struct ValueRecord {
    pub(crate) value: AtomicI64,
}

const _: () = assert!(size_of::<ValueRecord>() == VALUE_RECORD_LENGTH);

/// Packs `bytes` little-endian into `words`, zeroing the unused tail.
pub(crate) fn store_bytes(words: &[AtomicU64], bytes: &[u8]) {
    let used = bytes.len().div_ceil(8);
    for (word, chunk) in words.iter().zip(bytes.chunks(8)) {
        let mut buf = [0u8; 8];
        buf[..chunk.len()].copy_from_slice(chunk);
        word.store(u64::from_le_bytes(buf), Ordering::Relaxed);
    }
    for word in words.iter().skip(used) {
        word.store(0, Ordering::Relaxed);
    }
}

/// Unpacks the first `len` bytes of `words` into `out`.
pub(crate) fn load_bytes(words: &[AtomicU64], len: usize, out: &mut Vec<u8>) {
    let len = len.min(words.len() * 8);
    out.clear();
    for word in words.iter().take(len.div_ceil(8)) {
        out.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
    }
    out.truncate(len);
}

/// Storage for the two arrays of a counters region.
///
/// Implemented by [`ShmCounters`] for real cross-process use and by
/// [`HeapCounters`] for stores that only live inside one process.
pub trait CountersBuffer: Send + Sync {
    fn metadata(&self) -> &[MetadataRecord];

    fn values(&self) -> &[ValueRecord];

    /// Number of slots.
    fn capacity(&self) -> usize {
        self.metadata().len().min(self.values().len())
    }
}

/// Counters region on the heap.
pub struct HeapCounters {
    metadata: Box<[MetadataRecord]>,
    values: Box<[ValueRecord]>,
}

impl HeapCounters {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            metadata: (0..capacity).map(|_| MetadataRecord::default()).collect(),
            values: (0..capacity).map(|_| ValueRecord::default()).collect(),
        }
    }
}

impl CountersBuffer for HeapCounters {
    fn metadata(&self) -> &[MetadataRecord] {
        &self.metadata
    }

    fn values(&self) -> &[ValueRecord] {
        &self.values
    }
}

/// Counters region in two POSIX shared memory objects.
pub struct ShmCounters<Mode: ShmMode> {
    metadata: Shm<[MetadataRecord], Mode>,
    values: Shm<[ValueRecord], Mode>,
}

impl ShmCounters<Creator> {
    /// Creates both arrays with `capacity` unused slots.
    ///
    /// # Errors
    ///
    /// Fails if either object exists already or cannot be mapped.
    pub fn create(
        metadata_path: &ShmPath,
        values_path: &ShmPath,
        capacity: usize,
    ) -> Result<Self, ShmError> {
        let metadata = Shm::<[MetadataRecord], Creator>::create_slice(metadata_path, capacity)?;
        let values = Shm::<[ValueRecord], Creator>::create_slice(values_path, capacity)?;
        Ok(Self { metadata, values })
    }
}

impl ShmCounters<Opener> {
    /// Maps a region created by a driver.
    ///
    /// # Errors
    ///
    /// Fails if either object is missing, or if the two arrays disagree on
    /// the number of slots.
    pub fn open(metadata_path: &ShmPath, values_path: &ShmPath) -> Result<Self, ShmError> {
        let metadata = Shm::<[MetadataRecord], Opener>::open_slice(metadata_path)?;
        let values = Shm::<[ValueRecord], Opener>::open_slice(values_path)?;
        if metadata.len() != values.len() {
            return Err(ShmError::SizeMismatch {
                path: values_path.to_string(),
                expected: metadata.len() * VALUE_RECORD_LENGTH,
                actual: values.byte_len() as u64,
            });
        }
        Ok(Self { metadata, values })
    }
}

impl<Mode: ShmMode> CountersBuffer for ShmCounters<Mode> {
    fn metadata(&self) -> &[MetadataRecord] {
        &self.metadata
    }

    fn values(&self) -> &[ValueRecord] {
        &self.values
    }
}
