//! Types exchanged between clients and the driver.

use std::fmt;

use thiserror::Error;

use crate::SharedMemorySafe;
use crate::counters::{
    CounterError, CounterId, CounterTypeId, MAX_KEY_LENGTH, MAX_LABEL_LENGTH, RegistrationId,
};
use crate::ipc::shmem::{ShmError, ShmPath};

/// Unique identifier for a client connection.
///
/// Combines the process ID with a random nonce to ensure uniqueness even if
/// a process reconnects or PIDs are reused.
#[derive(SharedMemorySafe, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct ClientId {
    pid: u32,
    nonce: u32,
}

impl ClientId {
    /// Owner of counters the driver allocates for itself.
    pub const DRIVER: Self = Self { pid: 0, nonce: 0 };

    #[must_use]
    pub const fn new(pid: u32, nonce: u32) -> Self {
        Self { pid, nonce }
    }

    /// Generates a new unique client ID for the current process.
    #[must_use]
    pub fn generate() -> Self {
        Self {
            pid: std::process::id(),
            nonce: rand::random(),
        }
    }

    /// Packs the id into the 64-bit owner field of a counter record.
    #[must_use]
    pub const fn to_raw(self) -> i64 {
        ((self.pid as u64) << 32 | self.nonce as u64) as i64
    }

    #[must_use]
    pub const fn from_raw(raw: i64) -> Self {
        let raw = raw as u64;
        Self {
            pid: (raw >> 32) as u32,
            nonce: raw as u32,
        }
    }

    #[must_use]
    pub const fn pid(self) -> u32 {
        self.pid
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:08x}", self.pid, self.nonce)
    }
}

/// Ties a driver response to the command that caused it.
#[derive(SharedMemorySafe, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CorrelationId(i64);

impl CorrelationId {
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inline description of a counter to allocate.
#[derive(SharedMemorySafe, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CounterSpec {
    pub type_id: CounterTypeId,
    key_length: u32,
    label_length: u32,
    key: [u8; MAX_KEY_LENGTH],
    label: [u8; MAX_LABEL_LENGTH],
}

impl CounterSpec {
    /// Copies `key` and `label` into a fixed-size command record.
    ///
    /// Labels that do not fit are cut at a character boundary; keys never are.
    ///
    /// # Errors
    ///
    /// [`CounterError::KeyTooLong`] for keys over [`MAX_KEY_LENGTH`] bytes.
    pub fn new(type_id: CounterTypeId, key: &[u8], label: &str) -> Result<Self, CounterError> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(CounterError::KeyTooLong {
                len: key.len(),
                max: MAX_KEY_LENGTH,
            });
        }
        let mut end = label.len().min(MAX_LABEL_LENGTH);
        while !label.is_char_boundary(end) {
            end -= 1;
        }

        let mut spec = Self {
            type_id,
            key_length: key.len() as u32,
            label_length: end as u32,
            key: [0; MAX_KEY_LENGTH],
            label: [0; MAX_LABEL_LENGTH],
        };
        spec.key[..key.len()].copy_from_slice(key);
        spec.label[..end].copy_from_slice(&label.as_bytes()[..end]);
        Ok(spec)
    }

    #[must_use]
    pub fn key(&self) -> &[u8] {
        &self.key[..(self.key_length as usize).min(MAX_KEY_LENGTH)]
    }

    /// Label text; invalid UTF-8 written by a misbehaving client is replaced.
    #[must_use]
    pub fn label(&self) -> std::borrow::Cow<'_, str> {
        let len = (self.label_length as usize).min(MAX_LABEL_LENGTH);
        String::from_utf8_lossy(&self.label[..len])
    }
}

/// Commands sent from client to driver through the command ring.
#[derive(SharedMemorySafe, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub enum ClientCommand {
    /// Keep-alive signal to prevent timeout.
    Keepalive { client: ClientId },
    AddCounter {
        client: ClientId,
        correlation: CorrelationId,
        spec: CounterSpec,
    },
    RemoveCounter {
        client: ClientId,
        correlation: CorrelationId,
        counter: CounterId,
    },
    /// Graceful disconnect; the driver reclaims every counter the client owns.
    CloseClient { client: ClientId },
}

impl ClientCommand {
    #[must_use]
    pub const fn client(&self) -> ClientId {
        match self {
            Self::Keepalive { client }
            | Self::AddCounter { client, .. }
            | Self::RemoveCounter { client, .. }
            | Self::CloseClient { client } => *client,
        }
    }
}

/// Error codes carried from driver to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    Generic = 0,
    ResourceExhausted = 1,
    Unauthorized = 2,
    UnknownCounter = 3,
    NotAllocated = 4,
    KeyTooLong = 5,
    ClientTimedOut = 6,
}

impl ErrorCode {
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        match raw {
            1 => Self::ResourceExhausted,
            2 => Self::Unauthorized,
            3 => Self::UnknownCounter,
            4 => Self::NotAllocated,
            5 => Self::KeyTooLong,
            6 => Self::ClientTimedOut,
            _ => Self::Generic,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Generic => "driver error",
            Self::ResourceExhausted => "counters region exhausted",
            Self::Unauthorized => "counter is owned by another client",
            Self::UnknownCounter => "unknown counter id",
            Self::NotAllocated => "counter is not allocated",
            Self::KeyTooLong => "counter key too long",
            Self::ClientTimedOut => "client was declared dead by the driver",
        };
        f.write_str(text)
    }
}

impl From<&CounterError> for ErrorCode {
    fn from(err: &CounterError) -> Self {
        match err {
            CounterError::ResourceExhausted { .. } => Self::ResourceExhausted,
            CounterError::Unauthorized { .. } => Self::Unauthorized,
            CounterError::UnknownCounter(_) => Self::UnknownCounter,
            CounterError::NotAllocated(_) | CounterError::AlreadyClosed { .. } => {
                Self::NotAllocated
            }
            CounterError::KeyTooLong { .. } => Self::KeyTooLong,
        }
    }
}

/// Number of 64-bit words in one encoded [`DriverEvent`].
pub const EVENT_WORDS: usize = 6;

const EVENT_COUNTER_READY: u64 = 1;
const EVENT_OPERATION_SUCCEEDED: u64 = 2;
const EVENT_ERROR: u64 = 3;
const EVENT_CLIENT_TIMEOUT: u64 = 4;

/// Events broadcast from driver to every client.
///
/// Each client keeps only the events addressed to its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverEvent {
    CounterReady {
        client: ClientId,
        correlation: CorrelationId,
        counter: CounterId,
        registration_id: RegistrationId,
    },
    OperationSucceeded {
        client: ClientId,
        correlation: CorrelationId,
    },
    Error {
        client: ClientId,
        correlation: CorrelationId,
        code: ErrorCode,
    },
    /// The driver declared the client dead and reclaimed its counters.
    ClientTimeout { client: ClientId },
}

impl DriverEvent {
    #[must_use]
    pub const fn client(&self) -> ClientId {
        match self {
            Self::CounterReady { client, .. }
            | Self::OperationSucceeded { client, .. }
            | Self::Error { client, .. }
            | Self::ClientTimeout { client } => *client,
        }
    }

    #[must_use]
    pub fn encode(&self) -> [u64; EVENT_WORDS] {
        let mut words = [0u64; EVENT_WORDS];
        words[1] = self.client().to_raw() as u64;
        match *self {
            Self::CounterReady {
                correlation,
                counter,
                registration_id,
                ..
            } => {
                words[0] = EVENT_COUNTER_READY;
                words[2] = correlation.as_i64() as u64;
                words[3] = u64::from(counter.as_u32());
                words[4] = registration_id.as_i64() as u64;
            }
            Self::OperationSucceeded { correlation, .. } => {
                words[0] = EVENT_OPERATION_SUCCEEDED;
                words[2] = correlation.as_i64() as u64;
            }
            Self::Error {
                correlation, code, ..
            } => {
                words[0] = EVENT_ERROR;
                words[2] = correlation.as_i64() as u64;
                words[5] = code as i32 as u32 as u64;
            }
            Self::ClientTimeout { .. } => words[0] = EVENT_CLIENT_TIMEOUT,
        }
        words
    }

    /// Returns `None` for an unknown event kind.
    #[must_use]
    pub fn decode(words: &[u64; EVENT_WORDS]) -> Option<Self> {
        let client = ClientId::from_raw(words[1] as i64);
        let correlation = CorrelationId::new(words[2] as i64);
        match words[0] {
            EVENT_COUNTER_READY => Some(Self::CounterReady {
                client,
                correlation,
                counter: CounterId::new(words[3] as u32),
                registration_id: RegistrationId::new(words[4] as i64),
            }),
            EVENT_OPERATION_SUCCEEDED => Some(Self::OperationSucceeded {
                client,
                correlation,
            }),
            EVENT_ERROR => Some(Self::Error {
                client,
                correlation,
                code: ErrorCode::from_raw(words[5] as u32 as i32),
            }),
            EVENT_CLIENT_TIMEOUT => Some(Self::ClientTimeout { client }),
            _ => None,
        }
    }
}

/// Shared memory names used by one driver instance.
///
/// A `directory` groups the objects so several drivers can coexist on one
/// host, as long as each uses its own directory name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverPaths {
    pub cnc: ShmPath,
    pub counters_metadata: ShmPath,
    pub counters_values: ShmPath,
    pub to_driver: ShmPath,
    pub to_clients: ShmPath,
}

impl DriverPaths {
    /// # Errors
    ///
    /// [`ShmError::InvalidPath`] if `directory` contains `/` or is too long.
    pub fn new(directory: &str) -> Result<Self, ShmError> {
        let path = |suffix: &str| ShmPath::new(format!("/meridian-{directory}-{suffix}"));
        Ok(Self {
            cnc: path("cnc")?,
            counters_metadata: path("counters-meta")?,
            counters_values: path("counters-values")?,
            to_driver: path("to-driver")?,
            to_clients: path("to-clients")?,
        })
    }

    /// Every object name, in creation order.
    #[must_use]
    pub fn all(&self) -> [&ShmPath; 5] {
        [
            &self.counters_metadata,
            &self.counters_values,
            &self.to_driver,
            &self.to_clients,
            &self.cnc,
        ]
    }
}

/// Rejection of a command, as seen by the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("driver rejected command {correlation}: {code}")]
pub struct Rejection {
    pub correlation: CorrelationId,
    pub code: ErrorCode,
}
