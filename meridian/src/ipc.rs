//! Cross-process plumbing between clients and the driver.
//!
//! - [`shmem`]: typed POSIX shared memory mappings
//! - [`command_ring`]: client → driver commands (many producers, one consumer)
//! - [`broadcast`]: driver → client events (one writer, many readers)

pub mod broadcast;
pub mod command_ring;
pub mod shmem;
