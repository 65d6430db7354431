//! Shared-memory counters and gossip name resolution for a transport driver.
//!
//! A driver process owns a region of 64-bit counters that any process on the
//! host can read without locks ([`counters`]); clients ask the driver for
//! counters over shared memory rings ([`control`]). Drivers on different
//! hosts discover each other by name through a gossip protocol over UDP
//! ([`resolver`]).

// Lets the derive macro emit `::meridian::...` paths inside this crate too.
extern crate self as meridian;

pub mod control;
pub mod counters;
pub mod ipc;
pub mod net;
pub mod resolver;
pub mod runtime;
pub mod trace;

#[doc(inline)]
pub use meridian_derive::SharedMemorySafe;

#[doc(inline)]
pub use ipc::shmem::SharedMemorySafe;

pub use trace::init_tracing;
