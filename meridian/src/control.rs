//! Driver and client halves of the counters protocol.
//!
//! The driver creates four shared memory objects per directory: the counters
//! region, a command ring clients write into, a broadcast buffer it answers
//! through, and a control header it publishes last. Clients find the driver
//! by opening the control header.

pub mod client;
pub mod cnc;
pub mod conductor;
pub mod liveness;
pub mod types;
