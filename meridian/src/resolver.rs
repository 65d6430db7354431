//! Gossip-based name resolution between driver nodes.
//!
//! Each node keeps a [`NeighborTable`] of every other node it has heard of,
//! pushes it to its neighbors on every tick, and answers name lookups from
//! it. Knowledge spreads transitively: a node bootstrapped against one peer
//! eventually learns every node that peer can reach.

pub mod gossip;
pub mod name_resolver;
pub mod protocol;
pub mod table;

use std::io;

use thiserror::Error;

use crate::counters::CounterError;
use crate::net::EndpointError;

pub use gossip::{GossipConfig, GossipEngine, GossipStats, GossipTransport};
pub use name_resolver::{
    CACHE_ENTRIES_COUNTER_TYPE_ID, CACHE_ENTRIES_LABEL, NEIGHBORS_COUNTER_TYPE_ID,
    NEIGHBORS_LABEL, NameResolver, ResolvedNames, ResolverConfig,
};
pub use protocol::{GossipEntry, ProtocolError};
pub use table::{MergeOutcome, NeighborEntry, NeighborTable, ResolverName};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("no neighbor named {0:?}")]
    NotFound(String),
    #[error("no name resolver is configured")]
    NotConfigured,
    #[error("invalid resolver name {0:?}")]
    InvalidName(String),
    #[error("invalid bootstrap neighbor: {0}")]
    Bootstrap(#[from] EndpointError),
    #[error("resolver counters: {0}")]
    Counters(#[from] CounterError),
    #[error("resolver socket: {0}")]
    Io(#[from] io::Error),
}
