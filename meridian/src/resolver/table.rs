//! Per-node table of known neighbors.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use super::ResolverError;
use super::protocol::{GossipEntry, MAX_NAME_LENGTH};
use crate::net::Endpoint;
use crate::trace::{debug, info};

/// Symbolic identity of a driver node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResolverName(String);

impl ResolverName {
    /// # Errors
    ///
    /// [`ResolverError::InvalidName`] for empty names, names over 255 bytes,
    /// or names containing control characters.
    pub fn new(name: impl Into<String>) -> Result<Self, ResolverError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAME_LENGTH || name.chars().any(char::is_control)
        {
            return Err(ResolverError::InvalidName(name));
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolverName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node known to this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub name: String,
    pub address: Endpoint,
    /// Origin timestamp, compared to decide which of two entries is newer.
    pub timestamp_ms: i64,
    /// Local time of the last fresher update; drives expiry.
    pub last_activity_ms: i64,
    pub is_self: bool,
}

impl NeighborEntry {
    #[must_use]
    pub fn to_gossip(&self) -> GossipEntry {
        GossipEntry {
            name: self.name.clone(),
            address: self.address,
            timestamp_ms: self.timestamp_ms,
            is_self: self.is_self,
        }
    }
}

/// What a merge did with one incoming entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Replaced,
    /// Not newer than what the table holds, or about this node itself.
    Unchanged,
    /// Not newer than an entry for the same name purged recently.
    Stale,
    /// Origin timestamp negative, or further ahead of the local clock than
    /// the neighbor timeout.
    OutOfRange,
}

/// What remains of a purged entry while peers may still gossip it.
#[derive(Debug, Clone, Copy)]
struct Tombstone {
    timestamp_ms: i64,
    address: Endpoint,
    purged_at_ms: i64,
}

/// Mapping of neighbor name to its freshest known entry.
///
/// Holds at most one entry per name, including this node's own entry, which
/// only [`refresh_self`](Self::refresh_self) may change.
///
/// An incoming entry replaces the held one when its origin timestamp is
/// strictly newer, or when the timestamps are equal and its address is
/// greater (IPv4 before IPv6, then address bytes, then port). Every node
/// applies the same rule, so concurrent updates converge to one winner and
/// re-merging an entry already held changes nothing.
///
/// Origin timestamps are only compared with each other, never with the
/// local clock, except that one further ahead than the timeout is refused:
/// it would otherwise outrank every honest update for that name. Expiry
/// runs on local receipt time.
///
/// A purged entry leaves a tombstone for twice the timeout. Until then only
/// an entry that supersedes the purged one is accepted, so peers that have
/// not purged it yet cannot hand it back.
pub struct NeighborTable {
    self_name: ResolverName,
    timeout: Duration,
    entries: HashMap<String, NeighborEntry>,
    tombstones: HashMap<String, Tombstone>,
}

impl NeighborTable {
    #[must_use]
    pub fn new(
        self_name: ResolverName,
        self_address: Endpoint,
        timeout: Duration,
        now_ms: i64,
    ) -> Self {
        let own = NeighborEntry {
            name: self_name.as_str().to_owned(),
            address: self_address,
            timestamp_ms: now_ms,
            last_activity_ms: now_ms,
            is_self: true,
        };
        let mut entries = HashMap::new();
        entries.insert(own.name.clone(), own);
        Self {
            self_name,
            timeout,
            entries,
            tombstones: HashMap::new(),
        }
    }

    #[must_use]
    pub fn self_name(&self) -> &ResolverName {
        &self.self_name
    }

    /// This node's own entry.
    #[must_use]
    pub fn self_entry(&self) -> Option<&NeighborEntry> {
        self.entries.get(self.self_name.as_str())
    }

    /// Stamps this node's entry with a new origin timestamp.
    pub fn refresh_self(&mut self, now_ms: i64) {
        if let Some(own) = self.entries.get_mut(self.self_name.as_str()) {
            own.timestamp_ms = own.timestamp_ms.max(now_ms);
            own.last_activity_ms = now_ms;
        }
    }

    pub fn set_self_address(&mut self, address: Endpoint) {
        if let Some(own) = self.entries.get_mut(self.self_name.as_str()) {
            own.address = address;
        }
    }

    pub fn merge_entry(&mut self, incoming: &GossipEntry, now_ms: i64) -> MergeOutcome {
        if incoming.name == self.self_name.as_str() {
            return MergeOutcome::Unchanged;
        }
        if incoming.timestamp_ms < 0
            || incoming.timestamp_ms.saturating_sub(now_ms) > self.timeout_ms()
        {
            debug!(
                neighbor = %incoming.name,
                timestamp_ms = incoming.timestamp_ms,
                "gossip entry timestamp out of range"
            );
            return MergeOutcome::OutOfRange;
        }

        match self.entries.get_mut(&incoming.name) {
            None => {
                if let Some(tombstone) = self.tombstones.get(&incoming.name) {
                    if !newer(incoming, tombstone.timestamp_ms, tombstone.address) {
                        return MergeOutcome::Stale;
                    }
                    self.tombstones.remove(&incoming.name);
                }
                info!(neighbor = %incoming.name, address = %incoming.address, "neighbor added");
                self.entries.insert(
                    incoming.name.clone(),
                    NeighborEntry {
                        name: incoming.name.clone(),
                        address: incoming.address,
                        timestamp_ms: incoming.timestamp_ms,
                        last_activity_ms: now_ms,
                        is_self: false,
                    },
                );
                MergeOutcome::Inserted
            }
            Some(held) if supersedes(incoming, held) => {
                if held.address != incoming.address {
                    info!(
                        neighbor = %incoming.name,
                        old = %held.address,
                        address = %incoming.address,
                        "neighbor replaced"
                    );
                }
                held.address = incoming.address;
                held.timestamp_ms = incoming.timestamp_ms;
                held.last_activity_ms = now_ms;
                MergeOutcome::Replaced
            }
            Some(_) => MergeOutcome::Unchanged,
        }
    }

    /// Merges a batch, returning true if anything changed.
    pub fn merge<'a>(
        &mut self,
        incoming: impl IntoIterator<Item = &'a GossipEntry>,
        now_ms: i64,
    ) -> bool {
        let mut changed = false;
        for entry in incoming {
            changed |= matches!(
                self.merge_entry(entry, now_ms),
                MergeOutcome::Inserted | MergeOutcome::Replaced
            );
        }
        changed
    }

    /// Removes neighbors without a fresher update for longer than the timeout.
    pub fn purge(&mut self, now_ms: i64) -> Vec<NeighborEntry> {
        let timeout_ms = self.timeout_ms();
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|entry| !entry.is_self && now_ms - entry.last_activity_ms > timeout_ms)
            .map(|entry| entry.name.clone())
            .collect();

        let retention_ms = timeout_ms.saturating_mul(2);
        self.tombstones
            .retain(|_, tombstone| now_ms - tombstone.purged_at_ms <= retention_ms);

        let mut purged = Vec::with_capacity(expired.len());
        for name in expired {
            if let Some(entry) = self.entries.remove(&name) {
                info!(neighbor = %entry.name, address = %entry.address, "neighbor expired");
                self.tombstones.insert(
                    name,
                    Tombstone {
                        timestamp_ms: entry.timestamp_ms,
                        address: entry.address,
                        purged_at_ms: now_ms,
                    },
                );
                purged.push(entry);
            }
        }
        purged
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn timeout_ms(&self) -> i64 {
        self.timeout.as_millis() as i64
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&NeighborEntry> {
        self.entries.get(name)
    }

    /// Known neighbors, excluding this node.
    pub fn neighbors(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values().filter(|entry| !entry.is_self)
    }

    /// Every entry, this node's included.
    pub fn entries(&self) -> impl Iterator<Item = &NeighborEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn live_neighbor_count(&self) -> usize {
        self.entries.len().saturating_sub(usize::from(self.self_entry().is_some()))
    }

    /// Entries including this node's own.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn has_neighbor_at(&self, address: Endpoint) -> bool {
        self.neighbors().any(|entry| entry.address == address)
    }

    /// Every entry in gossip form, this node's first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<GossipEntry> {
        let mut out: Vec<GossipEntry> = self.self_entry().map(NeighborEntry::to_gossip).into_iter().collect();
        out.extend(self.neighbors().map(NeighborEntry::to_gossip));
        out
    }
}

fn supersedes(incoming: &GossipEntry, held: &NeighborEntry) -> bool {
    newer(incoming, held.timestamp_ms, held.address)
}

fn newer(incoming: &GossipEntry, timestamp_ms: i64, address: Endpoint) -> bool {
    incoming.timestamp_ms > timestamp_ms
        || (incoming.timestamp_ms == timestamp_ms && incoming.address > address)
}
