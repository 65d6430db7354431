//! Client heartbeat bookkeeping for the driver.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::time::Duration;

use minstant::Instant;

use crate::control::types::ClientId;
use crate::trace::{debug, info};

/// Dead ids are remembered this many timeouts after being declared dead, so
/// late commands from them are recognized rather than re-registering.
const TOMBSTONE_RETENTION_FACTOR: u32 = 10;

/// Outcome of recording activity for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// First command from this client.
    Registered,
    Refreshed,
    /// The client was already declared dead; its command must be ignored.
    Dead,
}

/// Tracks when each client was last heard from.
///
/// A client that stays silent for longer than the timeout is declared dead
/// exactly once, by [`sweep`](Self::sweep).
pub struct ClientLivenessTracker {
    timeout: Duration,
    clients: HashMap<ClientId, Instant>,
    tombstones: HashMap<ClientId, Instant>,
}

impl ClientLivenessTracker {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: HashMap::new(),
            tombstones: HashMap::new(),
        }
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn on_activity(&mut self, client: ClientId, now: Instant) -> Activity {
        if self.tombstones.contains_key(&client) {
            return Activity::Dead;
        }
        match self.clients.entry(client) {
            Entry::Occupied(mut seen) => {
                seen.insert(now);
                Activity::Refreshed
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                info!(%client, "client registered");
                Activity::Registered
            }
        }
    }

    /// Records a graceful close. Returns false if the client was not live.
    pub fn on_close(&mut self, client: ClientId, now: Instant) -> bool {
        if self.clients.remove(&client).is_none() {
            return false;
        }
        self.tombstones.insert(client, now);
        info!(%client, "client closed");
        true
    }

    /// Declares every client silent for longer than the timeout dead,
    /// calling `on_dead` once for each. Returns how many died.
    pub fn sweep(&mut self, now: Instant, mut on_dead: impl FnMut(ClientId)) -> usize {
        let timeout = self.timeout;
        let mut dead = Vec::new();
        self.clients.retain(|client, last_seen| {
            let alive = now.saturating_duration_since(*last_seen) <= timeout;
            if !alive {
                dead.push(*client);
            }
            alive
        });

        for client in &dead {
            info!(%client, timeout_ms = timeout.as_millis() as u64, "client timed out");
            self.tombstones.insert(*client, now);
            on_dead(*client);
        }

        let retention = timeout * TOMBSTONE_RETENTION_FACTOR;
        let before = self.tombstones.len();
        self.tombstones
            .retain(|_, declared| now.saturating_duration_since(*declared) <= retention);
        if self.tombstones.len() != before {
            debug!(pruned = before - self.tombstones.len(), "pruned client tombstones");
        }

        dead.len()
    }

    #[must_use]
    pub fn is_live(&self, client: ClientId) -> bool {
        self.clients.contains_key(&client)
    }

    #[must_use]
    pub fn is_dead(&self, client: ClientId) -> bool {
        self.tombstones.contains_key(&client)
    }

    #[must_use]
    pub fn live_count(&self) -> usize {
        self.clients.len()
    }
}
