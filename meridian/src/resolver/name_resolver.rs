//! Name lookups for the driver, backed by gossip.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use super::ResolverError;
use super::gossip::{GossipConfig, GossipEngine, GossipStats};
use super::table::{NeighborTable, ResolverName};
use crate::control::types::ClientId;
use crate::counters::{AtomicCounter, CounterStore, CounterTypeId};
use crate::net::{Endpoint, UdpSocket};
use crate::trace::{info, warn};

pub const NEIGHBORS_COUNTER_TYPE_ID: CounterTypeId = CounterTypeId::new(15);
pub const CACHE_ENTRIES_COUNTER_TYPE_ID: CounterTypeId = CounterTypeId::new(16);

/// Label prefixes tooling matches to find the resolver's counters.
pub const NEIGHBORS_LABEL: &str = "Resolver neighbors";
pub const CACHE_ENTRIES_LABEL: &str = "Resolver cache entries";

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub name: String,
    /// Port 0 picks an ephemeral port; an unspecified address is replaced
    /// by the datagram source address at each peer.
    pub bind: Endpoint,
    /// `host:port` of a node to join through, resolved at startup.
    pub bootstrap: Option<String>,
    pub gossip_interval: Duration,
    pub neighbor_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            name: format!("meridian-{}", std::process::id()),
            bind: Endpoint::any(0),
            bootstrap: None,
            gossip_interval: Duration::from_secs(1),
            neighbor_timeout: Duration::from_secs(10),
        }
    }
}

/// Names a resolver currently knows, readable from any thread.
///
/// Refreshed by the resolver's duty cycle whenever gossip did some work, so
/// lookups lag the table by at most one cycle.
#[derive(Debug, Clone, Default)]
pub struct ResolvedNames {
    inner: Arc<RwLock<HashMap<String, Endpoint>>>,
}

impl ResolvedNames {
    /// # Errors
    ///
    /// [`ResolverError::NotFound`] if no live entry carries that name.
    pub fn resolve(&self, name: &str) -> Result<Endpoint, ResolverError> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .ok_or_else(|| ResolverError::NotFound(name.to_owned()))
    }

    /// Number of names known, this node's included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, table: &NeighborTable) {
        let mut names = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        names.clear();
        names.extend(
            table
                .entries()
                .map(|entry| (entry.name.clone(), entry.address)),
        );
    }
}

/// Resolves node names to addresses and keeps the gossip running.
///
/// Driven from the driver's duty cycle through [`do_work`](Self::do_work).
/// Publishes its neighbor count and table size as counters owned by the
/// driver.
pub struct NameResolver {
    socket: UdpSocket,
    engine: GossipEngine,
    local: Endpoint,
    neighbors: AtomicCounter,
    cache_entries: AtomicCounter,
    resolved: ResolvedNames,
}

impl NameResolver {
    /// Binds the gossip socket and allocates the resolver counters.
    ///
    /// # Errors
    ///
    /// [`ResolverError::InvalidName`] for a bad node name,
    /// [`ResolverError::Bootstrap`] if the bootstrap address cannot be
    /// resolved, [`ResolverError::Io`] if the socket cannot be bound and
    /// [`ResolverError::Counters`] if the counters region is full.
    pub fn new(
        config: &ResolverConfig,
        store: &mut CounterStore,
        now_ms: i64,
    ) -> Result<Self, ResolverError> {
        let name = ResolverName::new(config.name.clone())?;
        let bootstrap = config
            .bootstrap
            .as_deref()
            .map(Endpoint::resolve)
            .transpose()?;

        let socket = UdpSocket::bind(config.bind)?;
        let local = socket.local_addr()?;

        let suffix = format!(": name={name} bind={local}");
        let neighbors = store.allocate(
            NEIGHBORS_COUNTER_TYPE_ID,
            &[],
            &format!("{NEIGHBORS_LABEL}{suffix}"),
            ClientId::DRIVER,
        )?;
        let cache_entries = match store.allocate(
            CACHE_ENTRIES_COUNTER_TYPE_ID,
            &[],
            &format!("{CACHE_ENTRIES_LABEL}{suffix}"),
            ClientId::DRIVER,
        ) {
            Ok(allocated) => allocated,
            Err(e) => {
                if let Err(free_err) = store.free(neighbors.id, ClientId::DRIVER) {
                    warn!(
                        counter = %neighbors.id,
                        error = %free_err,
                        "failed to release neighbors counter after allocation failure"
                    );
                }
                return Err(e.into());
            }
        };

        let gossip = GossipConfig {
            interval: config.gossip_interval,
            neighbor_timeout: config.neighbor_timeout,
            bootstrap,
        };
        info!(%name, %local, ?bootstrap, "name resolver bound");

        let resolver = Self {
            socket,
            engine: GossipEngine::new(name, local, gossip, now_ms),
            local,
            neighbors: store.counter(neighbors),
            cache_entries: store.counter(cache_entries),
            resolved: ResolvedNames::default(),
        };
        resolver.publish();
        Ok(resolver)
    }

    /// One duty cycle of gossip. Returns the amount of work done.
    pub fn do_work(&mut self, now_ms: i64) -> usize {
        let work = self.engine.do_work(&mut self.socket, now_ms);
        if work > 0 {
            self.publish();
        }
        work
    }

    /// Looks up a node by name, this node included.
    ///
    /// # Errors
    ///
    /// [`ResolverError::NotFound`] if no live entry carries that name.
    pub fn resolve(&self, name: &str) -> Result<Endpoint, ResolverError> {
        self.engine
            .table()
            .get(name)
            .map(|entry| entry.address)
            .ok_or_else(|| ResolverError::NotFound(name.to_owned()))
    }

    /// Handle other threads use to look up names.
    #[must_use]
    pub fn resolved_names(&self) -> ResolvedNames {
        self.resolved.clone()
    }

    #[must_use]
    pub fn name(&self) -> &ResolverName {
        self.engine.table().self_name()
    }

    /// Address the gossip socket is bound to.
    #[must_use]
    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    #[must_use]
    pub fn table(&self) -> &NeighborTable {
        self.engine.table()
    }

    #[must_use]
    pub fn stats(&self) -> GossipStats {
        self.engine.stats()
    }

    #[must_use]
    pub fn neighbors_counter(&self) -> &AtomicCounter {
        &self.neighbors
    }

    #[must_use]
    pub fn cache_entries_counter(&self) -> &AtomicCounter {
        &self.cache_entries
    }

    /// Frees the resolver counters.
    pub fn close(self, store: &mut CounterStore) {
        for counter in [&self.neighbors, &self.cache_entries] {
            if let Err(e) = store.free(counter.id(), ClientId::DRIVER) {
                warn!(counter = %counter.id(), error = %e, "failed to free resolver counter");
            }
        }
        info!(name = %self.name(), "name resolver closed");
    }

    fn publish(&self) {
        let table = self.engine.table();
        self.neighbors.set(table.live_neighbor_count() as i64);
        self.cache_entries.set(table.len() as i64);
        self.resolved.publish(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str, bootstrap: Option<Endpoint>) -> ResolverConfig {
        ResolverConfig {
            name: name.into(),
            bind: Endpoint::localhost(0),
            bootstrap: bootstrap.map(|ep| ep.to_string()),
            gossip_interval: Duration::from_millis(50),
            neighbor_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_counters_published_with_labels() {
        let mut store = CounterStore::with_heap(8);
        let resolver = NameResolver::new(&config("alpha", None), &mut store, 0).unwrap();

        let reader = store.reader();
        let neighbors = reader.find_by_label_prefix(NEIGHBORS_LABEL).unwrap();
        let entries = reader.find_by_label_prefix(CACHE_ENTRIES_LABEL).unwrap();
        assert_eq!(reader.value(neighbors).unwrap(), 0);
        assert_eq!(reader.value(entries).unwrap(), 1);

        let label = reader.label(neighbors).unwrap();
        assert!(label.ends_with(&format!(
            ": name=alpha bind={}",
            resolver.local_endpoint()
        )));

        let snapshot = reader.snapshot(entries).unwrap();
        assert_eq!(snapshot.type_id, CACHE_ENTRIES_COUNTER_TYPE_ID);
        assert_eq!(snapshot.owner, ClientId::DRIVER);

        resolver.close(&mut store);
        assert_eq!(store.allocated_count(), 0);
    }

    #[test]
    fn test_resolves_self_and_reports_unknown() {
        let mut store = CounterStore::with_heap(8);
        let resolver = NameResolver::new(&config("alpha", None), &mut store, 0).unwrap();

        assert_eq!(resolver.resolve("alpha").unwrap(), resolver.local_endpoint());
        assert!(matches!(
            resolver.resolve("nobody"),
            Err(ResolverError::NotFound(name)) if name == "nobody"
        ));

        let names = resolver.resolved_names();
        assert_eq!(names.len(), 1);
        assert_eq!(names.resolve("alpha").unwrap(), resolver.local_endpoint());
        assert!(names.resolve("nobody").is_err());
    }

    #[test]
    fn test_rejects_bad_name_and_bootstrap() {
        let mut store = CounterStore::with_heap(8);
        assert!(matches!(
            NameResolver::new(&config("", None), &mut store, 0),
            Err(ResolverError::InvalidName(_))
        ));

        let mut bad = config("alpha", None);
        bad.bootstrap = Some("no-port-here".into());
        assert!(matches!(
            NameResolver::new(&bad, &mut store, 0),
            Err(ResolverError::Bootstrap(_))
        ));
        assert_eq!(store.allocated_count(), 0);
    }

    #[test]
    fn test_full_region_leaves_nothing_allocated() {
        let mut store = CounterStore::with_heap(1);
        assert!(matches!(
            NameResolver::new(&config("alpha", None), &mut store, 0),
            Err(ResolverError::Counters(_))
        ));
        assert_eq!(store.allocated_count(), 0);
    }

    #[test]
    fn test_two_nodes_learn_each_other_over_loopback() {
        let mut store_a = CounterStore::with_heap(4);
        let mut store_b = CounterStore::with_heap(4);
        let mut a = NameResolver::new(&config("alpha", None), &mut store_a, 0).unwrap();
        let mut b = NameResolver::new(
            &config("beta", Some(a.local_endpoint())),
            &mut store_b,
            0,
        )
        .unwrap();

        let mut now = 0;
        for _ in 0..200 {
            a.do_work(now);
            b.do_work(now);
            if a.resolve("beta").is_ok() && b.resolve("alpha").is_ok() {
                break;
            }
            now += 50;
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(a.resolve("beta").unwrap(), b.local_endpoint());
        assert_eq!(b.resolve("alpha").unwrap(), a.local_endpoint());
        let names = a.resolved_names();
        let from_thread = std::thread::spawn(move || names.resolve("beta"))
            .join()
            .expect("lookup thread");
        assert_eq!(from_thread.unwrap(), b.local_endpoint());
        assert_eq!(a.neighbors_counter().get(), 1);
        assert_eq!(b.cache_entries_counter().get(), 2);
    }
}
