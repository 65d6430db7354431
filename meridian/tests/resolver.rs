//! Gossip name resolution over loopback UDP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use meridian::counters::{CounterStore, CountersReader};
use meridian::net::Endpoint;
use meridian::resolver::{
    CACHE_ENTRIES_LABEL, NEIGHBORS_LABEL, NameResolver, ResolverConfig, ResolverError,
};
use meridian::runtime::clock::epoch_millis;
use meridian::runtime::driver::{Driver, DriverConfig, DriverError};
use meridian::runtime::idle::{IdleStrategy, poll_until};
use meridian::runtime::topology::CpuConfig;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(40);
const NEIGHBOR_TIMEOUT: Duration = Duration::from_millis(600);
const SETTLE: Duration = Duration::from_secs(10);

fn resolver_config(name: &str, bootstrap: Option<Endpoint>) -> ResolverConfig {
    ResolverConfig {
        name: name.into(),
        bind: Endpoint::localhost(0),
        bootstrap: bootstrap.map(|e| e.to_string()),
        gossip_interval: GOSSIP_INTERVAL,
        neighbor_timeout: NEIGHBOR_TIMEOUT,
    }
}

fn spawn_node(name: &str, bootstrap: Option<Endpoint>) -> Option<Driver> {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    let config = DriverConfig {
        directory: format!(
            "it-gossip-{name}-{}-{}",
            std::process::id(),
            NEXT.fetch_add(1, Ordering::Relaxed)
        ),
        counters_capacity: 8,
        resolver: Some(resolver_config(name, bootstrap)),
        cpu: CpuConfig::Disabled,
        idle: IdleStrategy::Sleep(Duration::from_millis(1)),
        ..DriverConfig::default()
    };
    match Driver::spawn(config) {
        Ok(driver) => Some(driver),
        Err(DriverError::Shm(err)) if err.errno() == Some(rustix::io::Errno::ACCESS) => {
            eprintln!("Skipping: shared memory unavailable: {err}");
            None
        }
        Err(err) => panic!("{name} failed to start: {err}"),
    }
}

/// Value of the first counter whose label starts with `prefix`.
fn counter_value(counters: &CountersReader, prefix: &str) -> Option<i64> {
    let id = counters.find_by_label_prefix(prefix)?;
    counters.value(id).ok()
}

fn neighbors(driver: &Driver) -> Option<i64> {
    counter_value(&driver.counters(), NEIGHBORS_LABEL)
}

#[test]
fn test_chained_drivers_converge() {
    let Some(a) = spawn_node("alpha", None) else {
        return;
    };
    let a_addr = a.resolver_endpoint().expect("resolver running");
    let b = spawn_node("bravo", Some(a_addr)).expect("bravo starts");
    let b_addr = b.resolver_endpoint().expect("resolver running");
    let c = spawn_node("charlie", Some(b_addr)).expect("charlie starts");

    let nodes = [&a, &b, &c];
    assert!(
        poll_until(SETTLE, || nodes.iter().all(|n| neighbors(n) == Some(2))),
        "neighbor counts: {:?}",
        nodes.iter().map(|n| neighbors(n)).collect::<Vec<_>>()
    );
    for node in nodes {
        assert_eq!(counter_value(&node.counters(), CACHE_ENTRIES_LABEL), Some(3));
    }

    // Stays converged.
    std::thread::sleep(GOSSIP_INTERVAL * 5);
    assert!(nodes.iter().all(|n| neighbors(n) == Some(2)));
}

#[test]
fn test_drivers_resolve_every_node_in_chain() {
    let Some(a) = spawn_node("alpha", None) else {
        return;
    };
    let a_addr = a.resolver_endpoint().expect("resolver running");
    let b = spawn_node("bravo", Some(a_addr)).expect("bravo starts");
    let b_addr = b.resolver_endpoint().expect("resolver running");
    let c = spawn_node("charlie", Some(b_addr)).expect("charlie starts");
    let c_addr = c.resolver_endpoint().expect("resolver running");

    let expected = [("alpha", a_addr), ("bravo", b_addr), ("charlie", c_addr)];
    assert!(poll_until(SETTLE, || {
        [&a, &b, &c].iter().all(|node| {
            expected
                .iter()
                .all(|(name, addr)| node.resolve(name).ok() == Some(*addr))
        })
    }));
    assert!(matches!(
        a.resolve("delta"),
        Err(ResolverError::NotFound(name)) if name == "delta"
    ));
}

#[test]
fn test_resolve_needs_a_resolver() {
    let config = DriverConfig {
        directory: format!("it-gossip-none-{}", std::process::id()),
        counters_capacity: 8,
        cpu: CpuConfig::Disabled,
        idle: IdleStrategy::Sleep(Duration::from_millis(1)),
        ..DriverConfig::default()
    };
    let driver = match Driver::spawn(config) {
        Ok(driver) => driver,
        Err(DriverError::Shm(err)) if err.errno() == Some(rustix::io::Errno::ACCESS) => return,
        Err(err) => panic!("driver failed to start: {err}"),
    };
    assert!(matches!(
        driver.resolve("anyone"),
        Err(ResolverError::NotConfigured)
    ));
}

#[test]
fn test_counters_label_names_the_node() {
    let Some(a) = spawn_node("labelled", None) else {
        return;
    };
    let counters = a.counters();
    let id = counters
        .find_by_label_prefix(NEIGHBORS_LABEL)
        .expect("neighbors counter");
    let label = counters.label(id).unwrap();
    assert!(label.contains("name=labelled"), "{label}");
    assert_eq!(counters.value(id).unwrap(), 0);
}

/// Standalone resolvers stepped by hand, so the test can stop a node and
/// look up names directly.
struct Node {
    store: CounterStore,
    resolver: NameResolver,
}

impl Node {
    fn start(name: &str, bootstrap: Option<Endpoint>) -> Self {
        let mut store = CounterStore::with_heap(4);
        let resolver = NameResolver::new(&resolver_config(name, bootstrap), &mut store, epoch_millis())
            .expect("resolver starts");
        Self { store, resolver }
    }

    fn endpoint(&self) -> Endpoint {
        self.resolver.local_endpoint()
    }

    fn stop(self) {
        let Self { mut store, resolver } = self;
        resolver.close(&mut store);
    }
}

fn step(nodes: &mut [&mut Node]) {
    let now = epoch_millis();
    for node in nodes.iter_mut() {
        node.resolver.do_work(now);
    }
    std::thread::sleep(Duration::from_millis(2));
}

#[test]
fn test_reused_name_replaces_departed_node() {
    let mut a = Node::start("alpha", None);
    let mut b = Node::start("bravo", Some(a.endpoint()));
    let mut c = Node::start("charlie", Some(b.endpoint()));
    let mut old = Node::start("delta", Some(a.endpoint()));
    let old_endpoint = old.endpoint();

    assert!(poll_until(SETTLE, || {
        step(&mut [&mut a, &mut b, &mut c, &mut old]);
        a.resolver.table().live_neighbor_count() == 3
    }));
    assert_eq!(a.resolver.resolve("delta").unwrap(), old_endpoint);
    old.stop();

    let mut d = Node::start("delta", Some(a.endpoint()));
    let d_endpoint = d.endpoint();
    assert_ne!(d_endpoint, old_endpoint);

    assert!(poll_until(SETTLE, || {
        step(&mut [&mut a, &mut b, &mut c, &mut d]);
        [&a, &b, &c].iter().all(|n| {
            n.resolver.resolve("delta").ok() == Some(d_endpoint)
                && n.resolver.table().live_neighbor_count() == 3
        })
    }));
    assert_eq!(a.resolver.neighbors_counter().get(), 3);
    assert_eq!(a.resolver.cache_entries_counter().get(), 4);

    // Outlives the old entry's timeout without it coming back.
    let until = std::time::Instant::now() + NEIGHBOR_TIMEOUT * 2;
    while std::time::Instant::now() < until {
        step(&mut [&mut a, &mut b, &mut c, &mut d]);
        assert_eq!(a.resolver.resolve("delta").unwrap(), d_endpoint);
        assert_eq!(a.resolver.table().live_neighbor_count(), 3);
    }
}
