//! Push-based anti-entropy over UDP.
//!
//! The engine owns no socket and reads no clock. The caller passes both in,
//! so the same code runs over a real [`UdpSocket`] in the driver and over an
//! in-memory network in tests.

use std::io;
use std::time::Duration;

use super::protocol::{self, GossipEntry, MAX_FRAME_SIZE};
use super::table::{NeighborTable, ResolverName};
use crate::net::{Endpoint, UdpSocket};
use crate::trace::{debug, info, trace, warn};

/// Receive buffer size. Larger than any valid frame, so an oversized
/// datagram shows up as a length mismatch rather than a silent truncation.
const RECV_BUFFER_SIZE: usize = 2 * MAX_FRAME_SIZE;

/// Datagram I/O the engine needs.
pub trait GossipTransport {
    /// Sends one frame. `Ok(false)` means the transport would block and the
    /// frame was dropped.
    fn send_frame(&mut self, frame: &[u8], dest: Endpoint) -> io::Result<bool>;

    /// Receives one datagram, `Ok(None)` when nothing is queued.
    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>>;
}

impl GossipTransport for UdpSocket {
    fn send_frame(&mut self, frame: &[u8], dest: Endpoint) -> io::Result<bool> {
        self.try_send_to(frame, dest).map(|sent| sent.is_some())
    }

    fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
        self.try_recv_from(buf)
    }
}

#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub interval: Duration,
    /// A neighbor with no fresher update for this long is purged.
    pub neighbor_timeout: Duration,
    pub bootstrap: Option<Endpoint>,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            neighbor_timeout: Duration::from_secs(10),
            bootstrap: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GossipStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub frames_malformed: u64,
    pub send_errors: u64,
}

/// Gossip state machine for one node.
pub struct GossipEngine {
    table: NeighborTable,
    config: GossipConfig,
    next_tick_ms: Option<i64>,
    stats: GossipStats,
    recv_buf: Vec<u8>,
}

impl GossipEngine {
    #[must_use]
    pub fn new(
        self_name: ResolverName,
        self_address: Endpoint,
        config: GossipConfig,
        now_ms: i64,
    ) -> Self {
        Self {
            table: NeighborTable::new(self_name, self_address, config.neighbor_timeout, now_ms),
            config,
            next_tick_ms: None,
            stats: GossipStats::default(),
            recv_buf: vec![0; RECV_BUFFER_SIZE],
        }
    }

    #[must_use]
    pub fn table(&self) -> &NeighborTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut NeighborTable {
        &mut self.table
    }

    #[must_use]
    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> GossipStats {
        self.stats
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.next_tick_ms.is_some()
    }

    /// Sends this node's own entry to the bootstrap neighbor, if any, and
    /// schedules the first tick. An unreachable bootstrap is not an error;
    /// later ticks keep trying it.
    pub fn start(&mut self, transport: &mut impl GossipTransport, now_ms: i64) -> usize {
        self.table.refresh_self(now_ms);
        self.next_tick_ms = Some(now_ms + self.interval_ms());

        let Some(bootstrap) = self.config.bootstrap else {
            info!(name = %self.table.self_name(), "gossip started without bootstrap");
            return 0;
        };
        info!(name = %self.table.self_name(), %bootstrap, "gossip started");
        let own: Vec<GossipEntry> = self
            .table
            .self_entry()
            .map(|own| own.to_gossip())
            .into_iter()
            .collect();
        self.send_entries(transport, &own, &[bootstrap])
    }

    /// One duty cycle: drain inbound datagrams, then tick if one is due.
    pub fn do_work(&mut self, transport: &mut impl GossipTransport, now_ms: i64) -> usize {
        if !self.is_started() {
            return self.start(transport, now_ms);
        }

        let mut work = self.receive(transport, now_ms);
        if self.next_tick_ms.is_some_and(|due| now_ms >= due) {
            work += self.tick(transport, now_ms);
        }
        work
    }

    /// Pushes every known entry to every known neighbor, then expires
    /// neighbors that went quiet.
    pub fn tick(&mut self, transport: &mut impl GossipTransport, now_ms: i64) -> usize {
        self.next_tick_ms = Some(now_ms + self.interval_ms());
        self.table.refresh_self(now_ms);

        let own_address = self.table.self_entry().map(|own| own.address);
        let mut destinations: Vec<Endpoint> = self
            .table
            .neighbors()
            .map(|neighbor| neighbor.address)
            .filter(|address| Some(*address) != own_address)
            .collect();
        if let Some(bootstrap) = self.config.bootstrap
            && !self.table.has_neighbor_at(bootstrap)
        {
            destinations.push(bootstrap);
        }
        destinations.sort_unstable();
        destinations.dedup();

        let entries = self.table.snapshot();
        let sent = self.send_entries(transport, &entries, &destinations);

        let expired = self.table.purge(now_ms).len();
        if expired > 0 {
            info!(
                expired,
                neighbors = self.table.live_neighbor_count(),
                "neighbors expired"
            );
        }
        sent + expired
    }

    /// Drains the transport, merging every valid frame.
    pub fn receive(&mut self, transport: &mut impl GossipTransport, now_ms: i64) -> usize {
        let mut buf = std::mem::take(&mut self.recv_buf);
        let mut received = 0;
        loop {
            match transport.recv_frame(&mut buf) {
                Ok(Some((len, source))) => {
                    received += 1;
                    self.on_datagram(&buf[..len], source, now_ms);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "gossip receive failed");
                    break;
                }
            }
        }
        self.recv_buf = buf;
        received
    }

    /// Merges one datagram. Malformed frames are dropped and counted.
    /// Returns true if the table changed.
    pub fn on_datagram(&mut self, datagram: &[u8], source: Endpoint, now_ms: i64) -> bool {
        self.stats.frames_received += 1;
        let mut entries = match protocol::decode_frame(datagram) {
            Ok(entries) => entries,
            Err(e) => {
                self.stats.frames_malformed += 1;
                warn!(%source, error = %e, len = datagram.len(), "dropped malformed gossip frame");
                return false;
            }
        };

        for entry in &mut entries {
            if entry.is_self && entry.address.is_unspecified() {
                entry.address = entry.address.with_ip(source.ip());
            }
        }
        trace!(%source, entries = entries.len(), "gossip frame received");
        self.table.merge(&entries, now_ms)
    }

    fn send_entries(
        &mut self,
        transport: &mut impl GossipTransport,
        entries: &[GossipEntry],
        destinations: &[Endpoint],
    ) -> usize {
        if destinations.is_empty() {
            return 0;
        }
        let frames = protocol::encode_frames(entries);
        let mut sent = 0;
        for dest in destinations {
            for frame in &frames {
                match transport.send_frame(frame, *dest) {
                    Ok(true) => {
                        sent += 1;
                        self.stats.frames_sent += 1;
                    }
                    Ok(false) => debug!(%dest, "gossip send would block"),
                    Err(e) => {
                        self.stats.send_errors += 1;
                        debug!(%dest, error = %e, "gossip send failed");
                    }
                }
            }
        }
        sent
    }

    fn interval_ms(&self) -> i64 {
        self.config.interval.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{HashMap, VecDeque};
    use std::rc::Rc;

    use super::*;

    const INTERVAL_MS: i64 = 1_000;

    type Queues = Rc<RefCell<HashMap<Endpoint, VecDeque<(Vec<u8>, Endpoint)>>>>;

    /// Lossless datagram network between in-process nodes.
    #[derive(Default, Clone)]
    struct MemoryNetwork {
        queues: Queues,
    }

    impl MemoryNetwork {
        fn attach(&self, address: Endpoint) -> MemoryTransport {
            self.queues.borrow_mut().entry(address).or_default();
            MemoryTransport {
                address,
                queues: Rc::clone(&self.queues),
            }
        }

        fn detach(&self, address: Endpoint) {
            self.queues.borrow_mut().remove(&address);
        }
    }

    struct MemoryTransport {
        address: Endpoint,
        queues: Queues,
    }

    impl GossipTransport for MemoryTransport {
        fn send_frame(&mut self, frame: &[u8], dest: Endpoint) -> io::Result<bool> {
            match self.queues.borrow_mut().get_mut(&dest) {
                Some(queue) => {
                    queue.push_back((frame.to_vec(), self.address));
                    Ok(true)
                }
                None => Err(io::Error::from(io::ErrorKind::ConnectionRefused)),
            }
        }

        fn recv_frame(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, Endpoint)>> {
            let next = self
                .queues
                .borrow_mut()
                .get_mut(&self.address)
                .and_then(VecDeque::pop_front);
            Ok(next.map(|(frame, source)| {
                buf[..frame.len()].copy_from_slice(&frame);
                (frame.len(), source)
            }))
        }
    }

    struct Node {
        engine: GossipEngine,
        transport: MemoryTransport,
    }

    fn node(net: &MemoryNetwork, name: &str, port: u16, bootstrap: Option<u16>, now_ms: i64) -> Node {
        let address = Endpoint::localhost(port);
        let config = GossipConfig {
            interval: Duration::from_millis(INTERVAL_MS as u64),
            neighbor_timeout: Duration::from_secs(10),
            bootstrap: bootstrap.map(Endpoint::localhost),
        };
        Node {
            engine: GossipEngine::new(ResolverName::new(name).unwrap(), address, config, now_ms),
            transport: net.attach(address),
        }
    }

    fn run(nodes: &mut [Node], start_ms: i64, ticks: i64) -> i64 {
        let mut now = start_ms;
        for _ in 0..ticks {
            for node in nodes.iter_mut() {
                node.engine.do_work(&mut node.transport, now);
            }
            now += INTERVAL_MS;
        }
        now
    }

    fn counts(nodes: &[Node]) -> Vec<usize> {
        nodes
            .iter()
            .map(|node| node.engine.table().live_neighbor_count())
            .collect()
    }

    #[test]
    fn test_chain_converges() {
        let net = MemoryNetwork::default();
        let mut nodes = vec![
            node(&net, "A", 8050, None, 0),
            node(&net, "B", 8051, Some(8050), 0),
            node(&net, "C", 8052, Some(8051), 0),
        ];
        run(&mut nodes, 0, 6);
        assert_eq!(counts(&nodes), vec![2, 2, 2]);
    }

    #[test]
    fn test_converges_regardless_of_start_order() {
        let net = MemoryNetwork::default();
        let mut nodes = vec![
            node(&net, "C", 8052, Some(8051), 0),
            node(&net, "B", 8051, Some(8050), 0),
            node(&net, "A", 8050, None, 0),
        ];
        run(&mut nodes, 0, 8);
        assert_eq!(counts(&nodes), vec![2, 2, 2]);
    }

    #[test]
    fn test_transitive_discovery_across_hops() {
        let net = MemoryNetwork::default();
        let mut nodes: Vec<Node> = (0..5u16)
            .map(|i| {
                let bootstrap = i.checked_sub(1).map(|prev| 9000 + prev);
                node(&net, &format!("n{i}"), 9000 + i, bootstrap, 0)
            })
            .collect();
        run(&mut nodes, 0, 12);

        assert!(nodes[0].engine.table().get("n4").is_some());
        assert!(nodes[4].engine.table().get("n0").is_some());
        assert_eq!(counts(&nodes), vec![4; 5]);
    }

    #[test]
    fn test_reused_name_replaces_stale_entry() {
        let net = MemoryNetwork::default();
        let mut nodes = vec![
            node(&net, "A", 8050, None, 0),
            node(&net, "B", 8051, Some(8050), 0),
            node(&net, "C", 8052, Some(8051), 0),
        ];
        let now = run(&mut nodes, 0, 6);

        let gone = nodes.pop().unwrap();
        net.detach(gone.transport.address);
        nodes.push(node(&net, "C", 8053, Some(8050), now));
        nodes.push(node(&net, "D", 8054, Some(8050), now));
        run(&mut nodes, now, 6);

        let a = nodes[0].engine.table();
        assert_eq!(a.live_neighbor_count(), 3);
        assert_eq!(a.get("C").unwrap().address, Endpoint::localhost(8053));
        assert!(!a.has_neighbor_at(Endpoint::localhost(8052)));
    }

    #[test]
    fn test_silent_neighbor_expires_everywhere() {
        let net = MemoryNetwork::default();
        let mut nodes = vec![
            node(&net, "A", 8050, None, 0),
            node(&net, "B", 8051, Some(8050), 0),
            node(&net, "C", 8052, Some(8051), 0),
        ];
        let now = run(&mut nodes, 0, 6);

        let gone = nodes.pop().unwrap();
        net.detach(gone.transport.address);
        run(&mut nodes, now, 15);

        assert_eq!(counts(&nodes), vec![1, 1]);
        assert!(nodes[0].engine.table().get("C").is_none());
    }

    #[test]
    fn test_redelivered_frame_is_noop() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, "A", 8050, None, 0);
        let entries = vec![GossipEntry {
            name: "B".into(),
            address: Endpoint::localhost(8051),
            timestamp_ms: 100,
            is_self: true,
        }];
        let frame = protocol::encode_frames(&entries).remove(0);

        assert!(a.engine.on_datagram(&frame, Endpoint::localhost(8051), 100));
        let before = a.engine.table().snapshot();
        for _ in 0..3 {
            assert!(!a.engine.on_datagram(&frame, Endpoint::localhost(8051), 200));
        }
        assert_eq!(a.engine.table().snapshot(), before);
        a.engine.receive(&mut a.transport, 200);
        assert_eq!(a.engine.table().live_neighbor_count(), 1);
    }

    #[test]
    fn test_malformed_frame_dropped_and_counted() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, "A", 8050, None, 0);

        assert!(!a.engine.on_datagram(&[0x20, 0, 3], Endpoint::localhost(1), 0));
        assert!(!a.engine.on_datagram(&[0xff; 32], Endpoint::localhost(1), 0));

        let stats = a.engine.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.frames_malformed, 2);
        assert_eq!(a.engine.table().live_neighbor_count(), 0);
    }

    #[test]
    fn test_frame_with_extreme_timestamps_changes_nothing() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, "A", 8050, None, 0);
        let entries: Vec<GossipEntry> = [i64::MIN, -1, i64::MAX]
            .into_iter()
            .enumerate()
            .map(|(i, timestamp_ms)| GossipEntry {
                name: format!("B{i}"),
                address: Endpoint::localhost(8051),
                timestamp_ms,
                is_self: false,
            })
            .collect();
        let frame = protocol::encode_frames(&entries).remove(0);

        assert!(!a.engine.on_datagram(&frame, Endpoint::localhost(8051), 1_000_000));
        assert_eq!(a.engine.stats().frames_malformed, 0);
        assert_eq!(a.engine.table().live_neighbor_count(), 0);
    }

    #[test]
    fn test_unspecified_self_address_takes_source_ip() {
        let net = MemoryNetwork::default();
        let mut a = node(&net, "A", 8050, None, 0);
        let entries = vec![GossipEntry {
            name: "B".into(),
            address: Endpoint::any(8051),
            timestamp_ms: 1,
            is_self: true,
        }];
        let frame = protocol::encode_frames(&entries).remove(0);

        a.engine
            .on_datagram(&frame, Endpoint::new_v4(10, 1, 2, 3, 40000), 1);
        assert_eq!(
            a.engine.table().get("B").unwrap().address,
            Endpoint::new_v4(10, 1, 2, 3, 8051)
        );
    }

    #[test]
    fn test_unreachable_bootstrap_is_retried() {
        let net = MemoryNetwork::default();
        let mut b = node(&net, "B", 8051, Some(8050), 0);
        b.engine.do_work(&mut b.transport, 0);
        run(std::slice::from_mut(&mut b), INTERVAL_MS, 2);
        assert_eq!(b.engine.stats().send_errors, 3);

        let a = node(&net, "A", 8050, None, 3 * INTERVAL_MS);
        let mut nodes = vec![a, b];
        run(&mut nodes, 3 * INTERVAL_MS, 4);
        assert_eq!(counts(&nodes), vec![1, 1]);
    }
}
