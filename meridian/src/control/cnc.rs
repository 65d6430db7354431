//! Command-and-control header shared by a driver and its clients.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::SharedMemorySafe;

/// Layout version; clients refuse a header with a different one.
pub const CNC_VERSION: u32 = 1;

const READY_MARKER: u64 = 0x4D45_5249_4449_414E; // "MERIDIAN"

/// Small fixed header a driver publishes once everything else exists.
///
/// Clients wait for the ready marker before opening the other objects, and
/// watch the heartbeat to tell a live driver from one that crashed.
#[derive(SharedMemorySafe, Default)]
#[repr(C, align(64))]
pub struct CncHeader {
    ready: AtomicU64,
    version: AtomicU32,
    driver_pid: AtomicU32,
    counters_capacity: AtomicU64,
    client_liveness_timeout_ms: AtomicU64,
    driver_heartbeat_ms: AtomicI64,
}

impl CncHeader {
    /// Writes the driver parameters, then the ready marker.
    pub(crate) fn publish(&self, counters_capacity: usize, liveness_timeout: Duration, now_ms: i64) {
        self.version.store(CNC_VERSION, Ordering::Relaxed);
        self.driver_pid.store(std::process::id(), Ordering::Relaxed);
        self.counters_capacity
            .store(counters_capacity as u64, Ordering::Relaxed);
        self.client_liveness_timeout_ms
            .store(liveness_timeout.as_millis() as u64, Ordering::Relaxed);
        self.driver_heartbeat_ms.store(now_ms, Ordering::Relaxed);
        self.ready.store(READY_MARKER, Ordering::Release);
    }

    /// Clears the ready marker so connecting clients stop trusting the header.
    pub(crate) fn retire(&self) {
        self.ready.store(0, Ordering::Release);
    }

    pub(crate) fn beat(&self, now_ms: i64) {
        self.driver_heartbeat_ms.store(now_ms, Ordering::Release);
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire) == READY_MARKER
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn driver_pid(&self) -> u32 {
        self.driver_pid.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn counters_capacity(&self) -> usize {
        self.counters_capacity.load(Ordering::Acquire) as usize
    }

    #[must_use]
    pub fn client_liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.client_liveness_timeout_ms.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn driver_heartbeat_ms(&self) -> i64 {
        self.driver_heartbeat_ms.load(Ordering::Acquire)
    }

    /// True if the driver is ready and beat within `timeout` of `now_ms`.
    #[must_use]
    pub fn is_driver_alive(&self, now_ms: i64, timeout: Duration) -> bool {
        self.is_ready()
            && now_ms.saturating_sub(self.driver_heartbeat_ms()) <= timeout.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_not_ready_until_published() {
        let header = CncHeader::default();
        assert!(!header.is_ready());
        assert!(!header.is_driver_alive(0, Duration::from_secs(10)));

        header.publish(256, Duration::from_secs(10), 1_000);
        assert!(header.is_ready());
        assert_eq!(header.version(), CNC_VERSION);
        assert_eq!(header.counters_capacity(), 256);
        assert_eq!(header.client_liveness_timeout(), Duration::from_secs(10));
        assert_eq!(header.driver_pid(), std::process::id());
    }

    #[test]
    fn test_stale_heartbeat_means_dead_driver() {
        let header = CncHeader::default();
        header.publish(1, Duration::from_secs(1), 1_000);

        assert!(header.is_driver_alive(5_000, Duration::from_secs(10)));
        assert!(!header.is_driver_alive(20_000, Duration::from_secs(10)));

        header.beat(19_000);
        assert!(header.is_driver_alive(20_000, Duration::from_secs(10)));

        header.retire();
        assert!(!header.is_driver_alive(20_000, Duration::from_secs(10)));
    }
}
