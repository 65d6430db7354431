//! What a duty-cycle loop does when a cycle found no work.

use std::hint;
use std::thread;
use std::time::Duration;

use minstant::Instant;

/// Backoff policy for an agent loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStrategy {
    /// Never gives up the core.
    BusySpin,
    /// Sleeps a fixed period after every idle cycle.
    Sleep(Duration),
    /// Spins, then yields, then sleeps `park` per idle cycle until work shows up.
    Backoff {
        max_spins: u32,
        max_yields: u32,
        park: Duration,
    },
}

impl Default for IdleStrategy {
    fn default() -> Self {
        Self::Backoff {
            max_spins: 10,
            max_yields: 5,
            park: Duration::from_millis(1),
        }
    }
}

/// Per-loop state for an [`IdleStrategy`].
#[derive(Debug)]
pub struct Idler {
    strategy: IdleStrategy,
    spins: u32,
    yields: u32,
}

impl Idler {
    #[must_use]
    pub const fn new(strategy: IdleStrategy) -> Self {
        Self {
            strategy,
            spins: 0,
            yields: 0,
        }
    }

    /// Call once per cycle with the amount of work it did.
    pub fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
            return;
        }
        match self.strategy {
            IdleStrategy::BusySpin => hint::spin_loop(),
            IdleStrategy::Sleep(period) => thread::sleep(period),
            IdleStrategy::Backoff {
                max_spins,
                max_yields,
                park,
            } => {
                if self.spins < max_spins {
                    self.spins += 1;
                    hint::spin_loop();
                } else if self.yields < max_yields {
                    self.yields += 1;
                    thread::yield_now();
                } else {
                    thread::sleep(park);
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
    }
}

/// Polls `condition` until it holds or `timeout` passes, sleeping 1ms
/// between attempts. Returns whether the condition held.
pub fn poll_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_escalates_and_resets_on_work() {
        let mut idler = Idler::new(IdleStrategy::Backoff {
            max_spins: 2,
            max_yields: 1,
            park: Duration::from_micros(10),
        });
        for _ in 0..4 {
            idler.idle(0);
        }
        assert_eq!((idler.spins, idler.yields), (2, 1));

        idler.idle(3);
        assert_eq!((idler.spins, idler.yields), (0, 0));
    }

    #[test]
    fn test_poll_until_sees_eventual_condition() {
        let start = Instant::now();
        assert!(poll_until(Duration::from_secs(1), || {
            start.elapsed() >= Duration::from_millis(5)
        }));
    }

    #[test]
    fn test_poll_until_gives_up() {
        let start = Instant::now();
        assert!(!poll_until(Duration::from_millis(20), || false));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
