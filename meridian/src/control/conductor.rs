//! Driver-side command processing.
//!
//! Responsibilities:
//! - Own the counters region and every allocation in it.
//! - Apply client commands and answer them on the broadcast buffer.
//! - Declare silent clients dead and reclaim what they owned.
//! - Keep the control header's heartbeat fresh.
//! - Drive the name resolver, if configured.

use std::sync::Arc;
use std::time::Duration;

use minstant::Instant;
use rustix::io::Errno;

use crate::control::cnc::CncHeader;
use crate::control::liveness::{Activity, ClientLivenessTracker};
use crate::control::types::{ClientCommand, ClientId, DriverEvent, DriverPaths, ErrorCode};
use crate::counters::{CounterStore, CountersReader, ShmCounters};
use crate::ipc::broadcast::{BroadcastTransmitter, TO_CLIENTS_CAPACITY};
use crate::ipc::command_ring::{CommandRing, TO_DRIVER_CAPACITY};
use crate::ipc::shmem::{self, Creator, Opener, Shm, ShmError};
use crate::resolver::NameResolver;
use crate::runtime::clock::epoch_millis;
use crate::runtime::driver::{DriverConfig, DriverError};
use crate::trace::{debug, info, warn};

/// Commands applied per duty cycle, so a flood from one client cannot
/// starve liveness checks and gossip.
const COMMAND_LIMIT: usize = 64;

const HEARTBEAT_INTERVAL_MS: i64 = 100;

/// How long an existing directory without a ready header may still be
/// starting up before it counts as abandoned.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// State and duty cycle of one driver.
pub struct DriverConductor {
    paths: DriverPaths,
    store: CounterStore,
    commands: CommandRing<ClientCommand, TO_DRIVER_CAPACITY, Creator>,
    events: BroadcastTransmitter<TO_CLIENTS_CAPACITY>,
    liveness: ClientLivenessTracker,
    resolver: Option<NameResolver>,
    cnc: Shm<CncHeader, Creator>,
    last_heartbeat_ms: i64,
}

impl DriverConductor {
    /// Creates every shared memory object, then publishes the control
    /// header so clients only see a fully built driver.
    ///
    /// # Errors
    ///
    /// See [`Driver::spawn`](crate::runtime::driver::Driver::spawn).
    pub fn new(config: &DriverConfig) -> Result<Self, DriverError> {
        config.validate()?;
        let paths = DriverPaths::new(&config.directory)?;

        if config.delete_stale_on_start {
            remove_objects(&paths);
        }

        match Self::create(config, &paths) {
            Err(DriverError::AlreadyRunning(_)) if !previous_driver_alive(&paths) => {
                warn!(
                    directory = %config.directory,
                    "previous driver stopped beating, reclaiming its directory"
                );
                remove_objects(&paths);
                Self::create(config, &paths)
            }
            result => result,
        }
    }

    fn create(config: &DriverConfig, paths: &DriverPaths) -> Result<Self, DriverError> {
        let already_running = |err: ShmError| match err.errno() {
            Some(errno) if errno == Errno::EXIST => {
                DriverError::AlreadyRunning(config.directory.clone())
            }
            _ => DriverError::Shm(err),
        };

        let counters = ShmCounters::<Creator>::create(
            &paths.counters_metadata,
            &paths.counters_values,
            config.counters_capacity,
        )
        .map_err(already_running)?;
        let mut store = CounterStore::new(Arc::new(counters), config.counter_reuse_timeout);

        let commands = CommandRing::<ClientCommand, TO_DRIVER_CAPACITY, Creator>::create(
            &paths.to_driver,
        )
        .map_err(already_running)?;
        let events =
            BroadcastTransmitter::<TO_CLIENTS_CAPACITY>::create(&paths.to_clients)
                .map_err(already_running)?;

        let now_ms = epoch_millis();
        let resolver = config
            .resolver
            .as_ref()
            .map(|resolver| NameResolver::new(resolver, &mut store, now_ms))
            .transpose()?;

        let cnc = Shm::<CncHeader, Creator>::create(&paths.cnc).map_err(already_running)?;
        cnc.publish(
            config.counters_capacity,
            config.client_liveness_timeout,
            now_ms,
        );

        info!(
            directory = %config.directory,
            capacity = config.counters_capacity,
            "driver conductor ready"
        );
        Ok(Self {
            paths: paths.clone(),
            store,
            commands,
            events,
            liveness: ClientLivenessTracker::new(config.client_liveness_timeout),
            resolver,
            cnc,
            last_heartbeat_ms: now_ms,
        })
    }

    /// One duty cycle. Returns the amount of work done.
    pub fn do_work(&mut self) -> usize {
        let now = Instant::now();
        let now_ms = epoch_millis();

        let mut work = self.process_commands(now);
        work += self.check_liveness(now);
        self.heartbeat(now_ms);
        if let Some(resolver) = &mut self.resolver {
            work += resolver.do_work(now_ms);
        }
        work
    }

    fn process_commands(&mut self, now: Instant) -> usize {
        let mut processed = 0;
        while processed < COMMAND_LIMIT {
            let Some(command) = self.commands.pop() else {
                break;
            };
            self.on_command(command, now);
            processed += 1;
        }
        processed
    }

    fn on_command(&mut self, command: ClientCommand, now: Instant) {
        let client = command.client();
        if client == ClientId::DRIVER {
            warn!("command carrying the driver's own id ignored");
            return;
        }
        if self.liveness.on_activity(client, now) == Activity::Dead {
            debug!(%client, "command from timed out client ignored");
            self.send(DriverEvent::ClientTimeout { client });
            return;
        }

        match command {
            ClientCommand::Keepalive { .. } => {}
            ClientCommand::AddCounter {
                correlation, spec, ..
            } => {
                let event = match self
                    .store
                    .allocate(spec.type_id, spec.key(), &spec.label(), client)
                {
                    Ok(allocated) => DriverEvent::CounterReady {
                        client,
                        correlation,
                        counter: allocated.id,
                        registration_id: allocated.registration_id,
                    },
                    Err(e) => {
                        warn!(%client, %correlation, error = %e, "add counter failed");
                        DriverEvent::Error {
                            client,
                            correlation,
                            code: ErrorCode::from(&e),
                        }
                    }
                };
                self.send(event);
            }
            ClientCommand::RemoveCounter {
                correlation,
                counter,
                ..
            } => {
                let event = match self.store.free(counter, client) {
                    Ok(_) => DriverEvent::OperationSucceeded {
                        client,
                        correlation,
                    },
                    Err(e) => {
                        debug!(%client, %counter, error = %e, "remove counter failed");
                        DriverEvent::Error {
                            client,
                            correlation,
                            code: ErrorCode::from(&e),
                        }
                    }
                };
                self.send(event);
            }
            ClientCommand::CloseClient { .. } => {
                self.liveness.on_close(client, now);
                self.store.reclaim_all_for(client);
            }
        }
    }

    fn check_liveness(&mut self, now: Instant) -> usize {
        let store = &mut self.store;
        let events = &self.events;
        self.liveness.sweep(now, |client| {
            store.reclaim_all_for(client);
            events.transmit(&DriverEvent::ClientTimeout { client }.encode());
        })
    }

    fn heartbeat(&mut self, now_ms: i64) {
        if now_ms - self.last_heartbeat_ms >= HEARTBEAT_INTERVAL_MS {
            self.cnc.beat(now_ms);
            self.last_heartbeat_ms = now_ms;
        }
    }

    fn send(&self, event: DriverEvent) {
        self.events.transmit(&event.encode());
    }

    #[must_use]
    pub fn paths(&self) -> &DriverPaths {
        &self.paths
    }

    #[must_use]
    pub fn counters(&self) -> CountersReader {
        self.store.reader().clone()
    }

    #[must_use]
    pub fn store(&self) -> &CounterStore {
        &self.store
    }

    #[must_use]
    pub fn liveness(&self) -> &ClientLivenessTracker {
        &self.liveness
    }

    #[must_use]
    pub fn resolver(&self) -> Option<&NameResolver> {
        self.resolver.as_ref()
    }
}

impl Drop for DriverConductor {
    fn drop(&mut self) {
        self.cnc.retire();
        if let Some(resolver) = self.resolver.take() {
            resolver.close(&mut self.store);
        }
        info!(directory = %self.paths.cnc, "driver conductor closed");
    }
}

fn remove_objects(paths: &DriverPaths) {
    for path in paths.all() {
        if shmem::unlink(path) {
            warn!(%path, "removed stale shared memory object");
        }
    }
}

/// Whether the driver that created `paths` still beats.
///
/// A header that is missing or not yet ready gets [`STARTUP_GRACE`] to
/// appear, since a driver publishes it last. A ready header is judged by the
/// client liveness timeout its driver published.
fn previous_driver_alive(paths: &DriverPaths) -> bool {
    let deadline = Instant::now() + STARTUP_GRACE;
    loop {
        match Shm::<CncHeader, Opener>::open(&paths.cnc) {
            Ok(cnc) if cnc.is_ready() => {
                return cnc.is_driver_alive(epoch_millis(), cnc.client_liveness_timeout());
            }
            Ok(_) | Err(ShmError::SizeMismatch { .. }) => {}
            Err(e) if e.errno() == Some(Errno::NOENT) => {}
            Err(e) => {
                debug!(error = %e, "cannot inspect existing control header");
                return true;
            }
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
