//! Driver runtime: the conductor thread and its configuration.
//!
//! # Architecture
//!
//! One driver per directory owns the shared memory a set of clients maps:
//!
//! ```text
//!  client ──AddCounter/RemoveCounter/Keepalive──▶ command ring ──▶ ┐
//!  client ──────────────────────────────────────▶               ──▶ │ conductor
//!  client ◀──CounterReady/Error/ClientTimeout── broadcast buffer ◀─┘   thread
//!                                                                       │
//!  every process ◀──────── counters region (metadata + values) ◀────────┤
//!  peer drivers ◀──────────────── gossip over UDP ──────────────────────┘
//! ```
//!
//! The conductor is the only writer of counter metadata. It applies client
//! commands, declares silent clients dead, reclaims their counters, keeps
//! the control header's heartbeat fresh and drives the name resolver.
//!
//! # Example
//!
//! ```ignore
//! use meridian::runtime::driver::{Driver, DriverConfig};
//!
//! let driver = Driver::spawn(DriverConfig {
//!     directory: "node-a".into(),
//!     ..DriverConfig::default()
//! })?;
//!
//! // ... clients connect with the same directory ...
//!
//! driver.shutdown();
//! ```

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::control::conductor::DriverConductor;
use crate::counters::{CounterError, CountersReader};
use crate::ipc::shmem::ShmError;
use crate::net::Endpoint;
use crate::resolver::{ResolvedNames, ResolverConfig, ResolverError};
use crate::trace::{debug, info, warn};

use super::idle::{IdleStrategy, Idler};
use super::topology::{CpuConfig, pin_to_core};

/// Driver startup parameters.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Names this driver's shared memory objects. Clients connect with the
    /// same value.
    pub directory: String,
    pub counters_capacity: usize,
    /// A client silent for longer than this is declared dead.
    pub client_liveness_timeout: Duration,
    /// How long a freed counter slot stays reclaimed before reuse.
    pub counter_reuse_timeout: Duration,
    /// Remove existing objects before creating new ones, without checking
    /// for a live driver. Without it, objects are only reclaimed once the
    /// previous driver's heartbeat is stale.
    pub delete_stale_on_start: bool,
    pub resolver: Option<ResolverConfig>,
    pub cpu: CpuConfig,
    pub idle: IdleStrategy,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            directory: "default".into(),
            counters_capacity: 1024,
            client_liveness_timeout: Duration::from_secs(10),
            counter_reuse_timeout: Duration::from_secs(1),
            delete_stale_on_start: false,
            resolver: None,
            cpu: CpuConfig::default(),
            idle: IdleStrategy::default(),
        }
    }
}

impl DriverConfig {
    /// # Errors
    ///
    /// [`DriverError::InvalidConfig`] naming the first bad parameter.
    pub fn validate(&self) -> Result<(), DriverError> {
        if self.counters_capacity == 0 {
            return Err(DriverError::InvalidConfig("counters_capacity must be > 0"));
        }
        if self.client_liveness_timeout.is_zero() {
            return Err(DriverError::InvalidConfig(
                "client_liveness_timeout must be > 0",
            ));
        }
        if let Some(resolver) = &self.resolver {
            if resolver.gossip_interval.is_zero() {
                return Err(DriverError::InvalidConfig("gossip_interval must be > 0"));
            }
            if resolver.neighbor_timeout <= resolver.gossip_interval {
                return Err(DriverError::InvalidConfig(
                    "neighbor_timeout must exceed gossip_interval",
                ));
            }
        }
        Ok(())
    }
}

/// Error spawning the driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("failed to bind resolver socket: {0}")]
    Bind(#[source] io::Error),
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),
    #[error("a driver is already running in directory {0:?}")]
    AlreadyRunning(String),
    #[error("invalid driver configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("counters: {0}")]
    Counters(#[from] CounterError),
    #[error("resolver: {0}")]
    Resolver(ResolverError),
    #[error("failed to spawn conductor thread: {0}")]
    Spawn(#[source] io::Error),
}

impl From<ResolverError> for DriverError {
    fn from(err: ResolverError) -> Self {
        match err {
            ResolverError::Io(e) => Self::Bind(e),
            ResolverError::Counters(e) => Self::Counters(e),
            other => Self::Resolver(other),
        }
    }
}

/// Handle to a running driver.
///
/// Dropping the handle stops the conductor and waits for it, which removes
/// the driver's shared memory objects.
pub struct Driver {
    directory: String,
    counters: CountersReader,
    resolver_endpoint: Option<Endpoint>,
    resolved_names: Option<ResolvedNames>,
    shutdown_flag: Arc<AtomicBool>,
    conductor_handle: Option<JoinHandle<()>>,
}

impl Driver {
    /// Creates the shared memory objects and starts the conductor thread.
    ///
    /// # Errors
    ///
    /// - [`DriverError::InvalidConfig`] for a bad configuration
    /// - [`DriverError::AlreadyRunning`] if a driver with a fresh heartbeat
    ///   owns the directory
    /// - [`DriverError::Bind`] if the resolver socket cannot be bound
    /// - [`DriverError::Shm`] for other shared memory failures
    pub fn spawn(config: DriverConfig) -> Result<Self, DriverError> {
        info!(
            directory = %config.directory,
            counters_capacity = config.counters_capacity,
            client_liveness_timeout_ms = config.client_liveness_timeout.as_millis() as u64,
            resolver = ?config.resolver.as_ref().map(|r| &r.name),
            "driver starting"
        );

        let conductor = DriverConductor::new(&config)?;
        let counters = conductor.counters();
        let resolver_endpoint = conductor.resolver().map(|r| r.local_endpoint());
        let resolved_names = conductor.resolver().map(|r| r.resolved_names());

        let shutdown_flag = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown_flag);
        let core = config.cpu.resolve();
        let idle = config.idle;

        debug!("spawning conductor thread");
        let conductor_handle = thread::Builder::new()
            .name("meridian-conductor".into())
            .spawn(move || {
                if let Some(core) = core {
                    if pin_to_core(core) {
                        debug!(core, "conductor pinned");
                    } else {
                        warn!(core, "failed to pin conductor");
                    }
                }
                info!("conductor thread started");
                run_conductor(conductor, &flag, idle);
                info!("conductor thread exiting");
            })
            .map_err(DriverError::Spawn)?;

        info!(directory = %config.directory, "driver started");
        Ok(Self {
            directory: config.directory,
            counters,
            resolver_endpoint,
            resolved_names,
            shutdown_flag,
            conductor_handle: Some(conductor_handle),
        })
    }

    #[must_use]
    pub fn directory(&self) -> &str {
        &self.directory
    }

    /// Reader over this driver's counters region.
    #[must_use]
    pub fn counters(&self) -> CountersReader {
        self.counters.clone()
    }

    /// Address the resolver's gossip socket is bound to, if one runs.
    #[must_use]
    pub fn resolver_endpoint(&self) -> Option<Endpoint> {
        self.resolver_endpoint
    }

    /// Address of the node gossiping under `name`, as of the conductor's
    /// last resolver cycle.
    ///
    /// # Errors
    ///
    /// [`ResolverError::NotConfigured`] if this driver runs no resolver,
    /// [`ResolverError::NotFound`] if no live node carries that name.
    pub fn resolve(&self, name: &str) -> Result<Endpoint, ResolverError> {
        self.resolved_names
            .as_ref()
            .ok_or(ResolverError::NotConfigured)?
            .resolve(name)
    }

    /// Flag that stops the conductor when set, for signal handlers.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown_flag)
    }

    /// Stops the conductor and waits for it to release shared memory.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shutdown_flag.store(true, Ordering::Release);
        if let Some(handle) = self.conductor_handle.take() {
            info!(directory = %self.directory, "driver shutdown initiated");
            if handle.join().is_err() {
                warn!("conductor thread panicked");
            }
            info!(directory = %self.directory, "driver shutdown complete");
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_conductor(mut conductor: DriverConductor, shutdown: &AtomicBool, idle: IdleStrategy) {
    let mut idler = Idler::new(idle);
    while !shutdown.load(Ordering::Acquire) {
        let work = conductor.do_work();
        idler.idle(work);
    }
}
