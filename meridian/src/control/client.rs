//! Client side of the driver protocol.
//!
//! A [`Client`] maps the driver's shared memory, sends commands through the
//! command ring and reads answers from the broadcast buffer. Everything that
//! happens to counters, in this process or any other, is reported through
//! the handlers registered on it when [`Client::poll`] runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use minstant::Instant;
use rustix::io::Errno;
use thiserror::Error;

use crate::control::cnc::{CNC_VERSION, CncHeader};
use crate::control::types::{
    ClientCommand, ClientId, CorrelationId, CounterSpec, DriverEvent, DriverPaths, ErrorCode,
    Rejection,
};
use crate::counters::observer::{Handler, HandlerId};
use crate::counters::{
    AtomicCounter, CounterError, CounterId, CounterListener, CounterObserver, CounterTypeId,
    CountersReader, RegistrationId, ShmCounters,
};
use crate::ipc::broadcast::{BroadcastReceiver, TO_CLIENTS_CAPACITY};
use crate::ipc::command_ring::{CommandRing, TO_DRIVER_CAPACITY};
use crate::ipc::shmem::{Opener, Shm, ShmError};
use crate::runtime::clock::epoch_millis;
use crate::runtime::idle::{IdleStrategy, Idler};
use crate::trace::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Directory of the driver to connect to.
    pub directory: String,
    pub keepalive_interval: Duration,
    /// How long to wait for a driver to appear, and how stale its heartbeat
    /// may get before it is considered gone.
    pub driver_timeout: Duration,
    /// How long [`Client::add_counter`] waits for the driver's answer.
    pub response_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            directory: "default".into(),
            keepalive_interval: Duration::from_millis(500),
            driver_timeout: Duration::from_secs(10),
            response_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("no live driver in directory {0:?}")]
    DriverUnavailable(String),
    #[error("driver layout version {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },
    #[error("no answer to command {0} in time")]
    Timeout(CorrelationId),
    #[error(transparent)]
    Rejected(#[from] Rejection),
    #[error("driver declared this client dead")]
    TimedOutByDriver,
    #[error("shared memory: {0}")]
    Shm(#[from] ShmError),
    #[error(transparent)]
    Counter(#[from] CounterError),
    #[error("client is closed")]
    Closed,
    #[error("driver command ring is full")]
    RingFull,
    #[error("failed to spawn client agent: {0}")]
    Spawn(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
enum Response {
    Ready {
        counter: CounterId,
        registration_id: RegistrationId,
    },
    Succeeded,
    Failed(ErrorCode),
}

enum Pending {
    /// A caller is waiting; the answer is parked here until it looks.
    Awaited(Option<Response>),
    /// Nobody waits; the entry only tracks that the command is in flight.
    Detached,
}

/// Command ring end, event receiver and in-flight commands.
struct Conductor {
    commands: CommandRing<ClientCommand, TO_DRIVER_CAPACITY, Opener>,
    events: BroadcastReceiver<TO_CLIENTS_CAPACITY>,
    pending: HashMap<CorrelationId, Pending>,
    last_keepalive: Instant,
    timed_out: bool,
}

enum HandlerOp {
    Add(HandlerId, Handler),
    Remove(HandlerId),
}

struct ClientInner {
    id: ClientId,
    config: ClientConfig,
    cnc: Shm<CncHeader, Opener>,
    counters: CountersReader,
    conductor: Mutex<Conductor>,
    observer: Mutex<CounterObserver>,
    handler_ops: Mutex<Vec<HandlerOp>>,
    next_correlation: AtomicI64,
    closed: AtomicBool,
    agent: Mutex<Option<JoinHandle<()>>>,
}

/// Connection to a driver. Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Waits for the driver's control header, checks the driver is alive and
    /// maps its shared memory.
    ///
    /// # Errors
    ///
    /// - [`ClientError::DriverUnavailable`] if no driver became ready within
    ///   `driver_timeout`, or its heartbeat is stale
    /// - [`ClientError::VersionMismatch`] for a driver of another layout
    /// - [`ClientError::Shm`] for other shared memory failures
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let paths = DriverPaths::new(&config.directory)?;
        let cnc = wait_for_driver(&paths, &config)?;

        if cnc.version() != CNC_VERSION {
            return Err(ClientError::VersionMismatch {
                found: cnc.version(),
                expected: CNC_VERSION,
            });
        }
        if !cnc.is_driver_alive(epoch_millis(), config.driver_timeout) {
            return Err(ClientError::DriverUnavailable(config.directory));
        }

        let counters = ShmCounters::<Opener>::open(&paths.counters_metadata, &paths.counters_values)?;
        let events = BroadcastReceiver::open(&paths.to_clients)?;
        let commands = CommandRing::open(&paths.to_driver)?;

        let id = ClientId::generate();
        let conductor = Conductor {
            commands,
            events,
            pending: HashMap::new(),
            last_keepalive: Instant::now(),
            timed_out: false,
        };
        conductor
            .commands
            .push(ClientCommand::Keepalive { client: id })
            .map_err(|_| ClientError::RingFull)?;

        info!(client = %id, directory = %config.directory, "client connected");
        Ok(Self {
            inner: Arc::new(ClientInner {
                id,
                config,
                cnc,
                counters: CountersReader::new(Arc::new(counters)),
                conductor: Mutex::new(conductor),
                observer: Mutex::new(CounterObserver::new()),
                handler_ops: Mutex::new(Vec::new()),
                next_correlation: AtomicI64::new(1),
                closed: AtomicBool::new(false),
                agent: Mutex::new(None),
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> ClientId {
        self.inner.id
    }

    /// Reader over the driver's counters region.
    #[must_use]
    pub fn counters(&self) -> CountersReader {
        self.inner.counters.clone()
    }

    /// Asks the driver for a counter and waits for the answer.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Counter`] if `key` is too long
    /// - [`ClientError::Rejected`] if the driver refused, e.g. the region is full
    /// - [`ClientError::Timeout`] if no answer arrived within `response_timeout`
    /// - [`ClientError::Closed`] / [`ClientError::TimedOutByDriver`] if this
    ///   client can no longer issue commands
    pub fn add_counter(
        &self,
        type_id: CounterTypeId,
        key: &[u8],
        label: &str,
    ) -> Result<Counter, ClientError> {
        let spec = CounterSpec::new(type_id, key, label)?;
        let correlation = self.send(
            |client, correlation| ClientCommand::AddCounter {
                client,
                correlation,
                spec,
            },
            Pending::Awaited(None),
        )?;

        match self.await_response(correlation)? {
            Response::Ready {
                counter,
                registration_id,
            } => {
                let value = AtomicCounter::new(
                    Arc::clone(self.inner.counters.buffer()),
                    counter,
                    registration_id,
                )?;
                Ok(Counter {
                    client: self.clone(),
                    value,
                    closed: AtomicBool::new(false),
                })
            }
            Response::Failed(code) => Err(Rejection { correlation, code }.into()),
            Response::Succeeded => Err(Rejection {
                correlation,
                code: ErrorCode::Generic,
            }
            .into()),
        }
    }

    /// Registers a callback for counters becoming available in any process.
    /// Takes effect on the next [`poll`](Self::poll).
    pub fn add_available_counter_handler(
        &self,
        handler: impl FnMut(&CountersReader, RegistrationId, CounterId) + Send + 'static,
    ) -> HandlerId {
        self.queue_handler(Handler::Available(Box::new(handler)))
    }

    /// Registers a callback for counters becoming unavailable.
    /// Takes effect on the next [`poll`](Self::poll).
    pub fn add_unavailable_counter_handler(
        &self,
        handler: impl FnMut(&CountersReader, RegistrationId, CounterId) + Send + 'static,
    ) -> HandlerId {
        self.queue_handler(Handler::Unavailable(Box::new(handler)))
    }

    pub fn add_counter_listener(&self, listener: impl CounterListener + 'static) -> HandlerId {
        self.queue_handler(Handler::Listener(Box::new(listener)))
    }

    /// Removes a handler. Takes effect on the next [`poll`](Self::poll).
    pub fn remove_handler(&self, id: HandlerId) {
        lock(&self.inner.handler_ops).push(HandlerOp::Remove(id));
    }

    fn queue_handler(&self, handler: Handler) -> HandlerId {
        let id = HandlerId::next();
        lock(&self.inner.handler_ops).push(HandlerOp::Add(id, handler));
        id
    }

    /// Sends a keepalive when due, processes driver events and dispatches
    /// counter handlers. Returns the amount of work done.
    ///
    /// A poll made from inside a handler skips dispatch.
    ///
    /// # Errors
    ///
    /// [`ClientError::DriverUnavailable`] if the driver's heartbeat went
    /// stale, [`ClientError::TimedOutByDriver`] if the driver gave up on this
    /// client, [`ClientError::Closed`] after [`close`](Self::close).
    pub fn poll(&self) -> Result<usize, ClientError> {
        self.ensure_open()?;
        let mut work = self.service_conductor()?;
        work += self.dispatch_counters();
        Ok(work)
    }

    /// True while any command sent by this client awaits the driver's answer.
    #[must_use]
    pub fn has_active_commands(&self) -> bool {
        lock(&self.inner.conductor).pending.values().any(|pending| {
            matches!(pending, Pending::Awaited(None) | Pending::Detached)
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Tells the driver this client is leaving, which frees every counter
    /// it still owns, and stops the agent thread. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.send_close();
        let agent = lock(&self.inner.agent).take();
        // The agent may be closing the client from one of its own handlers.
        if let Some(handle) = agent
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            warn!(client = %self.inner.id, "client agent panicked");
        }
        info!(client = %self.inner.id, "client closed");
    }

    /// Polls from a background thread until the client is closed or every
    /// handle to it is dropped. Does nothing if an agent already runs.
    ///
    /// # Errors
    ///
    /// [`ClientError::Closed`] after [`close`](Self::close),
    /// [`ClientError::Spawn`] if the thread cannot be started.
    pub fn start_agent(&self, idle: IdleStrategy) -> Result<(), ClientError> {
        self.ensure_open()?;
        let mut agent = lock(&self.inner.agent);
        if agent.is_some() {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = thread::Builder::new()
            .name(format!("meridian-client-{}", self.inner.id))
            .spawn(move || run_agent(&weak, idle))
            .map_err(ClientError::Spawn)?;
        *agent = Some(handle);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    fn send(
        &self,
        command: impl FnOnce(ClientId, CorrelationId) -> ClientCommand,
        pending: Pending,
    ) -> Result<CorrelationId, ClientError> {
        self.ensure_open()?;
        let correlation = CorrelationId::new(self.inner.next_correlation.fetch_add(1, Ordering::Relaxed));
        let mut conductor = lock(&self.inner.conductor);
        if conductor.timed_out {
            return Err(ClientError::TimedOutByDriver);
        }
        conductor
            .commands
            .push(command(self.inner.id, correlation))
            .map_err(|_| ClientError::RingFull)?;
        conductor.pending.insert(correlation, pending);
        conductor.last_keepalive = Instant::now();
        Ok(correlation)
    }

    fn await_response(&self, correlation: CorrelationId) -> Result<Response, ClientError> {
        let deadline = Instant::now() + self.inner.config.response_timeout;
        let mut idler = Idler::new(IdleStrategy::default());
        loop {
            let work = match self.service_conductor() {
                Ok(work) => work,
                Err(e) => {
                    lock(&self.inner.conductor).pending.remove(&correlation);
                    return Err(e);
                }
            };
            {
                let mut conductor = lock(&self.inner.conductor);
                if let Some(Pending::Awaited(Some(response))) = conductor.pending.get(&correlation) {
                    let response = *response;
                    conductor.pending.remove(&correlation);
                    return Ok(response);
                }
                if conductor.timed_out {
                    conductor.pending.remove(&correlation);
                    return Err(ClientError::TimedOutByDriver);
                }
                if Instant::now() >= deadline {
                    conductor.pending.remove(&correlation);
                    return Err(ClientError::Timeout(correlation));
                }
            }
            idler.idle(work);
        }
    }

    fn service_conductor(&self) -> Result<usize, ClientError> {
        let inner = &self.inner;
        if !inner
            .cnc
            .is_driver_alive(epoch_millis(), inner.config.driver_timeout)
        {
            return Err(ClientError::DriverUnavailable(inner.config.directory.clone()));
        }

        let mut conductor = lock(&inner.conductor);
        let mut work = 0;

        let now = Instant::now();
        if !conductor.timed_out
            && now.saturating_duration_since(conductor.last_keepalive) >= inner.config.keepalive_interval
        {
            if conductor
                .commands
                .push(ClientCommand::Keepalive { client: inner.id })
                .is_ok()
            {
                conductor.last_keepalive = now;
                work += 1;
            } else {
                debug!(client = %inner.id, "command ring full, keepalive deferred");
            }
        }

        while let Some(words) = conductor.events.receive() {
            work += 1;
            let Some(event) = DriverEvent::decode(&words) else {
                warn!(client = %inner.id, kind = words[0], "unknown driver event");
                continue;
            };
            if event.client() != inner.id {
                continue;
            }
            conductor.on_event(inner.id, event);
        }

        if conductor.timed_out {
            return Err(ClientError::TimedOutByDriver);
        }
        Ok(work)
    }

    fn dispatch_counters(&self) -> usize {
        let mut observer = match self.inner.observer.try_lock() {
            Ok(observer) => observer,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return 0,
        };

        let ops = std::mem::take(&mut *lock(&self.inner.handler_ops));
        for op in ops {
            match op {
                HandlerOp::Add(id, handler) => observer.insert(id, handler),
                HandlerOp::Remove(id) => {
                    observer.remove(id);
                }
            }
        }
        observer.poll(&self.inner.counters)
    }
}

impl Conductor {
    fn on_event(&mut self, client: ClientId, event: DriverEvent) {
        let (correlation, response) = match event {
            DriverEvent::CounterReady {
                correlation,
                counter,
                registration_id,
                ..
            } => (
                correlation,
                Response::Ready {
                    counter,
                    registration_id,
                },
            ),
            DriverEvent::OperationSucceeded { correlation, .. } => (correlation, Response::Succeeded),
            DriverEvent::Error {
                correlation, code, ..
            } => (correlation, Response::Failed(code)),
            DriverEvent::ClientTimeout { .. } => {
                if !self.timed_out {
                    warn!(%client, "driver declared this client timed out");
                }
                self.timed_out = true;
                self.pending.retain(|_, pending| matches!(pending, Pending::Awaited(_)));
                return;
            }
        };

        match self.pending.get_mut(&correlation) {
            Some(Pending::Awaited(slot)) => *slot = Some(response),
            Some(Pending::Detached) => {
                if let Response::Failed(code) = response {
                    debug!(%client, %correlation, %code, "detached command failed");
                }
                self.pending.remove(&correlation);
            }
            None => debug!(%client, %correlation, "answer to unknown command"),
        }
    }
}

impl ClientInner {
    fn send_close(&self) {
        let conductor = lock(&self.conductor);
        if conductor.timed_out {
            return;
        }
        if conductor
            .commands
            .push(ClientCommand::CloseClient { client: self.id })
            .is_err()
        {
            warn!(client = %self.id, "command ring full, driver will time this client out");
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.send_close();
            debug!(client = %self.id, "client dropped without close");
        }
    }
}

fn run_agent(weak: &Weak<ClientInner>, idle: IdleStrategy) {
    let mut idler = Idler::new(idle);
    loop {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let client = Client { inner };
        if client.is_closed() {
            return;
        }
        match client.poll() {
            Ok(work) => {
                drop(client);
                idler.idle(work);
            }
            Err(ClientError::Closed) => return,
            Err(e) => {
                warn!(client = %client.id(), error = %e, "client agent stopping");
                return;
            }
        }
    }
}

fn wait_for_driver(
    paths: &DriverPaths,
    config: &ClientConfig,
) -> Result<Shm<CncHeader, Opener>, ClientError> {
    let deadline = Instant::now() + config.driver_timeout;
    loop {
        match Shm::<CncHeader, Opener>::open(&paths.cnc) {
            Ok(cnc) if cnc.is_ready() => return Ok(cnc),
            Ok(_) | Err(ShmError::SizeMismatch { .. }) => {}
            Err(e) if e.errno() == Some(Errno::NOENT) => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            return Err(ClientError::DriverUnavailable(config.directory.clone()));
        }
        thread::sleep(Duration::from_millis(1));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A counter this client allocated.
///
/// Dropping a `Counter` does not free it; call [`close`](Self::close), or
/// close the client, which frees every counter it owns.
pub struct Counter {
    client: Client,
    value: AtomicCounter,
    closed: AtomicBool,
}

impl Counter {
    #[must_use]
    pub fn id(&self) -> CounterId {
        self.value.id()
    }

    #[must_use]
    pub fn registration_id(&self) -> RegistrationId {
        self.value.registration_id()
    }

    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.get()
    }

    pub fn set(&self, value: i64) {
        self.value.set(value);
    }

    /// Returns the previous value.
    pub fn increment(&self) -> i64 {
        self.value.increment()
    }

    /// Returns the previous value.
    pub fn add(&self, delta: i64) -> i64 {
        self.value.add(delta)
    }

    /// Asks the driver to free this counter. Returns once the request is
    /// queued; the slot becomes unavailable asynchronously. Idempotent.
    ///
    /// # Errors
    ///
    /// [`ClientError::RingFull`] if the request could not be queued, in which
    /// case the counter stays open and the call may be retried.
    pub fn close(&self) -> Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.client.is_closed() || !self.value.is_live() {
            return Ok(());
        }
        let counter = self.value.id();
        let sent = self.client.send(
            |client, correlation| ClientCommand::RemoveCounter {
                client,
                correlation,
                counter,
            },
            Pending::Detached,
        );
        match sent {
            Ok(_) | Err(ClientError::TimedOutByDriver) => Ok(()),
            Err(e) => {
                self.closed.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    /// True after [`close`](Self::close), or once the driver freed the slot
    /// for any other reason.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || !self.value.is_live()
    }
}

impl std::fmt::Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Counter")
            .field("id", &self.id())
            .field("registration_id", &self.registration_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
