//! Per-process lifecycle notifications for counters.
//!
//! Each process keeps its own array of the registration it last saw in every
//! slot. A poll walks the region once and reports the difference:
//!
//! | last seen | now      | dispatched                          |
//! |-----------|----------|-------------------------------------|
//! | none      | `r`      | available(`r`)                      |
//! | `r`       | none     | unavailable(`r`)                    |
//! | `r`       | `r'`     | unavailable(`r`), available(`r'`)   |
//!
//! so every observed registration produces at most one available and one
//! unavailable notification per process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::reader::CountersReader;
use super::{CounterId, RegistrationId};

/// Receiver of counter lifecycle notifications.
///
/// Called on the polling thread. Implementations must not block; they may
/// read counters and construct [`ReadableCounter`](super::ReadableCounter)s.
pub trait CounterListener: Send {
    fn on_available(&mut self, reader: &CountersReader, registration_id: RegistrationId, id: CounterId);

    fn on_unavailable(
        &mut self,
        _reader: &CountersReader,
        _registration_id: RegistrationId,
        _id: CounterId,
    ) {
    }
}

pub(crate) type Callback = Box<dyn FnMut(&CountersReader, RegistrationId, CounterId) + Send>;

pub(crate) enum Handler {
    Listener(Box<dyn CounterListener>),
    Available(Callback),
    Unavailable(Callback),
}

/// Identifies a registered handler for removal. Unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl HandlerId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler-{}", self.0)
    }
}

/// Detects counters appearing and disappearing and dispatches handlers.
#[derive(Default)]
pub struct CounterObserver {
    seen: Box<[RegistrationId]>,
    handlers: Vec<(HandlerId, Handler)>,
}

impl CounterObserver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, handler: Handler) -> HandlerId {
        let id = HandlerId::next();
        self.insert(id, handler);
        id
    }

    /// Registers a handler under an id reserved earlier.
    pub(crate) fn insert(&mut self, id: HandlerId, handler: Handler) {
        self.handlers.push((id, handler));
    }

    pub fn add_listener(&mut self, listener: impl CounterListener + 'static) -> HandlerId {
        self.register(Handler::Listener(Box::new(listener)))
    }

    pub fn add_available_handler(
        &mut self,
        handler: impl FnMut(&CountersReader, RegistrationId, CounterId) + Send + 'static,
    ) -> HandlerId {
        self.register(Handler::Available(Box::new(handler)))
    }

    pub fn add_unavailable_handler(
        &mut self,
        handler: impl FnMut(&CountersReader, RegistrationId, CounterId) + Send + 'static,
    ) -> HandlerId {
        self.register(Handler::Unavailable(Box::new(handler)))
    }

    /// Returns false if no handler had this id.
    pub fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(handler_id, _)| *handler_id != id);
        self.handlers.len() != before
    }

    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Registration last seen in slot `id`, if any.
    #[must_use]
    pub fn last_seen(&self, id: CounterId) -> Option<RegistrationId> {
        self.seen
            .get(id.index())
            .copied()
            .filter(|registration| *registration != RegistrationId::NULL)
    }

    /// Diffs the region against the last poll and dispatches handlers.
    ///
    /// Returns the number of notifications dispatched.
    pub fn poll(&mut self, reader: &CountersReader) -> usize {
        if self.seen.len() != reader.capacity() {
            self.seen = vec![RegistrationId::NULL; reader.capacity()].into_boxed_slice();
        }

        let mut dispatched = 0;
        for index in 0..self.seen.len() {
            let id = CounterId::new(index as u32);
            let current = reader
                .live_registration(id)
                .unwrap_or(RegistrationId::NULL);
            let previous = self.seen[index];
            if current == previous {
                continue;
            }

            self.seen[index] = current;
            if previous != RegistrationId::NULL {
                self.dispatch_unavailable(reader, previous, id);
                dispatched += 1;
            }
            if current != RegistrationId::NULL {
                self.dispatch_available(reader, current, id);
                dispatched += 1;
            }
        }
        dispatched
    }

    fn dispatch_available(&mut self, reader: &CountersReader, registration: RegistrationId, id: CounterId) {
        for (_, handler) in &mut self.handlers {
            match handler {
                Handler::Listener(listener) => listener.on_available(reader, registration, id),
                Handler::Available(callback) => callback(reader, registration, id),
                Handler::Unavailable(_) => {}
            }
        }
    }

    fn dispatch_unavailable(&mut self, reader: &CountersReader, registration: RegistrationId, id: CounterId) {
        for (_, handler) in &mut self.handlers {
            match handler {
                Handler::Listener(listener) => listener.on_unavailable(reader, registration, id),
                Handler::Unavailable(callback) => callback(reader, registration, id),
                Handler::Available(_) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::types::ClientId;
    use crate::counters::{CounterStore, CounterTypeId, ReadableCounter};
    use std::sync::{Arc, Mutex};

    const TYPE: CounterTypeId = CounterTypeId::new(1101);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Available(RegistrationId, CounterId),
        Unavailable(RegistrationId, CounterId),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Event>>>);

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            self.0.lock().unwrap().clone()
        }
    }

    impl CounterListener for Recorder {
        fn on_available(&mut self, _: &CountersReader, registration: RegistrationId, id: CounterId) {
            self.0.lock().unwrap().push(Event::Available(registration, id));
        }

        fn on_unavailable(&mut self, _: &CountersReader, registration: RegistrationId, id: CounterId) {
            self.0.lock().unwrap().push(Event::Unavailable(registration, id));
        }
    }

    #[test]
    fn test_allocate_then_free_dispatches_once_each() {
        let mut store = CounterStore::with_heap(4);
        let mut observer = CounterObserver::new();
        let recorder = Recorder::default();
        observer.add_listener(recorder.clone());

        let allocated = store
            .allocate(TYPE, b"", "x", ClientId::DRIVER)
            .expect("allocate");
        assert_eq!(observer.poll(store.reader()), 1);
        assert_eq!(observer.poll(store.reader()), 0);

        store.free(allocated.id, ClientId::DRIVER).expect("free");
        assert_eq!(observer.poll(store.reader()), 1);
        assert_eq!(observer.poll(store.reader()), 0);

        assert_eq!(
            recorder.events(),
            vec![
                Event::Available(allocated.registration_id, allocated.id),
                Event::Unavailable(allocated.registration_id, allocated.id),
            ]
        );
    }

    #[test]
    fn test_slot_reuse_between_polls_reports_both() {
        let mut store = CounterStore::with_heap(1);
        let mut observer = CounterObserver::new();
        let recorder = Recorder::default();
        observer.add_listener(recorder.clone());

        let first = store.allocate(TYPE, b"", "a", ClientId::DRIVER).expect("a");
        observer.poll(store.reader());
        store.free(first.id, ClientId::DRIVER).expect("free");
        let second = store.allocate(TYPE, b"", "b", ClientId::DRIVER).expect("b");
        observer.poll(store.reader());

        assert_eq!(
            recorder.events(),
            vec![
                Event::Available(first.registration_id, first.id),
                Event::Unavailable(first.registration_id, first.id),
                Event::Available(second.registration_id, second.id),
            ]
        );
    }

    #[test]
    fn test_closure_handlers_and_removal() {
        let mut store = CounterStore::with_heap(4);
        let mut observer = CounterObserver::new();
        let available = Arc::new(Mutex::new(0));
        let unavailable = Arc::new(Mutex::new(0));

        let count = available.clone();
        let on_available = observer.add_available_handler(move |_, _, _| {
            *count.lock().unwrap() += 1;
        });
        let count = unavailable.clone();
        observer.add_unavailable_handler(move |_, _, _| {
            *count.lock().unwrap() += 1;
        });

        store.allocate(TYPE, b"", "a", ClientId::DRIVER).expect("a");
        observer.poll(store.reader());
        assert!(observer.remove(on_available));
        assert!(!observer.remove(on_available));

        let b = store.allocate(TYPE, b"", "b", ClientId::DRIVER).expect("b");
        store.free(b.id, ClientId::DRIVER).expect("free");
        observer.poll(store.reader());

        assert_eq!(*available.lock().unwrap(), 1);
        // `b` was allocated and freed between polls, so it was never seen.
        assert_eq!(*unavailable.lock().unwrap(), 0);
        assert_eq!(observer.handler_count(), 1);
    }

    #[test]
    fn test_handle_built_inside_callback() {
        let mut store = CounterStore::with_heap(2);
        let mut observer = CounterObserver::new();
        let handles: Arc<Mutex<Vec<ReadableCounter>>> = Arc::default();

        let sink = handles.clone();
        observer.add_available_handler(move |reader, registration, id| {
            let handle = ReadableCounter::new(reader, registration, id).expect("live counter");
            sink.lock().unwrap().push(handle);
        });
        let sink = handles.clone();
        observer.add_unavailable_handler(move |_, registration, _| {
            for handle in sink.lock().unwrap().iter() {
                if handle.registration_id() == registration {
                    handle.close();
                }
            }
        });

        let allocated = store
            .allocate(TYPE, b"", "x", ClientId::DRIVER)
            .expect("allocate");
        observer.poll(store.reader());
        assert!(!handles.lock().unwrap()[0].is_closed());
        assert_eq!(observer.last_seen(allocated.id), Some(allocated.registration_id));

        store.free(allocated.id, ClientId::DRIVER).expect("free");
        observer.poll(store.reader());
        assert!(handles.lock().unwrap()[0].is_closed());
        assert_eq!(observer.last_seen(allocated.id), None);
    }
}
