//! Generic listener registry with one delivery thread.
//!
//! Producers enqueue `(target, event)` and return immediately. The delivery
//! thread hands each event to the targeted listener, or to every listener
//! whose filter matches. A listener is either a callback run on the delivery
//! thread or a poller queue drained by [`CallbackManager::poll`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::worker::{lock, wait, wait_timeout, Worker, JOIN_TIMEOUT};

pub type ListenerId = u32;
pub type PollerId = u32;

/// Backlog size at which a warning is logged.
pub const BACKLOG_WARN: usize = 10_000;

/// Decides whether a broadcast event is delivered to a listener.
pub trait ListenerFilter<E>: Send + 'static {
    fn matches(&self, event: &E) -> bool;
}

/// What to do with a new event when the queue is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Overflow {
    #[default]
    DropOldest,
    DropNewest,
}

/// Queue bound. `capacity: None` is unbounded (a warning is logged past [`BACKLOG_WARN`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct QueuePolicy {
    pub capacity: Option<usize>,
    pub overflow: Overflow,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("poll timed out")]
    TimedOut,
    #[error("poll cancelled")]
    Cancelled,
    #[error("no such poller")]
    NoPoller,
}

pub type Callback<E> = Arc<dyn Fn(ListenerId, &E) + Send + Sync>;

enum Delivery<E> {
    Callback(Callback<E>),
    Poller(Arc<Poller<E>>),
}

impl<E> Clone for Delivery<E> {
    fn clone(&self) -> Self {
        match self {
            Delivery::Callback(cb) => Delivery::Callback(cb.clone()),
            Delivery::Poller(p) => Delivery::Poller(p.clone()),
        }
    }
}

struct Listener<F, E> {
    filter: F,
    poller: Option<PollerId>,
    delivery: Delivery<E>,
}

struct Poller<E> {
    state: Mutex<PollerState<E>>,
    cv: Condvar,
}

struct PollerState<E> {
    queue: VecDeque<(ListenerId, E)>,
    cancelled: bool,
    removed: bool,
}

impl<E> Poller<E> {
    fn new() -> Self {
        Poller {
            state: Mutex::new(PollerState {
                queue: VecDeque::new(),
                cancelled: false,
                removed: false,
            }),
            cv: Condvar::new(),
        }
    }

    fn push(&self, item: (ListenerId, E)) {
        lock(&self.state).queue.push_back(item);
        self.cv.notify_all();
    }

    fn shut(&self) {
        lock(&self.state).removed = true;
        self.cv.notify_all();
    }
}

struct State<F, E> {
    listeners: BTreeMap<ListenerId, Listener<F, E>>,
    next_listener: ListenerId,
    pollers: HashMap<PollerId, Arc<Poller<E>>>,
    next_poller: PollerId,
    queue: VecDeque<(Option<ListenerId>, E)>,
    active: bool,
    delivering: bool,
    warned: bool,
}

struct Shared<F, E> {
    name: &'static str,
    policy: QueuePolicy,
    state: Mutex<State<F, E>>,
    work: Condvar,
    idle: Condvar,
}

/// Listener registry parameterised over a filter type `F` and event type `E`.
pub struct CallbackManager<F, E> {
    shared: Arc<Shared<F, E>>,
    thread: Mutex<Option<Worker>>,
}

impl<F, E> CallbackManager<F, E>
where
    F: ListenerFilter<E>,
    E: Clone + Send + 'static,
{
    pub fn new(name: &'static str, policy: QueuePolicy) -> Self {
        CallbackManager {
            shared: Arc::new(Shared {
                name,
                policy,
                state: Mutex::new(State {
                    listeners: BTreeMap::new(),
                    next_listener: 1,
                    pollers: HashMap::new(),
                    next_poller: 1,
                    queue: VecDeque::new(),
                    active: false,
                    delivering: false,
                    warned: false,
                }),
                work: Condvar::new(),
                idle: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Register a callback. Starts the delivery thread on first use.
    pub fn add<C>(&self, filter: F, callback: C) -> ListenerId
    where
        C: Fn(ListenerId, &E) + Send + Sync + 'static,
    {
        self.ensure_started();
        self.insert(filter, None, Delivery::Callback(Arc::new(callback)))
    }

    pub fn create_poller(&self) -> PollerId {
        let mut st = lock(&self.shared.state);
        let id = st.next_poller;
        st.next_poller += 1;
        st.pollers.insert(id, Arc::new(Poller::new()));
        id
    }

    /// Register a listener that queues into `poller`. None if the poller does not exist.
    pub fn add_polled(&self, poller: PollerId, filter: F) -> Option<ListenerId> {
        let p = lock(&self.shared.state).pollers.get(&poller).cloned()?;
        self.ensure_started();
        Some(self.insert(filter, Some(poller), Delivery::Poller(p)))
    }

    fn insert(&self, filter: F, poller: Option<PollerId>, delivery: Delivery<E>) -> ListenerId {
        let mut st = lock(&self.shared.state);
        let id = st.next_listener;
        st.next_listener += 1;
        st.listeners.insert(
            id,
            Listener {
                filter,
                poller,
                delivery,
            },
        );
        id
    }

    pub fn remove(&self, listener: ListenerId) -> bool {
        lock(&self.shared.state).listeners.remove(&listener).is_some()
    }

    /// Remove a poller and every listener feeding it; blocked pollers return `NoPoller`.
    pub fn remove_poller(&self, poller: PollerId) {
        let mut st = lock(&self.shared.state);
        st.listeners.retain(|_, l| l.poller != Some(poller));
        if let Some(p) = st.pollers.remove(&poller) {
            p.shut();
        }
    }

    /// Wait for events on `poller`. `timeout: None` waits until an event or cancel.
    pub fn poll(
        &self,
        poller: PollerId,
        timeout: Option<Duration>,
    ) -> Result<Vec<(ListenerId, E)>, PollError> {
        let p = lock(&self.shared.state)
            .pollers
            .get(&poller)
            .cloned()
            .ok_or(PollError::NoPoller)?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = lock(&p.state);
        loop {
            if st.removed {
                return Err(PollError::NoPoller);
            }
            if st.cancelled {
                st.cancelled = false;
                return Err(PollError::Cancelled);
            }
            if !st.queue.is_empty() {
                return Ok(st.queue.drain(..).collect());
            }
            match deadline {
                None => st = wait(&p.cv, st),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(PollError::TimedOut);
                    }
                    st = wait_timeout(&p.cv, st, d - now).0;
                }
            }
        }
    }

    /// Wake a blocked [`poll`](Self::poll) on `poller` with `Cancelled`.
    pub fn cancel_poll(&self, poller: PollerId) {
        let p = lock(&self.shared.state).pollers.get(&poller).cloned();
        if let Some(p) = p {
            lock(&p.state).cancelled = true;
            p.cv.notify_all();
        }
    }

    pub fn has_listeners(&self) -> bool {
        !lock(&self.shared.state).listeners.is_empty()
    }

    /// Enqueue an event. Dropped silently when nobody is listening.
    pub fn send(&self, only: Option<ListenerId>, event: E) {
        let mut st = lock(&self.shared.state);
        if !st.active || st.listeners.is_empty() {
            return;
        }
        if let Some(cap) = self.shared.policy.capacity {
            if st.queue.len() >= cap {
                match self.shared.policy.overflow {
                    Overflow::DropNewest => {
                        debug!("{}: queue full, dropping new event", self.shared.name);
                        return;
                    }
                    Overflow::DropOldest => {
                        debug!("{}: queue full, dropping oldest event", self.shared.name);
                        st.queue.pop_front();
                    }
                }
            }
        }
        st.queue.push_back((only, event));
        if st.queue.len() >= BACKLOG_WARN && !st.warned {
            warn!("{}: {} undelivered events", self.shared.name, st.queue.len());
            st.warned = true;
        } else if st.queue.len() < BACKLOG_WARN / 2 {
            st.warned = false;
        }
        self.shared.work.notify_one();
    }

    /// Block until the queue is drained and nothing is being delivered.
    /// Returns false on timeout.
    pub fn wait_for_queue(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut st = lock(&self.shared.state);
        while st.active && (!st.queue.is_empty() || st.delivering) {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            st = wait_timeout(&self.shared.idle, st, deadline - now).0;
        }
        true
    }

    /// Stop the delivery thread, drop pending events and wake every poller.
    pub fn stop(&self) {
        {
            let mut st = lock(&self.shared.state);
            st.active = false;
            st.queue.clear();
            for p in st.pollers.values() {
                p.shut();
            }
        }
        self.shared.work.notify_all();
        self.shared.idle.notify_all();
        if let Some(w) = lock(&self.thread).take() {
            w.join_timeout(JOIN_TIMEOUT);
        }
    }

    fn ensure_started(&self) {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            return;
        }
        lock(&self.shared.state).active = true;
        let shared = self.shared.clone();
        match Worker::spawn(self.shared.name, move || deliver(shared)) {
            Ok(w) => *thread = Some(w),
            Err(e) => {
                warn!("{}: could not start delivery thread: {}", self.shared.name, e);
                lock(&self.shared.state).active = false;
            }
        }
    }
}

impl<F, E> Drop for CallbackManager<F, E> {
    fn drop(&mut self) {
        {
            let mut st = lock(&self.shared.state);
            st.active = false;
            st.queue.clear();
        }
        self.shared.work.notify_all();
        if let Some(w) = lock(&self.thread).take() {
            w.join_timeout(JOIN_TIMEOUT);
        }
    }
}

fn deliver<F, E>(shared: Arc<Shared<F, E>>)
where
    F: ListenerFilter<E>,
    E: Clone + Send + 'static,
{
    let mut st = lock(&shared.state);
    loop {
        while st.active && st.queue.is_empty() {
            st.delivering = false;
            shared.idle.notify_all();
            st = wait(&shared.work, st);
        }
        if !st.active {
            break;
        }
        let Some((only, event)) = st.queue.pop_front() else {
            continue;
        };
        st.delivering = true;
        let targets: Vec<(ListenerId, Delivery<E>)> = match only {
            Some(id) => st
                .listeners
                .get(&id)
                .map(|l| (id, l.delivery.clone()))
                .into_iter()
                .collect(),
            None => st
                .listeners
                .iter()
                .filter(|(_, l)| l.filter.matches(&event))
                .map(|(id, l)| (*id, l.delivery.clone()))
                .collect(),
        };
        drop(st);
        for (id, delivery) in targets {
            match delivery {
                Delivery::Callback(cb) => {
                    let ev = &event;
                    if panic::catch_unwind(AssertUnwindSafe(|| cb(id, ev))).is_err() {
                        warn!("{}: listener {} panicked", shared.name, id);
                    }
                }
                Delivery::Poller(p) => p.push((id, event.clone())),
            }
        }
        st = lock(&shared.state);
    }
    st.delivering = false;
    shared.idle.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Even;

    impl ListenerFilter<u32> for Even {
        fn matches(&self, event: &u32) -> bool {
            event % 2 == 0
        }
    }

    struct Any;

    impl ListenerFilter<u32> for Any {
        fn matches(&self, _: &u32) -> bool {
            true
        }
    }

    fn patience() -> Duration {
        Duration::from_secs(2)
    }

    #[test]
    fn callbacks_receive_matching_events() {
        let m: CallbackManager<Even, u32> = CallbackManager::new("test", QueuePolicy::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        m.add(Even, move |_, ev| s.lock().unwrap().push(*ev));
        for i in 0..6 {
            m.send(None, i);
        }
        assert!(m.wait_for_queue(patience()));
        assert_eq!(*seen.lock().unwrap(), vec![0, 2, 4]);
    }

    #[test]
    fn targeted_events_reach_one_listener() {
        let m: CallbackManager<Any, u32> = CallbackManager::new("test", QueuePolicy::default());
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (a2, b2) = (a.clone(), b.clone());
        let id_a = m.add(Any, move |_, _| {
            a2.fetch_add(1, Ordering::SeqCst);
        });
        m.add(Any, move |_, _| {
            b2.fetch_add(1, Ordering::SeqCst);
        });
        m.send(Some(id_a), 1);
        m.send(None, 2);
        assert!(m.wait_for_queue(patience()));
        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_without_listeners_are_dropped() {
        let m: CallbackManager<Any, u32> = CallbackManager::new("test", QueuePolicy::default());
        m.send(None, 1);
        let p = m.create_poller();
        m.add_polled(p, Any).unwrap();
        m.send(None, 2);
        let got = m.poll(p, Some(patience())).unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, 2);
    }

    #[test]
    fn poll_times_out_and_cancels() {
        let m: Arc<CallbackManager<Any, u32>> =
            Arc::new(CallbackManager::new("test", QueuePolicy::default()));
        let p = m.create_poller();
        m.add_polled(p, Any).unwrap();
        assert_eq!(
            m.poll(p, Some(Duration::from_millis(10))),
            Err(PollError::TimedOut)
        );
        let m2 = m.clone();
        let h = std::thread::spawn(move || m2.poll(p, None));
        std::thread::sleep(Duration::from_millis(50));
        m.cancel_poll(p);
        assert_eq!(h.join().unwrap(), Err(PollError::Cancelled));
    }

    #[test]
    fn removing_poller_removes_its_listeners() {
        let m: CallbackManager<Any, u32> = CallbackManager::new("test", QueuePolicy::default());
        let p = m.create_poller();
        m.add_polled(p, Any).unwrap();
        assert!(m.has_listeners());
        m.remove_poller(p);
        assert!(!m.has_listeners());
        assert_eq!(m.poll(p, Some(patience())), Err(PollError::NoPoller));
        assert!(m.add_polled(p, Any).is_none());
    }

    #[test]
    fn panicking_callback_does_not_stop_delivery() {
        let m: CallbackManager<Any, u32> = CallbackManager::new("test", QueuePolicy::default());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        m.add(Any, |_, ev| {
            if *ev == 1 {
                panic!("listener failure");
            }
        });
        m.add(Any, move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        m.send(None, 1);
        m.send(None, 2);
        assert!(m.wait_for_queue(patience()));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn bounded_queue_drops_newest() {
        let policy = QueuePolicy {
            capacity: Some(2),
            overflow: Overflow::DropNewest,
        };
        let m: CallbackManager<Any, u32> = CallbackManager::new("test", policy);
        let p = m.create_poller();
        m.add_polled(p, Any).unwrap();
        // hold the poller's lock so delivery stalls on the first event
        let held = {
            let st = m.shared.state.lock().unwrap();
            st.pollers.get(&p).cloned().unwrap()
        };
        let guard = held.state.lock().unwrap();
        for i in 0..10 {
            m.send(None, i);
        }
        let queued = m.shared.state.lock().unwrap().queue.len();
        assert!(queued <= 2);
        drop(guard);
        assert!(m.wait_for_queue(patience()));
        let got = m.poll(p, Some(patience())).unwrap();
        assert!(got.len() <= 3);
        assert_eq!(got[0].1, 0);
    }
}
