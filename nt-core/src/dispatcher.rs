//! Owns the connections and the threads that drive them: the periodic
//! dispatch loop plus either the server accept loop or the client
//! connect/reconnect loop.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::callback::ListenerId;
use crate::connection::{
    ConnectionId, ConnectionInfo, ConnectionState, EntryTypeFn, HandshakeFn, IncomingFn,
    NetworkConnection, Remote,
};
use crate::handshake::{self, HandshakeOutcome, MessageChannel};
use crate::notifier::ConnectionNotifier;
use crate::protocol::{Message, PROTO_REV_CURRENT, PROTO_REV_LEGACY};
use crate::storage::{OutgoingSink, Storage};
use crate::value::ValueType;
use crate::worker::{lock, wait, wait_timeout, Worker, JOIN_TIMEOUT};

pub const MIN_UPDATE_RATE: Duration = Duration::from_millis(10);
pub const MAX_UPDATE_RATE: Duration = Duration::from_secs(1);
pub const DEFAULT_UPDATE_RATE: Duration = Duration::from_millis(100);
/// Minimum spacing of forced flushes.
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);
const SAVE_INTERVAL: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between failed connection attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(250);

/// Bit set describing what the dispatcher is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkMode(u32);

impl NetworkMode {
    pub const NONE: NetworkMode = NetworkMode(0);
    pub const SERVER: NetworkMode = NetworkMode(0x01);
    pub const CLIENT: NetworkMode = NetworkMode(0x02);
    /// Server not yet listening, or client not yet connected.
    pub const STARTING: NetworkMode = NetworkMode(0x04);
    pub const FAILURE: NetworkMode = NetworkMode(0x08);
    /// Roles configured without any networking.
    pub const TEST: NetworkMode = NetworkMode(0x10);

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: NetworkMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for NetworkMode {
    type Output = NetworkMode;

    fn bitor(self, rhs: NetworkMode) -> NetworkMode {
        NetworkMode(self.0 | rhs.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("dispatcher is already running")]
    AlreadyActive,
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("no servers to connect to")]
    NoServers,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

struct FlushState {
    requested: bool,
    last_flush: Instant,
}

#[derive(Default)]
struct ReconnectState {
    requested: bool,
    retry_rev: Option<u16>,
    /// Connection the client loop is waiting on.
    current: Option<ConnectionId>,
}

type Target = (String, u16);

struct Shared {
    storage: Arc<Storage>,
    notifier: Arc<ConnectionNotifier>,
    active: AtomicBool,
    mode: AtomicU32,
    identity: Mutex<String>,
    default_proto_rev: AtomicU16,
    update_rate: Mutex<Duration>,
    persist_file: Mutex<Option<PathBuf>>,
    connections: Mutex<Vec<Arc<NetworkConnection>>>,
    flush: Mutex<FlushState>,
    flush_cv: Condvar,
    reconnect: Mutex<ReconnectState>,
    reconnect_cv: Condvar,
    servers: Mutex<Vec<Target>>,
    server_override: Mutex<Option<Target>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl OutgoingSink for Shared {
    fn queue_outgoing(&self, msg: Message, only: Option<ConnectionId>, except: Option<ConnectionId>) {
        let conns = lock(&self.connections);
        for conn in conns.iter() {
            let uid = conn.uid();
            if except == Some(uid) || only.map_or(false, |o| o != uid) {
                continue;
            }
            match conn.state() {
                ConnectionState::Synchronized | ConnectionState::Active => {
                    conn.queue_outgoing(msg.clone())
                }
                _ => {}
            }
        }
    }

    fn is_synchronized(&self) -> bool {
        lock(&self.connections).iter().any(|c| {
            matches!(
                c.state(),
                ConnectionState::Synchronized | ConnectionState::Active
            )
        })
    }
}

impl Shared {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn mode(&self) -> NetworkMode {
        NetworkMode(self.mode.load(Ordering::SeqCst))
    }

    fn set_mode(&self, mode: NetworkMode) {
        self.mode.store(mode.0, Ordering::SeqCst);
    }

    fn request_reconnect(&self, retry_rev: Option<u16>) {
        let mut st = lock(&self.reconnect);
        st.requested = true;
        if retry_rev.is_some() {
            st.retry_rev = retry_rev;
        }
        self.reconnect_cv.notify_all();
    }

    /// Reconnect only if `uid` is still the client's live connection.
    fn reconnect_if_current(&self, uid: ConnectionId) {
        let mut st = lock(&self.reconnect);
        if st.current == Some(uid) {
            st.requested = true;
            st.current = None;
            self.reconnect_cv.notify_all();
        }
    }

    fn entry_type_fn(self: &Arc<Self>) -> EntryTypeFn {
        let weak = Arc::downgrade(self);
        Arc::new(move |id: u16| {
            weak.upgrade()
                .map_or(ValueType::Unassigned, |s| s.storage.get_entry_type_by_network_id(id))
        })
    }

    fn incoming_fn(self: &Arc<Self>) -> IncomingFn {
        let weak = Arc::downgrade(self);
        Arc::new(move |msg: Message, conn: &NetworkConnection| {
            if let Some(s) = weak.upgrade() {
                s.storage.process_incoming(msg, conn);
            }
        })
    }

    fn server_handshake_fn(self: &Arc<Self>) -> HandshakeFn {
        let weak = Arc::downgrade(self);
        Arc::new(move |conn: &NetworkConnection, io: &mut dyn MessageChannel| {
            let Some(s) = weak.upgrade() else {
                return false;
            };
            let identity = lock(&s.identity).clone();
            let max_rev = s.default_proto_rev.load(Ordering::SeqCst);
            handshake::server_handshake(&s.storage, &identity, max_rev, conn, io)
        })
    }

    fn client_handshake_fn(self: &Arc<Self>) -> HandshakeFn {
        let weak = Arc::downgrade(self);
        Arc::new(move |conn: &NetworkConnection, io: &mut dyn MessageChannel| {
            let Some(s) = weak.upgrade() else {
                return false;
            };
            let identity = lock(&s.identity).clone();
            match handshake::client_handshake(&s.storage, &identity, conn, io) {
                HandshakeOutcome::Success => true,
                HandshakeOutcome::Failed => false,
                HandshakeOutcome::RetryWith(rev) => {
                    s.request_reconnect(Some(rev));
                    false
                }
            }
        })
    }

    fn next_target(&self, next: &mut usize) -> Option<Target> {
        if let Some(t) = lock(&self.server_override).clone() {
            return Some(t);
        }
        let servers = lock(&self.servers);
        if servers.is_empty() {
            return None;
        }
        let t = servers[*next % servers.len()].clone();
        *next = next.wrapping_add(1);
        Some(t)
    }

    /// Sleep for `dur` unless stopped or asked to reconnect.
    fn pause(&self, dur: Duration) {
        let st = lock(&self.reconnect);
        if self.is_active() {
            let _ = wait_timeout(&self.reconnect_cv, st, dur);
        }
    }
}

fn dispatch_loop(shared: Arc<Shared>) {
    let mut last_save = Instant::now();
    let mut flush = lock(&shared.flush);
    while shared.is_active() {
        if !flush.requested {
            let rate = *lock(&shared.update_rate);
            flush = wait_timeout(&shared.flush_cv, flush, rate).0;
        }
        if !shared.is_active() {
            break;
        }
        flush.requested = false;
        flush.last_flush = Instant::now();
        drop(flush);

        let mode = shared.mode();
        let client = mode.contains(NetworkMode::CLIENT);

        if mode.contains(NetworkMode::SERVER) && last_save.elapsed() >= SAVE_INTERVAL {
            last_save = Instant::now();
            let path = lock(&shared.persist_file).clone();
            if let Some(path) = path {
                if let Err(e) = shared.storage.save_persistent(&path, true) {
                    warn!("periodic save to {} failed: {}", path.display(), e);
                }
            }
        }

        let conns: Vec<Arc<NetworkConnection>> = lock(&shared.connections).clone();
        let mut connected = false;
        let mut dead = None;
        for conn in &conns {
            match conn.state() {
                ConnectionState::Active => {
                    connected = true;
                    conn.post_outgoing(client);
                }
                ConnectionState::Dead => dead = Some(conn.uid()),
                _ => {}
            }
        }
        if client && !mode.contains(NetworkMode::TEST) {
            if connected {
                shared.set_mode(NetworkMode::CLIENT);
            } else {
                shared.set_mode(NetworkMode::CLIENT | NetworkMode::STARTING);
            }
            if let Some(uid) = dead {
                shared.reconnect_if_current(uid);
            }
        }

        flush = lock(&shared.flush);
    }
}

fn accept_loop(shared: Arc<Shared>, listener: TcpListener) {
    loop {
        let (stream, peer) = match listener.accept() {
            Ok(s) => s,
            Err(e) => {
                if shared.is_active() {
                    warn!("accept failed: {}", e);
                    shared.set_mode(NetworkMode::SERVER | NetworkMode::FAILURE);
                }
                break;
            }
        };
        if !shared.is_active() {
            break;
        }
        debug!("accepted connection from {}", peer);
        let conn = NetworkConnection::new(
            stream,
            shared.notifier.clone(),
            shared.server_handshake_fn(),
            shared.entry_type_fn(),
        );
        let replaced = {
            let mut conns = lock(&shared.connections);
            match conns.iter_mut().find(|c| c.state() == ConnectionState::Dead) {
                Some(slot) => Some(std::mem::replace(slot, conn.clone())),
                None => {
                    conns.push(conn.clone());
                    None
                }
            }
        };
        if let Some(old) = replaced {
            old.stop();
        }
        if let Err(e) = conn.start(shared.incoming_fn()) {
            warn!("cannot start connection from {}: {}", peer, e);
        }
    }
    debug!("accept loop finished");
}

fn connect(target: &Target) -> io::Result<TcpStream> {
    let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no addresses");
    for addr in (target.0.as_str(), target.1).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) {
            Ok(s) => return Ok(s),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

fn client_loop(shared: Arc<Shared>) {
    let mut next = 0usize;
    let mut retry: Option<(Target, u16)> = None;
    while shared.is_active() {
        let (target, rev) = match retry.take() {
            Some(r) => r,
            None => match shared.next_target(&mut next) {
                Some(t) => (t, shared.default_proto_rev.load(Ordering::SeqCst)),
                None => {
                    shared.pause(RETRY_INTERVAL);
                    continue;
                }
            },
        };
        let stream = match connect(&target) {
            Ok(s) => s,
            Err(e) => {
                debug!("connect to {}:{} failed: {}", target.0, target.1, e);
                shared.pause(RETRY_INTERVAL);
                continue;
            }
        };
        if !shared.is_active() {
            break;
        }
        info!("connected to {}:{}", target.0, target.1);

        let conn = NetworkConnection::new(
            stream,
            shared.notifier.clone(),
            shared.client_handshake_fn(),
            shared.entry_type_fn(),
        );
        conn.set_proto_rev(rev);
        let old = std::mem::replace(&mut *lock(&shared.connections), vec![conn.clone()]);
        for o in old {
            o.stop();
        }
        *lock(&shared.reconnect) = ReconnectState {
            current: Some(conn.uid()),
            ..ReconnectState::default()
        };
        if let Err(e) = conn.start(shared.incoming_fn()) {
            warn!("cannot start connection to {}:{}: {}", target.0, target.1, e);
            shared.pause(RETRY_INTERVAL);
            continue;
        }

        let mut st = lock(&shared.reconnect);
        while !st.requested && shared.is_active() {
            st = wait(&shared.reconnect_cv, st);
        }
        st.requested = false;
        if let Some(rev) = st.retry_rev.take() {
            retry = Some((target, rev));
        }
    }
    debug!("client loop finished");
}

/// Network side of an instance.
pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Mutex<Vec<Worker>>,
}

impl Dispatcher {
    pub fn new(storage: Arc<Storage>, notifier: Arc<ConnectionNotifier>) -> Self {
        Dispatcher {
            shared: Arc::new(Shared {
                storage,
                notifier,
                active: AtomicBool::new(false),
                mode: AtomicU32::new(0),
                identity: Mutex::new(String::new()),
                default_proto_rev: AtomicU16::new(PROTO_REV_CURRENT),
                update_rate: Mutex::new(DEFAULT_UPDATE_RATE),
                persist_file: Mutex::new(None),
                connections: Mutex::new(Vec::new()),
                flush: Mutex::new(FlushState {
                    requested: false,
                    last_flush: Instant::now(),
                }),
                flush_cv: Condvar::new(),
                reconnect: Mutex::new(ReconnectState::default()),
                reconnect_cv: Condvar::new(),
                servers: Mutex::new(Vec::new()),
                server_override: Mutex::new(None),
                local_addr: Mutex::new(None),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn attach_storage(&self, server: bool) {
        let sink: Weak<dyn OutgoingSink> = Arc::downgrade(&self.shared) as Weak<Shared>;
        self.shared.storage.set_outgoing(sink, server);
    }

    fn spawn(&self, name: &str, f: impl FnOnce(Arc<Shared>) + Send + 'static) -> io::Result<()> {
        let shared = self.shared.clone();
        let w = Worker::spawn(name, move || f(shared))?;
        lock(&self.workers).push(w);
        Ok(())
    }

    /// Load `persist_file` (if any), bind, and start accepting clients.
    pub fn start_server(
        &self,
        persist_file: Option<PathBuf>,
        listen_address: &str,
        port: u16,
    ) -> Result<(), DispatcherError> {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            return Err(DispatcherError::AlreadyActive);
        }
        self.shared.set_mode(NetworkMode::SERVER | NetworkMode::STARTING);
        self.attach_storage(true);

        if let Some(path) = &persist_file {
            if path.exists() {
                if let Err(e) = self.shared.storage.load_persistent(path) {
                    warn!("cannot load {}: {}", path.display(), e);
                }
            }
        }
        *lock(&self.shared.persist_file) = persist_file;

        let host = if listen_address.is_empty() {
            "0.0.0.0"
        } else {
            listen_address
        };
        let listener = match TcpListener::bind((host, port)) {
            Ok(l) => l,
            Err(source) => {
                self.shared.active.store(false, Ordering::SeqCst);
                self.shared
                    .set_mode(NetworkMode::SERVER | NetworkMode::FAILURE);
                return Err(DispatcherError::Bind {
                    addr: format!("{}:{}", host, port),
                    source,
                });
            }
        };
        let addr = listener.local_addr()?;
        *lock(&self.shared.local_addr) = Some(addr);
        info!("listening on {}", addr);
        self.shared.set_mode(NetworkMode::SERVER);

        self.spawn("nt-dispatch", dispatch_loop)?;
        self.spawn("nt-accept", move |s| accept_loop(s, listener))?;
        Ok(())
    }

    /// Connect to the first reachable of `servers` (round-robin), reconnecting on loss.
    pub fn start_client(&self, servers: Vec<(String, u16)>) -> Result<(), DispatcherError> {
        if servers.is_empty() && lock(&self.shared.server_override).is_none() {
            return Err(DispatcherError::NoServers);
        }
        if self.shared.active.swap(true, Ordering::SeqCst) {
            return Err(DispatcherError::AlreadyActive);
        }
        *lock(&self.shared.servers) = servers;
        self.shared
            .set_mode(NetworkMode::CLIENT | NetworkMode::STARTING);
        self.attach_storage(false);

        self.spawn("nt-dispatch", dispatch_loop)?;
        self.spawn("nt-connect", client_loop)?;
        Ok(())
    }

    /// Take a server or client role for storage semantics without any sockets.
    pub fn start_test_mode(&self, server: bool) -> Result<(), DispatcherError> {
        if self.shared.active.swap(true, Ordering::SeqCst) {
            return Err(DispatcherError::AlreadyActive);
        }
        let role = if server {
            NetworkMode::SERVER
        } else {
            NetworkMode::CLIENT
        };
        self.shared.set_mode(role | NetworkMode::TEST);
        self.attach_storage(server);
        Ok(())
    }

    pub fn stop(&self) {
        let was_active = self.shared.active.swap(false, Ordering::SeqCst);
        {
            let _g = lock(&self.shared.flush);
            self.shared.flush_cv.notify_all();
        }
        {
            let _g = lock(&self.shared.reconnect);
            self.shared.reconnect_cv.notify_all();
        }
        if let Some(addr) = lock(&self.shared.local_addr).take() {
            // wake the blocked accept
            let ip = if addr.ip().is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                addr.ip()
            };
            let _ = TcpStream::connect_timeout(&SocketAddr::new(ip, addr.port()), CONNECT_TIMEOUT);
        }
        let workers: Vec<Worker> = lock(&self.workers).drain(..).collect();
        for w in workers {
            w.join_timeout(JOIN_TIMEOUT);
        }
        let conns = std::mem::take(&mut *lock(&self.shared.connections));
        for c in conns {
            c.stop();
        }
        if was_active && self.shared.mode().contains(NetworkMode::SERVER) {
            let path = lock(&self.shared.persist_file).clone();
            if let Some(path) = path {
                if let Err(e) = self.shared.storage.save_persistent(&path, true) {
                    warn!("final save to {} failed: {}", path.display(), e);
                }
            }
        }
        self.shared.set_mode(NetworkMode::NONE);
    }

    /// Wake the dispatch loop now. Calls closer together than 10ms are dropped.
    pub fn flush(&self) {
        let mut st = lock(&self.shared.flush);
        if st.last_flush.elapsed() < MIN_FLUSH_INTERVAL {
            return;
        }
        st.requested = true;
        self.shared.flush_cv.notify_one();
    }

    /// Set the dispatch period, clamped to 10ms..=1s.
    pub fn set_update_rate(&self, rate: Duration) {
        *lock(&self.shared.update_rate) = rate.clamp(MIN_UPDATE_RATE, MAX_UPDATE_RATE);
    }

    pub fn update_rate(&self) -> Duration {
        *lock(&self.shared.update_rate)
    }

    pub fn set_identity(&self, identity: &str) {
        *lock(&self.shared.identity) = identity.to_owned();
    }

    /// Revision a client offers first, and the highest a server accepts.
    pub fn set_default_proto_rev(&self, rev: u16) {
        let rev = rev.clamp(PROTO_REV_LEGACY, PROTO_REV_CURRENT);
        self.shared.default_proto_rev.store(rev, Ordering::SeqCst);
    }

    /// Replace the server override; the client tries it before its server list.
    pub fn set_server_override(&self, target: Option<(String, u16)>) {
        *lock(&self.shared.server_override) = target;
    }

    pub fn set_persist_file(&self, path: Option<PathBuf>) {
        *lock(&self.shared.persist_file) = path;
    }

    /// Drop the current client connection and dial again.
    pub fn reconnect(&self) {
        let conns: Vec<Arc<NetworkConnection>> = lock(&self.shared.connections).clone();
        for c in conns {
            c.stop();
        }
        self.shared.request_reconnect(None);
    }

    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        lock(&self.shared.connections)
            .iter()
            .filter(|c| c.state() == ConnectionState::Active)
            .map(|c| c.info())
            .collect()
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.shared.connections)
            .iter()
            .any(|c| c.state() == ConnectionState::Active)
    }

    /// Send the connected event of every active connection to one listener.
    pub fn notify_connections(&self, only: ListenerId) {
        for c in lock(&self.shared.connections).iter() {
            c.notify_if_active(only);
        }
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.shared.mode()
    }

    /// Bound address while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
