//! One TCP peer: state machine, reader and writer threads, outgoing buffer.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info, warn};

use crate::callback::ListenerId;
use crate::coalesce::PendingOutgoing;
use crate::handshake::MessageChannel;
use crate::notifier::{ConnectionNotification, ConnectionNotifier};
use crate::protocol::{Message, PROTO_REV_CURRENT};
use crate::value::ValueType;
use crate::wire::{decode_message, encode_message, DecodeError};
use crate::worker::{lock, Worker, JOIN_TIMEOUT};

pub type ConnectionId = u32;

/// Idle time after which a client sends a KeepAlive.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);
/// Unsent batches at which a warning is logged.
const BACKLOG_WARN: usize = 1_000;

static NEXT_UID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Init,
    Handshake,
    Synchronized,
    Active,
    Dead,
}

/// Snapshot of a connection for listeners and queries.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub remote_id: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub last_update: Option<SystemTime>,
    pub protocol_version: u16,
}

/// The parts of a connection that storage and the handshake touch.
pub trait Remote: Send + Sync {
    fn uid(&self) -> ConnectionId;
    fn proto_rev(&self) -> u16;
    fn set_proto_rev(&self, rev: u16);
    fn set_state(&self, state: ConnectionState);
    fn set_remote_id(&self, id: &str);
}

pub type HandshakeFn = Arc<dyn Fn(&NetworkConnection, &mut dyn MessageChannel) -> bool + Send + Sync>;
pub type IncomingFn = Arc<dyn Fn(Message, &NetworkConnection) + Send + Sync>;
pub type EntryTypeFn = Arc<dyn Fn(u16) -> ValueType + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("protocol error: {0}")]
    Decode(#[from] DecodeError),
}

/// Reads whole messages off a byte stream, buffering partial ones.
pub struct MessageReader<R> {
    inner: R,
    buf: Vec<u8>,
    /// Buffered length needed before the next decode attempt.
    want: usize,
}

impl<R: Read> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        MessageReader {
            inner,
            buf: Vec::new(),
            want: 1,
        }
    }

    pub fn read_message(
        &mut self,
        proto_rev: u16,
        entry_type: &dyn Fn(u16) -> ValueType,
    ) -> Result<Message, ReadError> {
        loop {
            if self.buf.len() >= self.want {
                match decode_message(&self.buf, proto_rev, entry_type) {
                    Ok((msg, n)) => {
                        self.buf.drain(..n);
                        self.want = 1;
                        return Ok(msg);
                    }
                    Err(DecodeError::NeedMore(at_least)) => {
                        self.want = at_least.max(self.buf.len() + 1);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            let mut chunk = [0u8; 4096];
            let n = match self.inner.read(&mut chunk) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if n == 0 {
                return Err(ReadError::Closed);
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

struct Pending {
    buffer: PendingOutgoing,
    last_post: Instant,
    warned: bool,
}

/// A live TCP peer. Created per accepted or dialled socket and never reused.
pub struct NetworkConnection {
    uid: ConnectionId,
    stream: TcpStream,
    remote_ip: String,
    remote_port: u16,
    notifier: Arc<ConnectionNotifier>,
    handshake: HandshakeFn,
    entry_type: EntryTypeFn,
    proto_rev: AtomicU16,
    state: Mutex<ConnectionState>,
    remote_id: Mutex<String>,
    last_update: Mutex<Option<SystemTime>>,
    pending: Mutex<Pending>,
    outgoing: Mutex<Option<mpsc::Sender<Vec<Message>>>>,
    backlog: AtomicUsize,
    active: AtomicBool,
    workers: Mutex<Vec<Worker>>,
}

impl NetworkConnection {
    pub fn new(
        stream: TcpStream,
        notifier: Arc<ConnectionNotifier>,
        handshake: HandshakeFn,
        entry_type: EntryTypeFn,
    ) -> Arc<Self> {
        let (remote_ip, remote_port) = match stream.peer_addr() {
            Ok(a) => (a.ip().to_string(), a.port()),
            Err(_) => (String::new(), 0),
        };
        Arc::new(NetworkConnection {
            uid: NEXT_UID.fetch_add(1, Ordering::Relaxed),
            stream,
            remote_ip,
            remote_port,
            notifier,
            handshake,
            entry_type,
            proto_rev: AtomicU16::new(PROTO_REV_CURRENT),
            state: Mutex::new(ConnectionState::Created),
            remote_id: Mutex::new(String::new()),
            last_update: Mutex::new(None),
            pending: Mutex::new(Pending {
                buffer: PendingOutgoing::new(),
                last_post: Instant::now(),
                warned: false,
            }),
            outgoing: Mutex::new(None),
            backlog: AtomicUsize::new(0),
            active: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the reader (which runs the handshake first) and the writer.
    pub fn start(self: &Arc<Self>, incoming: IncomingFn) -> io::Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.set_state(ConnectionState::Init);
        let _ = self.stream.set_nodelay(true);
        let read_stream = self.stream.try_clone()?;
        let write_stream = self.stream.try_clone()?;
        let (tx, rx) = mpsc::channel();
        *lock(&self.outgoing) = Some(tx);

        let writer = {
            let conn = self.clone();
            Worker::spawn(format!("nt-write-{}", self.uid), move || {
                conn.write_loop(write_stream, rx)
            })?
        };
        let reader = {
            let conn = self.clone();
            Worker::spawn(format!("nt-read-{}", self.uid), move || {
                conn.read_loop(read_stream, incoming)
            })
        };
        let mut workers = lock(&self.workers);
        workers.push(writer);
        match reader {
            Ok(r) => workers.push(r),
            Err(e) => {
                drop(workers);
                self.stop();
                return Err(e);
            }
        }
        Ok(())
    }

    /// Mark dead, close the socket and join both threads (1s each, logged on overrun).
    pub fn stop(&self) {
        self.set_state(ConnectionState::Dead);
        self.active.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        *lock(&self.outgoing) = None;
        let workers: Vec<Worker> = lock(&self.workers).drain(..).collect();
        for w in workers {
            w.join_timeout(JOIN_TIMEOUT);
        }
    }

    pub fn uid(&self) -> ConnectionId {
        self.uid
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            remote_id: lock(&self.remote_id).clone(),
            remote_ip: self.remote_ip.clone(),
            remote_port: self.remote_port,
            last_update: *lock(&self.last_update),
            protocol_version: self.proto_rev.load(Ordering::SeqCst),
        }
    }

    /// Re-send the connected event to one listener if this connection is up.
    pub fn notify_if_active(&self, only: ListenerId) {
        let st = lock(&self.state);
        if *st == ConnectionState::Active {
            self.notifier.send(
                Some(only),
                ConnectionNotification {
                    connected: true,
                    info: self.info(),
                },
            );
        }
    }

    /// Add to the pending buffer, folding with earlier messages for the same entry.
    pub fn queue_outgoing(&self, msg: Message) {
        let mut p = lock(&self.pending);
        p.buffer.push(msg);
        let n = p.buffer.len();
        if n >= BACKLOG_WARN && !p.warned {
            warn!("connection {}: {} messages pending", self.uid, n);
            p.warned = true;
        }
    }

    /// Hand the pending buffer to the writer. With nothing pending, sends a
    /// KeepAlive when `keep_alive` is set and the link has been idle long enough.
    pub fn post_outgoing(&self, keep_alive: bool) {
        let mut p = lock(&self.pending);
        let now = Instant::now();
        if p.buffer.is_empty() {
            if !keep_alive || now.duration_since(p.last_post) < KEEP_ALIVE_INTERVAL {
                return;
            }
            self.send_batch(vec![Message::KeepAlive]);
        } else {
            let batch = p.buffer.take();
            p.warned = false;
            self.send_batch(batch);
        }
        p.last_post = now;
    }

    fn send_batch(&self, msgs: Vec<Message>) {
        if let Some(tx) = lock(&self.outgoing).as_ref() {
            let n = self.backlog.fetch_add(1, Ordering::SeqCst) + 1;
            if n == BACKLOG_WARN {
                warn!("connection {}: writer is {} batches behind", self.uid, n);
            }
            if tx.send(msgs).is_err() {
                self.backlog.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn write_loop(&self, mut stream: TcpStream, rx: mpsc::Receiver<Vec<Message>>) {
        let mut buf = Vec::new();
        while let Ok(batch) = rx.recv() {
            self.backlog.fetch_sub(1, Ordering::SeqCst);
            let rev = self.proto_rev();
            buf.clear();
            for msg in &batch {
                if let Err(e) = encode_message(msg, rev, &mut buf) {
                    debug!("connection {}: dropping {:?}: {}", self.uid, msg, e);
                }
            }
            if buf.is_empty() {
                continue;
            }
            if let Err(e) = stream.write_all(&buf) {
                if self.is_active() {
                    warn!("connection {}: write failed: {}", self.uid, e);
                }
                break;
            }
            debug!("connection {}: sent {} messages", self.uid, batch.len());
        }
        self.set_state(ConnectionState::Dead);
        self.active.store(false, Ordering::SeqCst);
        let _ = stream.shutdown(Shutdown::Both);
    }

    fn read_loop(&self, stream: TcpStream, incoming: IncomingFn) {
        let mut reader = MessageReader::new(stream);
        self.set_state(ConnectionState::Handshake);
        let ok = {
            let mut io = HandshakeIo {
                reader: &mut reader,
                conn: self,
            };
            (self.handshake)(self, &mut io)
        };
        if ok {
            self.set_state(ConnectionState::Active);
            info!(
                "connection {} to {}:{} ({}) is active",
                self.uid,
                self.remote_ip,
                self.remote_port,
                lock(&self.remote_id)
            );
            while self.is_active() {
                match reader.read_message(self.proto_rev(), &*self.entry_type) {
                    Ok(msg) => {
                        self.touch();
                        if msg != Message::KeepAlive {
                            incoming(msg, self);
                        }
                    }
                    Err(e) => {
                        if self.is_active() {
                            match e {
                                ReadError::Closed => info!("connection {} closed by peer", self.uid),
                                e => warn!("connection {}: read failed: {}", self.uid, e),
                            }
                        }
                        break;
                    }
                }
            }
        } else {
            debug!("connection {}: handshake failed", self.uid);
        }
        self.set_state(ConnectionState::Dead);
        self.active.store(false, Ordering::SeqCst);
        // dropping the sender lets the writer flush what is queued, then close
        *lock(&self.outgoing) = None;
    }

    fn touch(&self) {
        *lock(&self.last_update) = Some(SystemTime::now());
    }
}

impl Remote for NetworkConnection {
    fn uid(&self) -> ConnectionId {
        self.uid
    }

    fn proto_rev(&self) -> u16 {
        self.proto_rev.load(Ordering::SeqCst)
    }

    fn set_proto_rev(&self, rev: u16) {
        self.proto_rev.store(rev, Ordering::SeqCst);
    }

    /// Dead is absorbing. Entering Active fires the connected event and
    /// leaving Active for Dead fires the disconnected one, each at most once.
    fn set_state(&self, state: ConnectionState) {
        let mut st = lock(&self.state);
        let prev = *st;
        if prev == ConnectionState::Dead || prev == state {
            return;
        }
        *st = state;
        let connected = match (prev, state) {
            (_, ConnectionState::Active) => true,
            (ConnectionState::Active, ConnectionState::Dead) => false,
            _ => return,
        };
        self.notifier.send(
            None,
            ConnectionNotification {
                connected,
                info: self.info(),
            },
        );
    }

    fn set_remote_id(&self, id: &str) {
        *lock(&self.remote_id) = id.to_owned();
    }
}

struct HandshakeIo<'a> {
    reader: &'a mut MessageReader<TcpStream>,
    conn: &'a NetworkConnection,
}

impl MessageChannel for HandshakeIo<'_> {
    fn recv(&mut self) -> Option<Message> {
        match self
            .reader
            .read_message(self.conn.proto_rev(), &*self.conn.entry_type)
        {
            Ok(msg) => {
                self.conn.touch();
                Some(msg)
            }
            Err(e) => {
                debug!("connection {}: handshake read: {}", self.conn.uid, e);
                None
            }
        }
    }

    fn send(&mut self, msgs: Vec<Message>) {
        self.conn.send_batch(msgs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::QueuePolicy;
    use crate::notifier::AllConnections;
    use crate::seqnum::SequenceNumber;
    use crate::value::Value;
    use std::net::TcpListener;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (server, client)
    }

    fn accept_all() -> HandshakeFn {
        Arc::new(|_: &NetworkConnection, _: &mut dyn MessageChannel| true)
    }

    fn ignore_incoming() -> IncomingFn {
        Arc::new(|_: Message, _: &NetworkConnection| {})
    }

    fn no_types() -> EntryTypeFn {
        Arc::new(|_: u16| ValueType::Unassigned)
    }

    fn wait_for_state(conn: &NetworkConnection, want: ConnectionState) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while conn.state() != want {
            assert!(Instant::now() < deadline, "stuck in {:?}", conn.state());
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn reader_decodes_split_input() {
        let mut bytes = Vec::new();
        encode_message(&Message::EntryDelete { id: 3 }, PROTO_REV_CURRENT, &mut bytes).unwrap();
        encode_message(&Message::KeepAlive, PROTO_REV_CURRENT, &mut bytes).unwrap();
        // one byte per read
        struct Trickle(Vec<u8>, usize);
        impl Read for Trickle {
            fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
                if self.1 >= self.0.len() {
                    return Ok(0);
                }
                out[0] = self.0[self.1];
                self.1 += 1;
                Ok(1)
            }
        }
        let mut r = MessageReader::new(Trickle(bytes, 0));
        let none = |_: u16| ValueType::Unassigned;
        assert_eq!(
            r.read_message(PROTO_REV_CURRENT, &none).unwrap(),
            Message::EntryDelete { id: 3 }
        );
        assert_eq!(r.read_message(PROTO_REV_CURRENT, &none).unwrap(), Message::KeepAlive);
        assert!(matches!(
            r.read_message(PROTO_REV_CURRENT, &none),
            Err(ReadError::Closed)
        ));
    }

    #[test]
    fn reader_rejects_oversized_string_header() {
        // ServerHello claiming a 1 GiB identity
        let mut bytes = vec![0x04, 0x00];
        crate::wire::write_uleb128(&mut bytes, 1 << 30);
        let mut r = MessageReader::new(io::Cursor::new(bytes));
        let none = |_: u16| ValueType::Unassigned;
        assert!(matches!(
            r.read_message(PROTO_REV_CURRENT, &none),
            Err(ReadError::Decode(DecodeError::StringTooLong(_)))
        ));
    }

    #[test]
    fn reader_assembles_large_value_from_small_reads() {
        let value = Value::Raw((0..200_000u32).map(|i| i as u8).collect());
        let msg = Message::EntryUpdate {
            id: 1,
            seq_num: SequenceNumber(2),
            value,
        };
        let mut bytes = Vec::new();
        encode_message(&msg, PROTO_REV_CURRENT, &mut bytes).unwrap();
        struct Small(io::Cursor<Vec<u8>>);
        impl Read for Small {
            fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
                let n = out.len().min(64);
                self.0.read(&mut out[..n])
            }
        }
        let mut r = MessageReader::new(Small(io::Cursor::new(bytes)));
        let none = |_: u16| ValueType::Unassigned;
        assert_eq!(r.read_message(PROTO_REV_CURRENT, &none).unwrap(), msg);
    }

    #[test]
    fn posts_coalesced_batch() {
        let (ours, theirs) = pair();
        let notifier = Arc::new(ConnectionNotifier::new("conn-test", QueuePolicy::default()));
        let conn = NetworkConnection::new(ours, notifier, accept_all(), no_types());
        conn.start(ignore_incoming()).unwrap();
        wait_for_state(&conn, ConnectionState::Active);

        conn.queue_outgoing(Message::EntryAssign {
            name: "foo".into(),
            id: 5,
            seq_num: SequenceNumber(1),
            value: Value::Double(1.0),
            flags: 0,
        });
        conn.queue_outgoing(Message::EntryUpdate {
            id: 5,
            seq_num: SequenceNumber(2),
            value: Value::Double(2.0),
        });
        conn.post_outgoing(false);
        conn.queue_outgoing(Message::FlagsUpdate { id: 9, flags: 1 });
        conn.post_outgoing(false);

        let mut reader = MessageReader::new(theirs);
        let none = |_: u16| ValueType::Unassigned;
        assert_eq!(
            reader.read_message(PROTO_REV_CURRENT, &none).unwrap(),
            Message::EntryAssign {
                name: "foo".into(),
                id: 5,
                seq_num: SequenceNumber(2),
                value: Value::Double(2.0),
                flags: 0,
            }
        );
        assert_eq!(
            reader.read_message(PROTO_REV_CURRENT, &none).unwrap(),
            Message::FlagsUpdate { id: 9, flags: 1 }
        );
        conn.stop();
        assert_eq!(conn.state(), ConnectionState::Dead);
    }

    #[test]
    fn idle_post_without_keep_alive_sends_nothing() {
        let (ours, _theirs) = pair();
        let notifier = Arc::new(ConnectionNotifier::new("conn-test", QueuePolicy::default()));
        let conn = NetworkConnection::new(ours, notifier, accept_all(), no_types());
        conn.start(ignore_incoming()).unwrap();
        conn.post_outgoing(false);
        assert_eq!(conn.backlog.load(Ordering::SeqCst), 0);
        conn.stop();
    }

    #[test]
    fn incoming_messages_and_one_shot_events() {
        let (ours, mut theirs) = pair();
        let notifier = Arc::new(ConnectionNotifier::new("conn-test", QueuePolicy::default()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let ev = events.clone();
        notifier.add(AllConnections, move |_, n| ev.lock().unwrap().push(n.connected));
        let received = Arc::new(Mutex::new(Vec::new()));
        let rx = received.clone();
        let conn = NetworkConnection::new(ours, notifier.clone(), accept_all(), no_types());
        conn.start(Arc::new(move |m: Message, _: &NetworkConnection| rx.lock().unwrap().push(m)))
            .unwrap();
        wait_for_state(&conn, ConnectionState::Active);

        let mut bytes = Vec::new();
        encode_message(&Message::KeepAlive, PROTO_REV_CURRENT, &mut bytes).unwrap();
        encode_message(&Message::EntryDelete { id: 1 }, PROTO_REV_CURRENT, &mut bytes).unwrap();
        theirs.write_all(&bytes).unwrap();
        drop(theirs);

        wait_for_state(&conn, ConnectionState::Dead);
        conn.stop();
        assert!(notifier.wait_for_queue(Duration::from_secs(2)));
        assert_eq!(*received.lock().unwrap(), vec![Message::EntryDelete { id: 1 }]);
        assert_eq!(*events.lock().unwrap(), vec![true, false]);
        assert!(conn.info().last_update.is_some());
    }

    #[test]
    fn failed_handshake_never_reports_connected() {
        let (ours, _theirs) = pair();
        let notifier = Arc::new(ConnectionNotifier::new("conn-test", QueuePolicy::default()));
        let events = Arc::new(Mutex::new(Vec::new()));
        let ev = events.clone();
        notifier.add(AllConnections, move |_, n| ev.lock().unwrap().push(n.connected));
        let reject: HandshakeFn = Arc::new(|_: &NetworkConnection, _: &mut dyn MessageChannel| false);
        let conn = NetworkConnection::new(ours, notifier.clone(), reject, no_types());
        conn.start(ignore_incoming()).unwrap();
        wait_for_state(&conn, ConnectionState::Dead);
        conn.stop();
        assert!(notifier.wait_for_queue(Duration::from_secs(2)));
        assert!(events.lock().unwrap().is_empty());
    }
}
