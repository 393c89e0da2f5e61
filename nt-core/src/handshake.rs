//! Client and server sides of the connection handshake.
//!
//! Both run on the connection's reader thread before it goes Active. They
//! talk through [`MessageChannel`] so they can be driven by a script in tests.

use log::{debug, info, warn};

use crate::connection::Remote;
use crate::protocol::{Message, PROTO_REV_CURRENT, PROTO_REV_LEGACY, SERVER_HELLO_REPEAT_CLIENT};
use crate::storage::Storage;

/// Remote id given to legacy clients, which do not send one the server trusts.
pub const LEGACY_CLIENT_ID: &str = "NT2 client";

/// Blocking question/answer access to the peer during the handshake.
pub trait MessageChannel {
    /// Next message, or None when the link failed.
    fn recv(&mut self) -> Option<Message>;
    /// Queue a batch for the writer.
    fn send(&mut self, msgs: Vec<Message>);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeOutcome {
    Success,
    Failed,
    /// Server only speaks this (older) revision; reconnect and try again with it.
    RetryWith(u16),
}

/// Client side. Sends ClientHello at the connection's revision, collects the
/// server's assignments and reconciles them with the local replica.
pub fn client_handshake(
    storage: &Storage,
    identity: &str,
    conn: &dyn Remote,
    io: &mut dyn MessageChannel,
) -> HandshakeOutcome {
    let rev = conn.proto_rev();
    io.send(vec![Message::ClientHello {
        proto_rev: rev,
        identity: identity.to_owned(),
    }]);

    let Some(mut msg) = io.recv() else {
        return HandshakeOutcome::Failed;
    };
    if let Message::ProtoUnsup { proto_rev } = msg {
        if proto_rev == PROTO_REV_LEGACY && rev != PROTO_REV_LEGACY {
            info!("server only supports revision {:#06x}, retrying", proto_rev);
            return HandshakeOutcome::RetryWith(PROTO_REV_LEGACY);
        }
        warn!("server rejected revision {:#06x} (supports {:#06x})", rev, proto_rev);
        return HandshakeOutcome::Failed;
    }

    let mut new_server = true;
    if rev >= PROTO_REV_CURRENT {
        let Message::ServerHello { flags, identity } = msg else {
            warn!("expected ServerHello, got {:?}", msg);
            return HandshakeOutcome::Failed;
        };
        conn.set_remote_id(&identity);
        new_server = flags & SERVER_HELLO_REPEAT_CLIENT == 0;
        msg = match io.recv() {
            Some(m) => m,
            None => return HandshakeOutcome::Failed,
        };
    }

    let mut assigns = Vec::new();
    loop {
        match msg {
            Message::ServerHelloDone => break,
            Message::KeepAlive => {}
            m @ Message::EntryAssign { .. } => assigns.push(m),
            other => {
                warn!("unexpected {:?} during handshake", other);
                return HandshakeOutcome::Failed;
            }
        }
        msg = match io.recv() {
            Some(m) => m,
            None => return HandshakeOutcome::Failed,
        };
    }
    debug!("received {} initial assignments", assigns.len());

    let mut reply = storage.apply_initial_assignments(conn, assigns, new_server);
    if rev >= PROTO_REV_CURRENT {
        reply.push(Message::ClientHelloDone);
    }
    if !reply.is_empty() {
        io.send(reply);
    }
    info!("handshake with server complete (revision {:#06x})", rev);
    HandshakeOutcome::Success
}

/// Server side. Accepts revisions from legacy up to `max_rev`, streams the
/// current entries and, at the current revision, waits for ClientHelloDone.
pub fn server_handshake(
    storage: &Storage,
    identity: &str,
    max_rev: u16,
    conn: &dyn Remote,
    io: &mut dyn MessageChannel,
) -> bool {
    let Some(msg) = io.recv() else {
        return false;
    };
    let Message::ClientHello {
        proto_rev,
        identity: remote_id,
    } = msg
    else {
        warn!("expected ClientHello, got {:?}", msg);
        return false;
    };
    if proto_rev > max_rev || proto_rev < PROTO_REV_LEGACY {
        info!("client requested unsupported revision {:#06x}", proto_rev);
        io.send(vec![Message::ProtoUnsup { proto_rev: max_rev }]);
        return false;
    }
    conn.set_proto_rev(proto_rev);
    if proto_rev >= PROTO_REV_CURRENT {
        conn.set_remote_id(&remote_id);
    } else {
        conn.set_remote_id(LEGACY_CLIENT_ID);
    }

    let mut batch = Vec::new();
    if proto_rev >= PROTO_REV_CURRENT {
        batch.push(Message::ServerHello {
            flags: 0,
            identity: identity.to_owned(),
        });
    }
    batch.extend(storage.get_initial_assignments(conn));
    batch.push(Message::ServerHelloDone);
    io.send(batch);

    if proto_rev < PROTO_REV_CURRENT {
        return true;
    }

    let mut incoming = Vec::new();
    loop {
        match io.recv() {
            None => return false,
            Some(Message::ClientHelloDone) => break,
            Some(Message::KeepAlive) => {}
            Some(m @ Message::EntryAssign { .. }) => incoming.push(m),
            Some(other) => {
                warn!("unexpected {:?} during handshake", other);
                return false;
            }
        }
    }
    for m in incoming {
        storage.process_incoming(m, conn);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::QueuePolicy;
    use crate::connection::{ConnectionId, ConnectionState};
    use crate::notifier::EntryNotifier;
    use crate::protocol::UNASSIGNED_ID;
    use crate::seqnum::SequenceNumber;
    use crate::storage::OutgoingSink;
    use crate::value::Value;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::sync::{Arc, Mutex, Weak};

    struct Script {
        incoming: VecDeque<Message>,
        sent: Vec<Vec<Message>>,
    }

    impl Script {
        fn new(incoming: Vec<Message>) -> Self {
            Script {
                incoming: incoming.into(),
                sent: Vec::new(),
            }
        }
    }

    impl MessageChannel for Script {
        fn recv(&mut self) -> Option<Message> {
            self.incoming.pop_front()
        }
        fn send(&mut self, msgs: Vec<Message>) {
            self.sent.push(msgs);
        }
    }

    struct Peer {
        rev: AtomicU16,
        states: Mutex<Vec<ConnectionState>>,
        remote_id: Mutex<String>,
    }

    impl Peer {
        fn new(rev: u16) -> Self {
            Peer {
                rev: AtomicU16::new(rev),
                states: Mutex::new(Vec::new()),
                remote_id: Mutex::new(String::new()),
            }
        }
    }

    impl Remote for Peer {
        fn uid(&self) -> ConnectionId {
            7
        }
        fn proto_rev(&self) -> u16 {
            self.rev.load(Ordering::SeqCst)
        }
        fn set_proto_rev(&self, rev: u16) {
            self.rev.store(rev, Ordering::SeqCst);
        }
        fn set_state(&self, state: ConnectionState) {
            self.states.lock().unwrap().push(state);
        }
        fn set_remote_id(&self, id: &str) {
            *self.remote_id.lock().unwrap() = id.to_owned();
        }
    }

    struct Nowhere;

    impl OutgoingSink for Nowhere {
        fn queue_outgoing(&self, _: Message, _: Option<ConnectionId>, _: Option<ConnectionId>) {}
        fn is_synchronized(&self) -> bool {
            false
        }
    }

    fn storage(server: bool) -> Storage {
        let s = Storage::new(Arc::new(EntryNotifier::new(QueuePolicy::default())));
        if !server {
            let sink: Weak<dyn OutgoingSink> = Weak::<Nowhere>::new();
            s.set_outgoing(sink, false);
        }
        s
    }

    fn assign(name: &str, id: u16, value: Value) -> Message {
        Message::EntryAssign {
            name: name.into(),
            id,
            seq_num: SequenceNumber(1),
            value,
            flags: 0,
        }
    }

    #[test]
    fn client_adopts_server_entries() {
        let s = storage(false);
        let peer = Peer::new(PROTO_REV_CURRENT);
        let mut io = Script::new(vec![
            Message::ServerHello {
                flags: 0,
                identity: "srv".into(),
            },
            assign("/a", 0, Value::Double(1.0)),
            Message::KeepAlive,
            assign("/b", 1, Value::Boolean(true)),
            Message::ServerHelloDone,
        ]);
        assert_eq!(client_handshake(&s, "me", &peer, &mut io), HandshakeOutcome::Success);
        assert_eq!(s.get_entry_value("/a"), Some(Value::Double(1.0)));
        assert_eq!(s.network_id("/b"), Some(1));
        assert_eq!(*peer.remote_id.lock().unwrap(), "srv");
        assert_eq!(io.sent.len(), 2);
        assert_eq!(
            io.sent[0],
            vec![Message::ClientHello {
                proto_rev: PROTO_REV_CURRENT,
                identity: "me".into()
            }]
        );
        assert_eq!(io.sent[1], vec![Message::ClientHelloDone]);
    }

    #[test]
    fn client_offers_unknown_local_writes() {
        let s = storage(false);
        s.set_value("/mine", Value::String("x".into()));
        let peer = Peer::new(PROTO_REV_CURRENT);
        let mut io = Script::new(vec![
            Message::ServerHello {
                flags: 0,
                identity: "srv".into(),
            },
            Message::ServerHelloDone,
        ]);
        assert_eq!(client_handshake(&s, "me", &peer, &mut io), HandshakeOutcome::Success);
        let reply = &io.sent[1];
        assert_eq!(reply.len(), 2);
        assert!(matches!(
            &reply[0],
            Message::EntryAssign { name, id: UNASSIGNED_ID, .. } if name == "/mine"
        ));
        assert_eq!(reply[1], Message::ClientHelloDone);
    }

    #[test]
    fn client_downgrades_on_legacy_server() {
        let s = storage(false);
        let peer = Peer::new(PROTO_REV_CURRENT);
        let mut io = Script::new(vec![Message::ProtoUnsup {
            proto_rev: PROTO_REV_LEGACY,
        }]);
        assert_eq!(
            client_handshake(&s, "me", &peer, &mut io),
            HandshakeOutcome::RetryWith(PROTO_REV_LEGACY)
        );

        let legacy = Peer::new(PROTO_REV_LEGACY);
        let mut io = Script::new(vec![Message::ProtoUnsup {
            proto_rev: PROTO_REV_LEGACY,
        }]);
        assert_eq!(client_handshake(&s, "me", &legacy, &mut io), HandshakeOutcome::Failed);
    }

    #[test]
    fn legacy_client_skips_hello_messages() {
        let s = storage(false);
        let peer = Peer::new(PROTO_REV_LEGACY);
        let mut io = Script::new(vec![
            assign("/a", 0, Value::Double(2.0)),
            Message::ServerHelloDone,
        ]);
        assert_eq!(client_handshake(&s, "me", &peer, &mut io), HandshakeOutcome::Success);
        assert_eq!(io.sent.len(), 1);
        assert_eq!(s.get_entry_value("/a"), Some(Value::Double(2.0)));
    }

    #[test]
    fn client_fails_on_unexpected_message() {
        let s = storage(false);
        let peer = Peer::new(PROTO_REV_CURRENT);
        let mut io = Script::new(vec![
            Message::ServerHello {
                flags: 0,
                identity: "srv".into(),
            },
            Message::EntryDelete { id: 0 },
        ]);
        assert_eq!(client_handshake(&s, "me", &peer, &mut io), HandshakeOutcome::Failed);
    }

    #[test]
    fn server_streams_entries_and_waits_for_done() {
        let s = storage(true);
        s.set_value("/a", Value::Double(1.0));
        let peer = Peer::new(PROTO_REV_CURRENT);
        let mut io = Script::new(vec![
            Message::ClientHello {
                proto_rev: PROTO_REV_CURRENT,
                identity: "client".into(),
            },
            assign("/b", UNASSIGNED_ID, Value::Boolean(false)),
            Message::ClientHelloDone,
        ]);
        assert!(server_handshake(&s, "srv", PROTO_REV_CURRENT, &peer, &mut io));
        let batch = &io.sent[0];
        assert_eq!(
            batch[0],
            Message::ServerHello {
                flags: 0,
                identity: "srv".into()
            }
        );
        assert!(matches!(&batch[1], Message::EntryAssign { name, id: 0, .. } if name == "/a"));
        assert_eq!(batch[2], Message::ServerHelloDone);
        assert_eq!(s.get_entry_value("/b"), Some(Value::Boolean(false)));
        assert_eq!(*peer.remote_id.lock().unwrap(), "client");
        assert_eq!(*peer.states.lock().unwrap(), vec![ConnectionState::Synchronized]);
    }

    #[test]
    fn server_rejects_newer_revision() {
        let s = storage(true);
        let peer = Peer::new(PROTO_REV_CURRENT);
        let mut io = Script::new(vec![Message::ClientHello {
            proto_rev: PROTO_REV_CURRENT,
            identity: "client".into(),
        }]);
        assert!(!server_handshake(&s, "srv", PROTO_REV_LEGACY, &peer, &mut io));
        assert_eq!(
            io.sent,
            vec![vec![Message::ProtoUnsup {
                proto_rev: PROTO_REV_LEGACY
            }]]
        );
    }

    #[test]
    fn legacy_server_side_is_active_after_hello_done() {
        let s = storage(true);
        s.set_value("/a", Value::Double(1.0));
        let peer = Peer::new(PROTO_REV_CURRENT);
        let mut io = Script::new(vec![Message::ClientHello {
            proto_rev: PROTO_REV_LEGACY,
            identity: String::new(),
        }]);
        assert!(server_handshake(&s, "srv", PROTO_REV_CURRENT, &peer, &mut io));
        assert_eq!(peer.proto_rev(), PROTO_REV_LEGACY);
        assert_eq!(*peer.remote_id.lock().unwrap(), LEGACY_CLIENT_ID);
        let batch = &io.sent[0];
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1], Message::ServerHelloDone);
    }
}
