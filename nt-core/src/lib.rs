//! NetworkTables replication engine.
//! One server and many clients keep replicas of a typed key-value table in
//! sync over TCP; [`NtInstance`] is the entry point.

pub mod callback;
pub mod coalesce;
pub mod connection;
pub mod dispatcher;
pub mod entry;
pub mod handshake;
pub mod instance;
pub mod notifier;
pub mod persistence;
pub mod protocol;
pub mod seqnum;
pub mod storage;
pub mod value;
pub mod wire;

mod worker;

pub use callback::{Overflow, PollError, QueuePolicy};
pub use connection::{ConnectionInfo, ConnectionState};
pub use dispatcher::{DispatcherError, NetworkMode};
pub use entry::{EntryInfo, LocalId};
pub use instance::NtInstance;
pub use notifier::{
    ConnectionNotification, EntryNotification, NOTIFY_DELETE, NOTIFY_FLAGS, NOTIFY_IMMEDIATE,
    NOTIFY_LOCAL, NOTIFY_NEW, NOTIFY_UPDATE,
};
pub use persistence::PersistError;
pub use protocol::{Message, DEFAULT_PORT, FLAG_PERSISTENT, PROTO_REV_CURRENT, PROTO_REV_LEGACY};
pub use seqnum::SequenceNumber;
pub use storage::{RpcCall, RpcCallId, RpcHandler};
pub use value::{Value, ValueType};
pub use wire::{decode_message, encode_message, DecodeError, EncodeError};
