//! NetworkTables wire protocol: message types, tags and revisions.

use crate::seqnum::SequenceNumber;
use crate::value::Value;

/// Legacy protocol revision (2.0).
pub const PROTO_REV_LEGACY: u16 = 0x0200;
/// Current protocol revision (3.0).
pub const PROTO_REV_CURRENT: u16 = 0x0300;
/// Default server TCP port.
pub const DEFAULT_PORT: u16 = 1735;
/// Magic carried by ClearEntries.
pub const CLEAR_ALL_MAGIC: u32 = 0xD06C_B27A;
/// Network id meaning "not yet assigned by the server".
pub const UNASSIGNED_ID: u16 = 0xFFFF;

/// Entry flag: value is saved to the persistent file.
pub const FLAG_PERSISTENT: u8 = 0x01;
/// ServerHello flag: the server has seen this client before.
pub const SERVER_HELLO_REPEAT_CLIENT: u8 = 0x01;

pub(crate) mod tag {
    pub const KEEP_ALIVE: u8 = 0x00;
    pub const CLIENT_HELLO: u8 = 0x01;
    pub const PROTO_UNSUP: u8 = 0x02;
    pub const SERVER_HELLO_DONE: u8 = 0x03;
    pub const SERVER_HELLO: u8 = 0x04;
    pub const CLIENT_HELLO_DONE: u8 = 0x05;
    pub const ENTRY_ASSIGN: u8 = 0x10;
    pub const ENTRY_UPDATE: u8 = 0x11;
    pub const FLAGS_UPDATE: u8 = 0x12;
    pub const ENTRY_DELETE: u8 = 0x13;
    pub const CLEAR_ENTRIES: u8 = 0x14;
    pub const EXECUTE_RPC: u8 = 0x20;
    pub const RPC_RESPONSE: u8 = 0x21;
}

/// All wire messages. Encoding depends on the negotiated revision (see wire module).
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    /// Identity is only on the wire when `proto_rev` is at least 3.0.
    ClientHello {
        proto_rev: u16,
        identity: String,
    },
    /// Server does not speak the client's revision; carries the server's.
    ProtoUnsup {
        proto_rev: u16,
    },
    ServerHelloDone,
    ServerHello {
        flags: u8,
        identity: String,
    },
    ClientHelloDone,
    EntryAssign {
        name: String,
        id: u16,
        seq_num: SequenceNumber,
        value: Value,
        flags: u8,
    },
    EntryUpdate {
        id: u16,
        seq_num: SequenceNumber,
        value: Value,
    },
    FlagsUpdate {
        id: u16,
        flags: u8,
    },
    EntryDelete {
        id: u16,
    },
    /// Delete all non-persistent entries.
    ClearEntries,
    ExecuteRpc {
        id: u16,
        call_uid: u16,
        params: Vec<u8>,
    },
    RpcResponse {
        id: u16,
        call_uid: u16,
        result: Vec<u8>,
    },
}

impl Message {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Message::KeepAlive => tag::KEEP_ALIVE,
            Message::ClientHello { .. } => tag::CLIENT_HELLO,
            Message::ProtoUnsup { .. } => tag::PROTO_UNSUP,
            Message::ServerHelloDone => tag::SERVER_HELLO_DONE,
            Message::ServerHello { .. } => tag::SERVER_HELLO,
            Message::ClientHelloDone => tag::CLIENT_HELLO_DONE,
            Message::EntryAssign { .. } => tag::ENTRY_ASSIGN,
            Message::EntryUpdate { .. } => tag::ENTRY_UPDATE,
            Message::FlagsUpdate { .. } => tag::FLAGS_UPDATE,
            Message::EntryDelete { .. } => tag::ENTRY_DELETE,
            Message::ClearEntries => tag::CLEAR_ENTRIES,
            Message::ExecuteRpc { .. } => tag::EXECUTE_RPC,
            Message::RpcResponse { .. } => tag::RPC_RESPONSE,
        }
    }

    /// Whether this message kind exists at the given protocol revision.
    pub fn supported_at(&self, proto_rev: u16) -> bool {
        proto_rev >= PROTO_REV_CURRENT || tag_supported_at_legacy(self.tag())
    }

    /// Assign, Update, FlagsUpdate, Delete and ClearEntries.
    pub fn is_entry_message(&self) -> bool {
        matches!(
            self,
            Message::EntryAssign { .. }
                | Message::EntryUpdate { .. }
                | Message::FlagsUpdate { .. }
                | Message::EntryDelete { .. }
                | Message::ClearEntries
        )
    }
}

pub(crate) fn tag_supported_at_legacy(t: u8) -> bool {
    matches!(
        t,
        tag::KEEP_ALIVE
            | tag::CLIENT_HELLO
            | tag::PROTO_UNSUP
            | tag::SERVER_HELLO_DONE
            | tag::ENTRY_ASSIGN
            | tag::ENTRY_UPDATE
    )
}
