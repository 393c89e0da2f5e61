//! Storage entries and the read-only views handed out of storage.

use crate::protocol::{FLAG_PERSISTENT, UNASSIGNED_ID};
use crate::seqnum::SequenceNumber;
use crate::value::{Value, ValueType};

/// Index into the storage arena. Stable for the life of the storage and never sent on the wire.
pub type LocalId = u32;

#[derive(Debug, Clone)]
pub(crate) struct Entry {
    pub name: String,
    pub value: Option<Value>,
    pub flags: u8,
    /// Network id; [`UNASSIGNED_ID`] until the server grants one.
    pub id: u16,
    pub local_id: LocalId,
    pub seq_num: SequenceNumber,
    /// Written through the local API since it was last deleted.
    pub local_write: bool,
    /// Local value not yet handed to a synchronized connection.
    pub pending: bool,
    pub rpc_call_uid: u16,
}

impl Entry {
    pub fn new(name: String, local_id: LocalId) -> Self {
        Entry {
            name,
            value: None,
            flags: 0,
            id: UNASSIGNED_ID,
            local_id,
            seq_num: SequenceNumber(0),
            local_write: false,
            pending: false,
            rpc_call_uid: 0,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.flags & FLAG_PERSISTENT != 0
    }

    pub fn value_type(&self) -> ValueType {
        self.value
            .as_ref()
            .map_or(ValueType::Unassigned, Value::value_type)
    }

    pub fn info(&self) -> EntryInfo {
        EntryInfo {
            local_id: self.local_id,
            name: self.name.clone(),
            value_type: self.value_type(),
            flags: self.flags,
        }
    }
}

/// Snapshot of an entry's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub local_id: LocalId,
    pub name: String,
    pub value_type: ValueType,
    pub flags: u8,
}
