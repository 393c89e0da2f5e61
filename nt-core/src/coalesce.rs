//! Per-connection outgoing buffer that folds redundant entry messages.
//!
//! Messages keep their queue order. Each network id has at most one pending
//! value message (Assign or Update) and one pending FlagsUpdate; a later
//! message for the same id replaces the earlier one in place.

use std::collections::HashMap;

use crate::protocol::{Message, UNASSIGNED_ID};

type SlotKey = u64;

#[derive(Debug, Default, Clone, Copy)]
struct IdSlots {
    value: Option<SlotKey>,
    flags: Option<SlotKey>,
}

/// Ordered list of slot handles plus a map from network id to its pending slots.
#[derive(Debug, Default)]
pub struct PendingOutgoing {
    next_key: SlotKey,
    order: Vec<SlotKey>,
    messages: HashMap<SlotKey, Message>,
    by_id: HashMap<u16, IdSlots>,
}

impl PendingOutgoing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages that would be sent by [`take`](Self::take).
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, msg: Message) {
        match &msg {
            Message::EntryAssign { id, .. } | Message::EntryUpdate { id, .. } => {
                let id = *id;
                if id == UNASSIGNED_ID {
                    self.append(msg);
                    return;
                }
                let slot = self.by_id.get(&id).and_then(|s| s.value);
                match slot.and_then(|k| self.messages.get_mut(&k)) {
                    Some(pending) => *pending = fold_value(pending, msg),
                    None => {
                        let key = self.append(msg);
                        self.by_id.entry(id).or_default().value = Some(key);
                    }
                }
            }
            Message::FlagsUpdate { id, .. } => {
                let id = *id;
                if id == UNASSIGNED_ID {
                    self.append(msg);
                    return;
                }
                let slot = self.by_id.get(&id).and_then(|s| s.flags);
                match slot.and_then(|k| self.messages.get_mut(&k)) {
                    Some(pending) => *pending = msg,
                    None => {
                        let key = self.append(msg);
                        self.by_id.entry(id).or_default().flags = Some(key);
                    }
                }
            }
            Message::EntryDelete { id } => {
                if let Some(slots) = self.by_id.remove(id) {
                    for key in [slots.value, slots.flags].into_iter().flatten() {
                        self.messages.remove(&key);
                    }
                }
                self.append(msg);
            }
            Message::ClearEntries => {
                self.messages.retain(|_, m| !m.is_entry_message());
                self.by_id.clear();
                self.append(msg);
            }
            _ => {
                self.append(msg);
            }
        }
    }

    /// Drain everything in queue order.
    pub fn take(&mut self) -> Vec<Message> {
        let mut messages = std::mem::take(&mut self.messages);
        let out = self
            .order
            .drain(..)
            .filter_map(|k| messages.remove(&k))
            .collect();
        self.by_id.clear();
        out
    }

    fn append(&mut self, msg: Message) -> SlotKey {
        let key = self.next_key;
        self.next_key += 1;
        self.order.push(key);
        self.messages.insert(key, msg);
        key
    }
}

/// An Update landing on a pending Assign keeps the Assign (the peer may not
/// know the entry yet) with the newer seq and value. Anything else replaces.
fn fold_value(pending: &Message, incoming: Message) -> Message {
    match (pending, incoming) {
        (
            Message::EntryAssign {
                name, id, flags, ..
            },
            Message::EntryUpdate { seq_num, value, .. },
        ) => Message::EntryAssign {
            name: name.clone(),
            id: *id,
            seq_num,
            value,
            flags: *flags,
        },
        (_, incoming) => incoming,
    }
}
