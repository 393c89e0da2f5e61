//! The local replica of the table: entries, id maps, conflict resolution and
//! message generation for local changes.
//!
//! Every operation runs under one lock. Notifications are queued while the
//! lock is held (so listeners see changes in order); outgoing messages are
//! collected and handed to the [`OutgoingSink`] after the lock is released.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::callback::ListenerId;
use crate::connection::{ConnectionId, ConnectionState, Remote};
use crate::entry::{Entry, EntryInfo, LocalId};
use crate::notifier::{
    EntryNotifier, NOTIFY_DELETE, NOTIFY_FLAGS, NOTIFY_IMMEDIATE, NOTIFY_LOCAL, NOTIFY_NEW,
    NOTIFY_UPDATE,
};
use crate::persistence::{self, PersistError};
use crate::protocol::{Message, FLAG_PERSISTENT, PROTO_REV_CURRENT, UNASSIGNED_ID};
use crate::seqnum::SequenceNumber;
use crate::value::{Value, ValueType};
use crate::worker::{lock, wait, wait_timeout};

/// Where storage sends the messages it generates (the dispatcher).
pub trait OutgoingSink: Send + Sync {
    /// Queue `msg` on every live connection, or only on `only`, skipping `except`.
    fn queue_outgoing(&self, msg: Message, only: Option<ConnectionId>, except: Option<ConnectionId>);

    /// True while a connection would accept broadcast messages.
    fn is_synchronized(&self) -> bool;
}

/// Server-side RPC callback: params in, result out.
pub type RpcHandler = Arc<dyn Fn(&RpcCall) -> Vec<u8> + Send + Sync>;

/// One incoming RPC invocation.
#[derive(Debug, Clone)]
pub struct RpcCall {
    pub local_id: LocalId,
    pub name: String,
    pub call_uid: u16,
    pub params: Vec<u8>,
    /// None for calls made locally on the server.
    pub caller: Option<ConnectionId>,
}

/// Handle to an outstanding RPC call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RpcCallId {
    pub local_id: LocalId,
    pub call_uid: u16,
}

struct Outgoing {
    msg: Message,
    only: Option<ConnectionId>,
    except: Option<ConnectionId>,
}

impl Outgoing {
    fn all(msg: Message) -> Self {
        Outgoing {
            msg,
            only: None,
            except: None,
        }
    }

    fn only(msg: Message, to: ConnectionId) -> Self {
        Outgoing {
            msg,
            only: Some(to),
            except: None,
        }
    }

    fn except(msg: Message, from: ConnectionId) -> Self {
        Outgoing {
            msg,
            only: None,
            except: Some(from),
        }
    }
}

struct Inner {
    entries: Vec<Entry>,
    by_name: HashMap<String, LocalId>,
    /// network id -> local id
    id_map: Vec<Option<LocalId>>,
    sink: Option<Weak<dyn OutgoingSink>>,
    server: bool,
    persistent_dirty: bool,
    rpc_handlers: HashMap<LocalId, RpcHandler>,
}

impl Inner {
    fn get_or_create(&mut self, name: &str) -> LocalId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let local_id = self.entries.len() as LocalId;
        self.entries.push(Entry::new(name.to_owned(), local_id));
        self.by_name.insert(name.to_owned(), local_id);
        local_id
    }

    fn lookup(&self, name: &str) -> Option<LocalId> {
        self.by_name.get(name).copied()
    }

    fn entry(&self, local_id: LocalId) -> Option<&Entry> {
        self.entries.get(local_id as usize)
    }

    fn entry_mut(&mut self, local_id: LocalId) -> &mut Entry {
        &mut self.entries[local_id as usize]
    }

    fn by_network_id(&self, id: u16) -> Option<LocalId> {
        self.id_map.get(usize::from(id)).copied().flatten()
    }

    fn map_id(&mut self, id: u16, local_id: LocalId) {
        let idx = usize::from(id);
        if self.id_map.len() <= idx {
            self.id_map.resize(idx + 1, None);
        }
        self.id_map[idx] = Some(local_id);
        self.entry_mut(local_id).id = id;
    }

    /// Server only: next sequential network id.
    fn allocate_id(&mut self, local_id: LocalId) -> u16 {
        let next = self.id_map.len();
        if next >= usize::from(UNASSIGNED_ID) {
            warn!("network id space exhausted; {} stays unassigned", self.entries[local_id as usize].name);
            return UNASSIGNED_ID;
        }
        let id = next as u16;
        self.map_id(id, local_id);
        id
    }

    fn release_id(&mut self, local_id: LocalId) -> u16 {
        let entry = self.entry_mut(local_id);
        let id = entry.id;
        entry.id = UNASSIGNED_ID;
        if let Some(slot) = self.id_map.get_mut(usize::from(id)) {
            *slot = None;
        }
        id
    }

    fn sink(&self) -> Option<Arc<dyn OutgoingSink>> {
        self.sink.as_ref().and_then(Weak::upgrade)
    }

    fn online(&self) -> bool {
        self.sink().map_or(false, |s| s.is_synchronized())
    }
}

#[derive(Default)]
struct RpcResults {
    results: HashMap<RpcCallId, Vec<u8>>,
    waiting: HashSet<RpcCallId>,
}

/// The local replica.
pub struct Storage {
    inner: Mutex<Inner>,
    notifier: Arc<EntryNotifier>,
    rpc_results: Mutex<RpcResults>,
    rpc_cv: Condvar,
}

impl Storage {
    pub fn new(notifier: Arc<EntryNotifier>) -> Self {
        Storage {
            inner: Mutex::new(Inner {
                entries: Vec::new(),
                by_name: HashMap::new(),
                id_map: Vec::new(),
                sink: None,
                server: true,
                persistent_dirty: false,
                rpc_handlers: HashMap::new(),
            }),
            notifier,
            rpc_results: Mutex::new(RpcResults::default()),
            rpc_cv: Condvar::new(),
        }
    }

    pub fn notifier(&self) -> &Arc<EntryNotifier> {
        &self.notifier
    }

    /// Attach the dispatcher. `server` selects id allocation and re-broadcast behaviour.
    pub fn set_outgoing(&self, sink: Weak<dyn OutgoingSink>, server: bool) {
        let mut inner = lock(&self.inner);
        inner.sink = Some(sink);
        inner.server = server;
    }

    pub fn clear_outgoing(&self) {
        lock(&self.inner).sink = None;
    }

    pub fn is_server(&self) -> bool {
        lock(&self.inner).server
    }

    fn send(&self, sink: Option<Arc<dyn OutgoingSink>>, out: Vec<Outgoing>) {
        let Some(sink) = sink else {
            return;
        };
        for o in out {
            sink.queue_outgoing(o.msg, o.only, o.except);
        }
    }

    // ---- local API -------------------------------------------------------

    /// Local id for `name`, creating an empty entry if needed.
    pub fn get_or_create(&self, name: &str) -> LocalId {
        lock(&self.inner).get_or_create(name)
    }

    pub fn get_entry_value(&self, name: &str) -> Option<Value> {
        let inner = lock(&self.inner);
        let id = inner.lookup(name)?;
        inner.entry(id)?.value.clone()
    }

    pub fn get_entry_value_by_id(&self, local_id: LocalId) -> Option<Value> {
        lock(&self.inner).entry(local_id)?.value.clone()
    }

    pub fn get_entry_type(&self, name: &str) -> ValueType {
        let inner = lock(&self.inner);
        inner
            .lookup(name)
            .and_then(|id| inner.entry(id))
            .map_or(ValueType::Unassigned, Entry::value_type)
    }

    /// Type of the entry behind a network id; used to decode legacy updates.
    pub fn get_entry_type_by_network_id(&self, id: u16) -> ValueType {
        let inner = lock(&self.inner);
        inner
            .by_network_id(id)
            .and_then(|lid| inner.entry(lid))
            .map_or(ValueType::Unassigned, Entry::value_type)
    }

    /// Network id of `name`, if one has been assigned.
    pub fn network_id(&self, name: &str) -> Option<u16> {
        let inner = lock(&self.inner);
        let id = inner.entry(inner.lookup(name)?)?.id;
        (id != UNASSIGNED_ID).then_some(id)
    }

    pub fn get_flags(&self, name: &str) -> u8 {
        let inner = lock(&self.inner);
        inner
            .lookup(name)
            .and_then(|id| inner.entry(id))
            .map_or(0, |e| e.flags)
    }

    pub fn entry_info_by_id(&self, local_id: LocalId) -> Option<EntryInfo> {
        let inner = lock(&self.inner);
        inner.entry(local_id).map(Entry::info)
    }

    /// Entries with a value whose name starts with `prefix` and whose type is in `types` (0 = any).
    pub fn get_entry_info(&self, prefix: &str, types: u8) -> Vec<EntryInfo> {
        let inner = lock(&self.inner);
        inner
            .entries
            .iter()
            .filter(|e| e.value.is_some())
            .filter(|e| e.name.starts_with(prefix) && e.value_type().matches_mask(types))
            .map(Entry::info)
            .collect()
    }

    pub fn get_entries(&self, prefix: &str, types: u8) -> Vec<LocalId> {
        self.get_entry_info(prefix, types)
            .into_iter()
            .map(|i| i.local_id)
            .collect()
    }

    /// Set a value. False if `name` is empty or the entry holds a different type.
    pub fn set_value(&self, name: &str, value: Value) -> bool {
        if name.is_empty() {
            return false;
        }
        let (ok, sink, out) = {
            let mut inner = lock(&self.inner);
            let id = inner.get_or_create(name);
            let mut out = Vec::new();
            let ok = self.set_value_locked(&mut inner, id, value, false, &mut out);
            (ok, inner.sink(), out)
        };
        self.send(sink, out);
        ok
    }

    pub fn set_value_by_id(&self, local_id: LocalId, value: Value) -> bool {
        let (ok, sink, out) = {
            let mut inner = lock(&self.inner);
            if inner.entry(local_id).is_none() {
                return false;
            }
            let mut out = Vec::new();
            let ok = self.set_value_locked(&mut inner, local_id, value, false, &mut out);
            (ok, inner.sink(), out)
        };
        self.send(sink, out);
        ok
    }

    /// Set only if the entry has no value. Otherwise report whether the existing type matches.
    pub fn set_default_value(&self, name: &str, value: Value) -> bool {
        if name.is_empty() {
            return false;
        }
        let (ok, sink, out) = {
            let mut inner = lock(&self.inner);
            let id = inner.get_or_create(name);
            if let Some(existing) = &inner.entries[id as usize].value {
                return existing.value_type() == value.value_type();
            }
            let mut out = Vec::new();
            let ok = self.set_value_locked(&mut inner, id, value, false, &mut out);
            (ok, inner.sink(), out)
        };
        self.send(sink, out);
        ok
    }

    /// Set a value even if it changes the entry's type.
    pub fn set_typed_value(&self, name: &str, value: Value) {
        if name.is_empty() {
            return;
        }
        let (sink, out) = {
            let mut inner = lock(&self.inner);
            let id = inner.get_or_create(name);
            let mut out = Vec::new();
            self.set_value_locked(&mut inner, id, value, true, &mut out);
            (inner.sink(), out)
        };
        self.send(sink, out);
    }

    fn set_value_locked(
        &self,
        inner: &mut Inner,
        local_id: LocalId,
        value: Value,
        force: bool,
        out: &mut Vec<Outgoing>,
    ) -> bool {
        let entry = inner.entry_mut(local_id);
        if let Some(old) = &entry.value {
            if old.value_type() != value.value_type() && !force {
                return false;
            }
            if *old == value {
                return true;
            }
        }
        let old = entry.value.replace(value.clone());
        entry.seq_num = entry.seq_num.next();
        entry.local_write = true;
        let persistent = entry.is_persistent();
        if inner.server && inner.entries[local_id as usize].id == UNASSIGNED_ID {
            inner.allocate_id(local_id);
        }
        if persistent {
            inner.persistent_dirty = true;
        }
        let entry = &inner.entries[local_id as usize];
        let notify = if old.is_none() { NOTIFY_NEW } else { NOTIFY_UPDATE };
        self.notifier
            .notify(local_id, &entry.name, &value, notify | NOTIFY_LOCAL, None);

        let type_changed = old
            .as_ref()
            .map_or(true, |o| o.value_type() != value.value_type());
        let msg = if type_changed {
            Some(Message::EntryAssign {
                name: entry.name.clone(),
                id: entry.id,
                seq_num: entry.seq_num,
                value,
                flags: entry.flags,
            })
        } else if entry.id != UNASSIGNED_ID {
            Some(Message::EntryUpdate {
                id: entry.id,
                seq_num: entry.seq_num,
                value,
            })
        } else {
            None
        };
        let sent = msg.is_some() && inner.online();
        inner.entry_mut(local_id).pending = !sent;
        out.extend(msg.map(Outgoing::all));
        true
    }

    /// Replace the flags of an entry that has a value.
    pub fn set_flags(&self, name: &str, flags: u8) {
        let (sink, out) = {
            let mut inner = lock(&self.inner);
            let Some(id) = inner.lookup(name) else {
                return;
            };
            let mut out = Vec::new();
            self.set_flags_locked(&mut inner, id, flags, &mut out);
            (inner.sink(), out)
        };
        self.send(sink, out);
    }

    pub fn set_flags_by_id(&self, local_id: LocalId, flags: u8) {
        let (sink, out) = {
            let mut inner = lock(&self.inner);
            if inner.entry(local_id).is_none() {
                return;
            }
            let mut out = Vec::new();
            self.set_flags_locked(&mut inner, local_id, flags, &mut out);
            (inner.sink(), out)
        };
        self.send(sink, out);
    }

    fn set_flags_locked(&self, inner: &mut Inner, local_id: LocalId, flags: u8, out: &mut Vec<Outgoing>) {
        let entry = inner.entry_mut(local_id);
        let Some(value) = entry.value.clone() else {
            return;
        };
        if entry.flags == flags {
            return;
        }
        let persist_changed = (entry.flags ^ flags) & FLAG_PERSISTENT != 0;
        entry.flags = flags;
        let id = entry.id;
        if persist_changed {
            inner.persistent_dirty = true;
        }
        let name = &inner.entries[local_id as usize].name;
        self.notifier
            .notify(local_id, name, &value, NOTIFY_FLAGS | NOTIFY_LOCAL, None);
        if id != UNASSIGNED_ID {
            out.push(Outgoing::all(Message::FlagsUpdate { id, flags }));
        }
    }

    pub fn delete(&self, name: &str) {
        let (sink, out) = {
            let mut inner = lock(&self.inner);
            let Some(local_id) = inner.lookup(name) else {
                return;
            };
            let mut out = Vec::new();
            if let Some(id) = self.delete_locked(&mut inner, local_id, true) {
                if id != UNASSIGNED_ID {
                    out.push(Outgoing::all(Message::EntryDelete { id }));
                }
            }
            (inner.sink(), out)
        };
        self.send(sink, out);
    }

    /// Clear value, flags and network id; the local id survives. Returns the
    /// released network id, or None if the entry had no value.
    fn delete_locked(&self, inner: &mut Inner, local_id: LocalId, local: bool) -> Option<u16> {
        let entry = inner.entry_mut(local_id);
        let old = entry.value.take()?;
        if entry.is_persistent() {
            inner.persistent_dirty = true;
        }
        let entry = inner.entry_mut(local_id);
        entry.flags = 0;
        entry.local_write = false;
        entry.pending = false;
        let id = inner.release_id(local_id);
        inner.rpc_handlers.remove(&local_id);
        let flags = if local {
            NOTIFY_DELETE | NOTIFY_LOCAL
        } else {
            NOTIFY_DELETE
        };
        let name = &inner.entries[local_id as usize].name;
        self.notifier.notify(local_id, name, &old, flags, None);
        Some(id)
    }

    /// Delete every non-persistent entry and tell peers with ClearEntries.
    pub fn delete_all(&self) {
        let (sink, out) = {
            let mut inner = lock(&self.inner);
            let deleted = self.clear_non_persistent(&mut inner, true);
            let out = if deleted > 0 {
                vec![Outgoing::all(Message::ClearEntries)]
            } else {
                Vec::new()
            };
            (inner.sink(), out)
        };
        self.send(sink, out);
    }

    fn clear_non_persistent(&self, inner: &mut Inner, local: bool) -> usize {
        let targets: Vec<LocalId> = inner
            .entries
            .iter()
            .filter(|e| e.value.is_some() && !e.is_persistent())
            .map(|e| e.local_id)
            .collect();
        for &id in &targets {
            self.delete_locked(inner, id, local);
        }
        targets.len()
    }

    /// Delete entries selected by `pred`, sending one Delete per entry.
    pub fn delete_all_matching<P>(&self, pred: P)
    where
        P: Fn(&EntryInfo) -> bool,
    {
        let (sink, out) = {
            let mut inner = lock(&self.inner);
            let targets: Vec<LocalId> = inner
                .entries
                .iter()
                .filter(|e| e.value.is_some() && pred(&e.info()))
                .map(|e| e.local_id)
                .collect();
            let mut out = Vec::new();
            for local_id in targets {
                if let Some(id) = self.delete_locked(&mut inner, local_id, true) {
                    if id != UNASSIGNED_ID {
                        out.push(Outgoing::all(Message::EntryDelete { id }));
                    }
                }
            }
            (inner.sink(), out)
        };
        self.send(sink, out);
    }

    /// Replay matching entries to one listener (immediate notify).
    pub fn notify_entries(&self, prefix: &str, only: ListenerId) {
        let inner = lock(&self.inner);
        for e in inner.entries.iter().filter(|e| e.name.starts_with(prefix)) {
            if let Some(v) = &e.value {
                self.notifier.notify(
                    e.local_id,
                    &e.name,
                    v,
                    NOTIFY_IMMEDIATE | NOTIFY_NEW,
                    Some(only),
                );
            }
        }
    }

    pub fn notify_entry(&self, local_id: LocalId, only: ListenerId) {
        let inner = lock(&self.inner);
        if let Some(e) = inner.entry(local_id) {
            if let Some(v) = &e.value {
                self.notifier.notify(
                    local_id,
                    &e.name,
                    v,
                    NOTIFY_IMMEDIATE | NOTIFY_NEW,
                    Some(only),
                );
            }
        }
    }

    // ---- network ---------------------------------------------------------

    /// Apply one message received from `from`.
    pub fn process_incoming(&self, msg: Message, from: &dyn Remote) {
        match msg {
            Message::ExecuteRpc {
                id,
                call_uid,
                params,
            } => self.process_execute_rpc(id, call_uid, params, from),
            Message::RpcResponse {
                id,
                call_uid,
                result,
            } => self.process_rpc_response(id, call_uid, result),
            msg => {
                let (sink, out) = {
                    let mut inner = lock(&self.inner);
                    let mut out = Vec::new();
                    self.process_entry_message(&mut inner, msg, from, &mut out);
                    (inner.sink(), out)
                };
                self.send(sink, out);
            }
        }
    }

    fn process_entry_message(&self, inner: &mut Inner, msg: Message, from: &dyn Remote, out: &mut Vec<Outgoing>) {
        match msg {
            Message::EntryAssign {
                name,
                id,
                seq_num,
                value,
                flags,
            } => self.process_assign(inner, name, id, seq_num, value, flags, from, out),
            Message::EntryUpdate { id, seq_num, value } => {
                let Some(local_id) = inner.by_network_id(id) else {
                    debug!("update for unknown entry id {}", id);
                    return;
                };
                let server = inner.server;
                let entry = inner.entry_mut(local_id);
                if entry.value.is_none() || !seq_num.is_newer_than(entry.seq_num) {
                    return;
                }
                entry.seq_num = seq_num;
                entry.pending = false;
                if entry.value.as_ref() != Some(&value) {
                    let persistent = entry.is_persistent();
                    entry.value = Some(value.clone());
                    if persistent {
                        inner.persistent_dirty = true;
                    }
                    let name = &inner.entries[local_id as usize].name;
                    self.notifier
                        .notify(local_id, name, &value, NOTIFY_UPDATE, None);
                }
                if server {
                    out.push(Outgoing::except(
                        Message::EntryUpdate { id, seq_num, value },
                        from.uid(),
                    ));
                }
            }
            Message::FlagsUpdate { id, flags } => {
                let Some(local_id) = inner.by_network_id(id) else {
                    debug!("flags update for unknown entry id {}", id);
                    return;
                };
                let server = inner.server;
                let entry = inner.entry_mut(local_id);
                let Some(value) = entry.value.clone() else {
                    return;
                };
                if entry.flags == flags {
                    return;
                }
                if (entry.flags ^ flags) & FLAG_PERSISTENT != 0 {
                    inner.persistent_dirty = true;
                }
                inner.entry_mut(local_id).flags = flags;
                let name = &inner.entries[local_id as usize].name;
                self.notifier
                    .notify(local_id, name, &value, NOTIFY_FLAGS, None);
                if server {
                    out.push(Outgoing::except(Message::FlagsUpdate { id, flags }, from.uid()));
                }
            }
            Message::EntryDelete { id } => {
                let Some(local_id) = inner.by_network_id(id) else {
                    debug!("delete for unknown entry id {}", id);
                    return;
                };
                self.delete_locked(inner, local_id, false);
                if inner.server {
                    out.push(Outgoing::except(Message::EntryDelete { id }, from.uid()));
                }
            }
            Message::ClearEntries => {
                self.clear_non_persistent(inner, false);
                if inner.server {
                    out.push(Outgoing::except(Message::ClearEntries, from.uid()));
                }
            }
            other => debug!("storage ignoring {:?}", other),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_assign(
        &self,
        inner: &mut Inner,
        name: String,
        id: u16,
        seq_num: SequenceNumber,
        value: Value,
        flags: u8,
        from: &dyn Remote,
        out: &mut Vec<Outgoing>,
    ) {
        let server = inner.server;
        let mut may_need_update = false;
        let local_id = if server {
            if id == UNASSIGNED_ID {
                // client asks for an id
                let local_id = inner.get_or_create(&name);
                if inner.entries[local_id as usize].value.is_some() {
                    debug!("id request for existing entry {}", name);
                    return;
                }
                let entry = inner.entry_mut(local_id);
                entry.value = Some(value.clone());
                entry.flags = flags;
                entry.seq_num = seq_num;
                entry.local_write = false;
                entry.pending = false;
                if entry.is_persistent() {
                    inner.persistent_dirty = true;
                }
                let new_id = inner.allocate_id(local_id);
                self.notifier
                    .notify(local_id, &name, &value, NOTIFY_NEW, None);
                out.push(Outgoing::all(Message::EntryAssign {
                    name,
                    id: new_id,
                    seq_num,
                    value,
                    flags,
                }));
                return;
            }
            match inner.by_network_id(id) {
                Some(l) => l,
                None => {
                    debug!("assign for unknown entry id {}", id);
                    return;
                }
            }
        } else {
            if id == UNASSIGNED_ID {
                debug!("client received assign without id for {}", name);
                return;
            }
            match inner.by_network_id(id) {
                Some(l) => l,
                None => {
                    let local_id = inner.get_or_create(&name);
                    let old_id = inner.entries[local_id as usize].id;
                    if old_id != UNASSIGNED_ID {
                        inner.release_id(local_id);
                    }
                    if inner.entries[local_id as usize].value.is_none() {
                        let entry = inner.entry_mut(local_id);
                        entry.value = Some(value.clone());
                        entry.flags = flags;
                        entry.seq_num = seq_num;
                        inner.map_id(id, local_id);
                        self.notifier
                            .notify(local_id, &name, &value, NOTIFY_NEW, None);
                        return;
                    }
                    // server granted an id to an entry we created
                    may_need_update = true;
                    inner.map_id(id, local_id);
                    let local_flags = inner.entries[local_id as usize].flags;
                    if local_flags != flags {
                        out.push(Outgoing::all(Message::FlagsUpdate {
                            id,
                            flags: local_flags,
                        }));
                    }
                    local_id
                }
            }
        };

        let entry = inner.entry_mut(local_id);
        if entry.name != name {
            debug!("assign for id {} names {} but entry is {}", id, name, entry.name);
            return;
        }
        let Some(current) = entry.value.clone() else {
            return;
        };
        if entry.seq_num.is_newer_than(seq_num) {
            // sender is stale; correct it
            if may_need_update || server {
                let correction = Message::EntryUpdate {
                    id,
                    seq_num: entry.seq_num,
                    value: current,
                };
                out.push(if server {
                    Outgoing::only(correction, from.uid())
                } else {
                    Outgoing::all(correction)
                });
            }
            return;
        }

        let mut notify = 0;
        let mut dirty = false;
        if !may_need_update && from.proto_rev() >= PROTO_REV_CURRENT && entry.flags != flags {
            dirty |= (entry.flags ^ flags) & FLAG_PERSISTENT != 0;
            entry.flags = flags;
            notify |= NOTIFY_FLAGS;
        }
        if current != value {
            dirty |= entry.is_persistent();
            entry.value = Some(value.clone());
            notify |= NOTIFY_UPDATE;
        }
        entry.seq_num = seq_num;
        entry.pending = false;
        let entry_flags = entry.flags;
        if dirty {
            inner.persistent_dirty = true;
        }
        if notify != 0 {
            self.notifier.notify(local_id, &name, &value, notify, None);
        }
        if server {
            out.push(Outgoing::except(
                Message::EntryAssign {
                    name,
                    id,
                    seq_num,
                    value,
                    flags: entry_flags,
                },
                from.uid(),
            ));
        }
    }

    /// Server: snapshot of every live entry for a new client. Marks it Synchronized
    /// under the storage lock so no change can fall between snapshot and live traffic.
    pub fn get_initial_assignments(&self, conn: &dyn Remote) -> Vec<Message> {
        let inner = lock(&self.inner);
        conn.set_state(ConnectionState::Synchronized);
        inner
            .entries
            .iter()
            .filter(|e| e.id != UNASSIGNED_ID)
            .filter_map(|e| {
                e.value.as_ref().map(|v| Message::EntryAssign {
                    name: e.name.clone(),
                    id: e.id,
                    seq_num: e.seq_num,
                    value: v.clone(),
                    flags: e.flags,
                })
            })
            .collect()
    }

    /// Client: reconcile the local replica with the server's initial assignments.
    /// Returns assigns for locally written entries the server does not know,
    /// to be sent before the end of the handshake. Updates for local writes
    /// that win over the server's copy are queued on the connection.
    pub fn apply_initial_assignments(
        &self,
        conn: &dyn Remote,
        msgs: Vec<Message>,
        new_server: bool,
    ) -> Vec<Message> {
        let (sink, updates, assigns) = {
            let mut inner = lock(&self.inner);
            if inner.server {
                return Vec::new();
            }
            conn.set_state(ConnectionState::Synchronized);
            let mut updates = Vec::new();

            for e in inner.entries.iter_mut() {
                e.id = UNASSIGNED_ID;
            }
            inner.id_map.clear();

            for msg in msgs {
                let Message::EntryAssign {
                    name,
                    id,
                    seq_num,
                    value,
                    flags,
                } = msg
                else {
                    debug!("non-assign message in initial assignments");
                    continue;
                };
                if id == UNASSIGNED_ID {
                    debug!("initial assignment of {} without id", name);
                    continue;
                }
                if inner.by_network_id(id).is_some() {
                    debug!("duplicate initial assignment for id {}", id);
                    continue;
                }
                let local_id = inner.get_or_create(&name);
                let rev = conn.proto_rev();
                let entry = inner.entry_mut(local_id);
                let mut dirty = false;
                match entry.value.clone() {
                    None => {
                        entry.value = Some(value.clone());
                        entry.flags = flags;
                        entry.seq_num = seq_num;
                        dirty = entry.is_persistent();
                        self.notifier
                            .notify(local_id, &name, &value, NOTIFY_NEW, None);
                    }
                    Some(local)
                        if entry.pending
                            && !entry.is_persistent()
                            && (new_server || !seq_num.is_newer_than(entry.seq_num)) =>
                    {
                        if !entry.seq_num.is_newer_than(seq_num) {
                            entry.seq_num = seq_num.next();
                        }
                        entry.pending = false;
                        updates.push(Outgoing::all(Message::EntryUpdate {
                            id,
                            seq_num: entry.seq_num,
                            value: local,
                        }));
                    }
                    Some(local) => {
                        let mut notify = 0;
                        if rev >= PROTO_REV_CURRENT && entry.flags != flags {
                            dirty |= (entry.flags ^ flags) & FLAG_PERSISTENT != 0;
                            entry.flags = flags;
                            notify |= NOTIFY_FLAGS;
                        }
                        if local != value {
                            dirty |= entry.is_persistent();
                            entry.value = Some(value.clone());
                            notify |= NOTIFY_UPDATE;
                        }
                        entry.seq_num = seq_num;
                        entry.pending = false;
                        if notify != 0 {
                            self.notifier.notify(local_id, &name, &value, notify, None);
                        }
                    }
                }
                if dirty {
                    inner.persistent_dirty = true;
                }
                inner.map_id(id, local_id);
            }

            let orphans: Vec<LocalId> = inner
                .entries
                .iter()
                .filter(|e| e.value.is_some() && e.id == UNASSIGNED_ID)
                .map(|e| e.local_id)
                .collect();
            let mut assigns = Vec::new();
            for local_id in orphans {
                let e = inner.entry_mut(local_id);
                if e.local_write {
                    e.pending = false;
                    if let Some(v) = &e.value {
                        assigns.push(Message::EntryAssign {
                            name: e.name.clone(),
                            id: UNASSIGNED_ID,
                            seq_num: e.seq_num,
                            value: v.clone(),
                            flags: e.flags,
                        });
                    }
                } else {
                    self.delete_locked(&mut inner, local_id, false);
                }
            }
            (inner.sink(), updates, assigns)
        };
        self.send(sink, updates);
        assigns
    }

    // ---- rpc -------------------------------------------------------------

    /// Create (or redefine) an RPC entry served by `handler`. False on type conflict.
    pub fn create_rpc(&self, name: &str, definition: Vec<u8>, handler: RpcHandler) -> bool {
        if name.is_empty() {
            return false;
        }
        let (sink, out) = {
            let mut inner = lock(&self.inner);
            let local_id = inner.get_or_create(name);
            let mut out = Vec::new();
            if !self.set_value_locked(&mut inner, local_id, Value::Rpc(definition), false, &mut out) {
                return false;
            }
            inner.rpc_handlers.insert(local_id, handler);
            (inner.sink(), out)
        };
        self.send(sink, out);
        true
    }

    /// Start a call. On a client this sends ExecuteRpc; on the server the handler runs inline.
    pub fn call_rpc(&self, name: &str, params: Vec<u8>) -> Option<RpcCallId> {
        let (call, sink, local) = {
            let mut inner = lock(&self.inner);
            let local_id = inner.lookup(name)?;
            let server = inner.server;
            let handler = inner.rpc_handlers.get(&local_id).cloned();
            let entry = inner.entry_mut(local_id);
            if !matches!(entry.value, Some(Value::Rpc(_))) {
                return None;
            }
            if !server && entry.id == UNASSIGNED_ID {
                return None;
            }
            entry.rpc_call_uid = entry.rpc_call_uid.wrapping_add(1);
            let call = RpcCallId {
                local_id,
                call_uid: entry.rpc_call_uid,
            };
            let rpc = RpcCall {
                local_id,
                name: entry.name.clone(),
                call_uid: call.call_uid,
                params,
                caller: None,
            };
            if server {
                (call, None, Some((handler?, rpc)))
            } else {
                let msg = Message::ExecuteRpc {
                    id: entry.id,
                    call_uid: call.call_uid,
                    params: rpc.params,
                };
                (call, inner.sink().map(|s| (s, msg)), None)
            }
        };
        if let Some((handler, rpc)) = local {
            let result = handler(&rpc);
            self.store_rpc_result(call, result);
        }
        if let Some((sink, msg)) = sink {
            sink.queue_outgoing(msg, None, None);
        }
        Some(call)
    }

    /// Wait for a call's result. `timeout: None` waits until the result arrives or the wait is cancelled.
    pub fn get_rpc_result(&self, call: RpcCallId, timeout: Option<Duration>) -> Option<Vec<u8>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut st = lock(&self.rpc_results);
        if !st.waiting.insert(call) {
            // someone else is already waiting on this call
            return None;
        }
        loop {
            if let Some(r) = st.results.remove(&call) {
                st.waiting.remove(&call);
                return Some(r);
            }
            if !st.waiting.contains(&call) {
                return None;
            }
            match deadline {
                None => st = wait(&self.rpc_cv, st),
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        st.waiting.remove(&call);
                        return None;
                    }
                    st = wait_timeout(&self.rpc_cv, st, d - now).0;
                }
            }
        }
    }

    pub fn cancel_rpc_result(&self, call: RpcCallId) {
        lock(&self.rpc_results).waiting.remove(&call);
        self.rpc_cv.notify_all();
    }

    fn store_rpc_result(&self, call: RpcCallId, result: Vec<u8>) {
        lock(&self.rpc_results).results.insert(call, result);
        self.rpc_cv.notify_all();
    }

    fn process_execute_rpc(&self, id: u16, call_uid: u16, params: Vec<u8>, from: &dyn Remote) {
        let (handler, call) = {
            let inner = lock(&self.inner);
            if !inner.server {
                debug!("client ignoring ExecuteRpc");
                return;
            }
            let Some(local_id) = inner.by_network_id(id) else {
                debug!("rpc call for unknown entry id {}", id);
                return;
            };
            let Some(entry) = inner.entry(local_id) else {
                return;
            };
            if !matches!(entry.value, Some(Value::Rpc(_))) {
                debug!("rpc call to non-rpc entry {}", entry.name);
                return;
            }
            let Some(handler) = inner.rpc_handlers.get(&local_id).cloned() else {
                debug!("no handler for rpc {}", entry.name);
                return;
            };
            let call = RpcCall {
                local_id,
                name: entry.name.clone(),
                call_uid,
                params,
                caller: Some(from.uid()),
            };
            (handler, call)
        };
        let result = handler(&call);
        let sink = lock(&self.inner).sink();
        if let Some(sink) = sink {
            sink.queue_outgoing(
                Message::RpcResponse {
                    id,
                    call_uid,
                    result,
                },
                Some(from.uid()),
                None,
            );
        }
    }

    fn process_rpc_response(&self, id: u16, call_uid: u16, result: Vec<u8>) {
        let local_id = {
            let inner = lock(&self.inner);
            if inner.server {
                debug!("server ignoring RpcResponse");
                return;
            }
            match inner.by_network_id(id) {
                Some(l) => l,
                None => {
                    debug!("rpc response for unknown entry id {}", id);
                    return;
                }
            }
        };
        self.store_rpc_result(RpcCallId { local_id, call_uid }, result);
    }

    // ---- persistence -----------------------------------------------------

    /// Persistent entries with values, sorted by name.
    pub fn persistent_entries(&self) -> Vec<(String, Value)> {
        let inner = lock(&self.inner);
        let mut out: Vec<(String, Value)> = inner
            .entries
            .iter()
            .filter(|e| e.is_persistent())
            .filter_map(|e| e.value.clone().map(|v| (e.name.clone(), v)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Save persistent entries to `path`. A periodic save is skipped when nothing changed.
    pub fn save_persistent(&self, path: &Path, periodic: bool) -> Result<(), PersistError> {
        {
            let mut inner = lock(&self.inner);
            if periodic && !inner.persistent_dirty {
                return Ok(());
            }
            inner.persistent_dirty = false;
        }
        let entries = self.persistent_entries();
        let res = persistence::save_file(path, &entries);
        if res.is_err() {
            lock(&self.inner).persistent_dirty = true;
        }
        res
    }

    /// Load a persistent file and apply it as local writes. Returns the number of entries applied.
    pub fn load_persistent(&self, path: &Path) -> Result<usize, PersistError> {
        let file = File::open(path)?;
        let entries = persistence::load(BufReader::new(file), &path.display().to_string())?;
        let n = entries.len();
        self.apply_persistent(entries);
        info!("loaded {} persistent entries from {}", n, path.display());
        Ok(n)
    }

    /// Apply loaded values: each becomes a persistent local write.
    pub fn apply_persistent(&self, entries: Vec<(String, Value)>) {
        let (sink, out) = {
            let mut inner = lock(&self.inner);
            let mut out = Vec::new();
            for (name, value) in entries {
                let local_id = inner.get_or_create(&name);
                let server = inner.server;
                let entry = inner.entry_mut(local_id);
                let old = entry.value.replace(value.clone());
                let was_persistent = entry.is_persistent();
                entry.flags |= FLAG_PERSISTENT;
                entry.local_write = true;
                entry.seq_num = entry.seq_num.next();
                if server && entry.id == UNASSIGNED_ID {
                    inner.allocate_id(local_id);
                }
                let entry = &inner.entries[local_id as usize];
                let notify = match &old {
                    None => NOTIFY_NEW,
                    Some(o) if *o != value => NOTIFY_UPDATE,
                    Some(_) if !was_persistent => NOTIFY_FLAGS,
                    Some(_) => 0,
                };
                if notify != 0 {
                    self.notifier
                        .notify(local_id, &name, &value, notify | NOTIFY_LOCAL, None);
                }
                let type_changed = old
                    .as_ref()
                    .map_or(true, |o| o.value_type() != value.value_type());
                if type_changed {
                    out.push(Outgoing::all(Message::EntryAssign {
                        name,
                        id: entry.id,
                        seq_num: entry.seq_num,
                        value,
                        flags: entry.flags,
                    }));
                } else if entry.id != UNASSIGNED_ID {
                    if old.as_ref() != Some(&value) {
                        out.push(Outgoing::all(Message::EntryUpdate {
                            id: entry.id,
                            seq_num: entry.seq_num,
                            value,
                        }));
                    }
                    if !was_persistent {
                        out.push(Outgoing::all(Message::FlagsUpdate {
                            id: entry.id,
                            flags: entry.flags,
                        }));
                    }
                }
            }
            (inner.sink(), out)
        };
        self.send(sink, out);
    }

    pub fn persistent_dirty(&self) -> bool {
        lock(&self.inner).persistent_dirty
    }
}
