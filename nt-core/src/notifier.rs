//! Entry and connection listeners on top of [`CallbackManager`].

use std::sync::atomic::{AtomicBool, Ordering};

use crate::callback::{CallbackManager, ListenerFilter, ListenerId, PollerId, QueuePolicy};
use crate::connection::ConnectionInfo;
use crate::entry::LocalId;
use crate::value::Value;

/// Replay current matching entries to a listener when it is added.
pub const NOTIFY_IMMEDIATE: u8 = 0x01;
/// Change was made through the local API rather than received.
pub const NOTIFY_LOCAL: u8 = 0x02;
pub const NOTIFY_NEW: u8 = 0x04;
pub const NOTIFY_DELETE: u8 = 0x08;
pub const NOTIFY_UPDATE: u8 = 0x10;
pub const NOTIFY_FLAGS: u8 = 0x20;

const ORIGIN_BITS: u8 = NOTIFY_IMMEDIATE | NOTIFY_LOCAL;
const CHANGE_BITS: u8 = NOTIFY_UPDATE | NOTIFY_FLAGS;

/// One entry change. For deletes `value` is the value before deletion.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryNotification {
    pub local_id: LocalId,
    pub name: String,
    pub value: Value,
    pub flags: u8,
}

/// Prefix or single-entry listener with a set of wanted event flags.
#[derive(Debug, Clone)]
pub struct EntryFilter {
    target: EntryTarget,
    flags: u8,
}

#[derive(Debug, Clone)]
enum EntryTarget {
    Prefix(String),
    Entry(LocalId),
}

impl EntryFilter {
    pub fn prefix(prefix: impl Into<String>, flags: u8) -> Self {
        EntryFilter {
            target: EntryTarget::Prefix(prefix.into()),
            flags,
        }
    }

    pub fn entry(local_id: LocalId, flags: u8) -> Self {
        EntryFilter {
            target: EntryTarget::Entry(local_id),
            flags,
        }
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }
}

impl ListenerFilter<EntryNotification> for EntryFilter {
    fn matches(&self, ev: &EntryNotification) -> bool {
        let target_ok = match &self.target {
            EntryTarget::Prefix(p) => ev.name.starts_with(p.as_str()),
            EntryTarget::Entry(id) => ev.local_id == *id,
        };
        if !target_ok {
            return false;
        }
        if ev.flags & NOTIFY_LOCAL != 0 && self.flags & NOTIFY_LOCAL == 0 {
            return false;
        }
        let mut listen = self.flags & !ORIGIN_BITS;
        let mut flags = ev.flags & !ORIGIN_BITS;
        // an assign can change value and flags at once; either interest is enough
        if flags & CHANGE_BITS == CHANGE_BITS {
            if listen & CHANGE_BITS == 0 {
                return false;
            }
            listen &= !CHANGE_BITS;
            flags &= !CHANGE_BITS;
        }
        flags & !listen == 0
    }
}

/// Entry listener registry. Tracks whether anyone wants local changes so the
/// common server case does not queue events nobody reads.
pub struct EntryNotifier {
    manager: CallbackManager<EntryFilter, EntryNotification>,
    local_notifiers: AtomicBool,
}

impl EntryNotifier {
    pub fn new(policy: QueuePolicy) -> Self {
        EntryNotifier {
            manager: CallbackManager::new("entry-notifier", policy),
            local_notifiers: AtomicBool::new(false),
        }
    }

    pub fn add<C>(&self, filter: EntryFilter, callback: C) -> ListenerId
    where
        C: Fn(ListenerId, &EntryNotification) + Send + Sync + 'static,
    {
        self.note_local(&filter);
        self.manager.add(filter, callback)
    }

    pub fn add_polled(&self, poller: PollerId, filter: EntryFilter) -> Option<ListenerId> {
        self.note_local(&filter);
        self.manager.add_polled(poller, filter)
    }

    fn note_local(&self, filter: &EntryFilter) {
        if filter.flags & NOTIFY_LOCAL != 0 {
            self.local_notifiers.store(true, Ordering::Release);
        }
    }

    pub fn local_notifiers(&self) -> bool {
        self.local_notifiers.load(Ordering::Acquire)
    }

    pub fn notify(
        &self,
        local_id: LocalId,
        name: &str,
        value: &Value,
        flags: u8,
        only: Option<ListenerId>,
    ) {
        if flags & NOTIFY_LOCAL != 0 && !self.local_notifiers() {
            return;
        }
        if !self.manager.has_listeners() {
            return;
        }
        self.manager.send(
            only,
            EntryNotification {
                local_id,
                name: name.to_owned(),
                value: value.clone(),
                flags,
            },
        );
    }

    pub fn manager(&self) -> &CallbackManager<EntryFilter, EntryNotification> {
        &self.manager
    }
}

/// Connection came up (`connected`) or went down.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionNotification {
    pub connected: bool,
    pub info: ConnectionInfo,
}

/// Connection listeners see every connection event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllConnections;

impl ListenerFilter<ConnectionNotification> for AllConnections {
    fn matches(&self, _: &ConnectionNotification) -> bool {
        true
    }
}

pub type ConnectionNotifier = CallbackManager<AllConnections, ConnectionNotification>;
