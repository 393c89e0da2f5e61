//! The instance handle: one storage, one dispatcher and the two notifiers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::callback::{ListenerId, PollError, PollerId, QueuePolicy};
use crate::connection::ConnectionInfo;
use crate::dispatcher::{Dispatcher, DispatcherError, NetworkMode};
use crate::entry::{EntryInfo, LocalId};
use crate::notifier::{
    AllConnections, ConnectionNotification, ConnectionNotifier, EntryFilter, EntryNotification,
    EntryNotifier, NOTIFY_IMMEDIATE,
};
use crate::persistence::PersistError;
use crate::storage::{RpcCallId, RpcHandler, Storage};
use crate::value::{Value, ValueType};

/// A NetworkTables node. Acts as server or client once started; until then
/// it is a local table with listeners.
pub struct NtInstance {
    dispatcher: Dispatcher,
    storage: Arc<Storage>,
    entry_notifier: Arc<EntryNotifier>,
    connection_notifier: Arc<ConnectionNotifier>,
}

impl Default for NtInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl NtInstance {
    pub fn new() -> Self {
        Self::with_queue_policy(QueuePolicy::default())
    }

    /// Instance whose listener queues follow `policy`.
    pub fn with_queue_policy(policy: QueuePolicy) -> Self {
        let entry_notifier = Arc::new(EntryNotifier::new(policy));
        let connection_notifier = Arc::new(ConnectionNotifier::new("connection-notifier", policy));
        let storage = Arc::new(Storage::new(entry_notifier.clone()));
        let dispatcher = Dispatcher::new(storage.clone(), connection_notifier.clone());
        NtInstance {
            dispatcher,
            storage,
            entry_notifier,
            connection_notifier,
        }
    }

    // ---- entries ---------------------------------------------------------

    pub fn get_entry(&self, name: &str) -> LocalId {
        self.storage.get_or_create(name)
    }

    pub fn get_entry_value(&self, name: &str) -> Option<Value> {
        self.storage.get_entry_value(name)
    }

    pub fn get_entry_value_by_id(&self, local_id: LocalId) -> Option<Value> {
        self.storage.get_entry_value_by_id(local_id)
    }

    pub fn get_entry_type(&self, name: &str) -> ValueType {
        self.storage.get_entry_type(name)
    }

    pub fn get_entry_flags(&self, name: &str) -> u8 {
        self.storage.get_flags(name)
    }

    pub fn get_entry_info(&self, prefix: &str, types: u8) -> Vec<EntryInfo> {
        self.storage.get_entry_info(prefix, types)
    }

    pub fn get_entries(&self, prefix: &str, types: u8) -> Vec<LocalId> {
        self.storage.get_entries(prefix, types)
    }

    /// False if `name` is empty or already holds a different type.
    pub fn set_entry_value(&self, name: &str, value: Value) -> bool {
        self.storage.set_value(name, value)
    }

    pub fn set_entry_value_by_id(&self, local_id: LocalId, value: Value) -> bool {
        self.storage.set_value_by_id(local_id, value)
    }

    pub fn set_default_entry_value(&self, name: &str, value: Value) -> bool {
        self.storage.set_default_value(name, value)
    }

    /// Set even if the type changes.
    pub fn set_entry_type_value(&self, name: &str, value: Value) {
        self.storage.set_typed_value(name, value)
    }

    pub fn set_entry_flags(&self, name: &str, flags: u8) {
        self.storage.set_flags(name, flags)
    }

    pub fn set_entry_flags_by_id(&self, local_id: LocalId, flags: u8) {
        self.storage.set_flags_by_id(local_id, flags)
    }

    pub fn delete_entry(&self, name: &str) {
        self.storage.delete(name)
    }

    /// Delete every non-persistent entry.
    pub fn delete_all_entries(&self) {
        self.storage.delete_all()
    }

    pub fn delete_entries_matching<P>(&self, pred: P)
    where
        P: Fn(&EntryInfo) -> bool,
    {
        self.storage.delete_all_matching(pred)
    }

    // ---- entry listeners -------------------------------------------------

    pub fn add_entry_listener<C>(&self, prefix: &str, flags: u8, callback: C) -> ListenerId
    where
        C: Fn(ListenerId, &EntryNotification) + Send + Sync + 'static,
    {
        let id = self
            .entry_notifier
            .add(EntryFilter::prefix(prefix, flags), callback);
        if flags & NOTIFY_IMMEDIATE != 0 {
            self.storage.notify_entries(prefix, id);
        }
        id
    }

    pub fn add_entry_listener_by_id<C>(&self, local_id: LocalId, flags: u8, callback: C) -> ListenerId
    where
        C: Fn(ListenerId, &EntryNotification) + Send + Sync + 'static,
    {
        let id = self
            .entry_notifier
            .add(EntryFilter::entry(local_id, flags), callback);
        if flags & NOTIFY_IMMEDIATE != 0 {
            self.storage.notify_entry(local_id, id);
        }
        id
    }

    pub fn remove_entry_listener(&self, listener: ListenerId) -> bool {
        self.entry_notifier.manager().remove(listener)
    }

    pub fn create_entry_poller(&self) -> PollerId {
        self.entry_notifier.manager().create_poller()
    }

    pub fn add_polled_entry_listener(&self, poller: PollerId, prefix: &str, flags: u8) -> Option<ListenerId> {
        let id = self
            .entry_notifier
            .add_polled(poller, EntryFilter::prefix(prefix, flags))?;
        if flags & NOTIFY_IMMEDIATE != 0 {
            self.storage.notify_entries(prefix, id);
        }
        Some(id)
    }

    pub fn poll_entry_listener(
        &self,
        poller: PollerId,
        timeout: Option<Duration>,
    ) -> Result<Vec<(ListenerId, EntryNotification)>, PollError> {
        self.entry_notifier.manager().poll(poller, timeout)
    }

    pub fn cancel_entry_poll(&self, poller: PollerId) {
        self.entry_notifier.manager().cancel_poll(poller)
    }

    pub fn remove_entry_poller(&self, poller: PollerId) {
        self.entry_notifier.manager().remove_poller(poller)
    }

    /// Wait until queued entry notifications have been delivered.
    pub fn wait_for_entry_listener_queue(&self, timeout: Duration) -> bool {
        self.entry_notifier.manager().wait_for_queue(timeout)
    }

    // ---- connection listeners --------------------------------------------

    /// With `immediate`, the listener is first told about every active connection.
    pub fn add_connection_listener<C>(&self, immediate: bool, callback: C) -> ListenerId
    where
        C: Fn(ListenerId, &ConnectionNotification) + Send + Sync + 'static,
    {
        let id = self.connection_notifier.add(AllConnections, callback);
        if immediate {
            self.dispatcher.notify_connections(id);
        }
        id
    }

    pub fn remove_connection_listener(&self, listener: ListenerId) -> bool {
        self.connection_notifier.remove(listener)
    }

    pub fn create_connection_poller(&self) -> PollerId {
        self.connection_notifier.create_poller()
    }

    pub fn add_polled_connection_listener(&self, poller: PollerId, immediate: bool) -> Option<ListenerId> {
        let id = self.connection_notifier.add_polled(poller, AllConnections)?;
        if immediate {
            self.dispatcher.notify_connections(id);
        }
        Some(id)
    }

    pub fn poll_connection_listener(
        &self,
        poller: PollerId,
        timeout: Option<Duration>,
    ) -> Result<Vec<(ListenerId, ConnectionNotification)>, PollError> {
        self.connection_notifier.poll(poller, timeout)
    }

    pub fn cancel_connection_poll(&self, poller: PollerId) {
        self.connection_notifier.cancel_poll(poller)
    }

    pub fn remove_connection_poller(&self, poller: PollerId) {
        self.connection_notifier.remove_poller(poller)
    }

    pub fn wait_for_connection_listener_queue(&self, timeout: Duration) -> bool {
        self.connection_notifier.wait_for_queue(timeout)
    }

    // ---- network ---------------------------------------------------------

    pub fn set_network_identity(&self, identity: &str) {
        self.dispatcher.set_identity(identity)
    }

    pub fn start_server(
        &self,
        persist_file: Option<PathBuf>,
        listen_address: &str,
        port: u16,
    ) -> Result<(), DispatcherError> {
        self.dispatcher.start_server(persist_file, listen_address, port)
    }

    pub fn start_client(&self, servers: Vec<(String, u16)>) -> Result<(), DispatcherError> {
        self.dispatcher.start_client(servers)
    }

    pub fn start_test_mode(&self, server: bool) -> Result<(), DispatcherError> {
        self.dispatcher.start_test_mode(server)
    }

    /// Stop serving or connecting. Entries stay.
    pub fn stop(&self) {
        self.dispatcher.stop()
    }

    pub fn set_server_override(&self, host: &str, port: u16) {
        self.dispatcher
            .set_server_override(Some((host.to_owned(), port)))
    }

    pub fn clear_server_override(&self) {
        self.dispatcher.set_server_override(None)
    }

    pub fn set_update_rate(&self, rate: Duration) {
        self.dispatcher.set_update_rate(rate)
    }

    pub fn set_default_proto_rev(&self, rev: u16) {
        self.dispatcher.set_default_proto_rev(rev)
    }

    /// Push pending changes now instead of at the next update tick.
    pub fn flush(&self) {
        self.dispatcher.flush()
    }

    pub fn reconnect(&self) {
        self.dispatcher.reconnect()
    }

    pub fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.dispatcher.get_connections()
    }

    pub fn is_connected(&self) -> bool {
        self.dispatcher.is_connected()
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.dispatcher.network_mode()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.dispatcher.local_addr()
    }

    // ---- rpc -------------------------------------------------------------

    pub fn create_rpc(&self, name: &str, definition: Vec<u8>, handler: RpcHandler) -> bool {
        self.storage.create_rpc(name, definition, handler)
    }

    pub fn call_rpc(&self, name: &str, params: Vec<u8>) -> Option<RpcCallId> {
        self.storage.call_rpc(name, params)
    }

    pub fn get_rpc_result(&self, call: RpcCallId, timeout: Option<Duration>) -> Option<Vec<u8>> {
        self.storage.get_rpc_result(call, timeout)
    }

    pub fn cancel_rpc_result(&self, call: RpcCallId) {
        self.storage.cancel_rpc_result(call)
    }

    // ---- persistence -----------------------------------------------------

    pub fn save_persistent(&self, path: &Path) -> Result<(), PersistError> {
        self.storage.save_persistent(path, false)
    }

    pub fn load_persistent(&self, path: &Path) -> Result<usize, PersistError> {
        self.storage.load_persistent(path)
    }
}

impl Drop for NtInstance {
    fn drop(&mut self) {
        self.dispatcher.stop();
        self.entry_notifier.manager().stop();
        self.connection_notifier.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::{NOTIFY_LOCAL, NOTIFY_NEW, NOTIFY_UPDATE};
    use crate::protocol::{PROTO_REV_CURRENT, PROTO_REV_LEGACY};
    use crate::storage::RpcCall;
    use std::sync::Mutex;
    use std::time::Instant;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn server(identity: &str) -> (NtInstance, u16) {
        let nt = NtInstance::new();
        nt.set_network_identity(identity);
        nt.set_update_rate(Duration::from_millis(10));
        nt.start_server(None, "127.0.0.1", 0).unwrap();
        let port = nt.local_addr().unwrap().port();
        (nt, port)
    }

    fn client(identity: &str, port: u16) -> NtInstance {
        let nt = NtInstance::new();
        nt.set_network_identity(identity);
        nt.set_update_rate(Duration::from_millis(10));
        nt.start_client(vec![("127.0.0.1".to_string(), port)]).unwrap();
        nt
    }

    #[test]
    fn values_flow_both_ways_and_deletes_propagate() {
        init_logger();
        let (srv, port) = server("srv");
        let cli = client("cli", port);
        eventually("connection", || cli.is_connected() && srv.is_connected());

        assert!(cli.set_entry_value("/k", Value::String("hello".into())));
        eventually("server sees client write", || {
            srv.get_entry_value("/k") == Some(Value::String("hello".into()))
        });
        assert_eq!(srv.storage.network_id("/k"), Some(0));

        assert!(srv.set_entry_value("/k", Value::String("world".into())));
        eventually("client sees server write", || {
            cli.get_entry_value("/k") == Some(Value::String("world".into()))
        });

        srv.delete_entry("/k");
        eventually("client sees delete", || {
            cli.get_entry_type("/k") == ValueType::Unassigned
        });
    }

    #[test]
    fn connection_listeners_see_identities() {
        init_logger();
        let (srv, port) = server("srv");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        srv.add_connection_listener(false, move |_, n| {
            s.lock().unwrap().push((n.connected, n.info.remote_id.clone()))
        });
        let cli = client("cli", port);
        eventually("connection", || cli.is_connected());

        let infos = cli.get_connections();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].remote_id, "srv");
        assert_eq!(infos[0].protocol_version, PROTO_REV_CURRENT);
        assert_eq!(cli.network_mode(), NetworkMode::CLIENT);

        // a late listener asking for immediate notify learns about the live link
        assert!(cli.wait_for_connection_listener_queue(Duration::from_secs(2)));
        let late = Arc::new(Mutex::new(0));
        let l = late.clone();
        cli.add_connection_listener(true, move |_, n| {
            if n.connected {
                *l.lock().unwrap() += 1;
            }
        });
        assert!(cli.wait_for_connection_listener_queue(Duration::from_secs(2)));

        drop(cli);
        eventually("disconnect event", || seen.lock().unwrap().len() == 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(true, "cli".to_string()), (false, "cli".to_string())]
        );
        assert_eq!(*late.lock().unwrap(), 1);
    }

    #[test]
    fn client_falls_back_to_legacy_server() {
        init_logger();
        let srv = NtInstance::new();
        srv.set_default_proto_rev(PROTO_REV_LEGACY);
        srv.set_update_rate(Duration::from_millis(10));
        srv.start_server(None, "127.0.0.1", 0).unwrap();
        let port = srv.local_addr().unwrap().port();
        srv.set_entry_value("/speed", Value::Double(3.5));

        let cli = client("cli", port);
        eventually("legacy connection", || cli.is_connected());
        assert_eq!(cli.get_connections()[0].protocol_version, PROTO_REV_LEGACY);
        eventually("initial value", || {
            cli.get_entry_value("/speed") == Some(Value::Double(3.5))
        });
        cli.set_entry_value("/speed", Value::Double(4.0));
        eventually("legacy update", || {
            srv.get_entry_value("/speed") == Some(Value::Double(4.0))
        });
    }

    #[test]
    fn reconnect_to_fresh_server_reoffers_local_writes() {
        init_logger();
        let (srv, port) = server("first");
        srv.set_entry_value("/theirs", Value::Double(1.0));
        let cli = client("cli", port);
        eventually("initial sync", || cli.get_entry_value("/theirs").is_some());
        cli.set_entry_value("/mine", Value::Boolean(true));
        eventually("client write", || srv.get_entry_value("/mine").is_some());

        drop(srv);
        eventually("client notices", || !cli.is_connected());

        let fresh = NtInstance::new();
        fresh.set_update_rate(Duration::from_millis(10));
        fresh.start_server(None, "127.0.0.1", port).unwrap();
        eventually("reconnect", || cli.is_connected());
        eventually("local write re-offered", || {
            fresh.get_entry_value("/mine") == Some(Value::Boolean(true))
        });
        eventually("server-only entry dropped", || {
            cli.get_entry_type("/theirs") == ValueType::Unassigned
        });
    }

    #[test]
    fn rpc_call_is_routed_to_server_handler() {
        init_logger();
        let (srv, port) = server("srv");
        let handler: RpcHandler =
            Arc::new(|call: &RpcCall| call.params.iter().rev().copied().collect());
        assert!(srv.create_rpc("/reverse", vec![1], handler));
        let cli = client("cli", port);
        eventually("rpc entry", || cli.get_entry_type("/reverse") == ValueType::Rpc);

        let call = cli.call_rpc("/reverse", vec![1, 2, 3]).unwrap();
        cli.flush();
        assert_eq!(
            cli.get_rpc_result(call, Some(Duration::from_secs(5))),
            Some(vec![3, 2, 1])
        );
    }

    #[test]
    fn immediate_listener_gets_current_entries_only_for_itself() {
        let nt = NtInstance::new();
        nt.set_entry_value("/a/x", Value::Double(1.0));
        nt.set_entry_value("/b/y", Value::Double(2.0));

        let first = Arc::new(Mutex::new(Vec::new()));
        let f = first.clone();
        nt.add_entry_listener("/", NOTIFY_NEW | NOTIFY_UPDATE, move |_, n| {
            f.lock().unwrap().push(n.name.clone())
        });
        let second = Arc::new(Mutex::new(Vec::new()));
        let s = second.clone();
        nt.add_entry_listener("/a", NOTIFY_IMMEDIATE | NOTIFY_NEW, move |_, n| {
            s.lock().unwrap().push((n.name.clone(), n.flags))
        });
        assert!(nt.wait_for_entry_listener_queue(Duration::from_secs(2)));
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(
            *second.lock().unwrap(),
            vec![("/a/x".to_string(), NOTIFY_IMMEDIATE | NOTIFY_NEW)]
        );
    }

    #[test]
    fn local_changes_reach_local_pollers() {
        let nt = NtInstance::new();
        let poller = nt.create_entry_poller();
        nt.add_polled_entry_listener(poller, "/", NOTIFY_NEW | NOTIFY_UPDATE | NOTIFY_LOCAL)
            .unwrap();
        nt.set_entry_value("/v", Value::Double(1.0));
        nt.set_entry_value("/v", Value::Double(2.0));
        let mut got = Vec::new();
        while got.len() < 2 {
            got.extend(nt.poll_entry_listener(poller, Some(Duration::from_secs(2))).unwrap());
        }
        assert_eq!(got[0].1.flags, NOTIFY_NEW | NOTIFY_LOCAL);
        assert_eq!(got[1].1.flags, NOTIFY_UPDATE | NOTIFY_LOCAL);
        assert_eq!(got[1].1.value, Value::Double(2.0));

        nt.cancel_entry_poll(poller);
        assert_eq!(nt.poll_entry_listener(poller, None), Err(PollError::Cancelled));
    }

    #[test]
    fn persistent_round_trip_through_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("networktables.ini");
        let nt = NtInstance::new();
        nt.set_entry_value("/keep", Value::DoubleArray(vec![1.0, 2.0]));
        nt.set_entry_flags("/keep", crate::protocol::FLAG_PERSISTENT);
        nt.set_entry_value("/drop", Value::Boolean(true));
        nt.save_persistent(&path).unwrap();

        let other = NtInstance::new();
        assert_eq!(other.load_persistent(&path).unwrap(), 1);
        assert_eq!(
            other.get_entry_value("/keep"),
            Some(Value::DoubleArray(vec![1.0, 2.0]))
        );
        assert_eq!(other.get_entry_flags("/keep"), crate::protocol::FLAG_PERSISTENT);
        assert_eq!(other.get_entry_value("/drop"), None);
    }
}
