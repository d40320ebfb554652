use std::{
    collections::HashMap,
    ops::Deref,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use tokio::sync::{watch, Mutex};

use super::{
    description::topology::{choose_n, TopologyDescription},
    Monitor,
    Server,
    ServerDescription,
    TransactionSupportStatus,
};
use crate::{
    client::{options::ClientOptions, session::ClusterTime},
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions},
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime,
    selection_criteria::SelectionCriteria,
};

const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A snapshot of the topology: the aggregate description plus the per-server state (pools,
/// operation counts) for every known address.
#[derive(Debug, Clone)]
pub(crate) struct TopologyState {
    pub(crate) description: TopologyDescription,
    pub(crate) servers: HashMap<ServerAddress, Arc<Server>>,
}

/// The client's live model of the deployment.
///
/// The topology is a single-writer structure: all mutation happens under `update_lock` and is
/// published as a new immutable snapshot on a watch channel, which is also what wakes blocked
/// server-selection attempts.
#[derive(Clone, Debug)]
pub(crate) struct Topology {
    inner: Arc<TopologyInner>,
}

#[derive(Debug)]
pub(crate) struct TopologyInner {
    /// The current snapshot. Readers `borrow()`; the single writer `send_replace`s.
    state_tx: watch::Sender<Arc<TopologyState>>,

    /// Serializes all writers so that monitor-published descriptions are applied in publication
    /// order.
    update_lock: Mutex<()>,

    /// Bumped to signal all monitors that an immediate re-check is wanted.
    check_requester: watch::Sender<u32>,

    options: ClientOptions,

    establisher: ConnectionEstablisher,
}

impl Topology {
    /// Creates a new topology from the seedlist in the options and starts one monitor task per
    /// seed.
    pub(crate) fn new(options: ClientOptions) -> Result<Self> {
        let establisher = ConnectionEstablisher::new(&options)?;

        let mut description = TopologyDescription::default();
        description.initialize(&options);

        let pool_options = ConnectionPoolOptions::from_client_options(&options);
        let servers: HashMap<ServerAddress, Arc<Server>> = description
            .server_addresses()
            .map(|address| {
                (
                    address.clone(),
                    Arc::new(Server::new(
                        address.clone(),
                        establisher.clone(),
                        pool_options.clone(),
                    )),
                )
            })
            .collect();

        let addresses: Vec<ServerAddress> = servers.keys().cloned().collect();

        let (state_tx, _) = watch::channel(Arc::new(TopologyState {
            description,
            servers,
        }));
        let (check_requester, _) = watch::channel(0);

        let topology = Self {
            inner: Arc::new(TopologyInner {
                state_tx,
                update_lock: Mutex::new(()),
                check_requester,
                options,
                establisher,
            }),
        };

        if !topology.inner.options.disable_monitoring {
            for address in addresses {
                Monitor::start(address, &topology);
            }
        }

        Ok(topology)
    }

    pub(crate) fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    pub(crate) fn establisher(&self) -> &ConnectionEstablisher {
        &self.inner.establisher
    }

    pub(crate) fn downgrade(&self) -> WeakTopology {
        WeakTopology {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The current topology snapshot.
    pub(crate) fn state(&self) -> Arc<TopologyState> {
        self.inner.state_tx.borrow().clone()
    }

    pub(crate) fn description(&self) -> TopologyDescription {
        self.state().description.clone()
    }

    pub(crate) fn topology_type(&self) -> crate::sdam::TopologyType {
        self.state().description.topology_type()
    }

    pub(crate) fn cluster_time(&self) -> Option<ClusterTime> {
        self.state().description.cluster_time().cloned()
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.state().description.logical_session_timeout
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.state().description.transaction_support_status()
    }

    pub(crate) fn server(&self, address: &ServerAddress) -> Option<Arc<Server>> {
        self.state().servers.get(address).cloned()
    }

    /// Subscribe to re-check requests; used by monitors to wake up early.
    pub(crate) fn subscribe_to_check_requests(&self) -> watch::Receiver<u32> {
        self.inner.check_requester.subscribe()
    }

    /// Mark the topology as stale, waking all monitors for an immediate probe.
    pub(crate) fn request_check(&self) {
        self.inner
            .check_requester
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Update the topology with a new server description published by a monitor, syncing the
    /// set of monitored servers with the resulting topology. Returns whether the topology
    /// changed.
    pub(crate) async fn update(&self, server_description: ServerDescription) -> bool {
        let _guard = self.inner.update_lock.lock().await;

        let old_state = self.inner.state_tx.borrow().clone();
        let mut new_description = old_state.description.clone();

        if let Err(error) = new_description.update(server_description) {
            tracing::warn!(error = %error, "ignoring invalid topology update");
            return false;
        }

        self.publish(old_state, new_description)
    }

    /// Handle an error that occurred during a monitor's check of a server.
    pub(crate) async fn handle_monitor_error(&self, address: ServerAddress, error: Error) -> bool {
        let description = ServerDescription::new_from_error(address.clone(), error);
        let changed = self.update(description).await;
        if let Some(server) = self.server(&address) {
            server.pool.clear(None);
        }
        changed
    }

    /// Handle an error that occurred during operation execution against `address`, as per the
    /// SDAM error-handling rules.
    pub(crate) async fn handle_application_error(
        &self,
        address: ServerAddress,
        error: Error,
    ) {
        if error.is_network_error() {
            // The server is unreachable (or too slow); mark it Unknown and churn its pool so no
            // stale sockets are handed out.
            let description =
                ServerDescription::new_from_error(address.clone(), error.clone());
            self.update(description).await;
            if let Some(server) = self.server(&address) {
                server.pool.clear(Some(&error));
            }
        } else if error.is_state_change_error() {
            // Stepdown handling: the server-sent code is authoritative. On 4.2+ (wire version
            // 8) a plain "not primary" no longer forces a mark-stale, since the server itself
            // already transitioned and will report the new state on the next heartbeat.
            let pre_wire_8 = error.wire_version.map_or(true, |v| v < 8);
            let mark_stale = pre_wire_8 || error.is_shutting_down();

            if mark_stale {
                let description =
                    ServerDescription::new_from_error(address.clone(), error.clone());
                self.update(description).await;
                self.request_check();
            }

            if error.is_shutting_down() || pre_wire_8 {
                if let Some(server) = self.server(&address) {
                    server.pool.clear(Some(&error));
                }
            }
        }
    }

    /// Advance the topology's cluster time if the given one is more recent.
    pub(crate) async fn advance_cluster_time(&self, cluster_time: ClusterTime) {
        let _guard = self.inner.update_lock.lock().await;

        let old_state = self.inner.state_tx.borrow().clone();
        if old_state.description.cluster_time() >= Some(&cluster_time) {
            return;
        }
        let mut new_description = old_state.description.clone();
        new_description.advance_cluster_time(&cluster_time);
        self.publish(old_state, new_description);
    }

    /// Publish a new state derived from `new_description`, adding servers (and monitors) for
    /// newly discovered addresses and dropping removed ones.
    fn publish(
        &self,
        old_state: Arc<TopologyState>,
        new_description: TopologyDescription,
    ) -> bool {
        let diff = old_state.description.diff(&new_description);
        let changed = diff.is_some();

        let mut servers = old_state.servers.clone();
        let mut new_addresses = Vec::new();

        if let Some(diff) = diff {
            for address in diff.removed_addresses {
                servers.remove(address);
            }
            for address in diff.added_addresses {
                new_addresses.push(address.clone());
            }
        }

        let pool_options = ConnectionPoolOptions::from_client_options(&self.inner.options);
        for address in &new_addresses {
            servers.insert(
                address.clone(),
                Arc::new(Server::new(
                    address.clone(),
                    self.inner.establisher.clone(),
                    pool_options.clone(),
                )),
            );
        }

        self.inner.state_tx.send_replace(Arc::new(TopologyState {
            description: new_description,
            servers,
        }));

        if !self.inner.options.disable_monitoring {
            for address in new_addresses {
                Monitor::start(address, self);
            }
        }

        changed
    }

    /// Selects a server according to the given criteria, waiting for monitors to update the
    /// topology until a suitable server appears or `serverSelectionTimeoutMS` elapses.
    pub(crate) async fn select_server(
        &self,
        criteria: &SelectionCriteria,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<SelectedServer> {
        let timeout = self
            .inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let start_time = Instant::now();

        let mut watcher = self.inner.state_tx.subscribe();

        loop {
            let state = watcher.borrow_and_update().clone();

            if let Some(server) = self.try_select(&state, criteria, deprioritized)? {
                return Ok(server);
            }

            // Nothing suitable in this snapshot; ask the monitors to probe again and wait for
            // the topology to change.
            self.request_check();

            let remaining = match timeout.checked_sub(start_time.elapsed()) {
                Some(remaining) if remaining > Duration::ZERO => remaining,
                _ => {
                    return Err(ErrorKind::ServerSelection {
                        message: state
                            .description
                            .server_selection_timeout_error_message(criteria),
                    }
                    .into())
                }
            };

            if runtime::timeout(remaining, watcher.changed()).await.is_err() {
                let state = watcher.borrow_and_update().clone();
                return Err(ErrorKind::ServerSelection {
                    message: state
                        .description
                        .server_selection_timeout_error_message(criteria),
                }
                .into());
            }
        }
    }

    fn try_select(
        &self,
        state: &TopologyState,
        criteria: &SelectionCriteria,
        deprioritized: Option<&ServerAddress>,
    ) -> Result<Option<SelectedServer>> {
        let mut in_window = state
            .description
            .suitable_servers_in_latency_window(criteria)?;

        // A server that just failed the first attempt of a retryable operation is used again
        // only if it is the sole candidate.
        if let Some(addr) = deprioritized {
            if in_window.len() > 1 {
                in_window.retain(|d| &d.address != addr);
            }
        }

        let in_window_servers: Vec<&Arc<Server>> = in_window
            .into_iter()
            .filter_map(|desc| state.servers.get(&desc.address))
            .collect();

        let selected = choose_n(&in_window_servers, 1).next();

        Ok(selected.map(|server| SelectedServer::new((*server).clone())))
    }
}

/// A weak reference to a topology, held by monitors so that outstanding monitor tasks do not
/// keep the topology (and thus each other) alive after the client goes away.
#[derive(Clone, Debug)]
pub(crate) struct WeakTopology {
    inner: Weak<TopologyInner>,
}

impl WeakTopology {
    pub(crate) fn upgrade(&self) -> Option<Topology> {
        self.inner.upgrade().map(|inner| Topology { inner })
    }
}

/// Struct encapsulating a selected server that handles the operation count accounting.
#[derive(Debug)]
pub(crate) struct SelectedServer {
    server: Arc<Server>,
}

impl SelectedServer {
    fn new(server: Arc<Server>) -> Self {
        server.increment_operation_count();
        Self { server }
    }
}

impl Deref for SelectedServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        self.server.deref()
    }
}

impl Drop for SelectedServer {
    fn drop(&mut self) {
        self.server.decrement_operation_count();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bson::DateTime,
        hello::{HelloCommandResponse, HelloReply},
        selection_criteria::ReadPreference,
    };

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn standalone_description(addr: &ServerAddress) -> ServerDescription {
        ServerDescription::new_from_hello_reply(
            addr.clone(),
            HelloReply {
                server_address: addr.clone(),
                command_response: HelloCommandResponse {
                    is_writable_primary: Some(true),
                    max_wire_version: Some(9),
                    min_wire_version: Some(6),
                    logical_session_timeout_minutes: Some(30),
                    last_write: Some(crate::hello::LastWrite {
                        last_write_date: DateTime::now(),
                    }),
                    ..Default::default()
                },
                raw_command_response: Default::default(),
                cluster_time: None,
            },
            Duration::from_millis(5),
        )
    }

    fn test_topology(hosts: &[&str]) -> Topology {
        let mut options = ClientOptions::builder()
            .hosts(
                hosts
                    .iter()
                    .map(|h| address(h))
                    .collect::<Vec<_>>(),
            )
            .server_selection_timeout(Duration::from_millis(100))
            .build();
        options.disable_monitoring = true;
        Topology::new(options).unwrap()
    }

    #[tokio::test]
    async fn selection_succeeds_after_discovery() {
        let topology = test_topology(&["a:27017"]);
        let addr = address("a:27017");

        // Before any monitor publishes, selection should time out.
        let criteria: SelectionCriteria = ReadPreference::Primary.into();
        let err = topology.select_server(&criteria, None).await.unwrap_err();
        assert!(err.is_server_selection_error());

        topology.update(standalone_description(&addr)).await;

        let selected = topology.select_server(&criteria, None).await.unwrap();
        assert_eq!(selected.address, addr);
    }

    #[tokio::test]
    async fn selection_wakes_on_topology_change() {
        let topology = test_topology(&["a:27017"]);
        let addr = address("a:27017");

        let select_topology = topology.clone();
        let select = tokio::spawn(async move {
            let criteria: SelectionCriteria = ReadPreference::Primary.into();
            select_topology.select_server(&criteria, None).await
        });

        // Let the selection attempt park itself on the watch channel, then publish.
        tokio::time::sleep(Duration::from_millis(10)).await;
        topology.update(standalone_description(&addr)).await;

        let selected = select.await.unwrap().unwrap();
        assert_eq!(selected.address, addr);
    }

    #[tokio::test]
    async fn network_error_marks_server_unknown() {
        let topology = test_topology(&["a:27017"]);
        let addr = address("a:27017");

        topology.update(standalone_description(&addr)).await;
        assert!(topology
            .state()
            .description
            .get_server_description(&addr)
            .unwrap()
            .is_available());

        let network_error: Error =
            crate::error::ErrorKind::Io(Arc::new(std::io::ErrorKind::ConnectionReset.into()))
                .into();
        topology
            .handle_application_error(addr.clone(), network_error)
            .await;

        assert!(!topology
            .state()
            .description
            .get_server_description(&addr)
            .unwrap()
            .is_available());
    }

    #[tokio::test]
    async fn operation_count_accounting() {
        let topology = test_topology(&["a:27017"]);
        let addr = address("a:27017");
        topology.update(standalone_description(&addr)).await;

        let criteria: SelectionCriteria = ReadPreference::Primary.into();
        let server = topology.server(&addr).unwrap();
        assert_eq!(server.operation_count(), 0);

        let selected = topology.select_server(&criteria, None).await.unwrap();
        assert_eq!(server.operation_count(), 1);
        drop(selected);
        assert_eq!(server.operation_count(), 0);
    }
}
