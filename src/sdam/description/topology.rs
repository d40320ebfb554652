pub(crate) mod server_selection;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    time::Duration,
};

use crate::{
    bson::oid::ObjectId,
    client::{options::ClientOptions, session::ClusterTime},
    cmap::Command,
    error::{Error, Result},
    options::ServerAddress,
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

use self::server_selection::IDLE_WRITE_PERIOD;

/// The possible types for a topology.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
#[non_exhaustive]
pub enum TopologyType {
    /// A single mongod server.
    Single,

    /// A replica set with no primary.
    ReplicaSetNoPrimary,

    /// A replica set with a primary.
    ReplicaSetWithPrimary,

    /// A sharded topology.
    Sharded,

    /// A topology whose type is not known.
    #[default]
    Unknown,
}

impl fmt::Display for TopologyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Single => "Single",
            Self::ReplicaSetNoPrimary => "ReplicaSetNoPrimary",
            Self::ReplicaSetWithPrimary => "ReplicaSetWithPrimary",
            Self::Sharded => "Sharded",
            Self::Unknown => "Unknown",
        })
    }
}

/// Whether the deployment is known to support multi-document transactions.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub(crate) enum TransactionSupportStatus {
    /// No data-bearing server has reported in yet.
    #[default]
    Undetermined,

    /// The deployment cannot run transactions: wrong topology type, servers too old, or no
    /// session support.
    Unsupported,

    /// Replica set on 4.0+ (wire version 7), or sharded cluster on 4.2+ (wire version 8).
    Supported,
}

/// The aggregate of every server description the monitors have published: the client's model of
/// the deployment.
#[derive(Debug, Clone)]
pub(crate) struct TopologyDescription {
    /// Whether the topology was seeded with exactly one address.
    pub(crate) single_seed: bool,

    pub(crate) topology_type: TopologyType,

    /// The replica set name, from the options or the first member seen.
    pub(crate) set_name: Option<String>,

    /// The highest replica set config version any primary has reported.
    pub(crate) max_set_version: Option<i32>,

    /// The highest election id any primary has reported.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Why the deployment cannot be used, when some server's wire versions do not overlap the
    /// driver's.
    pub(crate) compatibility_error: Option<String>,

    /// The minimum logical session timeout across the data-bearing servers, or `None` when any
    /// of them lacks one (i.e. sessions are unusable).
    pub(crate) logical_session_timeout: Option<Duration>,

    pub(crate) transaction_support_status: TransactionSupportStatus,

    /// The highest cluster time any server has reported.
    pub(crate) cluster_time: Option<ClusterTime>,

    pub(crate) local_threshold: Option<Duration>,

    pub(crate) heartbeat_freq: Option<Duration>,

    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

impl PartialEq for TopologyDescription {
    fn eq(&self, other: &Self) -> bool {
        // Equality only decides whether to wake parked server-selection attempts, so it covers
        // exactly what the selection algorithm looks at.
        self.topology_type == other.topology_type
            && self.compatibility_error == other.compatibility_error
            && self.servers == other.servers
    }
}

impl Default for TopologyDescription {
    fn default() -> Self {
        Self {
            single_seed: false,
            topology_type: TopologyType::Unknown,
            set_name: None,
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            transaction_support_status: TransactionSupportStatus::Undetermined,
            cluster_time: None,
            local_threshold: None,
            heartbeat_freq: None,
            servers: HashMap::new(),
        }
    }
}

impl TopologyDescription {
    /// Seeds the description from the client options: one blank server per seed address, and
    /// the initial topology type implied by the options.
    pub(crate) fn initialize(&mut self, options: &ClientOptions) {
        debug_assert!(
            self.servers.is_empty() && self.topology_type == TopologyType::Unknown,
            "new TopologyDescriptions should start empty"
        );

        self.topology_type = if options.direct_connection == Some(true) {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        for address in options.hosts.iter() {
            let description = ServerDescription::new(address);
            self.servers.insert(description.address.clone(), description);
        }

        self.single_seed = self.servers.len() == 1;
        self.set_name = options.repl_set_name.clone();
        self.local_threshold = options.local_threshold;
        self.heartbeat_freq = options.heartbeat_freq;
    }

    pub(crate) fn topology_type(&self) -> TopologyType {
        self.topology_type
    }

    pub(crate) fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    pub(crate) fn get_server_description(
        &self,
        address: &ServerAddress,
    ) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn compatibility_error(&self) -> Option<&String> {
        self.compatibility_error.as_ref()
    }

    pub(crate) fn transaction_support_status(&self) -> TransactionSupportStatus {
        self.transaction_support_status
    }

    fn heartbeat_frequency(&self) -> Duration {
        self.heartbeat_freq
            .unwrap_or(crate::sdam::DEFAULT_HEARTBEAT_FREQUENCY)
    }

    /// Raises the recorded cluster time if the given one is newer.
    pub(crate) fn advance_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if self.cluster_time.as_ref() < Some(cluster_time) {
            self.cluster_time = Some(cluster_time.clone());
        }
    }

    /// Folds a freshly published server description into the topology, applying the SDAM
    /// transition rules and refreshing the aggregate values derived from the member set.
    pub(crate) fn update(&mut self, server_description: ServerDescription) -> Result<()> {
        // The server may have been removed since its monitor started this check.
        if !self.servers.contains_key(&server_description.address) {
            return Ok(());
        }

        if let Ok(Some(ref cluster_time)) = server_description.cluster_time() {
            self.advance_cluster_time(cluster_time);
        }

        self.servers.insert(
            server_description.address.clone(),
            server_description.clone(),
        );

        self.apply_transition(server_description)?;

        self.refresh_session_support();
        self.refresh_transaction_support();
        self.refresh_compatibility();

        Ok(())
    }

    /// The SDAM state machine: what the current topology type makes of a server reporting the
    /// given type.
    fn apply_transition(&mut self, sd: ServerDescription) -> Result<()> {
        use ServerType as S;
        use TopologyType as T;

        match (self.topology_type, sd.server_type) {
            // Direct connections take the server as it comes.
            (T::Single, _) => {}

            // Nothing new was learned.
            (T::Unknown | T::ReplicaSetNoPrimary, S::Unknown | S::RsGhost) => {}
            (T::Sharded, S::Unknown | S::Mongos) => {}

            (T::Unknown, S::Standalone) => {
                if self.single_seed {
                    self.topology_type = T::Single;
                } else {
                    // A standalone mixed into a multi-server seedlist cannot be part of the
                    // deployment being discovered.
                    self.drop_server(&sd.address);
                }
            }

            (T::Unknown, S::Mongos) => self.topology_type = T::Sharded,

            (T::Unknown | T::ReplicaSetNoPrimary | T::ReplicaSetWithPrimary, S::RsPrimary) => {
                self.absorb_primary(sd)?
            }

            (T::Unknown | T::ReplicaSetNoPrimary, S::RsSecondary | S::RsArbiter | S::RsOther) => {
                self.absorb_member(sd)?
            }

            (T::Sharded, _) => self.drop_server(&sd.address),

            (T::ReplicaSetNoPrimary, S::Standalone | S::Mongos) => self.drop_server(&sd.address),

            (T::ReplicaSetWithPrimary, S::Unknown | S::RsGhost) => self.recount_primary(),

            (T::ReplicaSetWithPrimary, S::Standalone | S::Mongos) => {
                self.drop_server(&sd.address);
                self.recount_primary();
            }

            (T::ReplicaSetWithPrimary, S::RsSecondary | S::RsArbiter | S::RsOther) => {
                self.confirm_member(sd)?
            }
        }

        Ok(())
    }

    fn drop_server(&mut self, address: &ServerAddress) {
        self.servers.remove(address);
    }

    /// Adopts the server's set name when none is recorded yet; reports whether the server
    /// belongs to the set this topology tracks.
    fn accept_set_name(&mut self, sd: &ServerDescription) -> Result<bool> {
        let name = sd.set_name()?;
        if self.set_name.is_none() {
            self.set_name = name;
            Ok(true)
        } else {
            Ok(self.set_name == name)
        }
    }

    /// A primary reported in. Its host list is authoritative for the member set, unless its
    /// election credentials are older than what a previous primary showed.
    fn absorb_primary(&mut self, sd: ServerDescription) -> Result<()> {
        if !self.accept_set_name(&sd)? {
            self.drop_server(&sd.address);
            self.recount_primary();
            return Ok(());
        }

        if self.primary_is_stale(&sd)? {
            // Blank the entry so its monitor re-checks it; by then it will have learned it
            // lost the election.
            self.servers
                .insert(sd.address.clone(), ServerDescription::new(&sd.address));
            self.recount_primary();
            return Ok(());
        }
        self.record_election(&sd)?;

        // There can be at most one primary per set: any other server still claiming the role
        // is reset until its monitor reports again.
        let demote: Vec<ServerAddress> = self
            .servers
            .iter()
            .filter(|(address, server)| {
                server.server_type == ServerType::RsPrimary && **address != sd.address
            })
            .map(|(address, _)| address.clone())
            .collect();
        for address in demote {
            self.servers
                .insert(address.clone(), ServerDescription::new(&address));
        }

        // Sync the member set to the primary's view of it.
        let known = sd.known_hosts()?;
        for address in &known {
            if !self.servers.contains_key(address) {
                self.servers
                    .insert(address.clone(), ServerDescription::new(address));
            }
        }
        self.servers.retain(|address, _| known.contains(address));

        self.recount_primary();
        Ok(())
    }

    /// Whether this primary's (setVersion, electionId) pair is older than the newest one the
    /// topology has seen, i.e. it has not noticed losing an election yet.
    fn primary_is_stale(&self, sd: &ServerDescription) -> Result<bool> {
        Ok(
            match (
                sd.set_version()?,
                sd.election_id()?,
                self.max_set_version,
                self.max_election_id,
            ) {
                (Some(set_version), Some(election_id), Some(max_set_version), Some(max_election_id)) => {
                    max_set_version > set_version
                        || (max_set_version == set_version && max_election_id > election_id)
                }
                _ => false,
            },
        )
    }

    /// Records the election credentials of a current (non-stale) primary.
    fn record_election(&mut self, sd: &ServerDescription) -> Result<()> {
        if let Some(set_version) = sd.set_version()? {
            if let Some(election_id) = sd.election_id()? {
                self.max_election_id = Some(election_id);
            }
            if self.max_set_version.map_or(true, |max| set_version > max) {
                self.max_set_version = Some(set_version);
            }
        }
        Ok(())
    }

    /// A non-primary member reported in while no primary is known: adopt its view of the
    /// member set.
    fn absorb_member(&mut self, sd: ServerDescription) -> Result<()> {
        self.topology_type = TopologyType::ReplicaSetNoPrimary;

        if !self.accept_set_name(&sd)? {
            self.drop_server(&sd.address);
            return Ok(());
        }

        for address in sd.known_hosts()? {
            if !self.servers.contains_key(&address) {
                self.servers
                    .insert(address.clone(), ServerDescription::new(&address));
            }
        }

        if sd.invalid_me()? {
            self.drop_server(&sd.address);
        }

        Ok(())
    }

    /// A non-primary member reported in while a primary is known: it only needs to still belong
    /// here.
    fn confirm_member(&mut self, sd: ServerDescription) -> Result<()> {
        if self.set_name != sd.set_name()? || sd.invalid_me()? {
            self.drop_server(&sd.address);
            self.recount_primary();
        }
        Ok(())
    }

    /// Settles the topology type between the two replica set states based on whether any member
    /// currently holds the primary role.
    fn recount_primary(&mut self) {
        let has_primary = self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary);

        self.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Sessions are usable when every checked data-bearing server advertises a logical session
    /// timeout; the deployment-wide value is the minimum.
    fn refresh_session_support(&mut self) {
        let mut timeout: Option<Duration> = None;

        for server in self
            .servers
            .values()
            .filter(|server| server.server_type.is_data_bearing())
        {
            let reply = match server.reply {
                Ok(Some(ref reply)) => reply,
                // Unchecked or failed servers don't get a vote.
                _ => continue,
            };

            match reply.command_response.logical_session_timeout_minutes {
                Some(minutes) => {
                    let server_timeout = Duration::from_secs(minutes as u64 * 60);
                    timeout = Some(timeout.map_or(server_timeout, |t| t.min(server_timeout)));
                }
                None => {
                    timeout = None;
                    break;
                }
            }
        }

        self.logical_session_timeout = timeout;
    }

    /// Transactions need a replica set on wire version 7+ or a sharded cluster on 8+, with
    /// session support; until a data-bearing server has been checked, the answer is unknown.
    fn refresh_transaction_support(&mut self) {
        let min_wire_version = self
            .servers
            .values()
            .filter(|server| server.server_type.is_data_bearing())
            .filter_map(|server| server.max_wire_version().ok().flatten())
            .min();

        let min_wire_version = match min_wire_version {
            Some(version) => version,
            None => return,
        };

        let supported = self.logical_session_timeout.is_some()
            && match self.topology_type {
                TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                    min_wire_version >= 7
                }
                TopologyType::Sharded => min_wire_version >= 8,
                // A direct connection supports transactions when its one server is a replica
                // set member (or a mongos on 4.2+); a standalone never does.
                TopologyType::Single => match self.servers.values().next().map(|s| s.server_type) {
                    Some(ServerType::Mongos) => min_wire_version >= 8,
                    Some(
                        ServerType::RsPrimary
                        | ServerType::RsSecondary
                        | ServerType::RsArbiter
                        | ServerType::RsOther,
                    ) => min_wire_version >= 7,
                    _ => false,
                },
                TopologyType::Unknown => false,
            };

        self.transaction_support_status = if supported {
            TransactionSupportStatus::Supported
        } else {
            TransactionSupportStatus::Unsupported
        };
    }

    fn refresh_compatibility(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .find_map(|server| server.compatibility_error_message());
    }

    /// Attaches `$readPreference` when the target server expects one: always for a mongos with
    /// a non-default preference, and for direct connections to replica set members (which need
    /// at least primaryPreferred to answer at all).
    pub(crate) fn update_command_with_read_pref(
        &self,
        address: &ServerAddress,
        command: &mut Command,
        criteria: Option<&SelectionCriteria>,
    ) {
        let server_type = self
            .get_server_description(address)
            .map(|sd| sd.server_type)
            .unwrap_or(ServerType::Unknown);

        let requested = criteria.and_then(SelectionCriteria::as_read_pref);

        let attach = match (self.topology_type, server_type) {
            (TopologyType::Sharded | TopologyType::Single, ServerType::Mongos) => match requested {
                Some(read_pref) if read_pref != &ReadPreference::Primary => {
                    Some(read_pref.clone())
                }
                _ => None,
            },
            (TopologyType::Single, ServerType::Standalone) => None,
            (TopologyType::Single, _) => Some(match requested {
                None | Some(ReadPreference::Primary) => ReadPreference::PrimaryPreferred {
                    options: Default::default(),
                },
                Some(other) => other.clone(),
            }),
            _ => None,
        };

        if let Some(read_pref) = attach {
            command.set_read_preference(read_pref);
        }
    }

    /// The addresses added and removed going from `self` to `other`, or `None` when the two
    /// are equal for selection purposes.
    pub(crate) fn diff<'a>(
        &'a self,
        other: &'a TopologyDescription,
    ) -> Option<TopologyDescriptionDiff<'a>> {
        if self == other {
            return None;
        }

        let mine: HashSet<&ServerAddress> = self.server_addresses().collect();
        let theirs: HashSet<&ServerAddress> = other.server_addresses().collect();

        Some(TopologyDescriptionDiff {
            removed_addresses: mine.difference(&theirs).copied().collect(),
            added_addresses: theirs.difference(&mine).copied().collect(),
        })
    }
}

impl fmt::Display for TopologyDescription {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ Type: {}", self.topology_type)?;
        if let Some(ref set_name) = self.set_name {
            write!(f, ", Set Name: {}", set_name)?;
        }
        if let Some(ref error) = self.compatibility_error {
            write!(f, ", Compatibility Error: {}", error)?;
        }
        for (i, server) in self.servers.values().enumerate() {
            let prefix = if i == 0 { ", Servers: [ " } else { ", " };
            write!(f, "{}{}: {:?}", prefix, server.address, server.server_type)?;
        }
        if !self.servers.is_empty() {
            write!(f, " ]")?;
        }
        write!(f, " }}")
    }
}

/// A staleness bound below 90 seconds or below one heartbeat plus the idle-write period cannot
/// be answered meaningfully.
pub(crate) fn verify_max_staleness(
    max_staleness: Duration,
    heartbeat_frequency: Duration,
) -> Result<()> {
    let floor = std::cmp::max(
        Duration::from_secs(90),
        heartbeat_frequency.saturating_add(IDLE_WRITE_PERIOD),
    );

    if max_staleness < floor {
        Err(Error::invalid_argument(format!(
            "invalid max_staleness value: must be at least {} seconds",
            floor.as_secs()
        )))
    } else {
        Ok(())
    }
}

pub(crate) fn choose_n<T>(values: &[T], n: usize) -> impl Iterator<Item = &T> {
    use rand::{prelude::SliceRandom, SeedableRng};
    values.choose_multiple(&mut rand::rngs::SmallRng::from_entropy(), n)
}

/// The address-level difference between two topology descriptions.
#[derive(Debug)]
pub(crate) struct TopologyDescriptionDiff<'a> {
    pub(crate) removed_addresses: HashSet<&'a ServerAddress>,
    pub(crate) added_addresses: HashSet<&'a ServerAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hello::{HelloCommandResponse, HelloReply};

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn reply_with(address: &ServerAddress, response: HelloCommandResponse) -> ServerDescription {
        ServerDescription::new_from_hello_reply(
            address.clone(),
            HelloReply {
                server_address: address.clone(),
                command_response: response,
                raw_command_response: Default::default(),
                cluster_time: None,
            },
            Duration::from_millis(5),
        )
    }

    fn rs_member(
        addr: &ServerAddress,
        set_name: &str,
        primary: bool,
        hosts: Vec<&str>,
    ) -> ServerDescription {
        reply_with(
            addr,
            HelloCommandResponse {
                set_name: Some(set_name.to_string()),
                is_writable_primary: Some(primary),
                secondary: Some(!primary),
                hosts: Some(hosts.into_iter().map(String::from).collect()),
                me: Some(addr.to_string()),
                max_wire_version: Some(9),
                min_wire_version: Some(6),
                logical_session_timeout_minutes: Some(30),
                ..Default::default()
            },
        )
    }

    fn seeded(hosts: &[&str]) -> TopologyDescription {
        let options = ClientOptions::builder()
            .hosts(
                hosts
                    .iter()
                    .map(|h| ServerAddress::parse(h).unwrap())
                    .collect::<Vec<_>>(),
            )
            .build();
        let mut description = TopologyDescription::default();
        description.initialize(&options);
        description
    }

    #[test]
    fn discovers_replica_set_with_primary() {
        let mut topology = seeded(&["a:27017"]);
        let a = address("a:27017");

        topology
            .update(rs_member(&a, "rs0", true, vec!["a:27017", "b:27017"]))
            .unwrap();

        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.set_name.as_deref(), Some("rs0"));
        // The primary's host list adds b.
        assert!(topology.servers.contains_key(&address("b:27017")));
        assert_eq!(
            topology.transaction_support_status(),
            TransactionSupportStatus::Supported
        );
    }

    #[test]
    fn only_one_primary_per_set() {
        let mut topology = seeded(&["a:27017", "b:27017"]);
        let a = address("a:27017");
        let b = address("b:27017");

        topology
            .update(rs_member(&a, "rs0", true, vec!["a:27017", "b:27017"]))
            .unwrap();
        topology
            .update(rs_member(&b, "rs0", true, vec!["a:27017", "b:27017"]))
            .unwrap();

        let primaries: Vec<_> = topology
            .servers
            .values()
            .filter(|s| s.server_type == ServerType::RsPrimary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].address, b);
        assert_eq!(topology.topology_type(), TopologyType::ReplicaSetWithPrimary);
    }

    #[test]
    fn stale_primary_is_reset_to_unknown() {
        let mut topology = seeded(&["a:27017", "b:27017"]);
        let a = address("a:27017");
        let b = address("b:27017");

        let mut new_primary = rs_member(&b, "rs0", true, vec!["a:27017", "b:27017"]);
        if let Ok(Some(ref mut reply)) = new_primary.reply {
            reply.command_response.set_version = Some(2);
            reply.command_response.election_id = Some(ObjectId::new());
        }
        topology.update(new_primary).unwrap();

        // An old primary reporting an older set version gets marked Unknown.
        let mut stale_primary = rs_member(&a, "rs0", true, vec!["a:27017", "b:27017"]);
        if let Ok(Some(ref mut reply)) = stale_primary.reply {
            reply.command_response.set_version = Some(1);
            reply.command_response.election_id = Some(ObjectId::new());
        }
        topology.update(stale_primary).unwrap();

        assert_eq!(
            topology.servers.get(&a).unwrap().server_type,
            ServerType::Unknown
        );
        assert_eq!(
            topology.servers.get(&b).unwrap().server_type,
            ServerType::RsPrimary
        );
    }

    #[test]
    fn me_mismatch_removes_server() {
        let mut topology = seeded(&["a:27017", "b:27017"]);
        let a = address("a:27017");
        let b = address("b:27017");

        topology
            .update(rs_member(&a, "rs0", true, vec!["a:27017", "b:27017"]))
            .unwrap();

        let mut misreporting = rs_member(&b, "rs0", false, vec!["a:27017", "b:27017"]);
        if let Ok(Some(ref mut reply)) = misreporting.reply {
            reply.command_response.me = Some("c:27017".to_string());
        }
        topology.update(misreporting).unwrap();

        assert!(!topology.servers.contains_key(&b));
    }

    #[test]
    fn standalone_in_multi_seed_topology_is_removed() {
        let mut topology = seeded(&["a:27017", "b:27017"]);
        let a = address("a:27017");

        topology
            .update(reply_with(
                &a,
                HelloCommandResponse {
                    is_writable_primary: Some(true),
                    max_wire_version: Some(9),
                    ..Default::default()
                },
            ))
            .unwrap();

        assert!(!topology.servers.contains_key(&a));
        assert_eq!(topology.topology_type(), TopologyType::Unknown);
    }

    #[test]
    fn single_seed_standalone_becomes_single() {
        let mut topology = seeded(&["a:27017"]);
        let a = address("a:27017");

        topology
            .update(reply_with(
                &a,
                HelloCommandResponse {
                    is_writable_primary: Some(true),
                    max_wire_version: Some(9),
                    logical_session_timeout_minutes: Some(30),
                    ..Default::default()
                },
            ))
            .unwrap();

        assert_eq!(topology.topology_type(), TopologyType::Single);
    }

    #[test]
    fn mongos_discovery() {
        let mut topology = seeded(&["a:27017"]);
        let a = address("a:27017");

        topology
            .update(reply_with(
                &a,
                HelloCommandResponse {
                    msg: Some("isdbgrid".to_string()),
                    max_wire_version: Some(9),
                    logical_session_timeout_minutes: Some(30),
                    ..Default::default()
                },
            ))
            .unwrap();

        assert_eq!(topology.topology_type(), TopologyType::Sharded);
        assert_eq!(
            topology.transaction_support_status(),
            TransactionSupportStatus::Supported
        );
    }

    #[test]
    fn session_timeout_is_minimum_across_data_bearing_servers() {
        let mut topology = seeded(&["a:27017", "b:27017"]);
        let a = address("a:27017");
        let b = address("b:27017");

        let mut primary = rs_member(&a, "rs0", true, vec!["a:27017", "b:27017"]);
        if let Ok(Some(ref mut reply)) = primary.reply {
            reply.command_response.logical_session_timeout_minutes = Some(30);
        }
        topology.update(primary).unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(30 * 60))
        );

        let mut secondary = rs_member(&b, "rs0", false, vec!["a:27017", "b:27017"]);
        if let Ok(Some(ref mut reply)) = secondary.reply {
            reply.command_response.logical_session_timeout_minutes = Some(10);
        }
        topology.update(secondary).unwrap();
        assert_eq!(
            topology.logical_session_timeout,
            Some(Duration::from_secs(10 * 60))
        );
    }

    #[test]
    fn missing_session_support_disables_transactions() {
        let mut topology = seeded(&["a:27017", "b:27017"]);
        let a = address("a:27017");
        let b = address("b:27017");

        topology
            .update(rs_member(&a, "rs0", true, vec!["a:27017", "b:27017"]))
            .unwrap();
        assert_eq!(
            topology.transaction_support_status(),
            TransactionSupportStatus::Supported
        );

        let mut no_sessions = rs_member(&b, "rs0", false, vec!["a:27017", "b:27017"]);
        if let Ok(Some(ref mut reply)) = no_sessions.reply {
            reply.command_response.logical_session_timeout_minutes = None;
        }
        topology.update(no_sessions).unwrap();

        assert_eq!(topology.logical_session_timeout, None);
        assert_eq!(
            topology.transaction_support_status(),
            TransactionSupportStatus::Unsupported
        );
    }

    #[test]
    fn incompatible_wire_version_sets_error() {
        let mut topology = seeded(&["a:27017"]);
        let a = address("a:27017");

        topology
            .update(reply_with(
                &a,
                HelloCommandResponse {
                    is_writable_primary: Some(true),
                    min_wire_version: Some(2),
                    max_wire_version: Some(5),
                    ..Default::default()
                },
            ))
            .unwrap();

        assert!(topology.compatibility_error().is_some());
    }

    #[test]
    fn max_staleness_validation() {
        assert!(verify_max_staleness(Duration::from_secs(30), Duration::from_secs(10)).is_err());
        assert!(verify_max_staleness(Duration::from_secs(120), Duration::from_secs(10)).is_ok());
    }
}
