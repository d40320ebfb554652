use std::time::Duration;

use super::TopologyDescription;
use crate::{
    error::{ErrorKind, Result},
    sdam::description::{
        server::{ServerDescription, ServerType},
        topology::TopologyType,
    },
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// The idle-write allowance folded into staleness estimates: a primary writes to its oplog at
/// least this often, so a secondary can never appear fresher than one period behind.
pub(crate) const IDLE_WRITE_PERIOD: Duration = Duration::from_secs(10);

/// The tag-set and staleness constraints of a non-primary read preference.
struct SecondaryFilter<'a> {
    tag_sets: Option<&'a Vec<TagSet>>,
    max_staleness: Option<Duration>,
}

impl<'a> SecondaryFilter<'a> {
    fn new(read_preference: &'a ReadPreference) -> Self {
        Self {
            tag_sets: read_preference.tag_sets(),
            max_staleness: read_preference.max_staleness(),
        }
    }
}

impl TopologyDescription {
    pub(crate) fn server_selection_timeout_error_message(
        &self,
        criteria: &SelectionCriteria,
    ) -> String {
        let any_available = self.servers.values().any(ServerDescription::is_available);
        if any_available {
            format!(
                "Server selection timeout: None of the available servers suitable for criteria \
                 {:?}. Topology: {}",
                criteria, self
            )
        } else {
            format!(
                "Server selection timeout: No available servers. Topology: {}",
                self
            )
        }
    }

    /// The servers satisfying `criteria` whose smoothed round-trip time falls within the local
    /// threshold of the fastest of them. The caller picks one of these at random.
    pub(crate) fn suitable_servers_in_latency_window<'a>(
        &'a self,
        criteria: &'a SelectionCriteria,
    ) -> Result<Vec<&'a ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::ServerSelection {
                message: message.clone(),
            }
            .into());
        }

        let candidates = match criteria {
            SelectionCriteria::ReadPreference(read_preference) => {
                self.candidates(read_preference)?
            }
            SelectionCriteria::Predicate(predicate) => self
                .servers
                .values()
                .filter(|server| {
                    // Direct connections use their one server whatever it is; everywhere else
                    // a predicate can only pick data-bearing servers.
                    (self.topology_type == TopologyType::Single
                        || server.server_type.is_data_bearing())
                        && predicate(&crate::sdam::ServerInfo::new(server))
                })
                .collect(),
        };

        Ok(self.within_latency_window(candidates))
    }

    /// Role-based filtering: which servers may serve the given read preference at all.
    fn candidates(&self, read_preference: &ReadPreference) -> Result<Vec<&ServerDescription>> {
        Ok(match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            TopologyType::Single => self.servers.values().collect(),
            TopologyType::Sharded => self.with_role(ServerType::Mongos).collect(),
            TopologyType::ReplicaSetWithPrimary | TopologyType::ReplicaSetNoPrimary => {
                self.replica_set_candidates(read_preference)?
            }
        })
    }

    fn with_role(&self, role: ServerType) -> impl Iterator<Item = &ServerDescription> {
        self.servers
            .values()
            .filter(move |server| server.server_type == role)
    }

    fn primary_server(&self) -> Option<&ServerDescription> {
        self.with_role(ServerType::RsPrimary).next()
    }

    fn replica_set_candidates(
        &self,
        read_preference: &ReadPreference,
    ) -> Result<Vec<&ServerDescription>> {
        let filter = SecondaryFilter::new(read_preference);

        Ok(match read_preference {
            ReadPreference::Primary => self.primary_server().into_iter().collect(),
            ReadPreference::Secondary { .. } => self.eligible_secondaries(&filter, false)?,
            ReadPreference::Nearest { .. } => self.eligible_secondaries(&filter, true)?,
            ReadPreference::PrimaryPreferred { .. } => match self.primary_server() {
                Some(primary) => vec![primary],
                None => self.eligible_secondaries(&filter, false)?,
            },
            ReadPreference::SecondaryPreferred { .. } => {
                let secondaries = self.eligible_secondaries(&filter, false)?;
                if secondaries.is_empty() {
                    self.primary_server().into_iter().collect()
                } else {
                    secondaries
                }
            }
        })
    }

    /// The secondaries (plus the primary, for `nearest`) passing the staleness bound and tag
    /// sets.
    fn eligible_secondaries(
        &self,
        filter: &SecondaryFilter<'_>,
        include_primary: bool,
    ) -> Result<Vec<&ServerDescription>> {
        let mut servers: Vec<&ServerDescription> = self
            .servers
            .values()
            .filter(|server| {
                server.server_type == ServerType::RsSecondary
                    || (include_primary && server.server_type == ServerType::RsPrimary)
            })
            .collect();

        if let Some(max_staleness) = filter.max_staleness {
            super::verify_max_staleness(max_staleness, self.heartbeat_frequency())?;
            // A non-positive bound means no bound.
            if !max_staleness.is_zero() {
                self.drop_stale_secondaries(&mut servers, max_staleness);
            }
        }

        if let Some(tag_sets) = filter.tag_sets {
            keep_first_matching_tag_set(&mut servers, tag_sets);
        }

        Ok(servers)
    }

    /// Removes every secondary whose estimated replication lag exceeds `max_staleness`.
    ///
    /// With a primary known, a secondary's staleness is how much further behind the primary's
    /// last write it is than the primary itself was at its own last check; without one, the
    /// freshest secondary stands in for the primary. One heartbeat period is added either way,
    /// since a secondary may have fallen that much further behind since its last check.
    fn drop_stale_secondaries(
        &self,
        servers: &mut Vec<&ServerDescription>,
        max_staleness: Duration,
    ) {
        let max_staleness_ms = i64::try_from(max_staleness.as_millis()).unwrap_or(i64::MAX);
        let heartbeat_ms =
            i64::try_from(self.heartbeat_frequency().as_millis()).unwrap_or(i64::MAX);

        let write_date_ms = |server: &ServerDescription| -> Option<i64> {
            Some(server.last_write_date().ok()??.timestamp_millis())
        };

        match self.primary_server() {
            Some(primary) => {
                let reference = match (primary.last_update_time, write_date_ms(primary)) {
                    (Some(update_time), Some(write_date)) => {
                        update_time.timestamp_millis() - write_date
                    }
                    _ => return,
                };

                servers.retain(|server| {
                    if server.server_type != ServerType::RsSecondary {
                        return true;
                    }
                    match (server.last_update_time, write_date_ms(server)) {
                        (Some(update_time), Some(write_date)) => {
                            let staleness =
                                (update_time.timestamp_millis() - write_date) - reference
                                    + heartbeat_ms;
                            staleness <= max_staleness_ms
                        }
                        _ => false,
                    }
                });
            }
            None => {
                let freshest = self
                    .with_role(ServerType::RsSecondary)
                    .filter_map(|server| write_date_ms(server))
                    .max();
                let freshest = match freshest {
                    Some(freshest) => freshest,
                    None => return,
                };

                servers.retain(|server| {
                    if server.server_type != ServerType::RsSecondary {
                        return true;
                    }
                    match write_date_ms(server) {
                        Some(write_date) => {
                            freshest - write_date + heartbeat_ms <= max_staleness_ms
                        }
                        None => false,
                    }
                });
            }
        }
    }

    /// Keeps only the servers whose round-trip time is within `localThresholdMS` of the
    /// fastest candidate.
    fn within_latency_window<'a>(
        &self,
        mut candidates: Vec<&'a ServerDescription>,
    ) -> Vec<&'a ServerDescription> {
        let fastest = candidates
            .iter()
            .filter_map(|server| server.average_round_trip_time)
            .min();

        let fastest = match fastest {
            Some(fastest) => fastest,
            None => return Vec::new(),
        };

        let threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);
        let window_edge = fastest.saturating_add(threshold);

        candidates.retain(|server| {
            server
                .average_round_trip_time
                .map(|rtt| rtt <= window_edge)
                .unwrap_or(false)
        });
        candidates
    }
}

/// The first tag set any candidate satisfies wins: candidates matching it are kept, everything
/// else goes. If no tag set matches anything, nothing is suitable.
fn keep_first_matching_tag_set(servers: &mut Vec<&ServerDescription>, tag_sets: &[TagSet]) {
    if tag_sets.is_empty() {
        return;
    }

    for tag_set in tag_sets {
        if servers.iter().any(|server| server.matches_tag_set(tag_set)) {
            servers.retain(|server| server.matches_tag_set(tag_set));
            return;
        }
    }

    servers.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bson::DateTime,
        client::options::{ClientOptions, ServerAddress},
        hello::{HelloCommandResponse, HelloReply, LastWrite},
        selection_criteria::ReadPreferenceOptions,
    };

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    struct MemberSpec {
        host: &'static str,
        primary: bool,
        rtt_ms: u64,
        tags: Option<TagSet>,
        last_write_ms_ago: i64,
    }

    fn topology(members: Vec<MemberSpec>) -> TopologyDescription {
        let hosts: Vec<_> = members.iter().map(|m| address(m.host)).collect();
        let options = ClientOptions::builder().hosts(hosts.clone()).build();

        let mut topology = TopologyDescription::default();
        topology.initialize(&options);

        let now = DateTime::now().timestamp_millis();
        let host_strings: Vec<String> = members.iter().map(|m| m.host.to_string()).collect();

        for member in members {
            let addr = address(member.host);
            let response = HelloCommandResponse {
                set_name: Some("rs0".to_string()),
                is_writable_primary: Some(member.primary),
                secondary: Some(!member.primary),
                hosts: Some(host_strings.clone()),
                me: Some(addr.to_string()),
                max_wire_version: Some(9),
                min_wire_version: Some(6),
                logical_session_timeout_minutes: Some(30),
                tags: member.tags.clone(),
                last_write: Some(LastWrite {
                    last_write_date: DateTime::from_millis(now - member.last_write_ms_ago),
                }),
                ..Default::default()
            };
            let description = ServerDescription::new_from_hello_reply(
                addr,
                HelloReply {
                    server_address: address(member.host),
                    command_response: response,
                    raw_command_response: Default::default(),
                    cluster_time: None,
                },
                Duration::from_millis(member.rtt_ms),
            );
            topology.update(description).unwrap();
        }

        topology
    }

    fn names(servers: &[&ServerDescription]) -> Vec<String> {
        let mut names: Vec<String> = servers.iter().map(|s| s.address.to_string()).collect();
        names.sort();
        names
    }

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn primary_mode_selects_only_primary() {
        let topology = topology(vec![
            MemberSpec {
                host: "a:27017",
                primary: true,
                rtt_ms: 5,
                tags: None,
                last_write_ms_ago: 0,
            },
            MemberSpec {
                host: "b:27017",
                primary: false,
                rtt_ms: 5,
                tags: None,
                last_write_ms_ago: 0,
            },
        ]);

        let read_pref = ReadPreference::Primary.into();
        let suitable = topology
            .suitable_servers_in_latency_window(&read_pref)
            .unwrap();
        assert_eq!(names(&suitable), vec!["a:27017"]);
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let topology = topology(vec![MemberSpec {
            host: "a:27017",
            primary: true,
            rtt_ms: 5,
            tags: None,
            last_write_ms_ago: 0,
        }]);

        let criteria = ReadPreference::SecondaryPreferred {
            options: Default::default(),
        }
        .into();
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(names(&suitable), vec!["a:27017"]);
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        let topology = topology(vec![
            MemberSpec {
                host: "a:27017",
                primary: true,
                rtt_ms: 5,
                tags: None,
                last_write_ms_ago: 0,
            },
            MemberSpec {
                host: "b:27017",
                primary: false,
                rtt_ms: 10,
                tags: None,
                last_write_ms_ago: 0,
            },
            MemberSpec {
                host: "c:27017",
                primary: false,
                rtt_ms: 100,
                tags: None,
                last_write_ms_ago: 0,
            },
        ]);

        let criteria = ReadPreference::Nearest {
            options: Default::default(),
        }
        .into();
        // Default local threshold is 15ms: 5 and 10 are within 5+15, 100 is not.
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(names(&suitable), vec!["a:27017", "b:27017"]);
    }

    #[test]
    fn first_matching_tag_set_wins() {
        let topology = topology(vec![
            MemberSpec {
                host: "a:27017",
                primary: true,
                rtt_ms: 5,
                tags: Some(tags(&[("dc", "dallas")])),
                last_write_ms_ago: 0,
            },
            MemberSpec {
                host: "b:27017",
                primary: false,
                rtt_ms: 5,
                tags: Some(tags(&[("dc", "ny"), ("rack", "1")])),
                last_write_ms_ago: 0,
            },
            MemberSpec {
                host: "c:27017",
                primary: false,
                rtt_ms: 5,
                tags: Some(tags(&[("dc", "dallas")])),
                last_write_ms_ago: 0,
            },
        ]);

        let criteria = ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .tag_sets(vec![tags(&[("dc", "sf")]), tags(&[("dc", "ny")])])
                .build(),
        }
        .into();
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(names(&suitable), vec!["b:27017"]);

        // No tag set matches anything: no servers are suitable.
        let criteria = ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .tag_sets(vec![tags(&[("dc", "tokyo")])])
                .build(),
        }
        .into();
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert!(suitable.is_empty());
    }

    #[test]
    fn max_staleness_filters_lagged_secondaries() {
        let topology = topology(vec![
            MemberSpec {
                host: "a:27017",
                primary: true,
                rtt_ms: 5,
                tags: None,
                last_write_ms_ago: 0,
            },
            MemberSpec {
                host: "b:27017",
                primary: false,
                rtt_ms: 5,
                tags: None,
                last_write_ms_ago: 0,
            },
            MemberSpec {
                host: "c:27017",
                primary: false,
                rtt_ms: 5,
                tags: None,
                // Far beyond a 100 second staleness bound.
                last_write_ms_ago: 500_000,
            },
        ]);

        let criteria = ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(100))
                .build(),
        }
        .into();
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(names(&suitable), vec!["b:27017"]);
    }

    #[test]
    fn max_staleness_below_minimum_errors() {
        let topology = topology(vec![MemberSpec {
            host: "a:27017",
            primary: true,
            rtt_ms: 5,
            tags: None,
            last_write_ms_ago: 0,
        }]);

        let criteria = ReadPreference::Secondary {
            options: ReadPreferenceOptions::builder()
                .max_staleness(Duration::from_secs(45))
                .build(),
        }
        .into();
        assert!(topology.suitable_servers_in_latency_window(&criteria).is_err());
    }

    #[test]
    fn unknown_topology_has_no_suitable_servers() {
        let options = ClientOptions::builder()
            .hosts(vec![address("a:27017")])
            .build();
        let mut topology = TopologyDescription::default();
        topology.initialize(&options);

        let read_pref = ReadPreference::Primary.into();
        let suitable = topology
            .suitable_servers_in_latency_window(&read_pref)
            .unwrap();
        assert!(suitable.is_empty());
    }
}
