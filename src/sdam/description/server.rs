use std::{ops::RangeInclusive, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    bson::{oid::ObjectId, DateTime},
    client::session::ClusterTime,
    error::{Error, ErrorKind, Result},
    hello::{HelloCommandResponse, HelloReply},
    options::ServerAddress,
    selection_criteria::TagSet,
};

/// The wire protocol versions this driver can speak, i.e. MongoDB 3.6 and newer.
const SUPPORTED_WIRE_VERSIONS: RangeInclusive<i32> = 6..=21;

/// Enum representing the possible types of servers that the driver can connect to.
#[derive(Debug, Deserialize, Clone, Copy, Eq, PartialEq, Serialize, Default)]
#[non_exhaustive]
pub enum ServerType {
    /// A single, non-replica set mongod.
    Standalone,

    /// A router used in sharded deployments.
    Mongos,

    /// The primary node in a replica set.
    #[serde(rename = "RSPrimary")]
    RsPrimary,

    /// A secondary node in a replica set.
    #[serde(rename = "RSSecondary")]
    RsSecondary,

    /// A non-data bearing node in a replica set which can participate in elections.
    #[serde(rename = "RSArbiter")]
    RsArbiter,

    /// Hidden, starting up, or recovering nodes in a replica set.
    #[serde(rename = "RSOther")]
    RsOther,

    /// A member of an uninitialized replica set or a member that has been removed from the
    /// replica set config.
    #[serde(rename = "RSGhost")]
    RsGhost,

    /// A server that the driver hasn't yet communicated with or can't connect to.
    #[serde(alias = "PossiblePrimary")]
    #[default]
    Unknown,
}

impl ServerType {
    /// Derives the type from a hello reply. The rules are ordered: a mongos identifies itself
    /// via `msg`, a configured replica set member via `setName`, an uninitiated one via
    /// `isreplicaset`, and anything else is a standalone.
    pub(crate) fn from_hello_response(response: &HelloCommandResponse) -> Self {
        if response.msg.as_deref() == Some("isdbgrid") {
            return ServerType::Mongos;
        }

        if response.set_name.is_some() {
            return if response.hidden == Some(true) {
                ServerType::RsOther
            } else if response.is_writable_primary.or(response.is_master) == Some(true) {
                ServerType::RsPrimary
            } else if response.secondary == Some(true) {
                ServerType::RsSecondary
            } else if response.arbiter_only == Some(true) {
                ServerType::RsArbiter
            } else {
                ServerType::RsOther
            };
        }

        if response.is_replica_set == Some(true) {
            ServerType::RsGhost
        } else {
            ServerType::Standalone
        }
    }

    pub(crate) fn can_auth(self) -> bool {
        !matches!(self, ServerType::RsArbiter)
    }

    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::RsPrimary
                | ServerType::RsSecondary
                | ServerType::Mongos
        )
    }

    pub(crate) fn is_available(self) -> bool {
        !matches!(self, ServerType::Unknown)
    }
}

/// The monitor's view of one server: the outcome of its most recent check plus the smoothed
/// round-trip time. Descriptions are immutable; each check publishes a fresh one.
#[derive(Debug, Clone)]
pub(crate) struct ServerDescription {
    /// The address of this server, lowercased.
    pub(crate) address: ServerAddress,

    /// The type of this server, derived purely from the latest hello reply (or Unknown when
    /// there is none).
    pub(crate) server_type: ServerType,

    /// When this description was produced.
    pub(crate) last_update_time: Option<DateTime>,

    /// The exponentially-smoothed duration of this server's hello round trips.
    pub(crate) average_round_trip_time: Option<Duration>,

    /// The outcome of the last check: a reply, the error that prevented one, or nothing at all
    /// for a server that has been discovered but never checked.
    pub(crate) reply: Result<Option<HelloReply>>,
}

impl ServerDescription {
    /// A placeholder description for a server that has not been checked yet.
    pub(crate) fn new(address: &ServerAddress) -> Self {
        Self {
            address: ServerAddress::Tcp {
                host: address.host().to_lowercase(),
                port: address.port(),
            },
            server_type: ServerType::Unknown,
            last_update_time: None,
            average_round_trip_time: None,
            reply: Ok(None),
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        mut reply: HelloReply,
        average_rtt: Duration,
    ) -> Self {
        normalize_hostnames(&mut reply.command_response);

        Self {
            server_type: ServerType::from_hello_response(&reply.command_response),
            last_update_time: Some(DateTime::now()),
            average_round_trip_time: Some(average_rtt),
            reply: Ok(Some(reply)),
            ..Self::new(&address)
        }
    }

    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        Self {
            last_update_time: Some(DateTime::now()),
            reply: Err(error),
            ..Self::new(&address)
        }
    }

    /// The hello response of the last successful check, or the error of a failed one.
    ///
    /// Every piece of information about a live server funnels through this accessor, which is
    /// what lets the callers below propagate a failed check with `?`.
    fn hello(&self) -> Result<Option<&HelloCommandResponse>> {
        match self.reply {
            Ok(ref reply) => Ok(reply.as_ref().map(|r| &r.command_response)),
            Err(ref e) => Err(e.clone()),
        }
    }

    /// Whether this server is "available" as per the server selection rules.
    pub(crate) fn is_available(&self) -> bool {
        self.server_type.is_available()
    }

    /// A human-readable explanation when this server's wire versions do not overlap the
    /// driver's, or `None` when they do (or nothing is known).
    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        let response = match self.hello() {
            Ok(Some(response)) => response,
            _ => return None,
        };

        let server_range =
            response.min_wire_version.unwrap_or(0)..=response.max_wire_version.unwrap_or(0);

        if server_range.start() > SUPPORTED_WIRE_VERSIONS.end() {
            Some(format!(
                "Server at {} requires wire version {}, but this driver only supports up to {}",
                self.address,
                server_range.start(),
                SUPPORTED_WIRE_VERSIONS.end(),
            ))
        } else if server_range.end() < SUPPORTED_WIRE_VERSIONS.start() {
            Some(format!(
                "Server at {} only supports wire version {}, but this driver requires at least \
                 {} (MongoDB 3.6)",
                self.address,
                server_range.end(),
                SUPPORTED_WIRE_VERSIONS.start(),
            ))
        } else {
            None
        }
    }

    pub(crate) fn set_name(&self) -> Result<Option<String>> {
        Ok(self.hello()?.and_then(|r| r.set_name.clone()))
    }

    pub(crate) fn set_version(&self) -> Result<Option<i32>> {
        Ok(self.hello()?.and_then(|r| r.set_version))
    }

    pub(crate) fn election_id(&self) -> Result<Option<ObjectId>> {
        Ok(self.hello()?.and_then(|r| r.election_id))
    }

    pub(crate) fn max_wire_version(&self) -> Result<Option<i32>> {
        Ok(self.hello()?.and_then(|r| r.max_wire_version))
    }

    pub(crate) fn last_write_date(&self) -> Result<Option<DateTime>> {
        Ok(self
            .hello()?
            .and_then(|r| r.last_write.as_ref())
            .map(|w| w.last_write_date))
    }

    pub(crate) fn logical_session_timeout(&self) -> Result<Option<Duration>> {
        Ok(self
            .hello()?
            .and_then(|r| r.logical_session_timeout_minutes)
            .map(|minutes| Duration::from_secs(minutes as u64 * 60)))
    }

    pub(crate) fn cluster_time(&self) -> Result<Option<ClusterTime>> {
        match self.reply {
            Ok(ref reply) => Ok(reply.as_ref().and_then(|r| r.cluster_time.clone())),
            Err(ref e) => Err(e.clone()),
        }
    }

    /// Every address this server claims belongs to its replica set: hosts, passives, and
    /// arbiters.
    pub(crate) fn known_hosts(&self) -> Result<Vec<ServerAddress>> {
        let mut hosts = Vec::new();
        if let Some(response) = self.hello()? {
            for list in [&response.hosts, &response.passives, &response.arbiters] {
                for host in list.iter().flatten() {
                    hosts.push(ServerAddress::parse(host)?);
                }
            }
        }
        Ok(hosts)
    }

    /// Whether the address this server knows itself by disagrees with the one the driver
    /// reached it through.
    pub(crate) fn invalid_me(&self) -> Result<bool> {
        Ok(match self.hello()?.and_then(|r| r.me.as_deref()) {
            Some(me) => me != self.address.to_string(),
            None => false,
        })
    }

    pub(crate) fn tags(&self) -> Option<&TagSet> {
        match self.hello() {
            Ok(Some(response)) => response.tags.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        match self.tags() {
            Some(server_tags) => tag_set
                .iter()
                .all(|(key, value)| server_tags.get(key) == Some(value)),
            None => false,
        }
    }
}

fn normalize_hostnames(response: &mut HelloCommandResponse) {
    let mut lowercase_all = |list: &mut Option<Vec<String>>| {
        for host in list.iter_mut().flatten() {
            *host = host.to_lowercase();
        }
    };
    lowercase_all(&mut response.hosts);
    lowercase_all(&mut response.passives);
    lowercase_all(&mut response.arbiters);

    if let Some(ref mut me) = response.me {
        *me = me.to_lowercase();
    }
}

/// The projection of a hello response that description equality considers. Anything outside
/// this tuple (round-trip time in particular) changing does not wake server selection.
fn comparable<'a>(
    response: &'a HelloCommandResponse,
) -> (
    ServerType,
    [Option<i32>; 3],
    [&'a Option<Vec<String>>; 3],
    [&'a Option<String>; 3],
    &'a Option<TagSet>,
    Option<ObjectId>,
    Option<i64>,
) {
    (
        ServerType::from_hello_response(response),
        [
            response.min_wire_version,
            response.max_wire_version,
            response.set_version,
        ],
        [&response.hosts, &response.passives, &response.arbiters],
        [&response.me, &response.set_name, &response.primary],
        &response.tags,
        response.election_id,
        response.logical_session_timeout_minutes,
    )
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        if self.address != other.address || self.server_type != other.server_type {
            return false;
        }

        match (&self.reply, &other.reply) {
            (Ok(mine), Ok(theirs)) => {
                match (mine.as_ref(), theirs.as_ref()) {
                    (Some(mine), Some(theirs)) => {
                        comparable(&mine.command_response) == comparable(&theirs.command_response)
                    }
                    (None, None) => true,
                    _ => false,
                }
            }
            (Err(mine), Err(theirs)) => match (mine.kind.as_ref(), theirs.kind.as_ref()) {
                (ErrorKind::Command(mine), ErrorKind::Command(theirs)) => mine.code == theirs.code,
                _ => mine.to_string() == theirs.to_string(),
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::doc;

    fn parse(doc: crate::bson::Document) -> HelloCommandResponse {
        bson::from_document(doc).unwrap()
    }

    #[test]
    fn server_type_derivation() {
        assert_eq!(
            ServerType::from_hello_response(&parse(doc! { "ok": 1, "msg": "isdbgrid" })),
            ServerType::Mongos
        );
        assert_eq!(
            ServerType::from_hello_response(&parse(
                doc! { "ok": 1, "setName": "rs0", "ismaster": true }
            )),
            ServerType::RsPrimary
        );
        assert_eq!(
            ServerType::from_hello_response(&parse(
                doc! { "ok": 1, "setName": "rs0", "isWritablePrimary": true }
            )),
            ServerType::RsPrimary
        );
        assert_eq!(
            ServerType::from_hello_response(&parse(
                doc! { "ok": 1, "setName": "rs0", "secondary": true }
            )),
            ServerType::RsSecondary
        );
        assert_eq!(
            ServerType::from_hello_response(&parse(
                doc! { "ok": 1, "setName": "rs0", "arbiterOnly": true }
            )),
            ServerType::RsArbiter
        );
        // Hidden wins over any role flag.
        assert_eq!(
            ServerType::from_hello_response(&parse(
                doc! { "ok": 1, "setName": "rs0", "hidden": true, "ismaster": true }
            )),
            ServerType::RsOther
        );
        assert_eq!(
            ServerType::from_hello_response(&parse(doc! { "ok": 1, "isreplicaset": true })),
            ServerType::RsGhost
        );
        assert_eq!(
            ServerType::from_hello_response(&parse(doc! { "ok": 1 })),
            ServerType::Standalone
        );
        assert_eq!(
            ServerType::from_hello_response(&parse(doc! { "ok": 1, "isWritablePrimary": true })),
            ServerType::Standalone
        );
    }

    #[test]
    fn wire_version_compatibility() {
        let description = |min: i32, max: i32| {
            let address = ServerAddress::parse("a:27017").unwrap();
            ServerDescription::new_from_hello_reply(
                address.clone(),
                crate::hello::HelloReply {
                    server_address: address,
                    command_response: parse(doc! {
                        "ok": 1,
                        "minWireVersion": min,
                        "maxWireVersion": max,
                    }),
                    raw_command_response: Default::default(),
                    cluster_time: None,
                },
                Duration::from_millis(1),
            )
        };

        assert!(description(0, 5).compatibility_error_message().is_some());
        assert!(description(22, 25).compatibility_error_message().is_some());
        assert!(description(0, 8).compatibility_error_message().is_none());
        assert!(description(6, 17).compatibility_error_message().is_none());
    }

    #[test]
    fn me_mismatch_detection() {
        let address = ServerAddress::parse("a:27017").unwrap();
        let with_me = |me: &str| {
            ServerDescription::new_from_hello_reply(
                address.clone(),
                crate::hello::HelloReply {
                    server_address: address.clone(),
                    command_response: parse(doc! { "ok": 1, "me": me }),
                    raw_command_response: Default::default(),
                    cluster_time: None,
                },
                Duration::from_millis(1),
            )
        };

        assert!(!with_me("a:27017").invalid_me().unwrap());
        // Hostname case is normalized away before comparison.
        assert!(!with_me("A:27017").invalid_me().unwrap());
        assert!(with_me("b:27017").invalid_me().unwrap());
    }
}
