mod description;
mod monitor;
mod server;
mod topology;

use std::time::Duration;

pub use description::{server::ServerType, topology::TopologyType};
pub(crate) use description::{
    server::ServerDescription,
    topology::{TopologyDescription, TransactionSupportStatus},
};
pub(crate) use monitor::Monitor;
pub(crate) use server::Server;
pub(crate) use topology::{SelectedServer, Topology};

pub(crate) const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);
pub(crate) const MIN_HEARTBEAT_FREQUENCY: Duration = Duration::from_millis(500);

/// A description of the most up-to-date information known about a server, for use in selection
/// predicates.
#[derive(Clone, Debug)]
pub struct ServerInfo<'a> {
    description: &'a ServerDescription,
}

impl<'a> ServerInfo<'a> {
    pub(crate) fn new(description: &'a ServerDescription) -> Self {
        Self { description }
    }

    /// Gets the address of the server.
    pub fn address(&self) -> &crate::options::ServerAddress {
        &self.description.address
    }

    /// Gets the type of the server.
    pub fn server_type(&self) -> ServerType {
        self.description.server_type
    }

    /// Gets the average round trip time to the server, as measured by the most recent
    /// heartbeats.
    pub fn average_round_trip_time(&self) -> Option<Duration> {
        self.description.average_round_trip_time
    }

    /// Gets the tags of the server, if it is a replica set member.
    pub fn tags(&self) -> Option<&crate::selection_criteria::TagSet> {
        self.description.tags()
    }
}
