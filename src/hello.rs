use serde::{Deserialize, Serialize};

use crate::{
    bson::{doc, oid::ObjectId, DateTime, Document},
    client::{options::ServerAddress, session::ClusterTime},
    cmap::{Command, Connection},
    error::Result,
    selection_criteria::TagSet,
};

/// The pre-5.0 name of the `hello` command. New connections are greeted with this name, since
/// whether the server knows the modern one is exactly what the greeting discovers.
pub(crate) const LEGACY_HELLO_COMMAND_NAME: &str = "isMaster";

/// Builds the periodic monitoring / handshake command.
///
/// `hello_ok` is what the server has previously told us about its support for the modern
/// command name: `Some(true)` switches to `hello`, `Some(false)` stays on the legacy name, and
/// `None` (nothing known yet) asks via `helloOk: true`.
pub(crate) fn hello_command(hello_ok: Option<bool>) -> Command {
    let body = match hello_ok {
        Some(true) => doc! { "hello": 1 },
        Some(false) => doc! { LEGACY_HELLO_COMMAND_NAME: 1 },
        None => doc! { LEGACY_HELLO_COMMAND_NAME: 1, "helloOk": true },
    };
    let name = crate::bson_util::first_key(&body).unwrap_or(LEGACY_HELLO_COMMAND_NAME);

    Command::new(name.to_string(), "admin", body)
}

/// Execute a hello or legacy hello command on the given connection.
pub(crate) async fn run_hello(conn: &mut Connection, command: Command) -> Result<HelloReply> {
    conn.send_command(command, None)
        .await
        .and_then(|response| response.into_hello_reply())
}

#[derive(Debug, Clone)]
pub(crate) struct HelloReply {
    pub(crate) server_address: ServerAddress,
    pub(crate) command_response: HelloCommandResponse,
    pub(crate) raw_command_response: Document,
    pub(crate) cluster_time: Option<ClusterTime>,
}

/// The body of a reply to a `hello` command.
///
/// Every field the driver consumes is modeled; everything else the server reports is ignored at
/// deserialization.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct HelloCommandResponse {
    // Role reporting, from which the server type is derived.
    /// Whether this server can accept writes (a primary, a mongos, or a standalone).
    pub is_writable_primary: Option<bool>,

    /// Pre-5.0 spelling of `is_writable_primary`.
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,

    /// Whether this server is a replica set secondary.
    pub secondary: Option<bool>,

    /// Whether this server is an arbiter.
    pub arbiter_only: Option<bool>,

    /// Whether this server is hidden from clients.
    pub hidden: Option<bool>,

    /// "isdbgrid" when the responder is a mongos.
    pub msg: Option<String>,

    #[serde(rename = "isreplicaset")]
    /// Whether this server belongs to a replica set that has not been initiated.
    pub is_replica_set: Option<bool>,

    // Replica set configuration.
    /// The name of the replica set this server belongs to.
    pub set_name: Option<String>,

    /// The replica set config version.
    pub set_version: Option<i32>,

    /// The id of the most recent election this server has observed.
    pub election_id: Option<ObjectId>,

    /// The address of the member this server believes is primary.
    pub primary: Option<String>,

    /// The data-bearing members of the set.
    pub hosts: Option<Vec<String>>,

    /// The passive (non-electable) members of the set.
    pub passives: Option<Vec<String>>,

    /// The arbiters of the set.
    pub arbiters: Option<Vec<String>>,

    /// The address this server knows itself by.
    pub me: Option<String>,

    /// The member's replica set tags.
    pub tags: Option<TagSet>,

    /// When this server last applied a write.
    pub last_write: Option<LastWrite>,

    // Capabilities and limits.
    /// Lowest wire protocol version the server speaks.
    pub min_wire_version: Option<i32>,

    /// Highest wire protocol version the server speaks.
    pub max_wire_version: Option<i32>,

    /// Largest document the server accepts, in bytes.
    #[serde(default = "default_max_bson_object_size")]
    pub max_bson_object_size: i64,

    /// Largest wire message the server accepts, in bytes.
    #[serde(default = "default_max_message_size_bytes")]
    pub max_message_size_bytes: i32,

    /// Most write statements the server accepts in one write command.
    pub max_write_batch_size: Option<i64>,

    /// Minutes a logical session stays alive after its last use; absent when the deployment
    /// does not support sessions.
    pub logical_session_timeout_minutes: Option<i64>,

    /// Whether the server understands the modern `hello` command name.
    pub hello_ok: Option<bool>,

    /// The wire compressors shared between this client's offer and the server's support.
    #[serde(rename = "compression")]
    pub compressors: Option<Vec<String>>,

    /// The server-side id of the connection the command ran on (4.2+).
    pub connection_id: Option<i64>,

    // Authentication.
    /// SASL mechanisms available for the user named in the handshake's negotiation request.
    pub sasl_supported_mechs: Option<Vec<String>>,

    /// The server's reply to speculative authentication, when it chose to engage.
    pub speculative_authenticate: Option<Document>,
}

fn default_max_bson_object_size() -> i64 {
    16 * 1024 * 1024
}

fn default_max_message_size_bytes() -> i32 {
    48_000_000
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LastWrite {
    /// The date of the most recent write known to this server.
    pub last_write_date: DateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_command_name_selection() {
        let unknown = hello_command(None);
        assert_eq!(unknown.name, LEGACY_HELLO_COMMAND_NAME);
        assert_eq!(unknown.body.get_bool("helloOk"), Ok(true));

        let legacy = hello_command(Some(false));
        assert_eq!(legacy.name, LEGACY_HELLO_COMMAND_NAME);
        assert!(!legacy.body.contains_key("helloOk"));

        let modern = hello_command(Some(true));
        assert_eq!(modern.name, "hello");
        assert_eq!(modern.target_db, "admin");
    }

    #[test]
    fn limits_default_when_absent() {
        let response: HelloCommandResponse =
            bson::from_document(doc! { "ok": 1, "ismaster": true }).unwrap();
        assert_eq!(response.max_bson_object_size, 16 * 1024 * 1024);
        assert_eq!(response.max_message_size_bytes, 48_000_000);
        assert_eq!(response.max_write_batch_size, None);
    }
}
