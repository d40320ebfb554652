use std::time::Duration;

use crate::{client::options::ServerAddress, hello::HelloReply, sdam::ServerType};

/// Information about the server that a given connection is connected to, as learned from the
/// connection's handshake.
#[derive(Clone, Debug, Default)]
pub(crate) struct StreamDescription {
    /// The address of the server.
    pub(crate) server_address: ServerAddress,

    /// The type the server had when the handshake occurred.
    pub(crate) initial_server_type: ServerType,

    /// The maximum wire version that the server understands.
    pub(crate) max_wire_version: Option<i32>,

    /// The minimum wire version that the server understands.
    pub(crate) min_wire_version: Option<i32>,

    /// The supported authentication mechanisms for the requested user, if any were requested in
    /// the handshake.
    pub(crate) sasl_supported_mechs: Option<Vec<String>>,

    /// How long sessions started on this server remain active after their most recent use.
    pub(crate) logical_session_timeout: Option<Duration>,

    /// The maximum size of a BSON object the server accepts.
    pub(crate) max_bson_object_size: i64,

    /// The maximum size of a wire protocol message the server accepts.
    pub(crate) max_message_size_bytes: i32,

    /// The maximum number of writes the server accepts in one write command.
    pub(crate) max_write_batch_size: i64,

    /// Whether the server understands the modern `hello` command.
    pub(crate) hello_ok: bool,
}

impl StreamDescription {
    /// Constructs a new StreamDescription from a hello command reply.
    pub(crate) fn from_hello_reply(reply: &HelloReply) -> Self {
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: ServerType::from_hello_response(&reply.command_response),
            max_wire_version: reply.command_response.max_wire_version,
            min_wire_version: reply.command_response.min_wire_version,
            sasl_supported_mechs: reply.command_response.sasl_supported_mechs.clone(),
            logical_session_timeout: reply
                .command_response
                .logical_session_timeout_minutes
                .map(|mins| Duration::from_secs(mins as u64 * 60)),
            max_bson_object_size: reply.command_response.max_bson_object_size,
            max_message_size_bytes: reply.command_response.max_message_size_bytes,
            max_write_batch_size: reply
                .command_response
                .max_write_batch_size
                .unwrap_or(100_000),
            hello_ok: reply.command_response.hello_ok.unwrap_or(false),
        }
    }

    /// Whether this connection supports sessions.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Whether this connection supports retryable writes.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.initial_server_type != ServerType::Standalone
            && self.logical_session_timeout.is_some()
            && self.max_wire_version.map_or(false, |version| version >= 6)
    }
}
