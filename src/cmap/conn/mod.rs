pub(crate) mod command;
mod stream_description;
pub(crate) mod wire;

use std::time::{Duration, Instant};

use tokio::io::BufStream;

use self::wire::{next_request_id, Message, MessageFlags};
use super::manager::PoolManager;
use crate::{
    compression::Compressor,
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::{self, AsyncStream, TlsConfig},
};
pub(crate) use command::{Command, RawCommandResponse};
pub(crate) use stream_description::StreamDescription;

/// Identifying information about a connection, as carried on command monitoring events.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionInfo {
    /// The driver-side id of the connection, unique per pool.
    pub id: u32,

    /// The id the server assigned the connection (4.2+), for correlating with server logs.
    pub server_id: Option<i64>,

    /// The address the connection is to.
    pub address: ServerAddress,
}

/// One socket to one server, together with what the handshake learned about it.
///
/// Requests and replies on a connection are strictly FIFO, and the driver never interleaves
/// them: a connection is checked out by exactly one operation at a time.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,

    pub(crate) server_id: Option<i64>,

    pub(crate) address: ServerAddress,

    /// The pool generation at establishment; checkouts refuse connections whose generation
    /// trails the pool's.
    pub(crate) generation: u32,

    stream: BufStream<AsyncStream>,

    /// What the handshake learned; `None` only before the handshake has run.
    pub(crate) stream_description: Option<StreamDescription>,

    /// The compressor applied to outgoing compressible commands, as negotiated in the
    /// handshake. Incoming messages announce their own compressor.
    pub(crate) compressor: Option<Compressor>,

    /// Set when any I/O on this connection fails; a poisoned connection is closed on check-in
    /// rather than reused, since the stream position is unknowable.
    poisoned: bool,

    /// When the connection last went idle in the pool.
    idle_since: Option<Instant>,

    /// The way home: present exactly while checked out of a pool.
    pub(super) pool_manager: Option<PoolManager>,

    socket_timeout: Option<Duration>,
}

impl Connection {
    pub(crate) fn new(
        address: ServerAddress,
        stream: AsyncStream,
        id: u32,
        generation: u32,
        socket_timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            server_id: None,
            address,
            generation,
            stream: BufStream::new(stream),
            stream_description: None,
            compressor: None,
            poisoned: false,
            idle_since: None,
            pool_manager: None,
            socket_timeout,
        }
    }

    /// Open a socket to `address` for monitoring. The caller runs the handshake itself; the
    /// connection never joins a pool.
    pub(crate) async fn connect_monitoring(
        address: ServerAddress,
        connect_timeout: Option<Duration>,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let stream = AsyncStream::connect(&address, connect_timeout, tls_config).await?;
        Ok(Self::new(address, stream, 0, 0, connect_timeout))
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    // Pool lifecycle hooks.

    pub(super) fn on_checked_in(&mut self) {
        self.pool_manager = None;
        self.idle_since = Some(Instant::now());
    }

    pub(super) fn on_checked_out(&mut self, manager: PoolManager) {
        self.pool_manager = Some(manager);
        self.idle_since = None;
    }

    pub(super) fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub(super) fn is_stale(&self, current_generation: u32) -> bool {
        self.generation != current_generation
    }

    pub(super) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        match (self.idle_since, max_idle_time) {
            (Some(idle_since), Some(max_idle_time)) => idle_since.elapsed() >= max_idle_time,
            _ => false,
        }
    }

    // Command execution.

    /// Sends a `Command` and reads the reply.
    ///
    /// `Ok` means the wire exchange succeeded; whether the command itself succeeded is for the
    /// caller to decide from the reply document.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
    ) -> Result<RawCommandResponse> {
        let request_id = request_id.into().unwrap_or_else(next_request_id);

        let socket_timeout = self.socket_timeout;
        let exchange = async {
            self.write_message(command, request_id).await?;
            self.read_reply(request_id).await
        };

        let result = runtime::timeout_opt(socket_timeout, exchange)
            .await
            .and_then(std::convert::identity);

        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    async fn write_message(&mut self, command: Command, request_id: i32) -> Result<()> {
        // A connection that hasn't completed its handshake hasn't negotiated a wire version,
        // so its hello goes out as a legacy OP_QUERY.
        if self.stream_description.is_none() {
            return wire::write_op_query_to(&mut self.stream, request_id, &command.body).await;
        }

        let compress = command.should_compress();
        let message = Message::from_command(command, Some(request_id))?;
        match self.compressor {
            Some(ref compressor) if compress => {
                message.write_compressed_to(&mut self.stream, compressor).await
            }
            _ => message.write_to(&mut self.stream).await,
        }
    }

    async fn read_reply(&mut self, request_id: i32) -> Result<RawCommandResponse> {
        let max_len = self
            .stream_description
            .as_ref()
            .map(|description| description.max_message_size_bytes);
        let reply = Message::read_from(&mut self.stream, max_len).await?;

        if reply.response_to != request_id {
            return Err(Error::invalid_response(format!(
                "expected a response to request {} but got a response to request {}",
                request_id, reply.response_to,
            )));
        }
        if reply.flags.contains(MessageFlags::MORE_TO_COME) {
            return Err(Error::invalid_response(
                "server indicated moreToCome on a reply to a non-exhaust request",
            ));
        }

        Ok(RawCommandResponse::new(
            self.address.clone(),
            reply.into_single_document_response(),
        ))
    }

    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "Stream checked out but not handshaked".to_string(),
            }
            .into()
        })
    }

    pub(crate) fn supports_sessions(&self) -> bool {
        self.stream_description
            .as_ref()
            .map(StreamDescription::supports_sessions)
            .unwrap_or(false)
    }

    /// Moves the live state into a fresh value, leaving a husk behind; used by `Drop` to hand
    /// the connection back to its pool by value.
    fn detach(&mut self) -> Connection {
        Connection {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
            generation: self.generation,
            stream: std::mem::replace(&mut self.stream, BufStream::new(AsyncStream::Null)),
            stream_description: self.stream_description.take(),
            compressor: self.compressor.take(),
            poisoned: self.poisoned,
            idle_since: None,
            pool_manager: None,
            socket_timeout: self.socket_timeout,
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // A pool manager is present exactly while checked out: send the connection home so the
        // pool's capacity accounting stays right. Without one (idle in the pool, or a
        // monitoring connection) dropping the socket is the whole job.
        if let Some(manager) = self.pool_manager.take() {
            manager.check_in(self.detach());
        }
    }
}

/// The claim on a pool slot for a connection that is about to be established.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: u32,
}
