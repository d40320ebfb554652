pub(crate) mod handshake;

use std::time::Duration;

use self::handshake::Handshaker;
use crate::{
    client::{auth::Credential, options::ClientOptions},
    cmap::conn::{Connection, PendingConnection},
    error::Result,
    hello::HelloReply,
    options::ServerAddress,
    runtime::{AsyncStream, TlsConfig},
};

/// Contains the logic to establish a connection: opening the socket, performing the handshake,
/// and authenticating.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    handshaker: Handshaker,

    credential: Option<Credential>,

    connect_timeout: Option<Duration>,

    socket_timeout: Option<Duration>,

    tls_config: Option<TlsConfig>,
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        let handshaker = Handshaker::new(options);

        let tls_config = match options.tls_options() {
            Some(tls_options) => Some(TlsConfig::new(tls_options)?),
            None => None,
        };

        Ok(Self {
            handshaker,
            credential: options.credential.clone(),
            connect_timeout: options.connect_timeout,
            socket_timeout: options.socket_timeout,
            tls_config,
        })
    }

    /// Establishes a connection for application use: connect, handshake, authenticate.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> Result<Connection> {
        let stream = AsyncStream::connect(
            &pending_connection.address,
            self.connect_timeout,
            self.tls_config.as_ref(),
        )
        .await?;

        let mut connection = Connection::new(
            pending_connection.address,
            stream,
            pending_connection.id,
            pending_connection.generation,
            self.socket_timeout,
        );

        self.handshaker
            .handshake(&mut connection, self.credential.as_ref())
            .await?;

        Ok(connection)
    }

    /// Establishes a connection for topology monitoring. Monitoring connections authenticate like
    /// application connections but are never pooled.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
    ) -> Result<(Connection, HelloReply)> {
        let mut connection =
            Connection::connect_monitoring(address, self.connect_timeout, self.tls_config.as_ref())
                .await?;

        let hello_reply = self
            .handshaker
            .handshake(&mut connection, self.credential.as_ref())
            .await?;

        Ok((connection, hello_reply))
    }
}
