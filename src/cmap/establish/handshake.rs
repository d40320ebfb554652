use once_cell::sync::Lazy;

use crate::{
    bson::{doc, Bson, Document},
    client::{
        auth::{AuthMechanism, ClientFirst, Credential},
        options::ClientOptions,
    },
    cmap::{Command, Connection, StreamDescription},
    compression::Compressor,
    error::Result,
    hello::{hello_command, run_hello, HelloReply},
};

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ClientMetadata {
    pub(crate) application: Option<AppMetadata>,
    pub(crate) driver: DriverMetadata,
    pub(crate) os: OsMetadata,
    pub(crate) platform: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct AppMetadata {
    pub(crate) name: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DriverMetadata {
    pub(crate) name: String,
    pub(crate) version: String,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OsMetadata {
    pub(crate) os_type: String,
    pub(crate) architecture: String,
}

impl From<&ClientMetadata> for Bson {
    fn from(metadata: &ClientMetadata) -> Self {
        let mut metadata_doc = Document::new();

        if let Some(application) = &metadata.application {
            metadata_doc.insert("application", doc! { "name": application.name.as_str() });
        }

        metadata_doc.insert(
            "driver",
            doc! {
                "name": metadata.driver.name.as_str(),
                "version": metadata.driver.version.as_str(),
            },
        );

        metadata_doc.insert(
            "os",
            doc! {
                "type": metadata.os.os_type.as_str(),
                "architecture": metadata.os.architecture.as_str(),
            },
        );

        metadata_doc.insert("platform", metadata.platform.as_str());

        Bson::Document(metadata_doc)
    }
}

/// Contains the basic handshake information that can be statically determined. This document
/// (potentially with an application name added) is put in the `client` field of the hello
/// command.
pub(crate) static BASE_CLIENT_METADATA: Lazy<ClientMetadata> = Lazy::new(|| ClientMetadata {
    application: None,
    driver: DriverMetadata {
        name: env!("CARGO_PKG_NAME").into(),
        version: env!("CARGO_PKG_VERSION").into(),
    },
    os: OsMetadata {
        os_type: std::env::consts::OS.into(),
        architecture: std::env::consts::ARCH.into(),
    },
    platform: "rust with tokio".to_string(),
});

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The hello command to send when handshaking. This is identical for all connections made
    /// with the same options, so it is created up front when the Handshaker is.
    command: Command,

    compressors: Option<Vec<Compressor>>,
}

impl Handshaker {
    /// Creates a new Handshaker.
    pub(crate) fn new(options: &ClientOptions) -> Self {
        let mut metadata = BASE_CLIENT_METADATA.clone();

        // Handshakes are always sent with the legacy name, since whether the server understands
        // `hello` is exactly what the handshake discovers.
        let mut command = hello_command(None);

        if let Some(ref app_name) = options.app_name {
            metadata.application = Some(AppMetadata {
                name: app_name.clone(),
            });
        }

        command.body.insert("client", &metadata);

        if let Some(ref compressors) = options.compressors {
            command.body.insert(
                "compression",
                compressors
                    .iter()
                    .map(|compressor| Bson::String(compressor.name().to_string()))
                    .collect::<Vec<_>>(),
            );
        }

        Self {
            command,
            compressors: options.compressors.clone(),
        }
    }

    fn build_command(&self, credential: Option<&Credential>) -> Result<(Command, Option<ClientFirst>)> {
        let mut command = self.command.clone();

        let client_first = match credential {
            // Speculative authentication needs enough of a credential to build a first message;
            // anything less is reported properly by the post-handshake authentication step.
            Some(credential)
                if credential.username.is_some() || credential.mechanism.is_some() =>
            {
                credential.append_needed_mechanism_negotiation(&mut command.body);

                // The spec indicates that SCRAM-SHA-256 should be assumed for speculative
                // authentication if no mechanism is provided. This doesn't cause issues with
                // servers where SCRAM-SHA-256 is not the default since those servers are too old
                // to support speculative authentication at all.
                let auth_mechanism = credential
                    .mechanism
                    .as_ref()
                    .unwrap_or(&AuthMechanism::ScramSha256);

                let client_first = auth_mechanism.build_speculative_client_first(credential)?;
                if let Some(ref client_first) = client_first {
                    command
                        .body
                        .insert("speculativeAuthenticate", client_first.to_document());
                }
                client_first
            }
            _ => None,
        };

        Ok((command, client_first))
    }

    /// Handshakes a connection: runs the initial hello, records the stream description,
    /// negotiates compression, and authenticates if a credential is configured.
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        credential: Option<&Credential>,
    ) -> Result<HelloReply> {
        let (command, client_first) = self.build_command(credential)?;
        let mut hello_reply = run_hello(conn, command).await?;

        conn.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));
        conn.server_id = hello_reply.command_response.connection_id;

        // Record the client's message and the server's response from speculative authentication
        // if the server did send a response.
        let first_round = client_first.and_then(|client_first| {
            hello_reply
                .command_response
                .speculative_authenticate
                .take()
                .map(|server_first| client_first.into_first_round(server_first))
        });

        // Use the first compressor in the client's list that the server also supports.
        if let (Some(server_compressors), Some(client_compressors)) = (
            hello_reply.command_response.compressors.as_ref(),
            self.compressors.as_ref(),
        ) {
            conn.compressor = client_compressors
                .iter()
                .find(|client_compressor| {
                    server_compressors
                        .iter()
                        .any(|server_compressor| client_compressor.name() == server_compressor)
                })
                .cloned();
        }

        if let Some(credential) = credential {
            credential.authenticate_stream(conn, first_round).await?;
        }

        Ok(hello_reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_command_shape() {
        let options = ClientOptions::builder()
            .app_name("my-app".to_string())
            .compressors(vec![Compressor::Snappy, Compressor::Zlib { level: None }])
            .build();
        let handshaker = Handshaker::new(&options);
        let (command, client_first) = handshaker.build_command(None).unwrap();

        assert_eq!(command.name, "isMaster");
        assert_eq!(command.body.get_bool("helloOk"), Ok(true));
        assert!(client_first.is_none());

        let client = command.body.get_document("client").unwrap();
        assert_eq!(
            client.get_document("application").unwrap().get_str("name"),
            Ok("my-app")
        );
        assert_eq!(
            client.get_document("driver").unwrap().get_str("name"),
            Ok(env!("CARGO_PKG_NAME"))
        );

        let compression = command.body.get_array("compression").unwrap();
        assert_eq!(compression.len(), 2);
        assert_eq!(compression[0], Bson::String("snappy".to_string()));
    }

    #[test]
    fn speculative_auth_is_included_for_scram() {
        let options = ClientOptions::default();
        let handshaker = Handshaker::new(&options);

        let credential = Credential::builder()
            .username("user".to_string())
            .password("pass".to_string())
            .build();
        let (command, client_first) = handshaker.build_command(Some(&credential)).unwrap();

        assert!(client_first.is_some());
        let speculative = command.body.get_document("speculativeAuthenticate").unwrap();
        assert_eq!(speculative.get_i32("saslStart"), Ok(1));
        assert_eq!(speculative.get_str("mechanism"), Ok("SCRAM-SHA-256"));

        // Mechanism negotiation is requested when none is configured.
        assert_eq!(
            command.body.get_str("saslSupportedMechs"),
            Ok("admin.user")
        );
    }
}
