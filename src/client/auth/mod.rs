//! Contains the types needed to specify the auth configuration for a
//! [`Client`](crate::Client).

mod plain;
mod sasl;
mod scram;
mod x509;

use std::{fmt::Debug, str::FromStr};

use rand::Rng;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use self::scram::ScramVersion;
use crate::{
    bson::Document,
    cmap::{Command, Connection, StreamDescription},
    error::{Error, ErrorKind, Result},
};

/// How a connection proves its identity to the server.
#[derive(Clone, Deserialize, PartialEq, Debug)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// Challenge-response over SHA-1 ([RFC 5802](http://tools.ietf.org/html/rfc5802)).
    ScramSha1,

    /// Challenge-response over SHA-256 ([RFC 7677](https://tools.ietf.org/html/rfc7677)), the
    /// server-side default since MongoDB 4.0.
    ScramSha256,

    /// Authentication by the distinguished subject name of the client certificate presented in
    /// the TLS handshake.
    MongoDbX509,

    /// Kerberos ([RFC 4752](http://tools.ietf.org/html/rfc4752)); modeled for credential
    /// validation but not currently supported by this driver.
    Gssapi,

    /// SASL PLAIN ([RFC 4616](https://tools.ietf.org/html/rfc4616)), used by MongoDB solely
    /// for LDAP proxy authentication; the credentials live outside the database, so the
    /// "$external" source is mandatory.
    Plain,
}

impl AuthMechanism {
    /// Returns this `AuthMechanism` as its canonical string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => "SCRAM-SHA-1",
            AuthMechanism::ScramSha256 => "SCRAM-SHA-256",
            AuthMechanism::MongoDbX509 => "MONGODB-X509",
            AuthMechanism::Gssapi => "GSSAPI",
            AuthMechanism::Plain => "PLAIN",
        }
    }

    /// Get the default authSource for this mechanism, given the database name from the
    /// connection string (if any).
    pub(crate) fn default_source<'a>(&self, uri_db: Option<&'a str>) -> &'a str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => uri_db.unwrap_or("admin"),
            AuthMechanism::Plain => uri_db.unwrap_or("$external"),
            AuthMechanism::MongoDbX509 | AuthMechanism::Gssapi => "$external",
        }
    }

    /// Determines whether the provided credential carries everything this mechanism needs.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        let failure = |message: &str| {
            Err(ErrorKind::InvalidArgument {
                message: format!("{}: {}", self.as_str(), message),
            }
            .into())
        };

        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => {
                if credential.username.is_none() {
                    return failure("a username is required");
                }
            }
            AuthMechanism::Plain => {
                match credential.username.as_deref() {
                    None | Some("") => return failure("a non-empty username is required"),
                    _ => {}
                }
                if credential.password.is_none() {
                    return failure("a password is required");
                }
            }
            AuthMechanism::MongoDbX509 => {
                if credential.password.is_some() {
                    return failure("a password cannot be specified");
                }
                if !matches!(credential.source.as_deref(), None | Some("$external")) {
                    return failure("only $external may be used as the auth source");
                }
            }
            AuthMechanism::Gssapi => {
                if credential.username.is_none() {
                    return failure("a user principal is required");
                }
            }
        }

        Ok(())
    }

    fn unsupported(&self) -> Error {
        ErrorKind::Authentication {
            message: format!(
                "{} authentication requires an external security context and is not supported \
                 by this driver",
                self.as_str()
            ),
        }
        .into()
    }

    /// Constructs the first message of this mechanism's conversation, for inclusion in the
    /// handshake's `speculativeAuthenticate` field. Mechanisms whose first message depends on a
    /// server challenge return `None`.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<Option<ClientFirst>> {
        match self {
            Self::ScramSha1 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha1,
                ScramVersion::Sha1.build_speculative_client_first(credential)?,
            ))),
            Self::ScramSha256 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha256,
                ScramVersion::Sha256.build_speculative_client_first(credential)?,
            ))),
            Self::MongoDbX509 => Ok(Some(ClientFirst::X509(Box::new(
                x509::build_client_first(credential),
            )))),
            Self::Plain => Ok(None),
            Self::Gssapi => Err(self.unsupported()),
        }
    }

    pub(crate) async fn authenticate_stream(
        &self,
        stream: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        self.validate_credential(credential)?;

        match self {
            AuthMechanism::ScramSha1 => {
                ScramVersion::Sha1
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::ScramSha256 => {
                ScramVersion::Sha256
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::MongoDbX509 => x509::authenticate_stream(stream, credential, None).await,
            AuthMechanism::Plain => plain::authenticate_stream(stream, credential).await,
            AuthMechanism::Gssapi => Err(self.unsupported()),
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            "SCRAM-SHA-1" => Ok(AuthMechanism::ScramSha1),
            "SCRAM-SHA-256" => Ok(AuthMechanism::ScramSha256),
            "MONGODB-X509" => Ok(AuthMechanism::MongoDbX509),
            "GSSAPI" => Ok(AuthMechanism::Gssapi),
            "PLAIN" => Ok(AuthMechanism::Plain),
            "MONGODB-CR" => Err(ErrorKind::InvalidArgument {
                message: "MONGODB-CR is deprecated and not supported by this driver. Use SCRAM \
                          for password-based authentication instead"
                    .into(),
            }
            .into()),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid mechanism string: {}", str),
            }
            .into()),
        }
    }
}

/// When the user didn't configure a mechanism, pick one from what the server advertised for the
/// user in the handshake: SCRAM-SHA-256 when available, SCRAM-SHA-1 otherwise.
fn negotiate_mechanism(description: &StreamDescription) -> AuthMechanism {
    let sha256_advertised = description
        .sasl_supported_mechs
        .iter()
        .flatten()
        .any(|m| m == AuthMechanism::ScramSha256.as_str());

    if sha256_advertised {
        AuthMechanism::ScramSha256
    } else {
        AuthMechanism::ScramSha1
    }
}

/// Who to authenticate as, against what, and how. The mechanism and source can be left out, in
/// which case they are negotiated with the server or defaulted from the other fields.
#[derive(Clone, Default, Deserialize, TypedBuilder, PartialEq)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. Required by every mechanism except MONGODB-X509.
    pub username: Option<String>,

    /// The database used to authenticate. Defaults to "admin" for SCRAM and to "$external" for
    /// the mechanisms whose credentials are stored outside MongoDB.
    pub source: Option<String>,

    /// The password to authenticate with, for the mechanisms that use one.
    pub password: Option<String>,

    /// Which authentication mechanism to use. When absent, one is negotiated with the server.
    pub mechanism: Option<AuthMechanism>,

    /// Additional mechanism-specific properties.
    pub mechanism_properties: Option<Document>,

    /// Whether `source` came from an explicit `authSource` URI option, which outranks the
    /// value a TXT record provides during SRV expansion.
    #[serde(skip)]
    #[builder(setter(skip))]
    pub(crate) source_from_uri: bool,
}

impl Credential {
    /// The source database this credential authenticates against, after defaulting.
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or_else(|| {
            self.mechanism
                .as_ref()
                .map(|m| m.default_source(None))
                .unwrap_or("admin")
        })
    }

    /// When no mechanism is configured, ask the server which SASL mechanisms exist for the user
    /// as part of the handshake hello.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut Document) {
        if self.mechanism.is_some() {
            return;
        }
        if let Some(ref username) = self.username {
            command.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }

    /// Authenticates a freshly handshaken stream, completing the speculative first round when
    /// the server answered one.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        // Arbiters cannot be authenticated against.
        if !conn.stream_description()?.initial_server_type.can_auth() {
            return Ok(());
        };

        match first_round {
            Some(FirstRound::Scram(version, first_round)) => {
                version.authenticate_stream(conn, self, first_round).await
            }
            Some(FirstRound::X509(server_first)) => {
                x509::authenticate_stream(conn, self, Some(server_first)).await
            }
            None => {
                let mechanism = match self.mechanism {
                    Some(ref m) => m.clone(),
                    None => negotiate_mechanism(conn.stream_description()?),
                };
                mechanism.authenticate_stream(conn, self).await
            }
        }
    }
}

impl Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential")
            .field(&"REDACTED".to_string())
            .finish()
    }
}

/// The mechanism-specific opening message embedded into the handshake for speculative
/// authentication.
pub(crate) enum ClientFirst {
    Scram(ScramVersion, scram::ClientFirst),
    X509(Box<Command>),
}

impl ClientFirst {
    /// The document placed in the handshake's `speculativeAuthenticate` field.
    pub(crate) fn to_document(&self) -> Document {
        match self {
            Self::Scram(version, client_first) => client_first.to_command(version).body,
            Self::X509(command) => command.body.clone(),
        }
    }

    /// Pairs this message with the server's speculative reply, producing the state the
    /// authenticator resumes from.
    pub(crate) fn into_first_round(self, server_first: Document) -> FirstRound {
        match self {
            Self::Scram(version, client_first) => FirstRound::Scram(
                version,
                scram::FirstRound {
                    client_first,
                    server_first,
                },
            ),
            Self::X509(..) => FirstRound::X509(server_first),
        }
    }
}

/// A completed first round of speculative authentication.
#[derive(Debug)]
pub(crate) enum FirstRound {
    Scram(ScramVersion, scram::FirstRound),
    X509(Document),
}

/// A random nonce for a SCRAM conversation.
pub(crate) fn generate_nonce() -> String {
    let bytes: [u8; 32] = rand::thread_rng().gen();
    base64::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_strings_round_trip() {
        for mechanism in [
            AuthMechanism::ScramSha1,
            AuthMechanism::ScramSha256,
            AuthMechanism::MongoDbX509,
            AuthMechanism::Plain,
            AuthMechanism::Gssapi,
        ] {
            assert_eq!(
                AuthMechanism::from_str(mechanism.as_str()).unwrap(),
                mechanism
            );
        }

        assert!(AuthMechanism::from_str("MONGODB-CR").is_err());
        assert!(AuthMechanism::from_str("SPEAK-FRIEND").is_err());
    }

    #[test]
    fn credential_validation() {
        let no_user = Credential::default();
        assert!(AuthMechanism::ScramSha256.validate_credential(&no_user).is_err());
        assert!(AuthMechanism::Plain.validate_credential(&no_user).is_err());
        assert!(AuthMechanism::MongoDbX509.validate_credential(&no_user).is_ok());

        let with_password = Credential::builder()
            .username("app".to_string())
            .password("hunter2".to_string())
            .build();
        assert!(AuthMechanism::ScramSha1.validate_credential(&with_password).is_ok());
        assert!(AuthMechanism::MongoDbX509
            .validate_credential(&with_password)
            .is_err());

        let empty_user = Credential::builder()
            .username("".to_string())
            .password("pw".to_string())
            .build();
        assert!(AuthMechanism::Plain.validate_credential(&empty_user).is_err());

        let wrong_source = Credential::builder().source("admin".to_string()).build();
        assert!(AuthMechanism::MongoDbX509
            .validate_credential(&wrong_source)
            .is_err());
    }

    #[test]
    fn default_sources() {
        assert_eq!(AuthMechanism::ScramSha256.default_source(Some("db")), "db");
        assert_eq!(AuthMechanism::ScramSha256.default_source(None), "admin");
        assert_eq!(AuthMechanism::MongoDbX509.default_source(Some("db")), "$external");
        assert_eq!(AuthMechanism::Plain.default_source(None), "$external");
    }

    #[test]
    fn negotiation_prefers_sha256() {
        let mut description = StreamDescription::default();
        assert_eq!(negotiate_mechanism(&description), AuthMechanism::ScramSha1);

        description.sasl_supported_mechs =
            Some(vec!["SCRAM-SHA-1".to_string(), "SCRAM-SHA-256".to_string()]);
        assert_eq!(negotiate_mechanism(&description), AuthMechanism::ScramSha256);
    }
}
