use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    ops::BitXor,
    str,
    sync::RwLock,
};

use hmac::{digest::KeyInit, Hmac, Mac};
use md5::Md5;
use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    bson::{Bson, Document},
    client::auth::{
        self,
        sasl::{SaslMessage, SaslResponse},
        AuthMechanism,
        Credential,
    },
    cmap::{Command, Connection},
    error::{Error, Result},
};

/// The gs2 header sent with every conversation; this driver never offers channel binding.
const GS2_HEADER: &str = "n,,";

/// The fewest hash iterations the client will agree to perform.
const MIN_ITERATION_COUNT: usize = 4096;

/// Cache of salted passwords, so repeated handshakes against the same user skip the PBKDF2 work.
static SALTED_PASSWORD_CACHE: Lazy<RwLock<HashMap<CacheKey, Vec<u8>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

#[derive(Hash, Eq, PartialEq, Clone)]
struct CacheKey {
    password: String,
    salt: Vec<u8>,
    iterations: usize,
    version: ScramVersion,
}

fn cached_salted_password(key: &CacheKey) -> Option<Vec<u8>> {
    SALTED_PASSWORD_CACHE.read().unwrap().get(key).cloned()
}

fn cache_salted_password(key: CacheKey, salted_password: &[u8]) {
    if let Ok(mut cache) = SALTED_PASSWORD_CACHE.write() {
        cache.entry(key).or_insert_with(|| salted_password.to_vec());
    }
}

/// The versions of SCRAM supported by the driver, classified by hash function.
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl Display for ScramVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.mechanism().as_str())
    }
}

/// The contents of the first round of a handshake completed speculatively, handed from the
/// connection handshake to the authenticator.
#[derive(Debug)]
pub(crate) struct FirstRound {
    pub(crate) client_first: ClientFirst,
    pub(crate) server_first: Document,
}

impl ScramVersion {
    fn mechanism(&self) -> AuthMechanism {
        match self {
            ScramVersion::Sha1 => AuthMechanism::ScramSha1,
            ScramVersion::Sha256 => AuthMechanism::ScramSha256,
        }
    }

    /// Constructs the client's first message, suitable for embedding into the handshake's
    /// `speculativeAuthenticate` field.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<ClientFirst> {
        let username = credential
            .username
            .as_deref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no username supplied"))?;

        Ok(ClientFirst::new(
            credential.resolved_source().to_string(),
            username,
            auth::generate_nonce(),
        ))
    }

    /// Runs the SCRAM conversation against `conn`. When the first round already happened
    /// speculatively during the connection handshake, it is resumed rather than repeated.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        first_round: impl Into<Option<FirstRound>>,
    ) -> Result<()> {
        let username = credential
            .username
            .as_deref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no username supplied"))?;

        let password = credential
            .password
            .as_deref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no password supplied"))?;

        if credential.mechanism_properties.is_some() {
            return Err(Error::authentication_error(
                "SCRAM",
                "mechanism properties MUST NOT be specified",
            ));
        };

        let source = credential.resolved_source().to_string();

        let (client_first, first_reply) = match first_round.into() {
            Some(FirstRound {
                client_first,
                server_first,
            }) => (client_first, server_first),
            None => {
                let client_first = self.build_speculative_client_first(credential)?;
                let reply = conn
                    .send_command(client_first.to_command(self), None)
                    .await?
                    .into_raw_response();
                (client_first, reply)
            }
        };

        let server_first = ServerFirst::parse(first_reply)?;
        server_first.validate(client_first.nonce())?;

        let cache_key = CacheKey {
            password: password.to_string(),
            salt: server_first.salt.clone(),
            iterations: server_first.iterations,
            version: self.clone(),
        };
        let (salted_password, fresh) = match cached_salted_password(&cache_key) {
            Some(salted) => (salted, false),
            None => (
                self.salt_password(username, password, &server_first)?,
                true,
            ),
        };

        let client_final = self.client_final(&salted_password, &client_first, &server_first)?;

        let final_reply = conn
            .send_command(
                SaslMessage::Continue {
                    source: source.clone(),
                    conversation_id: server_first.conversation_id.clone(),
                    payload: client_final.message.clone().into_bytes(),
                }
                .into_command(),
                None,
            )
            .await?
            .into_raw_response();

        let server_final = ServerFinal::parse(final_reply)?;
        if server_final.conversation_id != server_first.conversation_id {
            return Err(Error::authentication_error(
                "SCRAM",
                "mismatched conversationId's",
            ));
        }
        self.verify_server_signature(&salted_password, &client_final, &server_final)?;

        // Servers that don't honor skipEmptyExchange expect one more empty client message and
        // answer it with "done: true".
        if !server_final.done {
            let response = conn
                .send_command(
                    SaslMessage::Continue {
                        source,
                        conversation_id: server_first.conversation_id.clone(),
                        payload: Vec::new(),
                    }
                    .into_command(),
                    None,
                )
                .await?;
            let closing = SaslResponse::parse("SCRAM", response.into_raw_response())?;
            if !closing.done {
                return Err(Error::authentication_error(
                    "SCRAM",
                    "authentication did not complete successfully",
                ));
            }
        }

        if fresh {
            cache_salted_password(cache_key, &salted_password);
        }

        Ok(())
    }

    /// Hashes the password into the salted password per the SCRAM RFC, with the MongoDB-specific
    /// pre-hashing for SHA-1.
    fn salt_password(
        &self,
        username: &str,
        password: &str,
        server_first: &ServerFirst,
    ) -> Result<Vec<u8>> {
        let normalized: Cow<'_, str> = match self {
            ScramVersion::Sha1 => {
                let mut md5 = Md5::new();
                md5.update(format!("{}:mongo:{}", username, password));
                Cow::Owned(hex::encode(md5.finalize()))
            }
            ScramVersion::Sha256 => stringprep::saslprep(password).map_err(|_| {
                Error::authentication_error("SCRAM-SHA-256", "saslprep failure")
            })?,
        };

        let mut salted = vec![0u8; self.digest_len()];
        let _ = match self {
            ScramVersion::Sha1 => pbkdf2::pbkdf2::<Hmac<Sha1>>(
                normalized.as_bytes(),
                &server_first.salt,
                server_first.iterations as u32,
                &mut salted,
            ),
            ScramVersion::Sha256 => pbkdf2::pbkdf2::<Hmac<Sha256>>(
                normalized.as_bytes(),
                &server_first.salt,
                server_first.iterations as u32,
                &mut salted,
            ),
        };
        Ok(salted)
    }

    fn digest_len(&self) -> usize {
        match self {
            ScramVersion::Sha1 => 20,
            ScramVersion::Sha256 => 32,
        }
    }

    fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        fn mac<M: Mac + KeyInit>(key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
            let mut mac = <M as Mac>::new_from_slice(key)
                .map_err(|_| Error::unknown_authentication_error("SCRAM"))?;
            mac.update(input);
            Ok(mac.finalize().into_bytes().to_vec())
        }

        match self {
            ScramVersion::Sha1 => mac::<Hmac<Sha1>>(key, input),
            ScramVersion::Sha256 => mac::<Hmac<Sha256>>(key, input),
        }
    }

    fn hash(&self, input: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => Sha1::digest(input).to_vec(),
            ScramVersion::Sha256 => Sha256::digest(input).to_vec(),
        }
    }

    /// Computes the client's final message and the auth message that both sides sign.
    fn client_final(
        &self,
        salted_password: &[u8],
        client_first: &ClientFirst,
        server_first: &ServerFirst,
    ) -> Result<ClientFinal> {
        let client_key = self.hmac(salted_password, b"Client Key")?;
        let stored_key = self.hash(&client_key);

        let without_proof = format!(
            "c={},r={}",
            base64::encode(GS2_HEADER),
            server_first.nonce
        );
        let auth_message = format!(
            "{},{},{}",
            client_first.bare_message(),
            server_first.message,
            without_proof
        );

        let client_signature = self.hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(key_byte, sig_byte)| key_byte.bitxor(sig_byte))
            .collect();

        Ok(ClientFinal {
            message: format!("{},p={}", without_proof, base64::encode(proof)),
            auth_message,
        })
    }

    /// Checks the server's proof that it also knows the salted password.
    fn verify_server_signature(
        &self,
        salted_password: &[u8],
        client_final: &ClientFinal,
        server_final: &ServerFinal,
    ) -> Result<()> {
        let verifier = match &server_final.body {
            ServerFinalBody::Verifier(verifier) => verifier,
            ServerFinalBody::Error(message) => {
                return Err(Error::authentication_error("SCRAM", message))
            }
        };

        let server_key = self.hmac(salted_password, b"Server Key")?;
        let expected = self.hmac(&server_key, client_final.auth_message.as_bytes())?;
        let received = base64::decode(verifier)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        if expected == received {
            Ok(())
        } else {
            Err(Error::authentication_error("SCRAM", "Authentication failed."))
        }
    }
}

/// Finds the value of the single-letter attribute `key` in a comma-separated SCRAM message.
fn attribute<'a>(message: &'a str, key: char) -> Result<&'a str> {
    message
        .split(',')
        .find_map(|entry| {
            let mut chars = entry.chars();
            (chars.next() == Some(key) && chars.next() == Some('=')).then(|| &entry[2..])
        })
        .ok_or_else(|| Error::invalid_authentication_response("SCRAM"))
}

/// The client's opening message.
#[derive(Debug)]
pub(crate) struct ClientFirst {
    source: String,
    bare: String,
    nonce: String,
}

impl ClientFirst {
    fn new(source: String, username: &str, nonce: String) -> Self {
        Self {
            source,
            bare: format!("n={},r={}", username, nonce),
            nonce,
        }
    }

    /// The message without the gs2 header, as included in the auth message.
    fn bare_message(&self) -> &str {
        &self.bare
    }

    fn nonce(&self) -> &str {
        &self.nonce
    }

    pub(crate) fn to_command(&self, scram: &ScramVersion) -> Command {
        SaslMessage::Start {
            source: self.source.clone(),
            mechanism: scram.mechanism(),
            payload: format!("{}{}", GS2_HEADER, self.bare).into_bytes(),
            skip_empty_exchange: true,
        }
        .into_command()
    }
}

/// The server's reply to the opening message: the combined nonce, the salt, and the iteration
/// count. Must be validated before the conversation continues.
struct ServerFirst {
    conversation_id: Bson,
    done: bool,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    iterations: usize,
}

impl ServerFirst {
    fn parse(response: Document) -> Result<Self> {
        let SaslResponse {
            conversation_id,
            done,
            payload,
        } = SaslResponse::parse("SCRAM", response)?;

        let message = str::from_utf8(&payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?
            .to_string();

        let nonce = attribute(&message, 'r')?.to_string();
        let salt = base64::decode(attribute(&message, 's')?)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;
        let iterations: usize = attribute(&message, 'i')?
            .parse()
            .map_err(|_| Error::authentication_error("SCRAM", "iteration count invalid"))?;

        Ok(Self {
            conversation_id,
            done,
            message,
            nonce,
            salt,
            iterations,
        })
    }

    fn validate(&self, client_nonce: &str) -> Result<()> {
        if self.done {
            Err(Error::authentication_error(
                "SCRAM",
                "handshake terminated early",
            ))
        } else if !self.nonce.starts_with(client_nonce) {
            // The combined nonce must extend the one the client sent.
            Err(Error::authentication_error("SCRAM", "mismatched nonce"))
        } else if self.iterations < MIN_ITERATION_COUNT {
            Err(Error::authentication_error(
                "SCRAM",
                "iteration count too low",
            ))
        } else {
            Ok(())
        }
    }
}

/// The client's closing message along with the auth message both sides sign.
struct ClientFinal {
    message: String,
    auth_message: String,
}

enum ServerFinalBody {
    Error(String),
    Verifier(String),
}

/// The server's closing message: either its signature over the auth message or an error.
struct ServerFinal {
    conversation_id: Bson,
    done: bool,
    body: ServerFinalBody,
}

impl ServerFinal {
    fn parse(response: Document) -> Result<Self> {
        let SaslResponse {
            conversation_id,
            done,
            payload,
        } = SaslResponse::parse("SCRAM", response)?;

        let message = str::from_utf8(&payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let body = if let Ok(error) = attribute(message, 'e') {
            ServerFinalBody::Error(error.to_string())
        } else if let Ok(verifier) = attribute(message, 'v') {
            ServerFinalBody::Verifier(verifier.to_string())
        } else {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        Ok(Self {
            conversation_id,
            done,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::{doc, spec::BinarySubtype, Binary};

    fn server_first(nonce: &str, iterations: usize) -> ServerFirst {
        ServerFirst {
            conversation_id: Bson::Int32(1),
            done: false,
            message: "mocked".to_string(),
            nonce: nonce.to_string(),
            salt: Vec::new(),
            iterations,
        }
    }

    #[test]
    fn attribute_lookup() {
        let message = "r=abc,s=c2FsdA==,i=4096";
        assert_eq!(attribute(message, 'r').unwrap(), "abc");
        assert_eq!(attribute(message, 'i').unwrap(), "4096");
        assert!(attribute(message, 'v').is_err());
        // Keys only match at the start of an entry.
        assert!(attribute("x=r=nope", 'r').is_err());
    }

    #[test]
    fn server_first_validation() {
        assert!(server_first("clientnonce-extended", 4096)
            .validate("clientnonce")
            .is_ok());
        assert!(server_first("othernonce", 4096).validate("clientnonce").is_err());
        assert!(server_first("clientnonce", 42).validate("clientnonce").is_err());

        let mut finished = server_first("clientnonce", 4096);
        finished.done = true;
        assert!(finished.validate("clientnonce").is_err());
    }

    #[test]
    fn server_first_payload_parsing() {
        let payload = format!(
            "r=fyko+d2lbbFgONRv9qkxdawLserver,s={},i=4096",
            base64::encode(b"salty")
        );
        let response = doc! {
            "ok": 1,
            "conversationId": 1,
            "done": false,
            "payload": Binary { subtype: BinarySubtype::Generic, bytes: payload.into_bytes() },
        };

        let parsed = ServerFirst::parse(response).unwrap();
        assert_eq!(parsed.iterations, 4096);
        assert_eq!(parsed.salt, b"salty");
        assert!(parsed.validate("fyko+d2lbbFgONRv9qkxdawL").is_ok());
    }

    #[test]
    fn salted_password_is_deterministic() {
        let sha256 = ScramVersion::Sha256;
        let first = server_first("n", 4096);
        let a = sha256.salt_password("user", "pencil", &with_salt(first)).unwrap();
        let b = sha256
            .salt_password("user", "pencil", &with_salt(server_first("n", 4096)))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let c = ScramVersion::Sha1
            .salt_password("user", "pencil", &with_salt(server_first("n", 4096)))
            .unwrap();
        assert_eq!(c.len(), 20);
        assert_ne!(a, c);
    }

    fn with_salt(mut first: ServerFirst) -> ServerFirst {
        first.salt = b"salt".to_vec();
        first
    }
}
