use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document},
    bson_util,
    client::auth::AuthMechanism,
    cmap::Command,
    error::{Error, Result},
};

/// A single client-to-server message in a SASL conversation.
pub(super) enum SaslMessage {
    /// The opening `saslStart` round.
    Start {
        source: String,
        mechanism: AuthMechanism,
        payload: Vec<u8>,
        /// Ask the server to fold the final empty exchange into its last real reply.
        skip_empty_exchange: bool,
    },

    /// A follow-up `saslContinue` round.
    Continue {
        source: String,
        conversation_id: Bson,
        payload: Vec<u8>,
    },
}

impl SaslMessage {
    pub(super) fn into_command(self) -> Command {
        fn binary(bytes: Vec<u8>) -> Binary {
            Binary {
                subtype: BinarySubtype::Generic,
                bytes,
            }
        }

        match self {
            Self::Start {
                source,
                mechanism,
                payload,
                skip_empty_exchange,
            } => {
                let mut body = doc! {
                    "saslStart": 1,
                    "mechanism": mechanism.as_str(),
                    "payload": binary(payload),
                };
                if skip_empty_exchange {
                    body.insert("options", doc! { "skipEmptyExchange": true });
                }
                Command::new("saslStart", source, body)
            }
            Self::Continue {
                source,
                conversation_id,
                payload,
            } => Command::new(
                "saslContinue",
                source,
                doc! {
                    "saslContinue": 1,
                    "conversationId": conversation_id,
                    "payload": binary(payload),
                },
            ),
        }
    }
}

/// The server's half of a SASL round.
pub(super) struct SaslResponse {
    pub(super) conversation_id: Bson,
    pub(super) done: bool,
    pub(super) payload: Vec<u8>,
}

impl SaslResponse {
    pub(super) fn parse(mechanism: &str, mut doc: Document) -> Result<Self> {
        // A rejected round carries a command error rather than a conversation payload.
        if let Some(ok) = doc.get("ok") {
            match bson_util::get_int(ok) {
                Some(1) => {}
                Some(_) => {
                    let reason = doc.get_str("errmsg").unwrap_or("Authentication failure");
                    return Err(Error::authentication_error(mechanism, reason));
                }
                None => return Err(Error::invalid_authentication_response(mechanism)),
            }
        }

        let malformed = || Error::invalid_authentication_response(mechanism);

        let conversation_id = doc.remove("conversationId").ok_or_else(malformed)?;
        let done = match doc.remove("done") {
            Some(Bson::Boolean(done)) => done,
            _ => return Err(malformed()),
        };
        let payload = match doc.remove("payload") {
            Some(Bson::Binary(binary)) => binary.bytes,
            _ => return Err(malformed()),
        };

        Ok(Self {
            conversation_id,
            done,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_command_shape() {
        let command = SaslMessage::Start {
            source: "admin".to_string(),
            mechanism: AuthMechanism::ScramSha256,
            payload: b"n,,n=u,r=abc".to_vec(),
            skip_empty_exchange: true,
        }
        .into_command();

        assert_eq!(command.name, "saslStart");
        assert_eq!(command.target_db, "admin");
        assert_eq!(command.body.get_str("mechanism"), Ok("SCRAM-SHA-256"));
        assert_eq!(
            command
                .body
                .get_document("options")
                .and_then(|o| o.get_bool("skipEmptyExchange")),
            Ok(true)
        );
    }

    #[test]
    fn response_parsing_rejects_failed_rounds() {
        let failed = doc! { "ok": 0, "errmsg": "auth failed", "code": 18 };
        assert!(SaslResponse::parse("SCRAM", failed).is_err());

        let missing_payload = doc! { "ok": 1, "conversationId": 1, "done": false };
        assert!(SaslResponse::parse("SCRAM", missing_payload).is_err());

        let complete = doc! {
            "ok": 1,
            "conversationId": 1,
            "done": true,
            "payload": Binary { subtype: BinarySubtype::Generic, bytes: vec![1, 2] },
        };
        let parsed = SaslResponse::parse("SCRAM", complete).unwrap();
        assert!(parsed.done);
        assert_eq!(parsed.payload, vec![1, 2]);
    }
}
