use crate::{
    client::auth::{
        sasl::{SaslMessage, SaslResponse},
        AuthMechanism,
        Credential,
    },
    cmap::Connection,
    error::{Error, Result},
};

/// Performs a PLAIN SASL conversation: a single exchange carrying the credentials, which are
/// stored outside of MongoDB (LDAP).
pub(super) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
) -> Result<()> {
    let source = match credential.source.as_deref() {
        Some("$external") | None => "$external",
        Some(..) => {
            return Err(Error::authentication_error(
                "PLAIN",
                "only $external may be specified as an auth source for PLAIN",
            ))
        }
    };

    let username = credential
        .username
        .as_ref()
        .ok_or_else(|| Error::authentication_error("PLAIN", "no username supplied"))?;

    let password = credential
        .password
        .as_ref()
        .ok_or_else(|| Error::authentication_error("PLAIN", "no password supplied"))?;

    let command = SaslMessage::Start {
        source: source.to_string(),
        mechanism: AuthMechanism::Plain,
        payload: payload_bytes(username, password),
        skip_empty_exchange: false,
    }
    .into_command();

    let response = conn.send_command(command, None).await?;
    let sasl_response = SaslResponse::parse("PLAIN", response.into_raw_response())?;

    if !sasl_response.done {
        return Err(Error::invalid_authentication_response("PLAIN"));
    }
    Ok(())
}

/// The PLAIN message: authzid, authcid and password joined by NUL bytes, with an empty authzid.
fn payload_bytes(username: &str, password: &str) -> Vec<u8> {
    let mut bytes = vec![0];
    bytes.extend(username.as_bytes());

    bytes.push(0);
    bytes.extend(password.as_bytes());

    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_layout() {
        assert_eq!(payload_bytes("user", "pass"), b"\x00user\x00pass".to_vec());
    }
}
