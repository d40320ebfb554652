use crate::{
    bson::{doc, Document},
    client::auth::Credential,
    cmap::{Command, Connection},
    error::{Error, Result},
};

/// Constructs the first client message in the X.509 handshake, also used for speculative
/// authentication.
pub(super) fn build_client_first(credential: &Credential) -> Command {
    let mut auth_command_doc = doc! {
        "authenticate": 1,
        "mechanism": "MONGODB-X509",
    };

    if let Some(ref username) = credential.username {
        auth_command_doc.insert("user", username);
    }

    Command::new("authenticate", "$external", auth_command_doc)
}

/// Performs X.509 authentication for a given stream. The server validates the client certificate
/// presented during the TLS handshake; the conversation itself is a single command.
pub(super) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    server_first: impl Into<Option<Document>>,
) -> Result<()> {
    // If speculative authentication succeeded during the handshake, no further work is needed.
    if server_first.into().is_some() {
        return Ok(());
    }

    let command = build_client_first(credential);
    let response = conn.send_command(command, None).await?;

    if !response.is_success() {
        return Err(Error::authentication_error(
            "MONGODB-X509",
            response
                .raw_response()
                .get_str("errmsg")
                .unwrap_or("authentication failed"),
        ));
    }

    Ok(())
}
