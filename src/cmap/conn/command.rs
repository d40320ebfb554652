use serde::de::DeserializeOwned;

use crate::{
    bson::{doc, Bson, Document},
    bson_util,
    client::{options::ServerAddress, session::ClusterTime, ClientSession},
    concern::ReadConcernLevel,
    error::{Error, Result},
    hello::{HelloCommandResponse, HelloReply},
    selection_criteria::ReadPreference,
};

/// Commands that always have their bodies redacted in monitoring events.
pub(crate) const REDACTED_COMMANDS: &[&str] = &[
    "authenticate",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "createuser",
    "updateuser",
    "copydbgetnonce",
    "copydbsaslstart",
    "copydb",
];

pub(crate) const HELLO_COMMAND_NAMES: &[&str] = &["hello", "ismaster", "isMaster"];

/// A command that has been or will be executed against the server.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
}

impl Command {
    /// Constructs a new command.
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
        }
    }

    pub(crate) fn set_session(&mut self, session: &ClientSession) {
        self.body.insert("lsid", session.id().clone());
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    /// Sets `readConcern.afterClusterTime` to the session's operation time, preserving any other
    /// read concern fields already present.
    pub(crate) fn set_after_cluster_time(&mut self, session: &ClientSession) {
        if let Some(operation_time) = session.operation_time() {
            let read_concern = match self.body.get_document_mut("readConcern") {
                Ok(doc) => doc,
                Err(_) => {
                    self.body.insert("readConcern", doc! {});
                    self.body
                        .get_document_mut("readConcern")
                        .expect("readConcern was just inserted")
                }
            };
            read_concern.insert("afterClusterTime", Bson::Timestamp(operation_time));
        }
    }

    pub(crate) fn set_read_concern_level(&mut self, level: ReadConcernLevel) {
        let read_concern = match self.body.get_document_mut("readConcern") {
            Ok(doc) => doc,
            Err(_) => {
                self.body.insert("readConcern", doc! {});
                self.body
                    .get_document_mut("readConcern")
                    .expect("readConcern was just inserted")
            }
        };
        read_concern.insert("level", level.as_str().to_string());
    }

    pub(crate) fn set_cluster_time(&mut self, cluster_time: &ClusterTime) {
        if let Ok(doc) = bson::to_bson(cluster_time) {
            self.body.insert("$clusterTime", doc);
        }
    }

    pub(crate) fn set_recovery_token(&mut self, recovery_token: &Document) {
        self.body.insert("recoveryToken", recovery_token.clone());
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.into_document());
    }

    pub(crate) fn should_redact(&self) -> bool {
        let name = self.name.to_lowercase();
        REDACTED_COMMANDS.contains(&name.as_str()) || self.is_hello_with_speculative_auth()
    }

    fn is_hello_with_speculative_auth(&self) -> bool {
        let name = self.name.to_lowercase();
        HELLO_COMMAND_NAMES
            .iter()
            .any(|hello| hello.to_lowercase() == name)
            && self.body.contains_key("speculativeAuthenticate")
    }

    /// Hello and authentication commands are never compressed.
    pub(crate) fn should_compress(&self) -> bool {
        let name = self.name.to_lowercase();
        !REDACTED_COMMANDS.contains(&name.as_str())
            && !HELLO_COMMAND_NAMES
                .iter()
                .any(|hello| hello.to_lowercase() == name)
    }
}

/// A response to a command as returned by the server, prior to any interpretation beyond locating
/// the result document.
#[derive(Clone, Debug)]
pub(crate) struct RawCommandResponse {
    source: ServerAddress,
    raw: Document,
}

impl RawCommandResponse {
    pub(crate) fn new(source: ServerAddress, raw: Document) -> Self {
        Self { source, raw }
    }

    /// Deserialize the body of this response to a `T`.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        bson::from_document(self.raw.clone()).map_err(|e| {
            Error::invalid_response(format!("error deserializing server response: {}", e))
        })
    }

    pub(crate) fn raw_response(&self) -> &Document {
        &self.raw
    }

    pub(crate) fn into_raw_response(self) -> Document {
        self.raw
    }

    /// The address of the server that sent this response.
    pub(crate) fn source_address(&self) -> &ServerAddress {
        &self.source
    }

    /// Whether the command succeeded, i.e. the response contains `ok: 1`.
    pub(crate) fn is_success(&self) -> bool {
        self.raw
            .get("ok")
            .and_then(bson_util::get_int)
            .map(|ok| ok == 1)
            .unwrap_or(false)
    }

    /// Interpret this response as a reply to a hello command.
    pub(crate) fn into_hello_reply(self) -> Result<HelloReply> {
        if !self.is_success() {
            let error: Error = self
                .body::<crate::operation::CommandErrorBody>()
                .map(|error_response| error_response.into())
                .unwrap_or_else(|e| {
                    Error::invalid_response(format!("error deserializing hello response: {}", e))
                });
            return Err(error);
        }

        let cluster_time: Option<ClusterTime> = self
            .raw
            .get_document("$clusterTime")
            .ok()
            .cloned()
            .and_then(|doc| bson::from_document(doc).ok());

        let command_response: HelloCommandResponse = self.body()?;

        Ok(HelloReply {
            server_address: self.source,
            command_response,
            cluster_time,
            raw_command_response: self.raw,
        })
    }
}
