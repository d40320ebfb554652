mod aggregate;
mod delete;
mod end_sessions;
mod find;
mod get_more;
mod insert;
mod kill_cursors;
mod run_command;
mod transaction;
mod update;

use std::{collections::VecDeque, fmt::Debug};

use serde::{Deserialize, Serialize};

use crate::{
    bson::{Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    coll::Namespace,
    error::{
        BulkWriteError,
        BulkWriteFailure,
        CommandError,
        Error,
        ErrorKind,
        Result,
        WriteConcernError,
        WriteFailure,
    },
    options::WriteConcern,
    selection_criteria::SelectionCriteria,
};

pub(crate) use aggregate::{Aggregate, AggregateTarget, ChangeStreamAggregate};
pub(crate) use delete::Delete;
pub(crate) use end_sessions::EndSessions;
pub(crate) use find::Find;
pub(crate) use get_more::GetMore;
pub(crate) use insert::Insert;
pub(crate) use kill_cursors::KillCursors;
pub(crate) use run_command::RunCommand;
pub(crate) use transaction::{AbortTransaction, CommitTransaction};
pub(crate) use update::Update;

/// One wire-level command, from the dispatcher's point of view: how to build it for a
/// particular server, how to interpret what comes back, and what routing and retry rules apply
/// to it.
///
/// An operation value is built once and executed at most twice (the original attempt plus one
/// retry).
pub(crate) trait Operation {
    /// What executing this operation produces.
    type O;

    /// The name of the server-side command this operation sends.
    const NAME: &'static str;

    /// Produces the command for one attempt against the described server. State needed to
    /// interpret the response may be stashed on `self`.
    fn build(&mut self, description: &StreamDescription) -> Result<Command>;

    /// Interprets a (transport-successful) server response.
    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O>;

    /// A chance to turn a failure into a success (e.g. treating "namespace not found" as an
    /// empty result). The default propagates.
    fn handle_error(&self, error: Error) -> Result<Self::O> {
        Err(error)
    }

    /// Where this operation may run; `None` defers to the client's defaults.
    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        None
    }

    /// Whether this operation requests acknowledgment from the server.
    fn is_acknowledged(&self) -> bool {
        self.write_concern()
            .map(WriteConcern::is_acknowledged)
            .unwrap_or(true)
    }

    /// This operation's write concern, if it writes.
    fn write_concern(&self) -> Option<&WriteConcern> {
        None
    }

    /// Whether a `readConcern` may be attached (and hence causal consistency applies).
    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        false
    }

    /// Whether the command may carry an `lsid`.
    fn supports_sessions(&self) -> bool {
        true
    }

    /// Which single-retry policy applies to this operation.
    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Adjusts the operation before its one retry (e.g. a commit upgrades its write concern).
    fn update_for_retry(&mut self) {}

    fn name(&self) -> &str {
        Self::NAME
    }
}

/// The retry class of an operation.
#[derive(Debug, PartialEq, Clone, Copy)]
pub(crate) enum Retryability {
    Write,
    Read,
    None,
}

/// Serializes `options` and merges the resulting fields into `doc`. The options type must
/// serialize to a document.
pub(crate) fn append_options<T: Serialize + Debug>(
    doc: &mut Document,
    options: Option<&T>,
) -> Result<()> {
    match options {
        Some(options) => {
            doc.extend(bson::to_document(options)?);
            Ok(())
        }
        None => Ok(()),
    }
}

/// Strips a write concern that was set but left entirely empty, so no `writeConcern: {}` is
/// ever sent.
pub(crate) fn drop_empty_write_concern(write_concern: &mut Option<WriteConcern>) {
    if write_concern.as_ref().map_or(false, WriteConcern::is_empty) {
        *write_concern = None;
    }
}

// Response models shared by the individual operations.

/// The failure-related fields of an `ok: 0` reply.
#[derive(Deserialize, Debug)]
pub(crate) struct CommandErrorBody {
    #[serde(flatten)]
    pub(crate) command_error: CommandError,

    #[serde(rename = "errorLabels")]
    pub(crate) error_labels: Option<Vec<String>>,
}

impl From<CommandErrorBody> for Error {
    fn from(body: CommandErrorBody) -> Error {
        Error::new(ErrorKind::Command(body.command_error), body.error_labels)
    }
}

/// The write-failure fields of a reply to a command that only carries a write concern (commit
/// and abort).
#[derive(Debug, Deserialize, Default, Clone)]
pub(crate) struct WriteConcernOnlyBody {
    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    labels: Option<Vec<String>>,
}

impl WriteConcernOnlyBody {
    pub(crate) fn validate(self) -> Result<()> {
        match self.write_concern_error {
            Some(write_concern_error) => Err(Error::new(
                ErrorKind::Write(WriteFailure::WriteConcernError(write_concern_error)),
                self.labels,
            )),
            None => Ok(()),
        }
    }
}

/// The shared shape of replies to `insert`, `update`, and `delete`.
#[derive(Deserialize, Debug)]
pub(crate) struct WriteResponseBody {
    /// How many documents the operation touched.
    pub(crate) n: u64,

    #[serde(rename = "nModified")]
    pub(crate) n_modified: Option<u64>,

    #[serde(rename = "writeErrors")]
    pub(crate) write_errors: Option<Vec<BulkWriteError>>,

    #[serde(rename = "writeConcernError")]
    pub(crate) write_concern_error: Option<WriteConcernError>,

    #[serde(rename = "errorLabels")]
    pub(crate) labels: Option<Vec<String>>,
}

impl WriteResponseBody {
    /// Errors out when the reply carries any write failures; single-write operations have
    /// nothing useful to do with the partial counts.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.write_errors.is_none() && self.write_concern_error.is_none() {
            return Ok(());
        };

        let failure = BulkWriteFailure {
            write_errors: self.write_errors.clone(),
            write_concern_error: self.write_concern_error.clone(),
            inserted_ids: Default::default(),
            partial_result: None,
        };

        Err(Error::new(
            ErrorKind::BulkWrite(failure),
            self.labels.clone(),
        ))
    }
}

/// The `cursor` document with which `find`-like commands answer.
#[derive(Debug, Deserialize)]
pub(crate) struct CursorBody {
    pub(crate) cursor: CursorInfo,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CursorInfo {
    pub(crate) id: i64,

    pub(crate) ns: Namespace,

    pub(crate) first_batch: VecDeque<Document>,
}

/// An `upserted` entry in an update reply: which statement upserted, and the id it produced.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct UpsertedId {
    pub(crate) index: usize,

    #[serde(rename = "_id")]
    pub(crate) id: Bson,
}
