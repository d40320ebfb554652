//! Contains the `Error` and `Result` types that `mongolite` uses.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use bson::Bson;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::{bson::Document, options::ServerAddress};

/// Retryable write error label, attached when a write may be retried by the dispatcher.
pub const RETRYABLE_WRITE_ERROR: &str = "RetryableWriteError";
/// Transient transaction error label: the whole transaction may be retried from the start.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";
/// Unknown transaction commit result label: the commit may be retried.
pub const UNKNOWN_TRANSACTION_COMMIT_RESULT: &str = "UnknownTransactionCommitResult";
/// Resumable change stream error label, attached by 4.4+ servers to errors a change stream may
/// resume past.
pub const RESUMABLE_CHANGE_STREAM_ERROR: &str = "ResumableChangeStreamError";

/// The result type for all methods that can return an error in the `mongolite` crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Server error code classification. The server's `codeName` is authoritative where present;
/// these numeric predicates are the fallback for older servers (and the source of truth for the
/// retryability sets, which are defined numerically).
mod codes {
    pub(super) fn not_writable_primary(code: i32) -> bool {
        // NotWritablePrimary, NotPrimaryNoSecondaryOk, LegacyNotPrimary
        matches!(code, 10107 | 13435 | 10058)
    }

    pub(super) fn recovering(code: i32) -> bool {
        // InterruptedAtShutdown, InterruptedDueToReplStateChange, NotPrimaryOrSecondary,
        // PrimarySteppedDown, ShutdownInProgress
        matches!(code, 11600 | 11602 | 13436 | 189 | 91)
    }

    pub(super) fn shutting_down(code: i32) -> bool {
        // InterruptedAtShutdown, ShutdownInProgress
        matches!(code, 11600 | 91)
    }

    pub(super) fn retryable_read(code: i32) -> bool {
        matches!(
            code,
            6 | 7 | 89 | 91 | 134 | 189 | 262 | 9001 | 10107 | 11600 | 11602 | 13435 | 13436
        )
    }

    pub(super) fn retryable_write(code: i32) -> bool {
        // The read set minus ReadConcernMajorityNotAvailableYet (134).
        retryable_read(code) && code != 134
    }

    pub(super) fn unknown_commit_result(code: i32) -> bool {
        // MaxTimeMSExpired, WriteConcernFailed, ShutdownInProgress
        matches!(code, 50 | 64 | 91)
    }

    pub(super) fn command_too_large(code: i32) -> bool {
        // BSONObjectTooLarge, DocumentTooLarge
        matches!(code, 10334 | 17420)
    }

    pub(super) fn resumable_change_stream(code: i32) -> bool {
        matches!(
            code,
            6 | 7 | 63 | 89 | 91 | 133 | 150 | 189 | 234 | 262 | 9001 | 10107 | 11600 | 11602
                | 13388 | 13435 | 13436
        )
    }
}

/// An error that can occur in the `mongolite` crate. The [`ErrorKind`] is boxed to keep the
/// type small; the labels attached by the server (or by the dispatcher) ride alongside it.
#[derive(Clone, Debug, ThisError)]
#[error("Kind: {kind}, labels: {labels:?}")]
#[non_exhaustive]
pub struct Error {
    /// The type of error that occurred.
    pub kind: Box<ErrorKind>,
    labels: HashSet<String>,
    pub(crate) wire_version: Option<i32>,
}

impl<E> From<E> for Error
where
    ErrorKind: From<E>,
{
    fn from(err: E) -> Self {
        Error::new(err.into(), None::<Option<String>>)
    }
}

// Constructors.
impl Error {
    pub(crate) fn new(kind: ErrorKind, labels: Option<impl IntoIterator<Item = String>>) -> Self {
        let mut labels: HashSet<String> = labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        // Some proxies report error labels inside the write concern error instead of at the
        // reply's top level; hoist them so label checks see them either way.
        if let Some(write_concern_error) = kind.write_concern_error() {
            labels.extend(write_concern_error.labels.iter().cloned());
        }
        Self {
            kind: Box::new(kind),
            labels,
            wire_version: None,
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Error {
        ErrorKind::InvalidArgument {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn invalid_response(message: impl Into<String>) -> Error {
        ErrorKind::InvalidResponse {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Error {
        ErrorKind::Internal {
            message: message.into(),
        }
        .into()
    }

    pub(crate) fn authentication_error(mechanism: &str, reason: &str) -> Self {
        ErrorKind::Authentication {
            message: format!("{} failure: {}", mechanism, reason),
        }
        .into()
    }

    pub(crate) fn unknown_authentication_error(mechanism: &str) -> Error {
        Error::authentication_error(mechanism, "internal error")
    }

    pub(crate) fn invalid_authentication_response(mechanism: &str) -> Error {
        Error::authentication_error(mechanism, "invalid server response")
    }

    pub(crate) fn from_resolve_error(error: hickory_resolver::error::ResolveError) -> Self {
        ErrorKind::DnsResolve {
            message: error.to_string(),
        }
        .into()
    }
}

// Labels.
impl Error {
    /// The labels attached to this error.
    pub fn labels(&self) -> &HashSet<String> {
        &self.labels
    }

    /// Whether this error carries the given label.
    pub fn contains_label<T: AsRef<str>>(&self, label: T) -> bool {
        self.labels.contains(label.as_ref())
    }

    pub(crate) fn add_label<T: AsRef<str>>(&mut self, label: T) {
        self.labels.insert(label.as_ref().to_string());
    }
}

// Classification.
impl Error {
    /// The server-reported error code consulted for SDAM decisions. Write concern error codes
    /// count; per-document write error codes never do.
    pub(crate) fn sdam_code(&self) -> Option<i32> {
        match self.kind.as_ref() {
            ErrorKind::Command(error) => Some(error.code),
            ErrorKind::Write(WriteFailure::WriteConcernError(error)) => Some(error.code),
            ErrorKind::BulkWrite(failure) => {
                failure.write_concern_error.as_ref().map(|error| error.code)
            }
            _ => None,
        }
    }

    /// The server-reported code name, consulted before the numeric code when classifying
    /// stepdowns.
    pub(crate) fn code_name(&self) -> Option<&str> {
        match self.kind.as_ref() {
            ErrorKind::Command(error) => Some(error.code_name.as_str()),
            ErrorKind::Write(WriteFailure::WriteConcernError(error)) => {
                Some(error.code_name.as_str())
            }
            ErrorKind::Write(WriteFailure::WriteError(error)) => error.code_name.as_deref(),
            ErrorKind::BulkWrite(failure) => failure
                .write_concern_error
                .as_ref()
                .map(|error| error.code_name.as_str()),
            _ => None,
        }
    }

    /// Classifies by code name when the server sent one, falling back to the numeric code.
    fn classify(&self, names: &[&str], by_code: fn(i32) -> bool) -> bool {
        match self.code_name() {
            Some(name) if !name.is_empty() => names.contains(&name),
            _ => self.sdam_code().map(by_code).unwrap_or(false),
        }
    }

    pub(crate) fn is_notwritableprimary(&self) -> bool {
        self.classify(
            &[
                "NotMaster",
                "NotWritablePrimary",
                "NotMasterNoSlaveOk",
                "NotPrimaryNoSecondaryOk",
                "LegacyNotPrimary",
            ],
            codes::not_writable_primary,
        )
    }

    pub(crate) fn is_recovering(&self) -> bool {
        self.classify(
            &[
                "InterruptedAtShutdown",
                "InterruptedDueToReplStateChange",
                "NotPrimaryOrSecondary",
                "NotMasterOrSecondary",
                "PrimarySteppedDown",
                "ShutdownInProgress",
            ],
            codes::recovering,
        )
    }

    /// Whether this is a stepdown-class error ("not writable primary" or "node is
    /// recovering").
    pub(crate) fn is_state_change_error(&self) -> bool {
        self.is_notwritableprimary() || self.is_recovering()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.sdam_code().map(codes::shutting_down).unwrap_or(false)
    }

    pub(crate) fn is_network_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Io(..) | ErrorKind::ConnectionPoolCleared { .. }
        )
    }

    pub(crate) fn is_network_timeout(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::TimedOut)
    }

    pub(crate) fn is_pool_cleared(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ConnectionPoolCleared { .. })
    }

    pub(crate) fn is_server_selection_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::ServerSelection { .. })
    }

    pub(crate) fn is_max_time_ms_expired_error(&self) -> bool {
        self.sdam_code() == Some(50)
    }

    /// Whether an error originated from the server.
    pub(crate) fn is_server_error(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Authentication { .. }
                | ErrorKind::BulkWrite(_)
                | ErrorKind::Command(_)
                | ErrorKind::Write(_)
        )
    }

    /// Whether the server rejected a write command outright for exceeding its size limits.
    pub(crate) fn is_command_size_error(&self) -> bool {
        match self.kind.as_ref() {
            ErrorKind::Command(error) => codes::command_too_large(error.code),
            _ => false,
        }
    }
}

// Retry decisions.
impl Error {
    /// Whether a read that hit this error may be retried.
    pub(crate) fn is_read_retryable(&self) -> bool {
        self.is_network_error()
            || self.sdam_code().map(codes::retryable_read).unwrap_or(false)
    }

    /// Whether a write that hit this error may be retried. The dispatcher (or a 4.4+ server)
    /// decides this by attaching the label; here only the label is consulted.
    pub(crate) fn is_write_retryable(&self) -> bool {
        self.contains_label(RETRYABLE_WRITE_ERROR)
    }

    /// Whether the dispatcher should attach the retryable-write label itself. From wire
    /// version 9 on, the server attaches it where warranted and the driver only labels network
    /// errors; before that, the code set applies too.
    pub(crate) fn should_add_retryable_write_label(&self, max_wire_version: i32) -> bool {
        if self.is_network_error() {
            return true;
        }
        if max_wire_version > 8 {
            return false;
        }
        self.sdam_code().map(codes::retryable_write).unwrap_or(false)
    }

    pub(crate) fn should_add_unknown_transaction_commit_result_label(&self) -> bool {
        if self.contains_label(TRANSIENT_TRANSACTION_ERROR) {
            return false;
        }
        self.is_network_error()
            || self.is_server_selection_error()
            || self.is_write_retryable()
            || self
                .sdam_code()
                .map(codes::unknown_commit_result)
                .unwrap_or(false)
    }

    /// Whether a change stream may resume past this error.
    pub(crate) fn is_resumable(&self) -> bool {
        if !self.is_server_error() {
            return true;
        }
        let code = self.sdam_code();
        if code == Some(43) {
            // CursorNotFound is always resumable.
            return true;
        }
        match self.wire_version {
            // 4.4+ servers label resumable errors themselves.
            Some(version) if version >= 9 => self.contains_label(RESUMABLE_CHANGE_STREAM_ERROR),
            Some(_) => code.map(codes::resumable_change_stream).unwrap_or(false),
            None => false,
        }
    }
}

/// The types of errors that can occur.
#[allow(missing_docs)]
#[derive(Clone, Debug, ThisError)]
#[non_exhaustive]
pub enum ErrorKind {
    // Caller mistakes and driver-side conditions.
    /// An invalid argument was provided.
    #[error("An invalid argument was provided: {message}")]
    #[non_exhaustive]
    InvalidArgument { message: String },

    /// An illegal transaction state transition or configuration.
    #[error("{message}")]
    #[non_exhaustive]
    Transaction { message: String },

    /// No server matching the required criteria became available in time.
    #[error("{message}")]
    #[non_exhaustive]
    ServerSelection { message: String },

    /// A checkout waited longer than the pool's wait-queue timeout for a connection to become
    /// available.
    #[error("Timed out while checking out a connection from connection pool for {address}")]
    #[non_exhaustive]
    WaitQueueTimeout {
        /// The address of the server whose pool timed the checkout out.
        address: ServerAddress,
    },

    /// An operation was attempted on a client that was shut down.
    #[error("Client has been shut down")]
    Shutdown,

    /// The deployment does not support logical sessions.
    #[error("Attempted to start a session on a deployment that does not support sessions")]
    SessionsNotSupported,

    /// The server does not support the attempted operation.
    #[error("The server does not support a database operation: {message}")]
    #[non_exhaustive]
    IncompatibleServer { message: String },

    /// A change stream document had no `_id`, so the stream can never resume.
    #[error("Cannot provide resume functionality when the resume token is missing")]
    MissingResumeToken,

    #[error("Internal error: {message}")]
    #[non_exhaustive]
    Internal { message: String },

    // I/O and environment.
    /// Wrapper around [`std::io::Error`].
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// An error occurred during DNS resolution.
    #[error("An error occurred during DNS resolution: {message}")]
    #[non_exhaustive]
    DnsResolve { message: String },

    #[error("{message}")]
    #[non_exhaustive]
    InvalidTlsConfig { message: String },

    /// The connection pool for a server was cleared by a concurrent failure while this
    /// operation held (or waited for) one of its connections.
    #[error("{message}")]
    #[non_exhaustive]
    ConnectionPoolCleared { message: String },

    // Codec.
    /// Wrapper around `bson::de::Error`.
    #[error("{0}")]
    BsonDeserialization(crate::bson::de::Error),

    /// Wrapper around `bson::ser::Error`.
    #[error("{0}")]
    BsonSerialization(crate::bson::ser::Error),

    /// The server sent back something the wire codec could not make sense of.
    #[error("The server returned an invalid reply to a database operation: {message}")]
    #[non_exhaustive]
    InvalidResponse { message: String },

    // Server-reported failures.
    /// An acknowledged command failed (`ok: 0`).
    #[error("Command failed: {0}")]
    Command(CommandError),

    /// A write operation failed.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    Write(WriteFailure),

    /// One or more writes in a multi-write operation failed.
    #[error("An error occurred when trying to execute a write operation: {0:?}")]
    BulkWrite(BulkWriteFailure),

    /// The connection handshake or credential validation failed.
    #[error("{message}")]
    #[non_exhaustive]
    Authentication { message: String },
}

impl ErrorKind {
    fn write_concern_error(&self) -> Option<&WriteConcernError> {
        match self {
            ErrorKind::Write(WriteFailure::WriteConcernError(error)) => Some(error),
            ErrorKind::BulkWrite(failure) => failure.write_concern_error.as_ref(),
            _ => None,
        }
    }
}

impl From<bson::de::Error> for ErrorKind {
    fn from(err: bson::de::Error) -> Self {
        Self::BsonDeserialization(err)
    }
}

impl From<bson::ser::Error> for ErrorKind {
    fn from(err: bson::ser::Error) -> Self {
        Self::BsonSerialization(err)
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<std::io::ErrorKind> for ErrorKind {
    fn from(err: std::io::ErrorKind) -> Self {
        Self::Io(Arc::new(err.into()))
    }
}

/// An error that occurred due to a database command failing.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct CommandError {
    /// Identifies the type of error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,
}

impl fmt::Display for CommandError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Error code {} ({}): {}",
            self.code, self.code_name, self.message
        )
    }
}

/// An error that occurred due to not being able to satisfy a write concern.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[non_exhaustive]
pub struct WriteConcernError {
    /// Identifies the type of write concern error.
    pub code: i32,

    /// The name associated with the error code.
    #[serde(rename = "codeName", default)]
    pub code_name: String,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document identifying the write concern setting related to the error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,

    /// Labels some proxies report here instead of at the top level of the reply.
    #[serde(rename = "errorLabels", default)]
    pub(crate) labels: Vec<String>,
}

/// A write failure that was not a write concern failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct WriteError {
    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code, when the server sent one.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document providing more information about the write error (e.g. details pertaining to
    /// document validation).
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

/// A failure of one write in a multi-write operation.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct BulkWriteError {
    /// Index into the list of operations that this error corresponds to.
    #[serde(default)]
    pub index: usize,

    /// Identifies the type of write error.
    pub code: i32,

    /// The name associated with the error code, when the server sent one.
    #[serde(rename = "codeName", default)]
    pub code_name: Option<String>,

    /// A description of the error that occurred.
    #[serde(rename = "errmsg", default = "String::new")]
    pub message: String,

    /// A document providing more information about the write error.
    #[serde(rename = "errInfo")]
    pub details: Option<Document>,
}

/// The set of errors that occurred during a multi-write operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkWriteFailure {
    /// The per-operation failures, if any.
    pub write_errors: Option<Vec<BulkWriteError>>,

    /// The write concern failure, if any.
    pub write_concern_error: Option<WriteConcernError>,

    #[serde(skip)]
    pub(crate) inserted_ids: HashMap<usize, Bson>,

    /// The partial result accumulated before the failure, so progress remains inspectable.
    #[serde(skip)]
    pub partial_result: Option<crate::results::BulkWriteResult>,
}

impl BulkWriteFailure {
    pub(crate) fn new() -> Self {
        BulkWriteFailure {
            write_errors: None,
            write_concern_error: None,
            inserted_ids: Default::default(),
            partial_result: None,
        }
    }
}

/// An error that occurred when trying to execute a write operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum WriteFailure {
    /// An error that occurred due to not being able to satisfy a write concern.
    WriteConcernError(WriteConcernError),

    /// An error that occurred during a write operation that wasn't due to being unable to
    /// satisfy a write concern.
    WriteError(WriteError),
}

/// Collapses a single-statement bulk failure into the plain write failure the single-write
/// methods report, leaving all other errors untouched.
pub(crate) fn convert_bulk_errors(error: Error) -> Error {
    let failure = match *error.kind {
        ErrorKind::BulkWrite(failure) => failure,
        _ => return error,
    };

    let first_write_error = failure
        .write_errors
        .and_then(|errors| errors.into_iter().next());

    let kind = if let Some(bulk_error) = first_write_error {
        ErrorKind::Write(WriteFailure::WriteError(WriteError {
            code: bulk_error.code,
            code_name: bulk_error.code_name,
            message: bulk_error.message,
            details: bulk_error.details,
        }))
    } else if let Some(write_concern_error) = failure.write_concern_error {
        ErrorKind::Write(WriteFailure::WriteConcernError(write_concern_error))
    } else {
        ErrorKind::InvalidResponse {
            message: "error missing write errors and write concern errors".to_string(),
        }
    };

    Error::new(kind, Some(error.labels))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command_error(code: i32, code_name: &str) -> Error {
        ErrorKind::Command(CommandError {
            code,
            code_name: code_name.to_string(),
            message: "".to_string(),
        })
        .into()
    }

    #[test]
    fn stepdown_classification_prefers_code_name() {
        let err = command_error(10107, "NotWritablePrimary");
        assert!(err.is_notwritableprimary());
        assert!(err.is_state_change_error());

        // A bogus numeric code with an authoritative name still classifies.
        let err = command_error(1, "PrimarySteppedDown");
        assert!(err.is_recovering());

        // Absent name falls back to the numeric code.
        let err = command_error(189, "");
        assert!(err.is_recovering());
        assert!(!err.is_notwritableprimary());
    }

    #[test]
    fn shutdown_codes() {
        assert!(command_error(11600, "InterruptedAtShutdown").is_shutting_down());
        assert!(command_error(91, "ShutdownInProgress").is_shutting_down());
        assert!(!command_error(10107, "NotWritablePrimary").is_shutting_down());
    }

    #[test]
    fn retryable_write_label_depends_on_wire_version() {
        let network: Error =
            ErrorKind::Io(Arc::new(std::io::ErrorKind::ConnectionReset.into())).into();
        assert!(network.should_add_retryable_write_label(9));
        assert!(network.should_add_retryable_write_label(8));

        let stepdown = command_error(10107, "NotWritablePrimary");
        // On 4.4+ servers the server attaches the label itself.
        assert!(!stepdown.should_add_retryable_write_label(9));
        assert!(stepdown.should_add_retryable_write_label(8));

        // ReadConcernMajorityNotAvailableYet retries reads but not writes.
        let majority_unavailable = command_error(134, "ReadConcernMajorityNotAvailableYet");
        assert!(majority_unavailable.is_read_retryable());
        assert!(!majority_unavailable.should_add_retryable_write_label(8));
    }

    #[test]
    fn unknown_commit_label() {
        let mut transient = command_error(112, "WriteConflict");
        transient.add_label(TRANSIENT_TRANSACTION_ERROR);
        assert!(!transient.should_add_unknown_transaction_commit_result_label());

        assert!(command_error(50, "MaxTimeMSExpired")
            .should_add_unknown_transaction_commit_result_label());
        assert!(command_error(64, "WriteConcernFailed")
            .should_add_unknown_transaction_commit_result_label());
        assert!(!command_error(11000, "DuplicateKey")
            .should_add_unknown_transaction_commit_result_label());
    }

    #[test]
    fn resumable_classification() {
        // Non-server errors are always resumable.
        let network: Error =
            ErrorKind::Io(Arc::new(std::io::ErrorKind::ConnectionReset.into())).into();
        assert!(network.is_resumable());

        // CursorNotFound is resumable regardless of version.
        let mut cursor_not_found = command_error(43, "CursorNotFound");
        cursor_not_found.wire_version = Some(9);
        assert!(cursor_not_found.is_resumable());

        // 4.4+: only the label counts.
        let mut labeled = command_error(6, "HostUnreachable");
        labeled.wire_version = Some(9);
        assert!(!labeled.is_resumable());
        labeled.add_label(RESUMABLE_CHANGE_STREAM_ERROR);
        assert!(labeled.is_resumable());

        // Pre-4.4: the allowlisted codes count.
        let mut coded = command_error(6, "HostUnreachable");
        coded.wire_version = Some(8);
        assert!(coded.is_resumable());
    }

    #[test]
    fn write_concern_error_labels_are_hoisted() {
        let kind = ErrorKind::Write(WriteFailure::WriteConcernError(WriteConcernError {
            code: 64,
            code_name: "WriteConcernFailed".to_string(),
            message: "waiting for replication timed out".to_string(),
            details: None,
            labels: vec![UNKNOWN_TRANSACTION_COMMIT_RESULT.to_string()],
        }));
        let err = Error::new(kind, None::<Option<String>>);
        assert!(err.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));
    }

    #[test]
    fn bulk_error_conversion() {
        let mut failure = BulkWriteFailure::new();
        failure.write_errors = Some(vec![BulkWriteError {
            index: 0,
            code: 11000,
            code_name: None,
            message: "dup".to_string(),
            details: None,
        }]);
        let mut bulk: Error = ErrorKind::BulkWrite(failure).into();
        bulk.add_label(RETRYABLE_WRITE_ERROR);

        let converted = convert_bulk_errors(bulk);
        assert!(matches!(
            converted.kind.as_ref(),
            ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == 11000
        ));
        // Labels survive the conversion.
        assert!(converted.contains_label(RETRYABLE_WRITE_ERROR));
    }
}
