//! Options for change streams.

use std::time::Duration;

use serde::Serialize;
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::{Document, Timestamp},
    coll::options::AggregateOptions,
    concern::ReadConcern,
    selection_criteria::SelectionCriteria,
};

/// These are the valid options for creating a change stream with
/// [`Collection::watch`](crate::Collection::watch) or [`Database::watch`](crate::Database::watch).
///
/// The serialized form of this struct is exactly the body of the `$changeStream` stage; options
/// that configure the surrounding aggregation are skipped.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, Serialize, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamOptions {
    /// Configures how the "fullDocument" field of change events is populated. The server default
    /// omits the full document for update events; `"updateLookup"` requests the current version
    /// of the changed document.
    pub full_document: Option<String>,

    /// Specifies the logical starting point for the new change stream. The change stream will
    /// report events starting immediately after the event referenced by the given resume token.
    pub resume_after: Option<Document>,

    /// The change stream will only provide changes that occurred at or after the specified
    /// timestamp. Any command run against the server will return an operation time that can be
    /// used here.
    pub start_at_operation_time: Option<Timestamp>,

    /// Whether the stream reports changes across the whole cluster rather than one database or
    /// collection. Only valid on streams opened against the `admin` database.
    #[serde(skip_serializing)]
    pub all_changes_for_cluster: Option<bool>,

    /// The maximum number of change events to return in one server batch.
    #[serde(skip_serializing)]
    pub batch_size: Option<u32>,

    /// The maximum amount of time for the server to wait on new documents to satisfy a change
    /// stream query.
    #[serde(skip_serializing)]
    pub max_await_time: Option<Duration>,

    /// The read concern for the underlying aggregation.
    #[serde(skip_serializing)]
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for the underlying aggregation.
    #[serde(skip_serializing)]
    pub selection_criteria: Option<SelectionCriteria>,
}

impl ChangeStreamOptions {
    /// The options for the aggregation wrapping the `$changeStream` stage.
    pub(crate) fn aggregate_options(&self) -> AggregateOptions {
        AggregateOptions {
            batch_size: self.batch_size,
            max_await_time: self.max_await_time,
            read_concern: self.read_concern.clone(),
            selection_criteria: self.selection_criteria.clone(),
            ..Default::default()
        }
    }
}
