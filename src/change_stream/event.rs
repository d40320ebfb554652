//! Contains the types of change events returned by change streams.

use serde::Deserialize;

use crate::{bson::Document, coll::Namespace};

/// An event in a change stream. `T` is the type the `fullDocument` field deserializes to;
/// [`Document`] works for any collection.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ChangeStreamEvent<T> {
    /// The resume token for this event. Callers can persist this and later resume a stream from
    /// this point with the `resume_after` option.
    #[serde(rename = "_id")]
    pub id: Document,

    /// The type of operation this event reports.
    pub operation_type: OperationType,

    /// The namespace the event applies to.
    pub ns: Option<ChangeNamespace>,

    /// The `_id` of the changed document, for CRUD events.
    pub document_key: Option<Document>,

    /// The full document, populated for inserts and replaces, and for updates when the stream
    /// was opened with `fullDocument: "updateLookup"`.
    pub full_document: Option<T>,

    /// A description of the fields changed by an update event.
    pub update_description: Option<UpdateDescription>,

    /// The identifier of the transaction the event was part of, if any.
    pub txn_number: Option<i64>,
}

/// The operation type reported in a change event.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub enum OperationType {
    /// A document was inserted.
    Insert,

    /// A document was updated.
    Update,

    /// A document was replaced.
    Replace,

    /// A document was deleted.
    Delete,

    /// The collection was dropped.
    Drop,

    /// The collection was renamed.
    Rename,

    /// The database was dropped.
    DropDatabase,

    /// The stream can no longer be resumed.
    Invalidate,

    /// Any operation type this driver version does not know about.
    #[serde(other)]
    Other,
}

/// The namespace a change event applies to.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[non_exhaustive]
pub struct ChangeNamespace {
    /// The database name.
    pub db: String,

    /// The collection name, absent for database-level events.
    pub coll: Option<String>,
}

impl From<Namespace> for ChangeNamespace {
    fn from(ns: Namespace) -> Self {
        ChangeNamespace {
            db: ns.db,
            coll: Some(ns.coll),
        }
    }
}

/// Describes the modifications performed by an update operation.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateDescription {
    /// Fields that were set or updated, mapped to their new values.
    pub updated_fields: Option<Document>,

    /// Fields that were removed.
    pub removed_fields: Option<Vec<String>>,
}
