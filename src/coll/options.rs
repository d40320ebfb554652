//! Options for collection-level operations.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    bson::{Bson, Document},
    concern::{ReadConcern, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// Options for creating a [`Collection`](crate::Collection) handle.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct CollectionOptions {
    /// The default read concern for operations on the collection.
    pub read_concern: Option<ReadConcern>,

    /// The default write concern for operations on the collection.
    pub write_concern: Option<WriteConcern>,

    /// The default selection criteria for read operations on the collection.
    pub selection_criteria: Option<SelectionCriteria>,
}

/// The type of cursor a query should return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum CursorType {
    /// A regular, non-tailable cursor: iteration ends when all matching results have been
    /// returned.
    NonTailable,

    /// A tailable cursor over a capped collection: the cursor stays open after the last result,
    /// and iteration reports "no document this wait" rather than end-of-stream.
    Tailable,

    /// A tailable cursor on which the server blocks for up to `max_await_time` waiting for new
    /// results before returning an empty batch.
    TailableAwait,
}

/// Options for [`Collection::insert_one`](crate::Collection::insert_one).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct InsertOneOptions {
    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

impl From<InsertOneOptions> for InsertManyOptions {
    fn from(options: InsertOneOptions) -> Self {
        InsertManyOptions {
            bypass_document_validation: options.bypass_document_validation,
            write_concern: options.write_concern,
            ordered: None,
        }
    }
}

/// Options for [`Collection::insert_many`](crate::Collection::insert_many).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct InsertManyOptions {
    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// Whether the writes must execute in order and stop at the first failure, or may execute
    /// in any order and attempt every document.
    ///
    /// Defaults to true.
    pub ordered: Option<bool>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Options for update operations.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct UpdateOptions {
    /// Filters specifying which elements of an array field to modify.
    pub array_filters: Option<Vec<Bson>>,

    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// Insert the document if no document matches the filter.
    pub upsert: Option<bool>,

    /// The collation to use for string comparisons in the filter.
    pub collation: Option<Document>,

    /// The index to use for the operation.
    pub hint: Option<Bson>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Options for delete operations.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DeleteOptions {
    /// The collation to use for string comparisons in the filter.
    pub collation: Option<Document>,

    /// The index to use for the operation.
    pub hint: Option<Bson>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// Options for [`Collection::find`](crate::Collection::find).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct FindOptions {
    /// Enables writing to temporary files by the server when executing the query.
    pub allow_disk_use: Option<bool>,

    /// The number of documents the server returns per batch.
    pub batch_size: Option<u32>,

    /// An arbitrary comment to attach to the query for log correlation.
    pub comment: Option<String>,

    /// The type of cursor to return.
    pub cursor_type: Option<CursorType>,

    /// The index to use for the operation.
    pub hint: Option<Document>,

    /// The maximum number of documents to return. A negative value means a single batch of at
    /// most `limit.abs()` documents.
    pub limit: Option<i64>,

    /// For tailable-await cursors, the maximum amount of time the server waits for new results
    /// per `getMore`.
    pub max_await_time: Option<Duration>,

    /// The maximum amount of time the server spends on the query.
    pub max_time: Option<Duration>,

    /// Prevents the server from timing out an idle cursor.
    pub no_cursor_timeout: Option<bool>,

    /// Limits the fields of the returned documents.
    pub projection: Option<Document>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for the operation.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The number of matching documents to skip.
    pub skip: Option<u64>,

    /// The order of the returned documents.
    pub sort: Option<Document>,
}

/// Options for [`Collection::find_one`](crate::Collection::find_one).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct FindOneOptions {
    /// An arbitrary comment to attach to the query for log correlation.
    pub comment: Option<String>,

    /// The index to use for the operation.
    pub hint: Option<Document>,

    /// The maximum amount of time the server spends on the query.
    pub max_time: Option<Duration>,

    /// Limits the fields of the returned document.
    pub projection: Option<Document>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for the operation.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The number of matching documents to skip.
    pub skip: Option<u64>,

    /// The order applied before selecting the first document.
    pub sort: Option<Document>,
}

impl From<FindOneOptions> for FindOptions {
    fn from(options: FindOneOptions) -> Self {
        FindOptions {
            comment: options.comment,
            hint: options.hint,
            limit: Some(-1),
            max_time: options.max_time,
            projection: options.projection,
            read_concern: options.read_concern,
            selection_criteria: options.selection_criteria,
            skip: options.skip,
            sort: options.sort,
            ..Default::default()
        }
    }
}

/// Options for [`Collection::aggregate`](crate::Collection::aggregate).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct AggregateOptions {
    /// Enables writing to temporary files by the server while executing the pipeline.
    pub allow_disk_use: Option<bool>,

    /// The number of documents the server returns per batch.
    pub batch_size: Option<u32>,

    /// Opt out of document-level validation for `$out` / `$merge` stages.
    pub bypass_document_validation: Option<bool>,

    /// The collation to use for string comparisons in the pipeline.
    pub collation: Option<Document>,

    /// An arbitrary comment to attach to the aggregation for log correlation.
    pub comment: Option<String>,

    /// The index to use for the operation.
    pub hint: Option<Document>,

    /// For change stream aggregations, the maximum amount of time the server waits for new
    /// results per `getMore`.
    pub max_await_time: Option<Duration>,

    /// The maximum amount of time the server spends on the aggregation.
    pub max_time: Option<Duration>,

    /// The read concern for the operation.
    pub read_concern: Option<ReadConcern>,

    /// The criteria used to select a server for the operation.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The write concern for `$out` / `$merge` stages.
    pub write_concern: Option<WriteConcern>,
}

/// Options for [`Collection::bulk_write`](crate::Collection::bulk_write).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct BulkWriteOptions {
    /// Opt out of document-level validation.
    pub bypass_document_validation: Option<bool>,

    /// Whether the writes must execute in order and stop at the first write error, or may
    /// execute in any order and attempt every operation.
    ///
    /// Defaults to true.
    pub ordered: Option<bool>,

    /// The write concern for the operation.
    pub write_concern: Option<WriteConcern>,
}

/// A `Namespace` is the fully qualified name of a collection: the database name and the
/// collection name joined by a dot.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// The database name.
    pub db: String,

    /// The collection name.
    pub coll: String,
}

impl Namespace {
    pub(crate) fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl std::str::FromStr for Namespace {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        let mut parts = s.splitn(2, '.');
        match (parts.next(), parts.next()) {
            (Some(db), Some(coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(crate::error::ErrorKind::InvalidArgument {
                message: format!("invalid namespace: {}", s),
            }
            .into()),
        }
    }
}

impl Serialize for Namespace {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_parsing() {
        let ns: Namespace = "db.coll.with.dots".parse().unwrap();
        assert_eq!(ns.db, "db");
        assert_eq!(ns.coll, "coll.with.dots");
        assert_eq!(ns.to_string(), "db.coll.with.dots");

        assert!("nodot".parse::<Namespace>().is_err());
        assert!(".coll".parse::<Namespace>().is_err());
    }
}
