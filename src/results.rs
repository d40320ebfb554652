//! Contains the types of results returned by CRUD operations.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::{
    bson::{Bson, Document},
    serde_util,
};

/// The result of a [`Collection::insert_one`](crate::Collection::insert_one) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertOneResult {
    /// The `_id` field of the document inserted.
    pub inserted_id: Bson,
}

impl InsertOneResult {
    pub(crate) fn from_insert_many_result(result: InsertManyResult) -> Self {
        Self {
            inserted_id: result
                .inserted_ids
                .get(&0)
                .cloned()
                .unwrap_or(Bson::Null),
        }
    }
}

/// The result of a [`Collection::insert_many`](crate::Collection::insert_many) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The `_id` field of the documents inserted, keyed by their index in the input.
    pub inserted_ids: HashMap<usize, Bson>,
}

impl InsertManyResult {
    pub(crate) fn new() -> Self {
        InsertManyResult {
            inserted_ids: HashMap::new(),
        }
    }
}

/// The result of a [`Collection::update_one`](crate::Collection::update_one) or
/// [`Collection::update_many`](crate::Collection::update_many) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct UpdateResult {
    /// The number of documents that matched the filter.
    pub matched_count: u64,

    /// The number of documents that were modified by the operation. `None` when the server did
    /// not report `nModified`.
    #[serde(serialize_with = "serde_util::serialize_u64_option_as_i64")]
    pub modified_count: Option<u64>,

    /// The `_id` field of the upserted document.
    pub upserted_id: Option<Bson>,
}

/// The result of a [`Collection::delete_one`](crate::Collection::delete_one) or
/// [`Collection::delete_many`](crate::Collection::delete_many) operation.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct DeleteResult {
    /// The number of documents deleted by the operation.
    pub deleted_count: u64,
}

/// The result of a [`Collection::bulk_write`](crate::Collection::bulk_write) operation.
#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct BulkWriteResult {
    /// The number of documents inserted.
    pub inserted_count: u64,

    /// The `_id` field of the documents inserted, keyed by their index in the overall bulk.
    pub inserted_ids: HashMap<usize, Bson>,

    /// The number of documents matched by update operations.
    pub matched_count: u64,

    /// The number of documents modified by update operations. `None` (and sticky) if any merged
    /// sub-result omitted `nModified`.
    #[serde(serialize_with = "serde_util::serialize_u64_option_as_i64")]
    pub modified_count: Option<u64>,

    /// The number of documents upserted by update operations.
    pub upserted_count: u64,

    /// The `_id` field of the upserted documents, keyed by their operation's index in the
    /// overall bulk.
    pub upserted_ids: HashMap<usize, Bson>,

    /// The number of documents deleted.
    pub deleted_count: u64,
}

impl BulkWriteResult {
    pub(crate) fn new() -> Self {
        Self {
            modified_count: Some(0),
            ..Default::default()
        }
    }
}

/// The batch of documents returned by a `getMore`, along with whether the cursor is now
/// exhausted.
#[derive(Debug, Clone)]
pub(crate) struct GetMoreResult {
    pub(crate) batch: VecDeque<Document>,
    pub(crate) exhausted: bool,
}
