//! Options for database-level operations.

use typed_builder::TypedBuilder;

use crate::{
    concern::{ReadConcern, WriteConcern},
    selection_criteria::SelectionCriteria,
};

/// Options for creating a [`Database`](crate::Database) handle.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct DatabaseOptions {
    /// The default read concern for operations on the database.
    pub read_concern: Option<ReadConcern>,

    /// The default write concern for operations on the database.
    pub write_concern: Option<WriteConcern>,

    /// The default selection criteria for read operations on the database.
    pub selection_criteria: Option<SelectionCriteria>,
}
