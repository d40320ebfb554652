//! Contains the types related to selecting a server for an operation.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    bson::{doc, Bson, Document},
    error::{ErrorKind, Result},
    options::ServerAddress,
    sdam::ServerInfo,
    serde_util,
};

/// Describes which servers are suitable for a given operation.
#[derive(Clone)]
#[non_exhaustive]
pub enum SelectionCriteria {
    /// A read preference that describes the suitable servers based on the server type, max
    /// staleness, and server tags.
    ///
    /// See the documentation [here](https://www.mongodb.com/docs/manual/core/read-preference/) for more details.
    ReadPreference(ReadPreference),

    /// A predicate used to filter servers that are considered suitable. A `server` will be
    /// considered suitable by a `predicate` if `predicate(server)` returns true.
    Predicate(Predicate),
}

impl fmt::Debug for SelectionCriteria {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ReadPreference(read_pref) => write!(f, "ReadPreference({:?})", read_pref),
            Self::Predicate(..) => write!(f, "Predicate"),
        }
    }
}

impl PartialEq for SelectionCriteria {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::ReadPreference(r1), Self::ReadPreference(r2)) => r1 == r2,
            (Self::Predicate(p1), Self::Predicate(p2)) => Arc::ptr_eq(p1, p2),
            _ => false,
        }
    }
}

impl From<ReadPreference> for SelectionCriteria {
    fn from(read_pref: ReadPreference) -> Self {
        Self::ReadPreference(read_pref)
    }
}

impl SelectionCriteria {
    pub(crate) fn as_read_pref(&self) -> Option<&ReadPreference> {
        match self {
            Self::ReadPreference(ref read_pref) => Some(read_pref),
            Self::Predicate(..) => None,
        }
    }

    pub(crate) fn is_read_pref_primary(&self) -> bool {
        matches!(self, Self::ReadPreference(ReadPreference::Primary))
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.as_read_pref().and_then(|pref| pref.max_staleness())
    }

    pub(crate) fn from_address(address: ServerAddress) -> Self {
        SelectionCriteria::Predicate(Arc::new(move |server| server.address() == &address))
    }
}

/// A predicate used to filter servers that are considered suitable.
pub type Predicate = Arc<dyn Send + Sync + Fn(&ServerInfo) -> bool>;

/// Specifies how the driver should route a read operation to members of a replica set.
///
/// If applicable, `tag_sets` can be used to target specific nodes in a replica set, and
/// `max_staleness` specifies the maximum lag behind the primary that a secondary can be to remain
/// eligible for the operation. The max staleness value maps to the `maxStalenessSeconds` MongoDB
/// option and will be sent to the server as an integer number of seconds.
///
/// See the [MongoDB docs](https://www.mongodb.com/docs/manual/core/read-preference) for more details.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadPreference {
    /// Only route this operation to the primary.
    Primary,

    /// Only route this operation to a secondary.
    Secondary {
        /// Specifies which secondaries are suitable.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the primary if it's available, but fall back to the secondaries if
    /// not.
    PrimaryPreferred {
        /// Specifies which secondaries are suitable as a fallback.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to a secondary if one is available, but fall back to the primary if
    /// not.
    SecondaryPreferred {
        /// Specifies which secondaries are suitable.
        options: ReadPreferenceOptions,
    },

    /// Route this operation to the node with the least network latency regardless of whether it's
    /// the primary or a secondary.
    Nearest {
        /// Specifies which servers are suitable.
        options: ReadPreferenceOptions,
    },
}

/// Specifies read preference options for non-primary read preferences.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default, setter(into)))]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadPreferenceOptions {
    /// Specifies which replica set members should be considered for operations. Each tag set will
    /// be checked in order until one or more servers is found with each tag in the set.
    #[serde(skip_serializing_if = "Option::is_none", rename = "tags")]
    pub tag_sets: Option<Vec<TagSet>>,

    /// Specifies the maximum amount of lag behind the primary that a secondary can be to be
    /// considered for the given operation. Any secondaries lagging behind more than
    /// `max_staleness` will not be considered for the operation.
    ///
    /// `max_staleness` must be at least 90 seconds. If a `max_staleness` less than 90 seconds is
    /// specified for an operation, the operation will return an error.
    #[serde(
        rename = "maxStalenessSeconds",
        serialize_with = "serde_util::serialize_duration_option_as_int_secs",
        default,
        skip_deserializing
    )]
    pub max_staleness: Option<Duration>,
}

impl ReadPreferenceOptions {
    pub(crate) fn is_default(&self) -> bool {
        self.tag_sets.is_none() && self.max_staleness.is_none()
    }
}

impl ReadPreference {
    /// The read preference mode as it appears in a connection string or `$readPreference`
    /// document.
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            ReadPreference::Primary => "primary",
            ReadPreference::Secondary { .. } => "secondary",
            ReadPreference::PrimaryPreferred { .. } => "primaryPreferred",
            ReadPreference::SecondaryPreferred { .. } => "secondaryPreferred",
            ReadPreference::Nearest { .. } => "nearest",
        }
    }

    pub(crate) fn options(&self) -> Option<&ReadPreferenceOptions> {
        match self {
            ReadPreference::Primary => None,
            ReadPreference::Secondary { options }
            | ReadPreference::PrimaryPreferred { options }
            | ReadPreference::SecondaryPreferred { options }
            | ReadPreference::Nearest { options } => Some(options),
        }
    }

    pub(crate) fn max_staleness(&self) -> Option<Duration> {
        self.options().and_then(|options| options.max_staleness)
    }

    pub(crate) fn tag_sets(&self) -> Option<&Vec<TagSet>> {
        self.options().and_then(|options| options.tag_sets.as_ref())
    }

    pub(crate) fn with_tags(mut self, tag_sets: Vec<TagSet>) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "read preference tags can only be specified when a non-primary mode \
                              is specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { ref mut options } => options,
            ReadPreference::PrimaryPreferred { ref mut options } => options,
            ReadPreference::SecondaryPreferred { ref mut options } => options,
            ReadPreference::Nearest { ref mut options } => options,
        };

        options.tag_sets = Some(tag_sets);

        Ok(self)
    }

    pub(crate) fn with_max_staleness(mut self, max_staleness: Duration) -> Result<Self> {
        let options = match self {
            ReadPreference::Primary => {
                return Err(ErrorKind::InvalidArgument {
                    message: "max staleness can only be specified when a non-primary mode is \
                              specified"
                        .to_string(),
                }
                .into());
            }
            ReadPreference::Secondary { ref mut options } => options,
            ReadPreference::PrimaryPreferred { ref mut options } => options,
            ReadPreference::SecondaryPreferred { ref mut options } => options,
            ReadPreference::Nearest { ref mut options } => options,
        };

        options.max_staleness = Some(max_staleness);

        Ok(self)
    }

    /// The `$readPreference` document attached to commands routed through a mongos.
    pub(crate) fn into_document(self) -> Document {
        let mut doc = doc! { "mode": self.mode() };

        if let Some(options) = self.options() {
            if let Some(max_staleness) = options.max_staleness {
                doc.insert("maxStalenessSeconds", max_staleness.as_secs() as i64);
            }

            if let Some(ref tag_sets) = options.tag_sets {
                let tags: Vec<Bson> = tag_sets
                    .iter()
                    .map(|tag_set| {
                        Bson::Document(
                            tag_set
                                .iter()
                                .map(|(k, v)| (k.clone(), Bson::String(v.clone())))
                                .collect(),
                        )
                    })
                    .collect();
                doc.insert("tags", tags);
            }
        }

        doc
    }
}

/// A read preference tag set. See the documentation [here](https://www.mongodb.com/docs/manual/tutorial/configure-replica-set-tag-sets/) for more details.
pub type TagSet = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_rejects_tags_and_staleness() {
        assert!(ReadPreference::Primary.with_tags(vec![]).is_err());
        assert!(ReadPreference::Primary
            .with_max_staleness(Duration::from_secs(100))
            .is_err());
    }

    #[test]
    fn document_form() {
        let mut tag_set = TagSet::new();
        tag_set.insert("dc".to_string(), "ny".to_string());

        let pref = ReadPreference::SecondaryPreferred {
            options: ReadPreferenceOptions::builder()
                .tag_sets(vec![tag_set])
                .max_staleness(Duration::from_secs(120))
                .build(),
        };

        let doc = pref.into_document();
        assert_eq!(
            doc,
            doc! {
                "mode": "secondaryPreferred",
                "maxStalenessSeconds": 120_i64,
                "tags": [ { "dc": "ny" } ],
            }
        );
    }
}
