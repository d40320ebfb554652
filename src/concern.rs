//! Contains the types for read concerns and write concerns.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    error::{Error, Result},
    serde_util,
};

/// The isolation level a read runs at.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/reference/read-concern/)
/// for what each level guarantees.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ReadConcern {
    /// The level of the read concern.
    pub level: ReadConcernLevel,
}

impl From<ReadConcernLevel> for ReadConcern {
    fn from(level: ReadConcernLevel) -> Self {
        Self { level }
    }
}

/// The read concern levels the server understands, plus an escape hatch for ones newer than
/// this driver.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum ReadConcernLevel {
    /// Reads the instance's most recent data, committed or not.
    Local,

    /// Reads data acknowledged by a majority of the replica set.
    Majority,

    /// Reads reflect all earlier successful majority-acknowledged writes.
    Linearizable,

    /// Like `Local`, but also answers from orphaned documents on sharded clusters.
    Available,

    /// Reads from a single majority-committed snapshot.
    Snapshot,

    /// A level this version of the driver does not know by name, passed through verbatim.
    Custom(String),
}

/// The (name, level) table the string conversions and convenience constructors derive from.
const READ_CONCERN_LEVELS: &[(&str, ReadConcernLevel)] = &[
    ("local", ReadConcernLevel::Local),
    ("majority", ReadConcernLevel::Majority),
    ("linearizable", ReadConcernLevel::Linearizable),
    ("available", ReadConcernLevel::Available),
    ("snapshot", ReadConcernLevel::Snapshot),
];

impl ReadConcernLevel {
    pub(crate) fn from_str(s: &str) -> Self {
        READ_CONCERN_LEVELS
            .iter()
            .find(|(name, _)| *name == s)
            .map(|(_, level)| level.clone())
            .unwrap_or_else(|| ReadConcernLevel::Custom(s.to_string()))
    }

    /// The level's wire-format name.
    pub(crate) fn as_str(&self) -> &str {
        match self {
            ReadConcernLevel::Custom(ref name) => name,
            known => READ_CONCERN_LEVELS
                .iter()
                .find(|(_, level)| level == known)
                .map(|(name, _)| *name)
                .unwrap_or(""),
        }
    }
}

macro_rules! read_concern_constructors {
    ($( $(#[$attr:meta])* $name:ident => $level:ident ),+ $(,)?) => {
        impl ReadConcern {
            $(
                $(#[$attr])*
                pub fn $name() -> Self {
                    ReadConcernLevel::$level.into()
                }
            )+
        }
    };
}

read_concern_constructors! {
    /// A read concern at level "local".
    local => Local,
    /// A read concern at level "majority".
    majority => Majority,
    /// A read concern at level "linearizable".
    linearizable => Linearizable,
    /// A read concern at level "available".
    available => Available,
    /// A read concern at level "snapshot".
    snapshot => Snapshot,
}

impl ReadConcern {
    /// A read concern at a level this driver has no name for.
    pub fn custom(level: impl AsRef<str>) -> Self {
        ReadConcernLevel::from_str(level.as_ref()).into()
    }
}

impl<'de> Deserialize<'de> for ReadConcernLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(ReadConcernLevel::from_str(&String::deserialize(deserializer)?))
    }
}

impl Serialize for ReadConcernLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// What the `w` field of a write concern asks the server to wait for.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/reference/write-concern/#w-option)
/// for the full semantics.
#[derive(Clone, Debug, PartialEq)]
#[non_exhaustive]
pub enum Acknowledgment {
    /// Wait for the write to reach this many nodes; 0 asks for no acknowledgment at all.
    Nodes(u32),

    /// Wait for a majority of voting nodes.
    Majority,

    /// Wait per a named custom write concern configured on the replica set.
    Custom(String),
}

impl Serialize for Acknowledgment {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Acknowledgment::Majority => serializer.serialize_str("majority"),
            Acknowledgment::Nodes(n) => {
                serde_util::serialize_u32_option_as_i32(&Some(*n), serializer)
            }
            Acknowledgment::Custom(name) => serializer.serialize_str(name),
        }
    }
}

impl<'de> Deserialize<'de> for Acknowledgment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum IntOrString {
            Int(u32),
            String(String),
        }
        Ok(match IntOrString::deserialize(deserializer)? {
            IntOrString::Int(n) => Acknowledgment::from(n),
            IntOrString::String(s) => Acknowledgment::from(s),
        })
    }
}

impl From<u32> for Acknowledgment {
    fn from(n: u32) -> Self {
        Acknowledgment::Nodes(n)
    }
}

impl From<String> for Acknowledgment {
    fn from(s: String) -> Self {
        match s.as_str() {
            "majority" => Acknowledgment::Majority,
            _ => Acknowledgment::Custom(s),
        }
    }
}

/// When a write is considered acknowledged: by how many nodes, within how long, and whether it
/// must reach the on-disk journal first.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/reference/write-concern/)
/// for the full semantics.
#[skip_serializing_none]
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder, Serialize, Deserialize)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct WriteConcern {
    /// The requested acknowledgment level.
    pub w: Option<Acknowledgment>,

    /// How long the server waits for the requested acknowledgment before reporting a write
    /// concern error. The write itself is not rolled back by the timeout.
    #[serde(rename = "wtimeout")]
    #[serde(
        serialize_with = "serde_util::serialize_duration_option_as_int_millis",
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis",
        default
    )]
    pub w_timeout: Option<Duration>,

    /// Whether the write must reach the on-disk journal before acknowledgment.
    #[serde(rename = "j")]
    pub journal: Option<bool>,
}

impl From<Acknowledgment> for WriteConcern {
    fn from(w: Acknowledgment) -> Self {
        WriteConcern {
            w: Some(w),
            w_timeout: None,
            journal: None,
        }
    }
}

impl WriteConcern {
    /// A majority write concern.
    pub fn majority() -> Self {
        Acknowledgment::Majority.into()
    }

    /// Whether this write concern requests any acknowledgment from the server. Only `w: 0`
    /// without journaling is unacknowledged.
    pub fn is_acknowledged(&self) -> bool {
        self.w != Some(Acknowledgment::Nodes(0)) || self.journal == Some(true)
    }

    /// Whether no field of the write concern was actually filled in.
    pub(crate) fn is_empty(&self) -> bool {
        matches!(
            self,
            WriteConcern {
                w: None,
                w_timeout: None,
                journal: None,
            }
        )
    }

    /// Journaling cannot be demanded of a write nobody acknowledges.
    pub fn validate(&self) -> Result<()> {
        if self.w == Some(Acknowledgment::Nodes(0)) && self.journal == Some(true) {
            return Err(Error::invalid_argument(
                "write concern cannot have w=0 and journal=true",
            ));
        }
        Ok(())
    }

    pub(crate) fn to_document(&self) -> Result<crate::bson::Document> {
        match bson::to_bson(self)? {
            crate::bson::Bson::Document(doc) => Ok(doc),
            _ => Err(Error::internal("write concern did not serialize to a document")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::doc;

    #[test]
    fn read_concern_level_round_trip() {
        for name in ["local", "majority", "linearizable", "available", "snapshot"] {
            assert_eq!(ReadConcernLevel::from_str(name).as_str(), name);
        }
        assert_eq!(ReadConcernLevel::from_str("future").as_str(), "future");
    }

    #[test]
    fn acknowledgment_coercions() {
        assert_eq!(
            Acknowledgment::from("majority".to_string()),
            Acknowledgment::Majority
        );
        assert_eq!(Acknowledgment::from(2u32), Acknowledgment::Nodes(2));
        assert_eq!(
            Acknowledgment::from("myTag".to_string()),
            Acknowledgment::Custom("myTag".to_string())
        );
    }

    #[test]
    fn write_concern_validation() {
        let invalid = WriteConcern::builder()
            .w(Acknowledgment::Nodes(0))
            .journal(true)
            .build();
        assert!(invalid.validate().is_err());
        assert!(invalid.is_acknowledged());

        let unacknowledged = WriteConcern::builder().w(Acknowledgment::Nodes(0)).build();
        assert!(unacknowledged.validate().is_ok());
        assert!(!unacknowledged.is_acknowledged());

        assert!(WriteConcern::majority().is_acknowledged());
        assert!(WriteConcern::default().is_empty());
    }

    #[test]
    fn write_concern_serialization() {
        let write_concern = WriteConcern::builder()
            .w(Acknowledgment::Majority)
            .w_timeout(Duration::from_millis(100))
            .build();
        assert_eq!(
            write_concern.to_document().unwrap(),
            doc! { "w": "majority", "wtimeout": 100_i32 }
        );
    }
}
