use serde::{Deserialize, Serialize};

use crate::bson::{Document, Timestamp};

/// Struct modeling a cluster time reported by the server.
///
/// See [the MongoDB documentation](https://www.mongodb.com/docs/manual/core/read-isolation-consistency-recency/)
/// for more information.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    /// An opaque signature produced by the server, forwarded verbatim when the client gossips
    /// the cluster time.
    pub(crate) signature: Document,
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        let lhs = (self.cluster_time.time, self.cluster_time.increment);
        let rhs = (other.cluster_time.time, other.cluster_time.increment);
        lhs.cmp(&rhs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::doc;

    fn cluster_time(time: u32, increment: u32) -> ClusterTime {
        ClusterTime {
            cluster_time: Timestamp { time, increment },
            signature: doc! {},
        }
    }

    #[test]
    fn ordering() {
        assert!(cluster_time(1, 1) < cluster_time(1, 2));
        assert!(cluster_time(1, 2) < cluster_time(2, 1));
        assert_eq!(cluster_time(3, 4), cluster_time(3, 4));
    }
}
