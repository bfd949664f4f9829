use derive_where::derive_where;
use serde::{Deserialize, Serialize};

use crate::bson::{Document, Timestamp};

/// Struct modeling a cluster time reported by the server.
///
/// Cluster times are ordered by their timestamp only; the signature is carried along so it can be
/// gossiped back to the deployment.
#[derive(Debug, Deserialize, Clone, Serialize)]
#[derive_where(PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterTime {
    pub(crate) cluster_time: Timestamp,

    #[derive_where(skip)]
    pub(crate) signature: Document,
}

impl ClusterTime {
    /// The timestamp portion of this cluster time.
    pub fn timestamp(&self) -> Timestamp {
        self.cluster_time
    }
}

impl std::cmp::Ord for ClusterTime {
    fn cmp(&self, other: &ClusterTime) -> std::cmp::Ordering {
        self.cluster_time.cmp(&other.cluster_time)
    }
}

impl std::cmp::PartialOrd for ClusterTime {
    fn partial_cmp(&self, other: &ClusterTime) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Replaces `current` with `candidate` only if the candidate is strictly newer, so the stored
/// value never regresses.
pub(crate) fn advance(current: &mut Option<ClusterTime>, candidate: Option<&ClusterTime>) -> bool {
    match (current.as_ref(), candidate) {
        (_, None) => false,
        (Some(current_time), Some(candidate)) if current_time >= candidate => false,
        (_, Some(candidate)) => {
            *current = Some(candidate.clone());
            true
        }
    }
}
