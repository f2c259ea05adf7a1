use crate::lease::candidate_expiration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const SHARD_ID_SEPARATOR: &str = "__";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkItemIdError {
    #[error("index name {0:?} contains the reserved separator \"__\"")]
    IndexNameContainsSeparator(String),
    #[error("work item id {0:?} is not of the form <index>__<shard>")]
    Malformed(String),
}

/// One document per unit of claimable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    #[serde(skip)]
    pub id: String,
    pub script_version: String,
    #[serde(default)]
    pub creator_id: Option<String>,
    #[serde(default)]
    pub lease_holder_id: Option<String>,
    /// Epoch seconds; `0` until the first claim.
    pub expiration: i64,
    pub num_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Epoch seconds at which the holder gave up on the item for good.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<i64>,
}

/// What a conditional claim does to a stored work item. This is the decision the
/// store evaluates atomically, in one read-modify-write per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimDecision {
    /// Caller already holds an unexpired lease; nothing changes but the caller should
    /// re-read the stored expiration.
    Reaffirm,
    Claim { expiration: i64, num_attempts: u32 },
    HeldElsewhere,
    /// Completed or failed.
    AlreadyCompleted,
}

impl WorkItem {
    pub fn unassigned(id: impl Into<String>, script_version: &str, creator_id: &str) -> Self {
        Self {
            id: id.into(),
            script_version: script_version.to_string(),
            creator_id: Some(creator_id.to_string()),
            lease_holder_id: None,
            expiration: 0,
            num_attempts: 0,
            completed_at: None,
            failed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.failed_at.is_some()
    }

    /// Completed or failed. Settled items are never leased again.
    pub fn is_settled(&self) -> bool {
        self.is_completed() || self.is_failed()
    }

    pub fn is_lease_expired(&self, server_epoch_seconds: i64) -> bool {
        self.expiration < server_epoch_seconds
    }

    pub fn evaluate_claim(
        &self,
        worker_id: &str,
        client_epoch_seconds: i64,
        server_epoch_seconds: i64,
        base_lease: Duration,
    ) -> ClaimDecision {
        if self.is_settled() {
            return ClaimDecision::AlreadyCompleted;
        }

        let new_expiration =
            candidate_expiration(client_epoch_seconds, base_lease, self.num_attempts);
        let held_by_caller = self.lease_holder_id.as_deref() == Some(worker_id);
        if held_by_caller && self.expiration > server_epoch_seconds {
            ClaimDecision::Reaffirm
        } else if self.is_lease_expired(server_epoch_seconds) && self.expiration < new_expiration
        {
            ClaimDecision::Claim {
                expiration: new_expiration,
                num_attempts: self.num_attempts.saturating_add(1),
            }
        } else {
            ClaimDecision::HeldElsewhere
        }
    }

    /// Applies a claim decision, returning the document the store should persist.
    pub fn claimed_by(&self, worker_id: &str, expiration: i64, num_attempts: u32) -> Self {
        Self {
            lease_holder_id: Some(worker_id.to_string()),
            expiration,
            num_attempts,
            ..self.clone()
        }
    }
}

/// Shard-level work item identity, rendered as `"{index}__{shard}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexAndShard {
    pub index_name: String,
    pub shard: u32,
}

impl IndexAndShard {
    pub fn new(index_name: impl Into<String>, shard: u32) -> Result<Self, WorkItemIdError> {
        let index_name = index_name.into();
        if index_name.contains(SHARD_ID_SEPARATOR) {
            return Err(WorkItemIdError::IndexNameContainsSeparator(index_name));
        }
        Ok(Self { index_name, shard })
    }

    pub fn work_item_id(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for IndexAndShard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{SHARD_ID_SEPARATOR}{}", self.index_name, self.shard)
    }
}

impl FromStr for IndexAndShard {
    type Err = WorkItemIdError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (index_name, shard) = input
            .rsplit_once(SHARD_ID_SEPARATOR)
            .ok_or_else(|| WorkItemIdError::Malformed(input.to_string()))?;
        let shard = shard
            .parse::<u32>()
            .map_err(|_| WorkItemIdError::Malformed(input.to_string()))?;
        if index_name.is_empty() {
            return Err(WorkItemIdError::Malformed(input.to_string()));
        }
        Self::new(index_name, shard)
    }
}
