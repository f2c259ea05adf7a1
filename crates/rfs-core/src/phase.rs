use crate::clock::add_duration;
use crate::lease::lease_window;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Snapshot,
    Metadata,
    Index,
    Documents,
}

impl Phase {
    pub const ALL: [Phase; 4] = [
        Phase::Snapshot,
        Phase::Metadata,
        Phase::Index,
        Phase::Documents,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Snapshot => "SNAPSHOT",
            Phase::Metadata => "METADATA",
            Phase::Index => "INDEX",
            Phase::Documents => "DOCUMENTS",
        }
    }

    /// Id of the phase entry document.
    pub fn entry_id(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "snapshot" => Ok(Phase::Snapshot),
            "metadata" => Ok(Phase::Metadata),
            "index" | "indices" => Ok(Phase::Index),
            "documents" | "docs" => Ok(Phase::Documents),
            other => Err(format!("Unknown phase: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseStatus {
    #[serde(alias = "NOT_STARTED")]
    Setup,
    InProgress,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseStatus::Setup => "SETUP",
            PhaseStatus::InProgress => "IN_PROGRESS",
            PhaseStatus::Completed => "COMPLETED",
            PhaseStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PhaseStatus::Completed | PhaseStatus::Failed)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse-grained work item for one migration phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseEntry {
    #[serde(rename = "type")]
    pub phase: Phase,
    pub status: PhaseStatus,
    #[serde(with = "epoch_millis_string")]
    pub lease_expiry: DateTime<Utc>,
    pub num_attempts: u32,
}

impl PhaseEntry {
    pub const MAX_ATTEMPTS: u32 = 3;

    /// Entry written by the first worker to reach the phase; creating it is the first
    /// lease acquisition.
    pub fn initial(phase: Phase, now: DateTime<Utc>, base_lease: Duration) -> Self {
        Self {
            phase,
            status: PhaseStatus::Setup,
            lease_expiry: add_duration(now, lease_window(base_lease, 0)),
            num_attempts: 1,
        }
    }

    pub fn id(&self) -> &'static str {
        self.phase.entry_id()
    }

    pub fn is_lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expiry < now
    }

    pub fn with_acquired_lease(&self, now: DateTime<Utc>, base_lease: Duration) -> Self {
        Self {
            lease_expiry: add_duration(now, lease_window(base_lease, self.num_attempts)),
            num_attempts: self.num_attempts.saturating_add(1),
            ..self.clone()
        }
    }

    pub fn with_status(&self, status: PhaseStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexWorkStatus {
    NotStarted,
    Completed,
    Failed,
}

impl IndexWorkStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexWorkStatus::NotStarted => "NOT_STARTED",
            IndexWorkStatus::Completed => "COMPLETED",
            IndexWorkStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for IndexWorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Child entry of the Index phase: one per index to create on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexWorkEntry {
    pub name: String,
    pub status: IndexWorkStatus,
    pub num_attempts: u32,
}

impl IndexWorkEntry {
    pub const ENTRY_TYPE: &'static str = "INDEX_WORK_ITEM";
    /// Entries that have been attempted more than this many times are marked failed.
    pub const ATTEMPTS_SOFT_LIMIT: u32 = 3;

    pub fn not_started(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: IndexWorkStatus::NotStarted,
            num_attempts: 0,
        }
    }

    pub fn id(&self) -> String {
        Self::id_for(&self.name)
    }

    pub fn id_for(index_name: &str) -> String {
        format!("{}:{index_name}", Self::ENTRY_TYPE)
    }

    pub fn with_status(&self, status: IndexWorkStatus) -> Self {
        Self {
            status,
            ..self.clone()
        }
    }

    pub fn with_attempt_recorded(&self) -> Self {
        Self {
            num_attempts: self.num_attempts.saturating_add(1),
            ..self.clone()
        }
    }
}

/// `leaseExpiry` travels as a string of epoch milliseconds.
mod epoch_millis_string {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.timestamp_millis().to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        let millis = raw.trim().parse::<i64>().map_err(de::Error::custom)?;
        DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| de::Error::custom(format!("leaseExpiry out of range: {millis}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_767_225_600_000)
            .single()
            .expect("valid ts")
    }

    #[test]
    fn phase_entry_wire_shape() {
        let entry = PhaseEntry::initial(Phase::Metadata, ts(), Duration::from_secs(60));
        let json = serde_json::to_value(&entry).expect("serialize");

        assert_eq!(json["type"], "METADATA");
        assert_eq!(json["status"], "SETUP");
        assert_eq!(json["leaseExpiry"], "1767225660000");
        assert_eq!(json["numAttempts"], 1);

        let parsed: PhaseEntry = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, entry);
    }

    #[test]
    fn not_started_is_read_as_setup() {
        let parsed: PhaseEntry = serde_json::from_str(
            r#"{"type":"SNAPSHOT","status":"NOT_STARTED","leaseExpiry":"0","numAttempts":0}"#,
        )
        .expect("deserialize");
        assert_eq!(parsed.status, PhaseStatus::Setup);
    }

    #[test]
    fn reacquired_lease_doubles_and_counts_attempt() {
        let entry = PhaseEntry::initial(Phase::Index, ts(), Duration::from_secs(60));
        let later = ts() + chrono::Duration::seconds(90);
        assert!(entry.is_lease_expired(later));

        let reacquired = entry.with_acquired_lease(later, Duration::from_secs(60));
        assert_eq!(reacquired.num_attempts, 2);
        assert_eq!(reacquired.lease_expiry, later + chrono::Duration::seconds(120));
        assert!(!reacquired.is_lease_expired(later));
    }

    #[test]
    fn phase_parses_cli_spellings() {
        assert_eq!("docs".parse::<Phase>(), Ok(Phase::Documents));
        assert_eq!("Metadata".parse::<Phase>(), Ok(Phase::Metadata));
        assert!("reindex".parse::<Phase>().is_err());
    }

    #[test]
    fn index_work_entry_ids_are_namespaced() {
        let entry = IndexWorkEntry::not_started("logs");
        assert_eq!(entry.id(), "INDEX_WORK_ITEM:logs");
        assert_eq!(entry.with_attempt_recorded().num_attempts, 1);
    }
}
