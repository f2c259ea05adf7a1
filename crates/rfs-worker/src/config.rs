use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use rfs_coordination::IndexAllowlist;
use rfs_core::Phase;
use rfs_migration::MigrationSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Sqlite,
    Opensearch,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Drive the four-phase state machine.
    #[default]
    Phases,
    /// Migrate a single shard and exit.
    Shard,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub store: StoreConfig,
    pub lease: LeaseConfig,
    pub migration: MigrationConfig,
    pub local: LocalConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    pub path: PathBuf,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tolerable_clock_drift_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            path: PathBuf::from("rfs-coordination.db"),
            url: None,
            username: None,
            password: None,
            tolerable_clock_drift_secs: 5,
        }
    }
}

impl StoreConfig {
    pub fn tolerable_clock_drift(&self) -> Duration {
        Duration::from_secs(self.tolerable_clock_drift_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Base lease for shard work items; doubled per prior attempt.
    pub initial_lease_secs: u64,
    pub phase_lease_secs: u64,
    pub max_shard_attempts: u32,
    pub phase_max_attempts: u32,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            initial_lease_secs: 600,
            phase_lease_secs: 60,
            max_shard_attempts: 5,
            phase_max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub snapshot_name: String,
    pub index_allowlist: Vec<String>,
    pub phases: Vec<String>,
    pub mode: Mode,
    pub index_batch_size: usize,
    pub documents_per_bulk: usize,
    pub random_wait_secs: u64,
    pub fan_out_retry_wait_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            snapshot_name: "rfs-snapshot".to_string(),
            index_allowlist: Vec::new(),
            phases: Phase::ALL.iter().map(|phase| phase.as_str().to_lowercase()).collect(),
            mode: Mode::Phases,
            index_batch_size: 10,
            documents_per_bulk: 500,
            random_wait_secs: 5,
            fan_out_retry_wait_secs: 10,
        }
    }
}

impl MigrationConfig {
    pub fn parsed_phases(&self) -> Result<Vec<Phase>> {
        self.phases
            .iter()
            .map(|name| name.parse::<Phase>().map_err(|err| anyhow!(err)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    pub source_dir: PathBuf,
    pub target_dir: PathBuf,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("snapshot"),
            target_dir: PathBuf::from("target"),
        }
    }
}

impl WorkerConfig {
    /// Reads the TOML file at `path`, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn migration_settings(&self) -> MigrationSettings {
        let migration = &self.migration;
        MigrationSettings {
            snapshot_name: migration.snapshot_name.clone(),
            allowlist: IndexAllowlist::new(migration.index_allowlist.iter().cloned()),
            phase_lease: Duration::from_secs(self.lease.phase_lease_secs),
            shard_lease: Duration::from_secs(self.lease.initial_lease_secs),
            phase_max_attempts: self.lease.phase_max_attempts,
            max_shard_attempts: self.lease.max_shard_attempts,
            index_batch_size: migration.index_batch_size,
            documents_per_bulk: migration.documents_per_bulk,
            random_wait: Duration::from_secs(migration.random_wait_secs),
            fan_out_retry_wait: Duration::from_secs(migration.fan_out_retry_wait_secs),
            ..MigrationSettings::default()
        }
    }
}
