use crate::config::{Backend, Mode, WorkerConfig};
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "rfs-worker")]
#[command(about = "Snapshot-to-cluster migration worker", long_about = None)]
pub struct Args {
    /// TOML config file; flags and environment variables override it.
    #[arg(long, env = "RFS_CONFIG")]
    pub config: Option<PathBuf>,
    /// Defaults to a random UUID.
    #[arg(long, env = "RFS_WORKER_ID")]
    pub worker_id: Option<String>,
    #[arg(long, value_enum, env = "RFS_BACKEND")]
    pub backend: Option<Backend>,
    #[arg(long, env = "RFS_STORE_PATH")]
    pub store_path: Option<PathBuf>,
    #[arg(long, env = "RFS_STORE_URL")]
    pub store_url: Option<String>,
    #[arg(long, env = "RFS_STORE_USERNAME")]
    pub store_username: Option<String>,
    #[arg(long, env = "RFS_STORE_PASSWORD", hide_env_values = true)]
    pub store_password: Option<String>,
    #[arg(long, value_enum, env = "RFS_MODE")]
    pub mode: Option<Mode>,
    #[arg(long, env = "RFS_SNAPSHOT_NAME")]
    pub snapshot_name: Option<String>,
    #[arg(long, env = "RFS_INDEX_ALLOWLIST", value_delimiter = ',')]
    pub index_allowlist: Option<Vec<String>>,
    #[arg(long, env = "RFS_PHASES", value_delimiter = ',')]
    pub phases: Option<Vec<String>>,
    #[arg(long, env = "RFS_INITIAL_LEASE_SECS")]
    pub initial_lease_secs: Option<u64>,
    #[arg(long, env = "RFS_SOURCE_DIR")]
    pub source_dir: Option<PathBuf>,
    #[arg(long, env = "RFS_TARGET_DIR")]
    pub target_dir: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

impl Args {
    pub fn apply_to(&self, config: &mut WorkerConfig) {
        if let Some(backend) = self.backend {
            config.store.backend = backend;
        }
        if let Some(path) = &self.store_path {
            config.store.path = path.clone();
        }
        if let Some(url) = &self.store_url {
            config.store.url = Some(url.clone());
        }
        if let Some(username) = &self.store_username {
            config.store.username = Some(username.clone());
        }
        if let Some(password) = &self.store_password {
            config.store.password = Some(password.clone());
        }
        if let Some(mode) = self.mode {
            config.migration.mode = mode;
        }
        if let Some(name) = &self.snapshot_name {
            config.migration.snapshot_name = name.clone();
        }
        if let Some(allowlist) = &self.index_allowlist {
            config.migration.index_allowlist = allowlist.clone();
        }
        if let Some(phases) = &self.phases {
            config.migration.phases = phases.clone();
        }
        if let Some(secs) = self.initial_lease_secs {
            config.lease.initial_lease_secs = secs;
        }
        if let Some(dir) = &self.source_dir {
            config.local.source_dir = dir.clone();
        }
        if let Some(dir) = &self.target_dir {
            config.local.target_dir = dir.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_file_values() {
        let mut config = WorkerConfig::from_toml(
            "[migration]\nsnapshot_name = \"from-file\"\nmode = \"phases\"\n",
        )
        .expect("parse");
        let args = Args::try_parse_from([
            "rfs-worker",
            "--mode",
            "shard",
            "--index-allowlist",
            "logs,metrics",
            "--initial-lease-secs",
            "45",
        ])
        .expect("args");

        args.apply_to(&mut config);

        assert_eq!(config.migration.mode, Mode::Shard);
        assert_eq!(config.migration.snapshot_name, "from-file");
        assert_eq!(
            config.migration.index_allowlist,
            vec!["logs".to_string(), "metrics".to_string()]
        );
        assert_eq!(config.lease.initial_lease_secs, 45);
    }

    #[test]
    fn backend_flag_accepts_lowercase_names() {
        let args = Args::try_parse_from(["rfs-worker", "--backend", "opensearch"]).expect("args");
        assert_eq!(args.backend, Some(Backend::Opensearch));
    }
}
