use rfs_core::collaborators::{CollaboratorFailureKind, DocumentSource, SnapshotMetadataSource};
use rfs_migration::EXIT_SUCCESS;
use rfs_worker::config::{Mode, WorkerConfig};
use rfs_worker::local::{document_file_name, LocalCluster, TEMPLATES_FILE};
use serde_json::json;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write_snapshot(root: &Path) {
    fs::create_dir_all(root.join("logs")).expect("logs dir");
    fs::create_dir_all(root.join("metrics")).expect("metrics dir");
    let manifest = json!({
        "indices": [
            { "name": "logs", "shards": 2 },
            { "name": "metrics", "shards": 1 },
        ],
        "templates": { "logs-template": { "index_patterns": ["logs-*"] } },
    });
    fs::write(root.join("manifest.json"), manifest.to_string()).expect("manifest");
    fs::write(
        root.join("logs/0.ndjson"),
        "{\"_id\":\"a\",\"_source\":{\"msg\":\"one\"}}\n\n{\"_id\":\"b/c\",\"_source\":{\"msg\":\"two\"}}\n",
    )
    .expect("shard 0");
    fs::write(
        root.join("logs/1.ndjson"),
        "{\"_id\":\"d\",\"_source\":{\"msg\":\"three\"}}\n",
    )
    .expect("shard 1");
    fs::write(
        root.join("metrics/0.ndjson"),
        "{\"_id\":\"m1\",\"_source\":{\"value\":1}}\n",
    )
    .expect("metrics shard");
}

fn config_for(dir: &TempDir) -> WorkerConfig {
    let mut config = WorkerConfig::default();
    config.store.path = dir.path().join("coordination.db");
    config.local.source_dir = dir.path().join("snapshot");
    config.local.target_dir = dir.path().join("target");
    config.migration.snapshot_name = "nightly".to_string();
    config.migration.documents_per_bulk = 1;
    write_snapshot(&config.local.source_dir);
    config
}

#[test]
fn phases_mode_migrates_snapshot_into_target_dir() {
    let dir = TempDir::new().expect("temp dir");
    let config = config_for(&dir);

    let code = rfs_worker::run(&config, "worker-1").expect("run");
    assert_eq!(code, EXIT_SUCCESS);

    let target = &config.local.target_dir;
    let templates: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(target.join(TEMPLATES_FILE)).expect("templates"))
            .expect("templates json");
    assert!(templates.get("logs-template").is_some());

    for (index, id) in [("logs", "a"), ("logs", "b/c"), ("logs", "d"), ("metrics", "m1")] {
        let path = target.join(index).join(document_file_name(id));
        assert!(path.exists(), "missing {}", path.display());
    }
    let doc: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(target.join("logs").join(document_file_name("d"))).expect("doc"),
    )
    .expect("doc json");
    assert_eq!(doc, json!({ "msg": "three" }));

    // Everything is recorded as done, so a shard worker finds nothing to do.
    let mut shard_config = config.clone();
    shard_config.migration.mode = Mode::Shard;
    assert_eq!(
        rfs_worker::run(&shard_config, "worker-2").expect("shard run"),
        EXIT_SUCCESS
    );
}

#[test]
fn shard_mode_migrates_one_shard_per_invocation() {
    let dir = TempDir::new().expect("temp dir");
    let mut config = config_for(&dir);
    config.migration.mode = Mode::Shard;
    config.migration.index_allowlist = vec!["logs".to_string()];

    for worker in ["worker-1", "worker-2", "worker-3"] {
        assert_eq!(rfs_worker::run(&config, worker).expect("run"), EXIT_SUCCESS);
    }

    let logs = config.local.target_dir.join("logs");
    assert!(logs.join(document_file_name("a")).exists());
    assert!(logs.join(document_file_name("d")).exists());
    assert!(!config.local.target_dir.join("metrics").exists());
}

#[test]
fn local_source_reports_malformed_lines() {
    let dir = TempDir::new().expect("temp dir");
    let source = dir.path().join("snapshot");
    write_snapshot(&source);
    fs::write(source.join("metrics/0.ndjson"), "{\"_id\":\"ok\",\"_source\":{}}\nnot json\n")
        .expect("rewrite shard");
    let cluster = LocalCluster::new(&source, dir.path().join("target"));

    let indices = cluster.indices("nightly").expect("indices");
    assert_eq!(indices.len(), 2);

    let results: Vec<_> = cluster
        .read_shard("nightly", "metrics", 0)
        .expect("open shard")
        .collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].as_ref().expect("first doc").id, "ok");
    let err = results[1].as_ref().expect_err("second line is malformed");
    assert_eq!(err.kind, CollaboratorFailureKind::Malformed);

    let missing = cluster
        .read_shard("nightly", "metrics", 7)
        .err()
        .expect("missing shard");
    assert_eq!(missing.kind, CollaboratorFailureKind::NotFound);
}
