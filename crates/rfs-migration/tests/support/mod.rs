#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use rfs_core::collaborators::{
    CollaboratorError, CollaboratorFailureKind, DocumentSink, DocumentSource, DocumentStream,
    IndexCreator, IndexMetadata, MetadataMigrator, SnapshotCreator, SnapshotMetadataSource,
    SnapshotState, SourceDocument,
};
use rfs_core::{Clock, ManualClock};
use rfs_coordination::LeaseWatchdog;
use rfs_migration::{Collaborators, MigrationSettings, WorkerState};
use rfs_storage::SqliteCoordinator;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
        .single()
        .expect("valid timestamp")
}

pub fn settings() -> MigrationSettings {
    MigrationSettings {
        snapshot_name: "nightly".to_string(),
        documents_per_bulk: 2,
        ..MigrationSettings::default()
    }
}

pub fn store(worker_id: &str, clock: &ManualClock) -> SqliteCoordinator {
    SqliteCoordinator::open_in_memory(worker_id, Arc::new(clock.clone())).expect("open db")
}

pub fn watchdog(clock: &ManualClock) -> Arc<LeaseWatchdog> {
    Arc::new(LeaseWatchdog::manual(Arc::new(clock.clone()), None))
}

type BulkHook = Box<dyn Fn() + Send + Sync>;

/// In-memory snapshot repository plus target cluster.
#[derive(Default)]
pub struct FakeCluster {
    indices: Vec<IndexMetadata>,
    documents: HashMap<(String, u32), Vec<SourceDocument>>,
    broken_indices: HashSet<String>,
    snapshot_polls_remaining: Mutex<u32>,
    snapshot_fails: bool,
    pub snapshots_created: Mutex<Vec<String>>,
    pub templates_migrated: Mutex<u32>,
    pub index_creations: Mutex<Vec<String>>,
    pub bulks: Mutex<Vec<(String, usize)>>,
    pub target: Mutex<BTreeMap<(String, String), serde_json::Value>>,
    on_bulk: Option<BulkHook>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an index whose shards each hold `docs_per_shard` documents.
    pub fn with_index(mut self, name: &str, shards: u32, docs_per_shard: usize) -> Self {
        self.indices.push(IndexMetadata {
            name: name.to_string(),
            shards,
        });
        for shard in 0..shards {
            let docs = (0..docs_per_shard)
                .map(|n| SourceDocument {
                    id: format!("{name}-{shard}-{n}"),
                    source: json!({ "shard": shard, "n": n }),
                })
                .collect();
            self.documents.insert((name.to_string(), shard), docs);
        }
        self
    }

    pub fn with_broken_index(mut self, name: &str) -> Self {
        self.broken_indices.insert(name.to_string());
        self.with_index(name, 1, 0)
    }

    pub fn with_snapshot_polls(self, polls: u32) -> Self {
        *self.snapshot_polls_remaining.lock().expect("polls") = polls;
        self
    }

    pub fn with_failing_snapshot(mut self) -> Self {
        self.snapshot_fails = true;
        self
    }

    pub fn with_bulk_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_bulk = Some(Box::new(hook));
        self
    }

    pub fn collaborators(&self) -> Collaborators<'_> {
        Collaborators {
            snapshot_metadata: self,
            snapshot_creator: self,
            metadata_migrator: self,
            index_creator: self,
            document_source: self,
            document_sink: self,
        }
    }

    pub fn target_doc_count(&self) -> usize {
        self.target.lock().expect("target").len()
    }
}

impl SnapshotMetadataSource for FakeCluster {
    fn indices(&self, _snapshot_name: &str) -> Result<Vec<IndexMetadata>, CollaboratorError> {
        Ok(self.indices.clone())
    }
}

impl SnapshotCreator for FakeCluster {
    fn create_snapshot(&self, snapshot_name: &str) -> Result<(), CollaboratorError> {
        self.snapshots_created
            .lock()
            .expect("snapshots")
            .push(snapshot_name.to_string());
        Ok(())
    }

    fn snapshot_state(&self, _snapshot_name: &str) -> Result<SnapshotState, CollaboratorError> {
        let mut remaining = self.snapshot_polls_remaining.lock().expect("polls");
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(SnapshotState::InProgress);
        }
        Ok(if self.snapshot_fails {
            SnapshotState::Failed
        } else {
            SnapshotState::Completed
        })
    }
}

impl MetadataMigrator for FakeCluster {
    fn migrate_templates(&self, _snapshot_name: &str) -> Result<(), CollaboratorError> {
        *self.templates_migrated.lock().expect("templates") += 1;
        Ok(())
    }
}

impl IndexCreator for FakeCluster {
    fn create_index(&self, _snapshot_name: &str, index_name: &str) -> Result<(), CollaboratorError> {
        self.index_creations
            .lock()
            .expect("creations")
            .push(index_name.to_string());
        if self.broken_indices.contains(index_name) {
            return Err(CollaboratorError::new(
                CollaboratorFailureKind::Rejected,
                format!("mapping rejected for {index_name}"),
            ));
        }
        Ok(())
    }
}

impl DocumentSource for FakeCluster {
    fn read_shard(
        &self,
        _snapshot_name: &str,
        index_name: &str,
        shard: u32,
    ) -> Result<DocumentStream<'_>, CollaboratorError> {
        let docs = self
            .documents
            .get(&(index_name.to_string(), shard))
            .ok_or_else(|| {
                CollaboratorError::new(
                    CollaboratorFailureKind::NotFound,
                    format!("{index_name}/{shard}"),
                )
            })?;
        Ok(Box::new(docs.iter().cloned().map(Ok)))
    }
}

impl DocumentSink for FakeCluster {
    fn send_bulk(
        &self,
        index_name: &str,
        documents: &[SourceDocument],
    ) -> Result<(), CollaboratorError> {
        {
            let mut target = self.target.lock().expect("target");
            for doc in documents {
                target.insert((index_name.to_string(), doc.id.clone()), doc.source.clone());
            }
        }
        self.bulks
            .lock()
            .expect("bulks")
            .push((index_name.to_string(), documents.len()));
        if let Some(hook) = &self.on_bulk {
            hook();
        }
        Ok(())
    }
}

/// Everything one worker needs, owned by the test.
pub struct Harness {
    pub clock: ManualClock,
    pub store: SqliteCoordinator,
    pub watchdog: Arc<LeaseWatchdog>,
    pub settings: MigrationSettings,
}

impl Harness {
    pub fn new(worker_id: &str, clock: &ManualClock) -> Self {
        Self {
            clock: clock.clone(),
            store: store(worker_id, clock),
            watchdog: watchdog(clock),
            settings: settings(),
        }
    }

    pub fn with_store(store: SqliteCoordinator, clock: &ManualClock) -> Self {
        Self {
            clock: clock.clone(),
            store,
            watchdog: watchdog(clock),
            settings: settings(),
        }
    }

    pub fn state<'a>(&'a self, cluster: &'a FakeCluster) -> WorkerState<'a> {
        let clock: Arc<dyn Clock> = Arc::new(self.clock.clone());
        WorkerState::new(
            &self.store,
            cluster.collaborators(),
            clock,
            &self.watchdog,
            &self.settings,
        )
    }
}

pub const SECOND: Duration = Duration::from_secs(1);
