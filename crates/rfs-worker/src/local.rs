//! Filesystem stand-ins for the snapshot repository and the target cluster.
//!
//! The source directory holds `manifest.json` plus `<index>/<shard>.ndjson`; the target
//! directory receives `templates.json`, one directory per created index and one JSON
//! file per document id.

use rfs_core::collaborators::{
    CollaboratorError, CollaboratorFailureKind, DocumentSink, DocumentSource, DocumentStream,
    IndexCreator, IndexMetadata, MetadataMigrator, SnapshotCreator, SnapshotMetadataSource,
    SnapshotState, SourceDocument,
};
use rfs_migration::Collaborators;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const TEMPLATES_FILE: &str = "templates.json";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SnapshotManifest {
    #[serde(default)]
    pub indices: Vec<IndexMetadata>,
    #[serde(default)]
    pub templates: Value,
}

pub struct LocalCluster {
    source_dir: PathBuf,
    target_dir: PathBuf,
}

fn io_error(path: &Path, err: io::Error) -> CollaboratorError {
    let kind = if err.kind() == io::ErrorKind::NotFound {
        CollaboratorFailureKind::NotFound
    } else {
        CollaboratorFailureKind::Io
    };
    CollaboratorError::new(kind, format!("{}: {err}", path.display()))
}

fn malformed(path: &Path, err: impl std::fmt::Display) -> CollaboratorError {
    CollaboratorError::new(
        CollaboratorFailureKind::Malformed,
        format!("{}: {err}", path.display()),
    )
}

/// Anything outside `[A-Za-z0-9._-]`, and a leading `.`, is hex-escaped so the result is
/// always one plain path component.
fn escape_file_name(raw: &str) -> String {
    let mut name = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        let plain = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_')
            || (byte == b'.' && !name.is_empty());
        if plain {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

pub fn document_file_name(id: &str) -> String {
    format!("{}.json", escape_file_name(id))
}

/// Directory name an index gets under the target directory.
pub fn index_dir_name(index_name: &str) -> String {
    escape_file_name(index_name)
}

impl LocalCluster {
    pub fn new(source_dir: impl Into<PathBuf>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            target_dir: target_dir.into(),
        }
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

    pub fn manifest(&self) -> Result<SnapshotManifest, CollaboratorError> {
        let path = self.source_dir.join(MANIFEST_FILE);
        let contents = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
        serde_json::from_str(&contents).map_err(|err| malformed(&path, err))
    }

    fn index_dir(&self, index_name: &str) -> PathBuf {
        self.target_dir.join(index_dir_name(index_name))
    }

    /// Snapshot shards live under the index's own name, which must therefore be a
    /// single plain directory name.
    fn source_index_dir(&self, index_name: &str) -> Result<PathBuf, CollaboratorError> {
        let mut components = Path::new(index_name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Ok(self.source_dir.join(index_name)),
            _ => Err(CollaboratorError::new(
                CollaboratorFailureKind::Malformed,
                format!("index name {index_name:?} is not a plain directory name"),
            )),
        }
    }
}

impl SnapshotMetadataSource for LocalCluster {
    fn indices(&self, _snapshot_name: &str) -> Result<Vec<IndexMetadata>, CollaboratorError> {
        Ok(self.manifest()?.indices)
    }
}

impl SnapshotCreator for LocalCluster {
    /// The source directory already is the snapshot; creating it only validates the
    /// manifest.
    fn create_snapshot(&self, snapshot_name: &str) -> Result<(), CollaboratorError> {
        let manifest = self.manifest()?;
        info!(
            event = "local_snapshot_ready",
            snapshot = snapshot_name,
            indices = manifest.indices.len()
        );
        Ok(())
    }

    fn snapshot_state(&self, _snapshot_name: &str) -> Result<SnapshotState, CollaboratorError> {
        match self.manifest() {
            Ok(_) => Ok(SnapshotState::Completed),
            Err(err) if err.kind == CollaboratorFailureKind::Malformed => {
                Ok(SnapshotState::Failed)
            }
            Err(err) => Err(err),
        }
    }
}

impl MetadataMigrator for LocalCluster {
    fn migrate_templates(&self, _snapshot_name: &str) -> Result<(), CollaboratorError> {
        let manifest = self.manifest()?;
        fs::create_dir_all(&self.target_dir).map_err(|err| io_error(&self.target_dir, err))?;
        let path = self.target_dir.join(TEMPLATES_FILE);
        let body = serde_json::to_vec_pretty(&manifest.templates)
            .map_err(|err| malformed(&path, err))?;
        fs::write(&path, body).map_err(|err| io_error(&path, err))
    }
}

impl IndexCreator for LocalCluster {
    fn create_index(
        &self,
        _snapshot_name: &str,
        index_name: &str,
    ) -> Result<(), CollaboratorError> {
        let path = self.index_dir(index_name);
        fs::create_dir_all(&path).map_err(|err| io_error(&path, err))?;
        debug!(event = "local_index_created", index = index_name);
        Ok(())
    }
}

impl DocumentSource for LocalCluster {
    fn read_shard(
        &self,
        _snapshot_name: &str,
        index_name: &str,
        shard: u32,
    ) -> Result<DocumentStream<'_>, CollaboratorError> {
        let path = self
            .source_index_dir(index_name)?
            .join(format!("{shard}.ndjson"));
        let file = fs::File::open(&path).map_err(|err| io_error(&path, err))?;
        let lines = BufReader::new(file).lines();
        Ok(Box::new(lines.filter_map(move |line| match line {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(
                serde_json::from_str::<SourceDocument>(&line).map_err(|err| malformed(&path, err)),
            ),
            Err(err) => Some(Err(io_error(&path, err))),
        })))
    }
}

impl DocumentSink for LocalCluster {
    fn send_bulk(
        &self,
        index_name: &str,
        documents: &[SourceDocument],
    ) -> Result<(), CollaboratorError> {
        let dir = self.index_dir(index_name);
        fs::create_dir_all(&dir).map_err(|err| io_error(&dir, err))?;
        for document in documents {
            let path = dir.join(document_file_name(&document.id));
            let body =
                serde_json::to_vec(&document.source).map_err(|err| malformed(&path, err))?;
            fs::write(&path, body).map_err(|err| io_error(&path, err))?;
        }
        debug!(
            event = "local_bulk_written",
            index = index_name,
            documents = documents.len()
        );
        Ok(())
    }
}
