//! Narrow interfaces to the systems the migration drives but does not implement:
//! the snapshot repository, the target cluster, and the HTTP transport under the
//! document-store backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollaboratorFailureKind {
    Unreachable,
    Rejected,
    NotFound,
    Io,
    Malformed,
}

impl CollaboratorFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollaboratorFailureKind::Unreachable => "unreachable",
            CollaboratorFailureKind::Rejected => "rejected",
            CollaboratorFailureKind::NotFound => "not_found",
            CollaboratorFailureKind::Io => "io",
            CollaboratorFailureKind::Malformed => "malformed",
        }
    }
}

impl fmt::Display for CollaboratorFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct CollaboratorError {
    pub kind: CollaboratorFailureKind,
    pub message: String,
}

impl CollaboratorError {
    pub fn new(kind: CollaboratorFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub shards: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source")]
    pub source: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotState {
    InProgress,
    Completed,
    Failed,
}

/// Enumerates the indices (and their shard counts) captured in a snapshot.
pub trait SnapshotMetadataSource {
    fn indices(&self, snapshot_name: &str) -> Result<Vec<IndexMetadata>, CollaboratorError>;
}

pub trait SnapshotCreator {
    /// Initiates the snapshot. Must tolerate being called again for the same name.
    fn create_snapshot(&self, snapshot_name: &str) -> Result<(), CollaboratorError>;

    fn snapshot_state(&self, snapshot_name: &str) -> Result<SnapshotState, CollaboratorError>;
}

pub trait MetadataMigrator {
    fn migrate_templates(&self, snapshot_name: &str) -> Result<(), CollaboratorError>;
}

pub trait IndexCreator {
    /// Idempotent: creating an index that already exists succeeds.
    fn create_index(&self, snapshot_name: &str, index_name: &str)
        -> Result<(), CollaboratorError>;
}

pub type DocumentStream<'a> =
    Box<dyn Iterator<Item = Result<SourceDocument, CollaboratorError>> + 'a>;

pub trait DocumentSource {
    fn read_shard(
        &self,
        snapshot_name: &str,
        index_name: &str,
        shard: u32,
    ) -> Result<DocumentStream<'_>, CollaboratorError>;
}

pub trait DocumentSink {
    /// Idempotent per document id.
    fn send_bulk(
        &self,
        index_name: &str,
        documents: &[SourceDocument],
    ) -> Result<(), CollaboratorError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Path and query, relative to the store's base URL.
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn json(method: HttpMethod, path: impl Into<String>, body: &Value) -> Self {
        let mut request = Self::new(method, path);
        request
            .headers
            .push(("Content-Type".to_string(), "application/json".to_string()));
        request.body = Some(body.to_string().into_bytes());
        request
    }

    pub fn body_json(&self) -> Option<Value> {
        self.body
            .as_deref()
            .and_then(|body| serde_json::from_slice(body).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub payload: Vec<u8>,
}

impl HttpResponse {
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

pub trait HttpTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, CollaboratorError>;
}

impl<T: HttpTransport + ?Sized> HttpTransport for &T {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse, CollaboratorError> {
        (**self).execute(request)
    }
}
