//! Coordination store on an OpenSearch/Elasticsearch cluster. Work items are documents
//! in a dedicated index; every lease mutation is a painless script evaluated by the
//! cluster, so the conditional write happens where the document lives.

mod entries;
mod scripts;
mod transport;
mod work_items;

#[cfg(test)]
pub(crate) mod test_support;

pub use transport::ReqwestTransport;

use rfs_core::collaborators::{
    CollaboratorError, HttpMethod, HttpRequest, HttpResponse, HttpTransport,
};
use rfs_core::retry::{with_bounded_retries, REFRESH_RETRY, SETUP_RETRY};
use rfs_core::{Clock, CoordinationError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const WORK_ITEMS_INDEX: &str = ".migrations_working_state";
pub const ENTRIES_INDEX: &str = ".migrations_phase_state";

#[derive(Debug, Error)]
pub enum OpenSearchError {
    #[error("transport error: {0}")]
    Transport(#[from] CollaboratorError),
    #[error("{method} {path} returned {status}: {body}")]
    UnexpectedStatus {
        method: HttpMethod,
        path: String,
        status: u16,
        body: String,
    },
    #[error("malformed response from {path}: {message}")]
    MalformedResponse { path: String, message: String },
}

impl From<OpenSearchError> for CoordinationError {
    fn from(err: OpenSearchError) -> Self {
        match err {
            OpenSearchError::MalformedResponse { path, message } => {
                CoordinationError::MalformedResponse(format!("{path}: {message}"))
            }
            other => CoordinationError::backend(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSearchCoordinatorConfig {
    pub work_items_index: String,
    pub entries_index: String,
    pub tolerable_clock_drift: Duration,
}

impl Default for OpenSearchCoordinatorConfig {
    fn default() -> Self {
        Self {
            work_items_index: WORK_ITEMS_INDEX.to_string(),
            entries_index: ENTRIES_INDEX.to_string(),
            tolerable_clock_drift: Duration::from_secs(5),
        }
    }
}

pub struct OpenSearchCoordinator<T> {
    transport: T,
    worker_id: String,
    clock: Arc<dyn Clock>,
    config: OpenSearchCoordinatorConfig,
}

/// Parsed reply: status plus the JSON body, if there was one.
#[derive(Debug)]
pub(crate) struct Reply {
    pub status: u16,
    pub body: Value,
}

impl Reply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Every `reason` string in an error body, outermost first.
    pub fn error_reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        collect_reasons(&self.body, &mut reasons);
        reasons
    }

    pub fn error_type(&self) -> Option<&str> {
        self.body.pointer("/error/type").and_then(Value::as_str)
    }

    pub fn reason_with_prefix(&self, prefix: &str) -> Option<String> {
        self.error_reasons()
            .into_iter()
            .find_map(|reason| reason.strip_prefix(prefix).map(str::to_string))
    }
}

fn collect_reasons(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(reason)) = map.get("reason") {
                out.push(reason.clone());
            }
            for (key, nested) in map {
                if key != "reason" {
                    collect_reasons(nested, out);
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_reasons(item, out)),
        _ => {}
    }
}

impl<T: HttpTransport> OpenSearchCoordinator<T> {
    pub fn new(transport: T, worker_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            transport,
            worker_id: worker_id.into(),
            clock,
            config: OpenSearchCoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: OpenSearchCoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub(crate) fn send(&self, request: HttpRequest) -> Result<Reply, OpenSearchError> {
        let response: HttpResponse = self.transport.execute(&request)?;
        let body = if response.payload.is_empty() {
            Value::Null
        } else {
            response
                .json()
                .map_err(|err| OpenSearchError::MalformedResponse {
                    path: request.path.clone(),
                    message: err.to_string(),
                })?
        };
        Ok(Reply {
            status: response.status,
            body,
        })
    }

    pub(crate) fn unexpected(&self, request: &HttpRequest, reply: &Reply) -> OpenSearchError {
        OpenSearchError::UnexpectedStatus {
            method: request.method,
            path: request.path.clone(),
            status: reply.status,
            body: reply.body.to_string(),
        }
    }

    pub(crate) fn malformed(path: &str, message: impl Into<String>) -> OpenSearchError {
        OpenSearchError::MalformedResponse {
            path: path.to_string(),
            message: message.into(),
        }
    }

    /// Sends `request` and fails on any non-2xx status.
    pub(crate) fn send_ok(&self, request: HttpRequest) -> Result<Value, OpenSearchError> {
        let reply = self.send(request.clone())?;
        if !reply.is_success() {
            return Err(self.unexpected(&request, &reply));
        }
        Ok(reply.body)
    }

    fn create_index(&self, index: &str, mappings: &Value) -> Result<(), OpenSearchError> {
        let body = json!({
            "settings": { "index": { "number_of_shards": 1, "number_of_replicas": 1 } },
            "mappings": mappings,
        });
        let request = HttpRequest::json(HttpMethod::Put, format!("/{index}"), &body);
        let reply = self.send(request.clone())?;
        if reply.is_success() {
            debug!(event = "store_index_created", index);
            return Ok(());
        }
        if reply.status == 400 && reply.error_type() == Some("resource_already_exists_exception")
        {
            debug!(event = "store_index_exists", index);
            return Ok(());
        }
        Err(self.unexpected(&request, &reply))
    }

    pub(crate) fn setup_indices(&self) -> Result<(), CoordinationError> {
        let work_items_mapping = json!({
            "properties": {
                "expiration": { "type": "long" },
                "completedAt": { "type": "long" },
                "failedAt": { "type": "long" },
                "claimToken": { "type": "keyword", "norms": false },
                "leaseHolderId": { "type": "keyword", "norms": false },
                "status": { "type": "keyword", "norms": false },
                "numAttempts": { "type": "integer" },
                "scriptVersion": { "type": "keyword", "norms": false },
                "creatorId": { "type": "keyword", "norms": false }
            }
        });
        let entries_mapping = json!({
            "properties": {
                "type": { "type": "keyword" },
                "status": { "type": "keyword" },
                "name": { "type": "keyword" },
                "leaseExpiry": { "type": "keyword" },
                "numAttempts": { "type": "integer" }
            }
        });

        with_bounded_retries(self.clock.as_ref(), SETUP_RETRY, "setup", || {
            self.create_index(&self.config.work_items_index, &work_items_mapping)?;
            self.create_index(&self.config.entries_index, &entries_mapping)
        })
    }

    /// Visibility barrier so that searches observe preceding writes.
    pub(crate) fn refresh(&self, index: &str) -> Result<(), CoordinationError> {
        with_bounded_retries(self.clock.as_ref(), REFRESH_RETRY, "refresh", || {
            self.send_ok(HttpRequest::new(HttpMethod::Post, format!("/{index}/_refresh")))
                .map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use rfs_core::WorkCoordinator;

    #[test]
    fn setup_accepts_existing_indices() {
        let transport = ScriptedTransport::default();
        transport.respond(200, json!({ "acknowledged": true }));
        transport.respond(
            400,
            json!({ "error": { "type": "resource_already_exists_exception", "reason": "exists" }, "status": 400 }),
        );
        let coordinator = coordinator("w1", &transport);

        coordinator.setup().expect("setup");

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].path, "/.migrations_working_state");
        assert_eq!(requests[1].path, "/.migrations_phase_state");
        let mapping = requests[0].body_json().expect("mapping body");
        assert_eq!(
            mapping.pointer("/mappings/properties/expiration/type"),
            Some(&json!("long"))
        );
        assert_eq!(
            mapping.pointer("/mappings/properties/leaseHolderId/type"),
            Some(&json!("keyword"))
        );
        assert_eq!(
            mapping.pointer("/mappings/properties/failedAt/type"),
            Some(&json!("long"))
        );
    }

    #[test]
    fn setup_gives_up_after_bounded_retries() {
        let transport = ScriptedTransport::default();
        for _ in 0..SETUP_RETRY.max_attempts {
            transport.respond(503, json!({ "error": "unavailable" }));
        }
        let coordinator = coordinator("w1", &transport);

        let err = coordinator.setup().expect_err("exhausted");
        assert!(matches!(
            err,
            CoordinationError::RetriesExhausted {
                operation: "setup",
                attempts: 6,
                ..
            }
        ));
    }

    #[test]
    fn nested_reasons_are_collected() {
        let reply = Reply {
            status: 400,
            body: json!({
                "error": {
                    "type": "illegal_argument_exception",
                    "reason": "failed to execute script",
                    "caused_by": { "type": "illegal_argument_exception", "reason": "clock drift: server=42" }
                }
            }),
        };
        assert_eq!(
            reply.reason_with_prefix(scripts::CLOCK_DRIFT_PREFIX).as_deref(),
            Some("42")
        );
        assert_eq!(reply.error_reasons().len(), 2);
    }
}
