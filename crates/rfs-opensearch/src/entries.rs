//! Phase and child entries on the cluster. The store has no compare-and-swap on
//! document content, so an update re-reads the entry, compares it with the caller's
//! copy, and writes with `if_seq_no`/`if_primary_term`; a concurrent writer in between
//! surfaces as 409 and is reported like any other mismatch.

use crate::{OpenSearchCoordinator, OpenSearchError};
use rfs_core::collaborators::{HttpMethod, HttpRequest, HttpTransport};
use rfs_core::{
    CoordinationError, EntryStore, IndexWorkEntry, IndexWorkStatus, Phase, PhaseEntry,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

/// A stored entry together with the version it was read at.
struct Versioned<E> {
    entry: E,
    seq_no: u64,
    primary_term: u64,
}

fn to_document<E: Serialize>(entry: &E, entry_type: Option<&str>) -> Result<Value, CoordinationError> {
    let mut doc =
        serde_json::to_value(entry).map_err(|err| CoordinationError::InvalidArgument(err.to_string()))?;
    if let (Some(entry_type), Value::Object(map)) = (entry_type, &mut doc) {
        map.insert("type".to_string(), json!(entry_type));
    }
    Ok(doc)
}

impl<T: HttpTransport> OpenSearchCoordinator<T> {
    fn entry_path(&self, entry_id: &str) -> String {
        format!("/{}/_doc/{entry_id}", self.config.entries_index)
    }

    fn read_versioned<E: DeserializeOwned>(
        &self,
        entry_id: &str,
    ) -> Result<Option<Versioned<E>>, CoordinationError> {
        let request = HttpRequest::new(HttpMethod::Get, self.entry_path(entry_id));
        let reply = self.send(request.clone())?;
        if reply.status == 404 || reply.body.get("found").and_then(Value::as_bool) == Some(false) {
            return Ok(None);
        }
        if !reply.is_success() {
            return Err(self.unexpected(&request, &reply).into());
        }

        let field = |name: &str| {
            reply
                .body
                .get(name)
                .and_then(Value::as_u64)
                .ok_or_else(|| Self::malformed(&request.path, format!("missing {name}")))
        };
        let seq_no = field("_seq_no")?;
        let primary_term = field("_primary_term")?;
        let source = reply
            .body
            .get("_source")
            .cloned()
            .ok_or_else(|| Self::malformed(&request.path, "missing _source"))?;
        let entry = serde_json::from_value(source)
            .map_err(|err| Self::malformed(&request.path, err.to_string()))?;
        Ok(Some(Versioned {
            entry,
            seq_no,
            primary_term,
        }))
    }

    fn create_document(&self, entry_id: &str, doc: &Value) -> Result<bool, CoordinationError> {
        let request = HttpRequest::json(
            HttpMethod::Put,
            format!("/{}/_create/{entry_id}?refresh=true", self.config.entries_index),
            doc,
        );
        let reply = self.send(request.clone())?;
        match reply.status {
            200 | 201 => Ok(true),
            409 => Ok(false),
            _ => Err(self.unexpected(&request, &reply).into()),
        }
    }

    /// Replaces the stored entry only if it still equals `expected`.
    fn swap_document<E>(
        &self,
        entry_id: &str,
        doc: &Value,
        expected: &E,
    ) -> Result<bool, CoordinationError>
    where
        E: DeserializeOwned + PartialEq,
    {
        let Some(current) = self.read_versioned::<E>(entry_id)? else {
            return Ok(false);
        };
        if current.entry != *expected {
            return Ok(false);
        }

        let request = HttpRequest::json(
            HttpMethod::Put,
            format!(
                "{}?if_seq_no={}&if_primary_term={}&refresh=true",
                self.entry_path(entry_id),
                current.seq_no,
                current.primary_term
            ),
            doc,
        );
        let reply = self.send(request.clone())?;
        match reply.status {
            200 | 201 => Ok(true),
            409 => Ok(false),
            _ => Err(self.unexpected(&request, &reply).into()),
        }
    }
}

impl<T: HttpTransport> EntryStore for OpenSearchCoordinator<T> {
    fn get_phase_entry(&self, phase: Phase) -> Result<Option<PhaseEntry>, CoordinationError> {
        Ok(self
            .read_versioned::<PhaseEntry>(phase.entry_id())?
            .map(|versioned| versioned.entry))
    }

    fn create_phase_entry(
        &self,
        entry: &PhaseEntry,
    ) -> Result<Option<PhaseEntry>, CoordinationError> {
        let created = self.create_document(entry.id(), &to_document(entry, None)?)?;
        if created {
            debug!(event = "phase_entry_created", phase = %entry.phase, status = %entry.status);
        }
        Ok(created.then(|| entry.clone()))
    }

    fn update_phase_entry(
        &self,
        updated: &PhaseEntry,
        expected: &PhaseEntry,
    ) -> Result<Option<PhaseEntry>, CoordinationError> {
        if updated.phase != expected.phase {
            return Err(CoordinationError::InvalidArgument(format!(
                "cannot replace {} entry with {} entry",
                expected.phase, updated.phase
            )));
        }
        let swapped = self.swap_document(updated.id(), &to_document(updated, None)?, expected)?;
        if swapped {
            debug!(
                event = "phase_entry_updated",
                phase = %updated.phase,
                status = %updated.status,
                num_attempts = updated.num_attempts
            );
        } else {
            debug!(event = "phase_entry_update_dropped", phase = %updated.phase);
        }
        Ok(swapped.then(|| updated.clone()))
    }

    fn create_index_work_entry(&self, entry: &IndexWorkEntry) -> Result<bool, CoordinationError> {
        self.create_document(
            &entry.id(),
            &to_document(entry, Some(IndexWorkEntry::ENTRY_TYPE))?,
        )
    }

    fn get_index_work_entry(
        &self,
        index_name: &str,
    ) -> Result<Option<IndexWorkEntry>, CoordinationError> {
        Ok(self
            .read_versioned::<IndexWorkEntry>(&IndexWorkEntry::id_for(index_name))?
            .map(|versioned| versioned.entry))
    }

    fn index_work_entries_to_migrate(
        &self,
        limit: usize,
    ) -> Result<Vec<IndexWorkEntry>, CoordinationError> {
        let index = &self.config.entries_index;
        self.refresh(index)?;
        let path = format!("/{index}/_search");
        let body = json!({
            "query": {
                "bool": {
                    "filter": [
                        { "term": { "type": IndexWorkEntry::ENTRY_TYPE } },
                        { "term": { "status": IndexWorkStatus::NotStarted.as_str() } }
                    ]
                }
            },
            "sort": [{ "name": { "order": "asc" } }],
            "size": limit
        });
        let result = self.send_ok(HttpRequest::json(HttpMethod::Post, path.clone(), &body))?;
        let hits = result
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .ok_or_else(|| Self::malformed(&path, "missing hits"))?;

        hits.iter()
            .map(|hit| {
                let source = hit
                    .get("_source")
                    .cloned()
                    .ok_or_else(|| Self::malformed(&path, "hit without _source"))?;
                serde_json::from_value(source)
                    .map_err(|err| Self::malformed(&path, err.to_string()))
            })
            .collect::<Result<Vec<_>, OpenSearchError>>()
            .map_err(CoordinationError::from)
    }

    fn update_index_work_entry(
        &self,
        updated: &IndexWorkEntry,
        expected: &IndexWorkEntry,
    ) -> Result<Option<IndexWorkEntry>, CoordinationError> {
        if updated.name != expected.name {
            return Err(CoordinationError::InvalidArgument(format!(
                "cannot replace index entry {} with {}",
                expected.name, updated.name
            )));
        }
        let doc = to_document(updated, Some(IndexWorkEntry::ENTRY_TYPE))?;
        let swapped = self.swap_document(&updated.id(), &doc, expected)?;
        if !swapped {
            debug!(event = "index_entry_update_dropped", index = %updated.name);
        }
        Ok(swapped.then(|| updated.clone()))
    }

    fn force_update_index_work_entry(
        &self,
        updated: &IndexWorkEntry,
    ) -> Result<IndexWorkEntry, CoordinationError> {
        let doc = to_document(updated, Some(IndexWorkEntry::ENTRY_TYPE))?;
        self.send_ok(HttpRequest::json(
            HttpMethod::Put,
            format!("{}?refresh=true", self.entry_path(&updated.id())),
            &doc,
        ))?;
        info!(
            event = "index_entry_forced",
            index = %updated.name,
            status = %updated.status
        );
        Ok(updated.clone())
    }
}
