use crate::scripts::{
    CLAIM_LEASE, CLOCK_DRIFT_PREFIX, COMPLETE_WORK_ITEM, FAIL_WORK_ITEM, HELD_BY_PREFIX,
    SCRIPT_VERSION_MISMATCH_PREFIX,
};
use crate::{OpenSearchCoordinator, OpenSearchError, Reply};
use rfs_core::clock::from_epoch_seconds;
use rfs_core::collaborators::{HttpMethod, HttpRequest, HttpTransport};
use rfs_core::retry::assign_with_drift_retries;
use rfs_core::{
    AcquiredWork, AssignOneResult, CoordinationError, WorkAcquisitionOutcome, WorkCoordinator,
    WorkItem, SCRIPT_VERSION,
};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

fn parse_item(work_item_id: &str, source: Option<&Value>, path: &str) -> Result<WorkItem, OpenSearchError> {
    let source = source.ok_or_else(|| OpenSearchError::MalformedResponse {
        path: path.to_string(),
        message: format!("missing _source for {work_item_id}"),
    })?;
    let mut item: WorkItem =
        serde_json::from_value(source.clone()).map_err(|err| OpenSearchError::MalformedResponse {
            path: path.to_string(),
            message: err.to_string(),
        })?;
    item.id = work_item_id.to_string();
    Ok(item)
}

fn acquired(item: &WorkItem) -> AcquiredWork {
    AcquiredWork {
        work_item_id: item.id.clone(),
        lease_expiration: from_epoch_seconds(item.expiration),
        num_attempts: item.num_attempts,
    }
}

fn positive_lease(lease_duration: Duration) -> Result<(), CoordinationError> {
    if lease_duration.is_zero() {
        return Err(CoordinationError::InvalidArgument(
            "lease duration must be positive".to_string(),
        ));
    }
    Ok(())
}

fn unsettled() -> Value {
    json!([
        { "exists": { "field": "completedAt" } },
        { "exists": { "field": "failedAt" } }
    ])
}

/// Documents neither completed nor failed, whether or not they were ever leased.
fn incomplete_query() -> Value {
    json!({
        "bool": {
            "must": [{ "exists": { "field": "expiration" } }],
            "must_not": unsettled()
        }
    })
}

impl<T: HttpTransport> OpenSearchCoordinator<T> {
    /// Unique per claim request; a worker id alone does not identify the document a
    /// claim-any round stamped once a restarted worker reuses its id.
    fn claim_token(&self, client_ts: i64) -> String {
        format!("{}:{client_ts}:{:016x}", self.worker_id, rand::random::<u64>())
    }

    fn claim_script(&self, client_ts: i64, lease_duration: Duration, claim_token: &str) -> Value {
        json!({
            "lang": "painless",
            "source": CLAIM_LEASE,
            "params": {
                "clientTimestamp": client_ts,
                "expirationWindow": lease_duration.as_secs(),
                "workerId": self.worker_id,
                "scriptVersion": SCRIPT_VERSION,
                "tolerableDriftSecs": self.config.tolerable_clock_drift.as_secs(),
                "claimToken": claim_token,
            }
        })
    }

    /// Maps an exception thrown by one of the lease scripts to its protocol error.
    fn script_rejection(
        &self,
        work_item_id: &str,
        client_ts: i64,
        reply: &Reply,
    ) -> Option<CoordinationError> {
        if let Some(found) = reply.reason_with_prefix(SCRIPT_VERSION_MISMATCH_PREFIX) {
            return Some(CoordinationError::ScriptVersionMismatch {
                work_item_id: work_item_id.to_string(),
                found,
                expected: SCRIPT_VERSION.to_string(),
            });
        }
        if let Some(server) = reply
            .reason_with_prefix(CLOCK_DRIFT_PREFIX)
            .and_then(|raw| raw.trim().parse::<i64>().ok())
        {
            return Some(CoordinationError::ClockDrift {
                client_epoch_seconds: client_ts,
                server_epoch_seconds: server,
                tolerance_secs: self.config.tolerable_clock_drift.as_secs(),
            });
        }
        reply
            .reason_with_prefix(HELD_BY_PREFIX)
            .map(|holder| CoordinationError::LeaseOwnershipViolation {
                work_item_id: work_item_id.to_string(),
                worker_id: self.worker_id.clone(),
                holder: (holder != "null").then_some(holder),
            })
    }

    fn rejection_or_unexpected(
        &self,
        work_item_id: &str,
        client_ts: i64,
        request: &HttpRequest,
        reply: &Reply,
    ) -> CoordinationError {
        self.script_rejection(work_item_id, client_ts, reply)
            .unwrap_or_else(|| self.unexpected(request, reply).into())
    }

    fn assign_one(
        &self,
        lease_duration: Duration,
    ) -> Result<AssignOneResult<AcquiredWork>, CoordinationError> {
        let client_ts = self.clock.epoch_seconds();
        let claim_token = self.claim_token(client_ts);
        let index = &self.config.work_items_index;
        let body = json!({
            "query": {
                "function_score": {
                    "query": {
                        "bool": {
                            "filter": [{ "range": { "expiration": { "lt": client_ts } } }],
                            "must_not": unsettled()
                        }
                    },
                    "random_score": {},
                    "boost_mode": "replace"
                }
            },
            "script": self.claim_script(client_ts, lease_duration, &claim_token),
        });
        let request = HttpRequest::json(
            HttpMethod::Post,
            format!("/{index}/_update_by_query?refresh=true&max_docs=1"),
            &body,
        );
        let reply = self.send(request.clone())?;
        if reply.status == 409 {
            return Ok(AssignOneResult::VersionConflict);
        }
        let has_failures = reply
            .body
            .get("failures")
            .and_then(Value::as_array)
            .is_some_and(|failures| !failures.is_empty());
        if !reply.is_success() || has_failures {
            return Err(self.rejection_or_unexpected("*", client_ts, &request, &reply));
        }

        let count = |field: &str| reply.body.get(field).and_then(Value::as_u64).unwrap_or(0);
        if count("updated") > 0 {
            let work = self.find_assigned(&claim_token, &request.path)?;
            info!(
                event = "lease_claimed",
                work_item_id = %work.work_item_id,
                worker_id = %self.worker_id,
                expiration = work.lease_expiration.timestamp(),
                num_attempts = work.num_attempts
            );
            return Ok(AssignOneResult::Assigned(work));
        }
        if count("version_conflicts") > 0 {
            return Ok(AssignOneResult::VersionConflict);
        }
        if count("total") == 0 {
            return Ok(AssignOneResult::NothingToAcquire);
        }
        Ok(AssignOneResult::PotentialClockDrift)
    }

    /// The item the preceding claim-any round stamped with `claim_token`. The update ran
    /// with `refresh=true`, so the search sees it.
    fn find_assigned(
        &self,
        claim_token: &str,
        claim_path: &str,
    ) -> Result<AcquiredWork, CoordinationError> {
        let index = &self.config.work_items_index;
        let body = json!({
            "query": {
                "bool": {
                    "filter": [
                        { "term": { "leaseHolderId": self.worker_id } },
                        { "term": { "claimToken": claim_token } }
                    ]
                }
            },
            "size": 1
        });
        let path = format!("/{index}/_search");
        let result = self.send_ok(HttpRequest::json(HttpMethod::Post, path.clone(), &body))?;
        let hit = result
            .pointer("/hits/hits/0")
            .ok_or_else(|| Self::malformed(claim_path, "claimed item not found by holder search"))?;
        let id = hit
            .get("_id")
            .and_then(Value::as_str)
            .ok_or_else(|| Self::malformed(&path, "hit without _id"))?;
        let item = parse_item(id, hit.get("_source"), &path)?;
        Ok(acquired(&item))
    }
}

impl<T: HttpTransport> OpenSearchCoordinator<T> {
    /// Runs one of the holder-only settlement scripts. Returns whether the document
    /// changed; `false` means it was already completed or failed.
    fn settle(&self, work_item_id: &str, script: &str) -> Result<bool, CoordinationError> {
        let client_ts = self.clock.epoch_seconds();
        let index = &self.config.work_items_index;
        let body = json!({
            "script": {
                "lang": "painless",
                "source": script,
                "params": {
                    "workerId": self.worker_id,
                    "scriptVersion": SCRIPT_VERSION,
                }
            }
        });
        let request = HttpRequest::json(
            HttpMethod::Post,
            format!("/{index}/_update/{work_item_id}"),
            &body,
        );
        let reply = self.send(request.clone())?;
        if reply.status == 404 {
            return Err(CoordinationError::NotFound(work_item_id.to_string()));
        }
        if !reply.is_success() {
            return Err(self.rejection_or_unexpected(work_item_id, client_ts, &request, &reply));
        }

        match reply.body.get("result").and_then(Value::as_str) {
            Some("updated") => Ok(true),
            Some("noop") => Ok(false),
            other => Err(Self::malformed(
                &request.path,
                format!("unexpected update result {other:?}"),
            )
            .into()),
        }
    }
}

impl<T: HttpTransport> WorkCoordinator for OpenSearchCoordinator<T> {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn setup(&self) -> Result<(), CoordinationError> {
        self.setup_indices()
    }

    fn create_unassigned_work_item(&self, work_item_id: &str) -> Result<bool, CoordinationError> {
        let index = &self.config.work_items_index;
        let doc = WorkItem::unassigned(work_item_id, SCRIPT_VERSION, &self.worker_id);
        let body = serde_json::to_value(&doc)
            .map_err(|err| CoordinationError::InvalidArgument(err.to_string()))?;
        let request = HttpRequest::json(
            HttpMethod::Put,
            format!("/{index}/_create/{work_item_id}"),
            &body,
        );
        let reply = self.send(request.clone())?;
        match reply.status {
            200 | 201 => {
                debug!(event = "work_item_created", work_item_id, worker_id = %self.worker_id);
                Ok(true)
            }
            409 => Ok(false),
            _ => Err(self.unexpected(&request, &reply).into()),
        }
    }

    fn create_or_update_lease_for_work_item(
        &self,
        work_item_id: &str,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome, CoordinationError> {
        positive_lease(lease_duration)?;
        let client_ts = self.clock.epoch_seconds();
        let claim_token = self.claim_token(client_ts);
        let index = &self.config.work_items_index;
        let upsert = serde_json::to_value(WorkItem::unassigned(
            work_item_id,
            SCRIPT_VERSION,
            &self.worker_id,
        ))
        .map_err(|err| CoordinationError::InvalidArgument(err.to_string()))?;
        let body = json!({
            "scripted_upsert": true,
            "upsert": upsert,
            "script": self.claim_script(client_ts, lease_duration, &claim_token),
        });
        let request = HttpRequest::json(
            HttpMethod::Post,
            format!("/{index}/_update/{work_item_id}?_source=true"),
            &body,
        );
        let reply = self.send(request.clone())?;
        if reply.status == 409 {
            return Err(CoordinationError::LeaseLockHeldElsewhere {
                work_item_id: work_item_id.to_string(),
            });
        }
        if !reply.is_success() {
            return Err(self.rejection_or_unexpected(work_item_id, client_ts, &request, &reply));
        }

        let item = parse_item(work_item_id, reply.body.pointer("/get/_source"), &request.path)?;
        match reply.body.get("result").and_then(Value::as_str) {
            Some("created") | Some("updated") => {
                info!(
                    event = "lease_claimed",
                    work_item_id,
                    worker_id = %self.worker_id,
                    expiration = item.expiration,
                    num_attempts = item.num_attempts
                );
                Ok(WorkAcquisitionOutcome::Acquired(acquired(&item)))
            }
            Some("noop") if item.is_settled() => Ok(WorkAcquisitionOutcome::AlreadyCompleted),
            Some("noop")
                if item.lease_holder_id.as_deref() == Some(self.worker_id.as_str())
                    && item.expiration > client_ts =>
            {
                debug!(event = "lease_reaffirmed", work_item_id, worker_id = %self.worker_id);
                Ok(WorkAcquisitionOutcome::Acquired(acquired(&item)))
            }
            Some("noop") => {
                debug!(
                    event = "lease_held_elsewhere",
                    work_item_id,
                    holder = ?item.lease_holder_id,
                    expiration = item.expiration
                );
                Err(CoordinationError::LeaseLockHeldElsewhere {
                    work_item_id: work_item_id.to_string(),
                })
            }
            other => Err(Self::malformed(
                &request.path,
                format!("unexpected update result {other:?}"),
            )
            .into()),
        }
    }

    fn acquire_next_work_item(
        &self,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome, CoordinationError> {
        positive_lease(lease_duration)?;
        let assigned =
            assign_with_drift_retries(self.clock.as_ref(), || self.assign_one(lease_duration))?;
        Ok(match assigned {
            Some(work) => WorkAcquisitionOutcome::Acquired(work),
            None => WorkAcquisitionOutcome::NoAvailableWork,
        })
    }

    fn complete_work_item(&self, work_item_id: &str) -> Result<(), CoordinationError> {
        if self.settle(work_item_id, COMPLETE_WORK_ITEM)? {
            info!(
                event = "work_item_completed",
                work_item_id,
                worker_id = %self.worker_id
            );
        } else {
            debug!(event = "work_item_already_settled", work_item_id);
        }
        self.refresh(&self.config.work_items_index)
    }

    fn fail_work_item(&self, work_item_id: &str) -> Result<(), CoordinationError> {
        if self.settle(work_item_id, FAIL_WORK_ITEM)? {
            warn!(
                event = "work_item_failed",
                work_item_id,
                worker_id = %self.worker_id
            );
        } else {
            debug!(event = "work_item_already_settled", work_item_id);
        }
        self.refresh(&self.config.work_items_index)
    }

    fn num_work_items_pending(&self) -> Result<u64, CoordinationError> {
        let index = &self.config.work_items_index;
        self.refresh(index)?;
        let path = format!("/{index}/_count");
        let body = self.send_ok(HttpRequest::json(
            HttpMethod::Post,
            path.clone(),
            &json!({ "query": incomplete_query() }),
        ))?;
        body.get("count")
            .and_then(Value::as_u64)
            .ok_or_else(|| Self::malformed(&path, "missing count").into())
    }

    fn get_work_item(&self, work_item_id: &str) -> Result<Option<WorkItem>, CoordinationError> {
        let index = &self.config.work_items_index;
        let request = HttpRequest::new(HttpMethod::Get, format!("/{index}/_doc/{work_item_id}"));
        let reply = self.send(request.clone())?;
        if reply.status == 404 {
            return Ok(None);
        }
        if !reply.is_success() {
            return Err(self.unexpected(&request, &reply).into());
        }
        if reply.body.get("found").and_then(Value::as_bool) == Some(false) {
            return Ok(None);
        }
        Ok(Some(parse_item(
            work_item_id,
            reply.body.get("_source"),
            &request.path,
        )?))
    }
}
