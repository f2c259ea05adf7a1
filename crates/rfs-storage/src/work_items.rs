use crate::{sql, SqliteCoordinator};
use rfs_core::clock::from_epoch_seconds;
use rfs_core::lease::check_clock_drift;
use rfs_core::retry::{assign_with_drift_retries, with_bounded_retries, SETUP_RETRY};
use rfs_core::{
    AcquiredWork, AssignOneResult, ClaimDecision, CoordinationError, WorkAcquisitionOutcome,
    WorkCoordinator, WorkItem, SCRIPT_VERSION,
};
use rusqlite::{params, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::time::Duration;
use tracing::{debug, info, warn};

const WORK_ITEM_COLUMNS: &str = "
    work_item_id,
    script_version,
    creator_id,
    lease_holder_id,
    expiration,
    num_attempts,
    completed_at,
    failed_at
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Completed,
    Failed,
}

impl Settlement {
    fn update_sql(self) -> &'static str {
        match self {
            Settlement::Completed => {
                "
                UPDATE work_items
                SET completed_at = ?1
                WHERE work_item_id = ?2
                  AND lease_holder_id = ?3
                  AND completed_at IS NULL
                  AND failed_at IS NULL
                "
            }
            Settlement::Failed => {
                "
                UPDATE work_items
                SET failed_at = ?1
                WHERE work_item_id = ?2
                  AND lease_holder_id = ?3
                  AND completed_at IS NULL
                  AND failed_at IS NULL
                "
            }
        }
    }
}

impl SqliteCoordinator {
    /// Reads store time inside the write transaction and advances the high-water mark to
    /// this worker's clock. The new mark only lands if the transaction commits.
    fn begin(&self, tx: &Transaction<'_>) -> Result<(i64, i64), CoordinationError> {
        let client_ts = self.clock.epoch_seconds();
        let high_water: i64 = tx
            .query_row("SELECT high_water FROM store_clock WHERE id = 1", [], |row| {
                row.get(0)
            })
            .map_err(sql)?;
        let server_ts = high_water.max(client_ts);
        check_clock_drift(client_ts, server_ts, self.config.tolerable_clock_drift)?;
        if client_ts > high_water {
            tx.execute(
                "UPDATE store_clock SET high_water = ?1 WHERE id = 1",
                [client_ts],
            )
            .map_err(sql)?;
        }
        Ok((client_ts, server_ts))
    }

    fn settle_work_item(
        &self,
        work_item_id: &str,
        settlement: Settlement,
    ) -> Result<(), CoordinationError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql)?;
        let (_, server_ts) = self.begin(&tx)?;

        let item = select_work_item(&tx, work_item_id)?
            .ok_or_else(|| CoordinationError::NotFound(work_item_id.to_string()))?;
        ensure_script_version(&item)?;
        if item.lease_holder_id.as_deref() != Some(self.worker_id.as_str()) {
            return Err(CoordinationError::LeaseOwnershipViolation {
                work_item_id: work_item_id.to_string(),
                worker_id: self.worker_id.clone(),
                holder: item.lease_holder_id,
            });
        }
        if item.is_settled() {
            debug!(
                event = "work_item_already_settled",
                work_item_id,
                completed = item.is_completed(),
                failed = item.is_failed()
            );
            return Ok(());
        }

        let changes = tx
            .execute(
                settlement.update_sql(),
                params![server_ts, work_item_id, self.worker_id],
            )
            .map_err(sql)?;
        if changes == 0 {
            return Err(CoordinationError::LeaseOwnershipViolation {
                work_item_id: work_item_id.to_string(),
                worker_id: self.worker_id.clone(),
                holder: None,
            });
        }
        tx.commit().map_err(sql)?;

        match settlement {
            Settlement::Completed => info!(
                event = "work_item_completed",
                work_item_id,
                worker_id = %self.worker_id,
                completed_at = server_ts
            ),
            Settlement::Failed => warn!(
                event = "work_item_failed",
                work_item_id,
                worker_id = %self.worker_id,
                num_attempts = item.num_attempts,
                failed_at = server_ts
            ),
        }
        Ok(())
    }

    fn assign_one(
        &self,
        lease_duration: Duration,
    ) -> Result<AssignOneResult<AcquiredWork>, CoordinationError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql)?;
        let (client_ts, server_ts) = self.begin(&tx)?;

        let candidate = tx
            .query_row(
                &format!(
                    "
                    SELECT {WORK_ITEM_COLUMNS}
                    FROM work_items
                    WHERE completed_at IS NULL
                      AND failed_at IS NULL
                      AND expiration < ?1
                    ORDER BY random()
                    LIMIT 1
                    "
                ),
                [server_ts],
                map_work_item,
            )
            .optional()
            .map_err(sql)?;
        let Some(item) = candidate else {
            return Ok(AssignOneResult::NothingToAcquire);
        };
        ensure_script_version(&item)?;

        let ClaimDecision::Claim {
            expiration,
            num_attempts,
        } = item.evaluate_claim(&self.worker_id, client_ts, server_ts, lease_duration)
        else {
            return Ok(AssignOneResult::PotentialClockDrift);
        };

        let claimed = item.claimed_by(&self.worker_id, expiration, num_attempts);
        if !write_claim(&tx, Some(&item), &claimed)? {
            return Ok(AssignOneResult::VersionConflict);
        }
        tx.commit().map_err(sql)?;

        info!(
            event = "lease_claimed",
            work_item_id = %claimed.id,
            worker_id = %self.worker_id,
            expiration,
            num_attempts
        );
        Ok(AssignOneResult::Assigned(AcquiredWork {
            work_item_id: claimed.id,
            lease_expiration: from_epoch_seconds(expiration),
            num_attempts,
        }))
    }
}

impl WorkCoordinator for SqliteCoordinator {
    fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn setup(&self) -> Result<(), CoordinationError> {
        with_bounded_retries(self.clock.as_ref(), SETUP_RETRY, "setup", || self.migrate())
    }

    fn create_unassigned_work_item(&self, work_item_id: &str) -> Result<bool, CoordinationError> {
        let conn = self.lock()?;
        let changes = conn
            .execute(
                "
                INSERT OR IGNORE INTO work_items (
                    work_item_id,
                    script_version,
                    creator_id,
                    expiration,
                    num_attempts
                ) VALUES (?1, ?2, ?3, 0, 0)
                ",
                params![work_item_id, SCRIPT_VERSION, self.worker_id],
            )
            .map_err(sql)?;

        if changes > 0 {
            debug!(event = "work_item_created", work_item_id, worker_id = %self.worker_id);
        }
        Ok(changes > 0)
    }

    fn create_or_update_lease_for_work_item(
        &self,
        work_item_id: &str,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome, CoordinationError> {
        if lease_duration.is_zero() {
            return Err(CoordinationError::InvalidArgument(
                "lease duration must be positive".to_string(),
            ));
        }

        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(sql)?;
        let (client_ts, server_ts) = self.begin(&tx)?;

        let existing = select_work_item(&tx, work_item_id)?;
        let item = existing.clone().unwrap_or_else(|| {
            WorkItem::unassigned(work_item_id, SCRIPT_VERSION, &self.worker_id)
        });
        ensure_script_version(&item)?;

        let outcome = match item.evaluate_claim(&self.worker_id, client_ts, server_ts, lease_duration)
        {
            ClaimDecision::Claim {
                expiration,
                num_attempts,
            } => {
                let claimed = item.claimed_by(&self.worker_id, expiration, num_attempts);
                if !write_claim(&tx, existing.as_ref(), &claimed)? {
                    return Err(CoordinationError::LeaseLockHeldElsewhere {
                        work_item_id: work_item_id.to_string(),
                    });
                }
                info!(
                    event = "lease_claimed",
                    work_item_id,
                    worker_id = %self.worker_id,
                    expiration,
                    num_attempts,
                    created = existing.is_none()
                );
                WorkAcquisitionOutcome::Acquired(AcquiredWork {
                    work_item_id: work_item_id.to_string(),
                    lease_expiration: from_epoch_seconds(expiration),
                    num_attempts,
                })
            }
            ClaimDecision::Reaffirm => {
                debug!(event = "lease_reaffirmed", work_item_id, worker_id = %self.worker_id);
                WorkAcquisitionOutcome::Acquired(AcquiredWork {
                    work_item_id: work_item_id.to_string(),
                    lease_expiration: from_epoch_seconds(item.expiration),
                    num_attempts: item.num_attempts,
                })
            }
            ClaimDecision::AlreadyCompleted => WorkAcquisitionOutcome::AlreadyCompleted,
            ClaimDecision::HeldElsewhere => {
                debug!(
                    event = "lease_held_elsewhere",
                    work_item_id,
                    holder = ?item.lease_holder_id,
                    expiration = item.expiration
                );
                return Err(CoordinationError::LeaseLockHeldElsewhere {
                    work_item_id: work_item_id.to_string(),
                });
            }
        };

        tx.commit().map_err(sql)?;
        Ok(outcome)
    }

    fn acquire_next_work_item(
        &self,
        lease_duration: Duration,
    ) -> Result<WorkAcquisitionOutcome, CoordinationError> {
        if lease_duration.is_zero() {
            return Err(CoordinationError::InvalidArgument(
                "lease duration must be positive".to_string(),
            ));
        }

        let assigned =
            assign_with_drift_retries(self.clock.as_ref(), || self.assign_one(lease_duration))?;
        Ok(match assigned {
            Some(work) => WorkAcquisitionOutcome::Acquired(work),
            None => WorkAcquisitionOutcome::NoAvailableWork,
        })
    }

    fn complete_work_item(&self, work_item_id: &str) -> Result<(), CoordinationError> {
        self.settle_work_item(work_item_id, Settlement::Completed)
    }

    fn fail_work_item(&self, work_item_id: &str) -> Result<(), CoordinationError> {
        self.settle_work_item(work_item_id, Settlement::Failed)
    }

    fn num_work_items_pending(&self) -> Result<u64, CoordinationError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "
                SELECT COUNT(*)
                FROM work_items
                WHERE expiration IS NOT NULL
                  AND completed_at IS NULL
                  AND failed_at IS NULL
                ",
                [],
                |row| row.get(0),
            )
            .map_err(sql)?;
        Ok(count.max(0) as u64)
    }

    fn get_work_item(&self, work_item_id: &str) -> Result<Option<WorkItem>, CoordinationError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE work_item_id = ?1"),
            [work_item_id],
            map_work_item,
        )
        .optional()
        .map_err(sql)
    }
}

fn select_work_item(
    tx: &Transaction<'_>,
    work_item_id: &str,
) -> Result<Option<WorkItem>, CoordinationError> {
    tx.query_row(
        &format!("SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE work_item_id = ?1"),
        [work_item_id],
        map_work_item,
    )
    .optional()
    .map_err(sql)
}

/// Persists a claim conditioned on the row still matching what was read.
fn write_claim(
    tx: &Transaction<'_>,
    previous: Option<&WorkItem>,
    claimed: &WorkItem,
) -> Result<bool, CoordinationError> {
    let changes = match previous {
        None => tx.execute(
            "
            INSERT OR IGNORE INTO work_items (
                work_item_id,
                script_version,
                creator_id,
                lease_holder_id,
                expiration,
                num_attempts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                claimed.id,
                claimed.script_version,
                claimed.creator_id,
                claimed.lease_holder_id,
                claimed.expiration,
                claimed.num_attempts,
            ],
        ),
        Some(previous) => tx.execute(
            "
            UPDATE work_items
            SET lease_holder_id = ?1,
                expiration = ?2,
                num_attempts = ?3
            WHERE work_item_id = ?4
              AND expiration = ?5
              AND num_attempts = ?6
              AND completed_at IS NULL
              AND failed_at IS NULL
            ",
            params![
                claimed.lease_holder_id,
                claimed.expiration,
                claimed.num_attempts,
                claimed.id,
                previous.expiration,
                previous.num_attempts,
            ],
        ),
    }
    .map_err(sql)?;
    Ok(changes > 0)
}

fn ensure_script_version(item: &WorkItem) -> Result<(), CoordinationError> {
    if item.script_version != SCRIPT_VERSION {
        return Err(CoordinationError::ScriptVersionMismatch {
            work_item_id: item.id.clone(),
            found: item.script_version.clone(),
            expected: SCRIPT_VERSION.to_string(),
        });
    }
    Ok(())
}

fn map_work_item(row: &Row<'_>) -> rusqlite::Result<WorkItem> {
    Ok(WorkItem {
        id: row.get(0)?,
        script_version: row.get(1)?,
        creator_id: row.get(2)?,
        lease_holder_id: row.get(3)?,
        expiration: row.get(4)?,
        num_attempts: row.get::<_, i64>(5)?.clamp(0, u32::MAX as i64) as u32,
        completed_at: row.get(6)?,
        failed_at: row.get(7)?,
    })
}
