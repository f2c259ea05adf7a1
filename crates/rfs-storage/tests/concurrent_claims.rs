use chrono::{DateTime, TimeZone, Utc};
use rfs_core::{Clock, CoordinationError, ManualClock, WorkAcquisitionOutcome, WorkCoordinator};
use rfs_storage::SqliteCoordinator;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tempfile::NamedTempFile;

const LEASE: Duration = Duration::from_secs(30);

fn ts() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
        .single()
        .expect("valid timestamp")
}

fn open_workers(path: &Path, clock: &ManualClock, count: usize) -> Vec<SqliteCoordinator> {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let workers: Vec<_> = (0..count)
        .map(|idx| {
            SqliteCoordinator::open(path, format!("worker-{idx}"), clock.clone())
                .expect("open worker store")
        })
        .collect();
    workers[0].setup().expect("setup");
    workers
}

#[test]
fn racing_claims_on_one_item_grant_a_single_lease() {
    let file = NamedTempFile::new().expect("temp file");
    let clock = ManualClock::new(ts());
    let workers = open_workers(file.path(), &clock, 8);
    workers[0]
        .create_unassigned_work_item("logs__0")
        .expect("create");

    let barrier = Arc::new(Barrier::new(workers.len()));
    let handles: Vec<_> = workers
        .into_iter()
        .map(|worker| {
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                worker.create_or_update_lease_for_work_item("logs__0", LEASE)
            })
        })
        .collect();

    let mut granted = 0;
    for handle in handles {
        match handle.join().expect("worker thread") {
            Ok(WorkAcquisitionOutcome::Acquired(work)) => {
                assert_eq!(work.num_attempts, 1);
                granted += 1;
            }
            Err(CoordinationError::LeaseLockHeldElsewhere { .. }) => {}
            other => panic!("unexpected claim result: {other:?}"),
        }
    }
    assert_eq!(granted, 1);
}

#[test]
fn workers_drain_every_item_exactly_once() {
    let file = NamedTempFile::new().expect("temp file");
    let clock = ManualClock::new(ts());
    let workers = open_workers(file.path(), &clock, 4);
    let expected: BTreeSet<String> = (0..24).map(|shard| format!("logs__{shard}")).collect();
    for id in &expected {
        workers[0].create_unassigned_work_item(id).expect("create");
    }

    let handles: Vec<_> = workers
        .into_iter()
        .map(|worker| {
            std::thread::spawn(move || {
                let mut done = Vec::new();
                loop {
                    match worker.acquire_next_work_item(LEASE).expect("acquire") {
                        WorkAcquisitionOutcome::Acquired(work) => {
                            worker
                                .complete_work_item(&work.work_item_id)
                                .expect("complete");
                            done.push(work.work_item_id);
                        }
                        WorkAcquisitionOutcome::NoAvailableWork => return done,
                        WorkAcquisitionOutcome::AlreadyCompleted => {
                            panic!("claim-any never reports completion")
                        }
                    }
                }
            })
        })
        .collect();

    let mut seen = BTreeSet::new();
    for handle in handles {
        for id in handle.join().expect("worker thread") {
            assert!(seen.insert(id), "item completed twice");
        }
    }
    assert_eq!(seen, expected);
}

#[test]
fn abandoned_lease_is_reclaimed_after_expiry() {
    let file = NamedTempFile::new().expect("temp file");
    let clock = ManualClock::new(ts());
    let workers = open_workers(file.path(), &clock, 2);
    workers[0]
        .create_unassigned_work_item("logs__0")
        .expect("create");

    match workers[0].acquire_next_work_item(LEASE).expect("first claim") {
        WorkAcquisitionOutcome::Acquired(_) => {}
        other => panic!("expected acquisition, got {other:?}"),
    }
    assert_eq!(
        workers[1].acquire_next_work_item(LEASE).expect("while leased"),
        WorkAcquisitionOutcome::NoAvailableWork
    );

    clock.advance(LEASE + Duration::from_secs(1));
    match workers[1].acquire_next_work_item(LEASE).expect("reclaim") {
        WorkAcquisitionOutcome::Acquired(work) => {
            assert_eq!(work.work_item_id, "logs__0");
            assert_eq!(work.num_attempts, 2);
        }
        other => panic!("expected acquisition, got {other:?}"),
    }
    assert!(matches!(
        workers[0].complete_work_item("logs__0"),
        Err(CoordinationError::LeaseOwnershipViolation { .. })
    ));
}
