mod support;

use rfs_core::{Clock, CoordinationError, ManualClock, WorkAcquisitionOutcome, WorkCoordinator};
use rfs_coordination::{SHARD_SETUP_LEASE, SHARD_SETUP_WORK_ITEM_ID};
use rfs_migration::{MigrationRunner, ShardWorkerOutcome, EXIT_NO_WORK_LEFT, EXIT_SUCCESS};
use rfs_storage::SqliteCoordinator;
use std::sync::Arc;
use std::time::Duration;
use support::{ts, FakeCluster, Harness};
use tempfile::NamedTempFile;

fn open(path: &std::path::Path, worker_id: &str, clock: &ManualClock) -> SqliteCoordinator {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    SqliteCoordinator::open(path, worker_id, clock).expect("open store")
}

#[test]
fn each_invocation_migrates_one_shard_until_drained() {
    let clock = ManualClock::new(ts());
    let harness = Harness::new("worker-a", &clock);
    let cluster = FakeCluster::new().with_index("logs", 2, 3);

    let mut migrated = Vec::new();
    for _ in 0..2 {
        let outcome = MigrationRunner::new(harness.state(&cluster))
            .run_shard_worker()
            .expect("shard worker");
        assert_eq!(outcome.exit_code(), EXIT_SUCCESS);
        match outcome {
            ShardWorkerOutcome::Migrated {
                work_item_id,
                documents,
            } => {
                assert_eq!(documents, 3);
                migrated.push(work_item_id);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    migrated.sort();
    assert_eq!(migrated, vec!["logs__0".to_string(), "logs__1".to_string()]);

    let last = MigrationRunner::new(harness.state(&cluster))
        .run_shard_worker()
        .expect("shard worker");
    assert_eq!(last, ShardWorkerOutcome::NothingPending);
    assert_eq!(last.exit_code(), EXIT_SUCCESS);
    assert_eq!(cluster.target_doc_count(), 6);
}

#[test]
fn leased_but_unfinished_shards_exit_with_no_work_left() {
    let file = NamedTempFile::new().expect("temp file");
    let clock = ManualClock::new(ts());
    let holder = open(file.path(), "worker-a", &clock);
    holder.setup().expect("setup");

    // Worker A runs the fan-out and takes the only shard, then stalls.
    holder
        .create_or_update_lease_for_work_item(SHARD_SETUP_WORK_ITEM_ID, SHARD_SETUP_LEASE)
        .expect("guard lease");
    holder
        .create_unassigned_work_item("logs__0")
        .expect("enqueue shard");
    holder
        .complete_work_item(SHARD_SETUP_WORK_ITEM_ID)
        .expect("complete guard");
    match holder
        .acquire_next_work_item(Duration::from_secs(600))
        .expect("acquire")
    {
        WorkAcquisitionOutcome::Acquired(work) => assert_eq!(work.work_item_id, "logs__0"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    let harness = Harness::with_store(open(file.path(), "worker-b", &clock), &clock);
    let cluster = FakeCluster::new().with_index("logs", 1, 3);

    let outcome = MigrationRunner::new(harness.state(&cluster))
        .run_shard_worker()
        .expect("shard worker");
    assert_eq!(outcome, ShardWorkerOutcome::NoWorkLeft);
    assert_eq!(outcome.exit_code(), EXIT_NO_WORK_LEFT);
    assert!(cluster.bulks.lock().expect("bulks").is_empty());

    holder.complete_work_item("logs__0").expect("finish shard");
    let outcome = MigrationRunner::new(harness.state(&cluster))
        .run_shard_worker()
        .expect("shard worker");
    assert_eq!(outcome, ShardWorkerOutcome::NothingPending);
}

#[test]
fn stalled_shard_is_picked_up_after_its_lease_runs_out() {
    let file = NamedTempFile::new().expect("temp file");
    let clock = ManualClock::new(ts());
    let stalled = Harness::with_store(open(file.path(), "worker-a", &clock), &clock);
    let cluster = FakeCluster::new().with_index("logs", 1, 3);

    // Worker A leases the shard but its migration never finishes.
    stalled.store.setup().expect("setup");
    stalled
        .store
        .create_or_update_lease_for_work_item(SHARD_SETUP_WORK_ITEM_ID, SHARD_SETUP_LEASE)
        .expect("guard lease");
    stalled
        .store
        .create_unassigned_work_item("logs__0")
        .expect("enqueue shard");
    stalled
        .store
        .complete_work_item(SHARD_SETUP_WORK_ITEM_ID)
        .expect("complete guard");
    stalled
        .store
        .acquire_next_work_item(stalled.settings.shard_lease)
        .expect("acquire");

    clock.advance(stalled.settings.shard_lease + Duration::from_secs(1));

    let rescuer = Harness::with_store(open(file.path(), "worker-b", &clock), &clock);
    let outcome = MigrationRunner::new(rescuer.state(&cluster))
        .run_shard_worker()
        .expect("shard worker");
    assert_eq!(
        outcome,
        ShardWorkerOutcome::Migrated {
            work_item_id: "logs__0".to_string(),
            documents: 3
        }
    );

    let item = rescuer
        .store
        .get_work_item("logs__0")
        .expect("read")
        .expect("item exists");
    assert_eq!(item.num_attempts, 2);
    assert_eq!(item.lease_holder_id.as_deref(), Some("worker-b"));
    assert!(item.completed_at.is_some());
    assert!(matches!(
        stalled.store.complete_work_item("logs__0"),
        Err(CoordinationError::LeaseOwnershipViolation { .. })
    ));
}

#[test]
fn shard_past_its_attempt_limit_is_settled_as_failed() {
    let clock = ManualClock::new(ts());
    let mut harness = Harness::new("worker-a", &clock);
    harness.settings.max_shard_attempts = 1;
    let cluster = FakeCluster::new().with_index("logs", 1, 3);

    harness
        .store
        .create_or_update_lease_for_work_item("logs__0", harness.settings.shard_lease)
        .expect("abandoned claim");
    clock.advance(harness.settings.shard_lease + Duration::from_secs(1));

    let outcome = MigrationRunner::new(harness.state(&cluster))
        .run_shard_worker()
        .expect("shard worker");
    assert_eq!(
        outcome,
        ShardWorkerOutcome::ShardFailed {
            work_item_id: "logs__0".to_string(),
            attempts: 2,
        }
    );
    assert_eq!(outcome.exit_code(), EXIT_SUCCESS);
    assert_eq!(cluster.target_doc_count(), 0);

    let item = harness
        .store
        .get_work_item("logs__0")
        .expect("read")
        .expect("item exists");
    assert!(item.failed_at.is_some());
    assert_eq!(
        MigrationRunner::new(harness.state(&cluster))
            .run_shard_worker()
            .expect("shard worker"),
        ShardWorkerOutcome::NothingPending
    );
}
