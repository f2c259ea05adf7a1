mod support;

use rfs_core::{
    Clock, EntryStore, IndexWorkStatus, ManualClock, Phase, PhaseEntry, PhaseStatus,
    WorkCoordinator,
};
use rfs_migration::{
    MigrationError, MigrationRunner, PhaseFailure, EXIT_FAILURE, EXIT_LEASE_EXPIRED,
};
use std::time::Duration;
use support::{ts, FakeCluster, Harness, SECOND};

fn phase_status(harness: &Harness, phase: Phase) -> PhaseEntry {
    harness
        .store
        .get_phase_entry(phase)
        .expect("read entry")
        .expect("entry exists")
}

#[test]
fn full_run_completes_every_phase() {
    let clock = ManualClock::new(ts());
    let harness = Harness::new("worker-a", &clock);
    let cluster = FakeCluster::new()
        .with_index("logs", 2, 5)
        .with_index("metrics", 1, 3)
        .with_index(".kibana", 1, 1)
        .with_snapshot_polls(2);

    let mut runner = MigrationRunner::new(harness.state(&cluster));
    runner.run_phases(&Phase::ALL).expect("migration run");

    for phase in Phase::ALL {
        let entry = phase_status(&harness, phase);
        assert_eq!(entry.status, PhaseStatus::Completed, "{phase}");
        assert_eq!(entry.num_attempts, 1, "{phase}");
    }
    assert_eq!(
        *cluster.snapshots_created.lock().expect("snapshots"),
        vec!["nightly".to_string()]
    );
    assert_eq!(*cluster.templates_migrated.lock().expect("templates"), 1);

    let mut created = cluster.index_creations.lock().expect("creations").clone();
    created.sort();
    assert_eq!(created, vec!["logs".to_string(), "metrics".to_string()]);

    // 2 logs shards of 5 docs plus 1 metrics shard of 3, never the dot index.
    assert_eq!(cluster.target_doc_count(), 13);
    assert!(cluster
        .bulks
        .lock()
        .expect("bulks")
        .iter()
        .all(|(index, size)| index != ".kibana" && *size <= 2));
    assert!(!harness.store.work_items_are_pending().expect("pending"));
    assert_eq!(
        harness
            .store
            .get_work_item("logs__1")
            .expect("read item")
            .expect("item exists")
            .lease_holder_id
            .as_deref(),
        Some("worker-a")
    );
}

#[test]
fn rerun_after_completion_does_no_work() {
    let clock = ManualClock::new(ts());
    let harness = Harness::new("worker-a", &clock);
    let cluster = FakeCluster::new().with_index("logs", 1, 2);

    MigrationRunner::new(harness.state(&cluster))
        .run_phases(&Phase::ALL)
        .expect("first run");
    MigrationRunner::new(harness.state(&cluster))
        .run_phases(&Phase::ALL)
        .expect("second run");

    assert_eq!(cluster.snapshots_created.lock().expect("snapshots").len(), 1);
    assert_eq!(cluster.bulks.lock().expect("bulks").len(), 1);
}

#[test]
fn exhausted_phase_attempts_exit_failed() {
    let clock = ManualClock::new(ts());
    let harness = Harness::new("worker-a", &clock);
    let cluster = FakeCluster::new();
    harness.store.setup().expect("setup");
    let abandoned = PhaseEntry {
        phase: Phase::Snapshot,
        status: PhaseStatus::Setup,
        lease_expiry: ts() - chrono::Duration::seconds(1),
        num_attempts: PhaseEntry::MAX_ATTEMPTS,
    };
    harness
        .store
        .create_phase_entry(&abandoned)
        .expect("create entry");

    let err = MigrationRunner::new(harness.state(&cluster))
        .run_phases(&[Phase::Snapshot])
        .expect_err("phase should fail");

    match &err {
        MigrationError::PhaseExitedFailed { phase, failure } => {
            assert_eq!(*phase, Phase::Snapshot);
            assert_eq!(
                *failure,
                PhaseFailure::AttemptsExhausted {
                    attempts: 3,
                    max_attempts: 3
                }
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(err.exit_code(), EXIT_FAILURE);
    assert_eq!(phase_status(&harness, Phase::Snapshot).status, PhaseStatus::Failed);
    assert!(cluster.snapshots_created.lock().expect("snapshots").is_empty());
}

#[test]
fn expired_setup_lease_is_taken_over_with_doubled_window() {
    let clock = ManualClock::new(ts());
    let harness = Harness::new("worker-b", &clock);
    let cluster = FakeCluster::new();
    harness.store.setup().expect("setup");
    let abandoned = PhaseEntry::initial(
        Phase::Metadata,
        ts() - chrono::Duration::seconds(120),
        Duration::from_secs(60),
    );
    harness
        .store
        .create_phase_entry(&abandoned)
        .expect("create entry");

    MigrationRunner::new(harness.state(&cluster))
        .run_phases(&[Phase::Metadata])
        .expect("metadata run");

    let entry = phase_status(&harness, Phase::Metadata);
    assert_eq!(entry.status, PhaseStatus::Completed);
    assert_eq!(entry.num_attempts, 2);
    assert_eq!(entry.lease_expiry, ts() + chrono::Duration::seconds(120));
}

#[test]
fn live_setup_lease_is_waited_out() {
    let clock = ManualClock::new(ts());
    let harness = Harness::new("worker-b", &clock);
    let cluster = FakeCluster::new();
    harness.store.setup().expect("setup");
    let held = PhaseEntry::initial(
        Phase::Metadata,
        ts() - chrono::Duration::seconds(30),
        Duration::from_secs(60),
    );
    harness.store.create_phase_entry(&held).expect("create entry");

    MigrationRunner::new(harness.state(&cluster))
        .run_phases(&[Phase::Metadata])
        .expect("metadata run");

    // The holder's lease ran until ts + 30s; random waits moved the clock past it.
    assert!(clock.now() > ts() + chrono::Duration::seconds(30));
    assert_eq!(phase_status(&harness, Phase::Metadata).num_attempts, 2);
    assert_eq!(*cluster.templates_migrated.lock().expect("templates"), 1);
}

#[test]
fn failed_snapshot_fails_the_phase() {
    let clock = ManualClock::new(ts());
    let harness = Harness::new("worker-a", &clock);
    let cluster = FakeCluster::new().with_snapshot_polls(1).with_failing_snapshot();

    let err = MigrationRunner::new(harness.state(&cluster))
        .run_phases(&Phase::ALL)
        .expect_err("snapshot should fail");

    assert!(matches!(
        err,
        MigrationError::PhaseExitedFailed {
            phase: Phase::Snapshot,
            failure: PhaseFailure::SnapshotFailed { .. }
        }
    ));
    assert_eq!(phase_status(&harness, Phase::Snapshot).status, PhaseStatus::Failed);
    assert!(harness
        .store
        .get_phase_entry(Phase::Metadata)
        .expect("read")
        .is_none());
}

#[test]
fn index_past_soft_limit_is_marked_failed() {
    let clock = ManualClock::new(ts());
    let harness = Harness::new("worker-a", &clock);
    let cluster = FakeCluster::new()
        .with_index("logs", 1, 0)
        .with_broken_index("broken");

    MigrationRunner::new(harness.state(&cluster))
        .run_phases(&[Phase::Index])
        .expect("index run");

    let broken = harness
        .store
        .get_index_work_entry("broken")
        .expect("read")
        .expect("entry exists");
    assert_eq!(broken.status, IndexWorkStatus::Failed);
    assert_eq!(broken.num_attempts, 4);

    let logs = harness
        .store
        .get_index_work_entry("logs")
        .expect("read")
        .expect("entry exists");
    assert_eq!(logs.status, IndexWorkStatus::Completed);

    let creations = cluster.index_creations.lock().expect("creations");
    assert_eq!(creations.iter().filter(|name| *name == "broken").count(), 4);
    assert_eq!(phase_status(&harness, Phase::Index).status, PhaseStatus::Completed);
}

#[test]
fn lease_expiry_mid_shard_stops_the_stream() {
    let clock = ManualClock::new(ts());
    let mut harness = Harness::new("worker-a", &clock);
    harness.settings.shard_lease = 5 * SECOND;
    let hook_clock = clock.clone();
    let hook_watchdog = harness.watchdog.clone();
    let cluster = FakeCluster::new()
        .with_index("logs", 1, 5)
        .with_bulk_hook(move || {
            hook_clock.advance(10 * SECOND);
            hook_watchdog.fire_expired();
        });

    let err = MigrationRunner::new(harness.state(&cluster))
        .run_phases(&[Phase::Documents])
        .expect_err("lease should expire");

    assert_eq!(err.exit_code(), EXIT_LEASE_EXPIRED);
    match &err {
        MigrationError::PhaseFailed { phase, step, .. } => {
            assert_eq!(*phase, Phase::Documents);
            assert_eq!(*step, "MigrateShard");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    // Only the first bulk went out before the token was observed.
    assert_eq!(cluster.bulks.lock().expect("bulks").len(), 1);
    let item = harness
        .store
        .get_work_item("logs__0")
        .expect("read")
        .expect("item exists");
    assert!(item.completed_at.is_none());
}

#[test]
fn shard_over_attempt_limit_is_settled_while_others_complete() {
    let clock = ManualClock::new(ts());
    let mut harness = Harness::new("worker-a", &clock);
    harness.settings.max_shard_attempts = 2;
    let cluster = FakeCluster::new().with_index("logs", 2, 3);

    // logs__0 has already been taken twice by workers that never finished it.
    let lease = 5 * SECOND;
    harness
        .store
        .create_or_update_lease_for_work_item("logs__0", lease)
        .expect("first claim");
    clock.advance(6 * SECOND);
    harness
        .store
        .create_or_update_lease_for_work_item("logs__0", lease)
        .expect("second claim");
    clock.advance(60 * SECOND);

    MigrationRunner::new(harness.state(&cluster))
        .run_phases(&[Phase::Documents])
        .expect("documents phase");

    assert_eq!(
        phase_status(&harness, Phase::Documents).status,
        PhaseStatus::Completed
    );
    let abandoned = harness
        .store
        .get_work_item("logs__0")
        .expect("read")
        .expect("item exists");
    assert!(abandoned.failed_at.is_some());
    assert!(abandoned.completed_at.is_none());
    assert_eq!(abandoned.num_attempts, 3);

    let migrated = harness
        .store
        .get_work_item("logs__1")
        .expect("read")
        .expect("item exists");
    assert!(migrated.completed_at.is_some());
    assert_eq!(cluster.target_doc_count(), 3);
    assert!(!harness.store.work_items_are_pending().expect("pending"));
}
