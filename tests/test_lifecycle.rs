//! Integration tests for the migration lifecycle
//!
//! Test flow mirrors a deployment: build a plan from artifacts and the
//! record store, gate it, execute it step by step, then rebuild plans from
//! whatever state the run left behind.

use chrono::Utc;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;
use tideline::migration::{
    build_apply_plan, build_rollback_plan, build_squash_plan, Action, ApplyOptions, ApplyTarget,
    CancellationToken, EventBus, FnRunner, InMemoryRecordStore, LifecycleExecutor,
    MigrationArtifact, MigrationError, MigrationSet, Migrator, PlanStatus, RecordStore,
    RollbackSelector, RunOutcome, RunRequest, RunnerError, SafetyContext, SafetyGate, Severity,
    StaticArtifactSource, Version,
};

fn artifacts(n: usize) -> Vec<MigrationArtifact> {
    (1..=n)
        .map(|i| {
            MigrationArtifact::new(
                format!("v{i}"),
                format!("step_{i}"),
                Action::new(format!("apply {i}")),
                Some(Action::new(format!("revert {i}"))),
                Utc::now(),
            )
        })
        .collect()
}

fn numbered(n: usize) -> Vec<MigrationArtifact> {
    (1..=n)
        .map(|i| {
            MigrationArtifact::new(
                i.to_string(),
                format!("step_{i}"),
                Action::new(format!("apply {i}")),
                Some(Action::new(format!("revert {i}"))),
                Utc::now(),
            )
        })
        .collect()
}

fn ok(_: &RunRequest<'_>) -> Result<RunOutcome, RunnerError> {
    Ok(RunOutcome::default())
}

fn labels(plan: &tideline::migration::Plan) -> Vec<String> {
    plan.steps
        .iter()
        .map(|s| format!("{} {}", s.operation, s.version))
        .collect()
}

#[test]
fn test_empty_store_plans_every_artifact_in_order() {
    for n in [0, 1, 7, 25] {
        let set = MigrationSet::from_artifacts(numbered(n).into_iter().rev().collect()).unwrap();
        let plan = build_apply_plan(&set, &[], &ApplyTarget::Latest).unwrap();
        assert_eq!(plan.len(), n);
        let versions: Vec<u64> = plan.steps.iter().filter_map(|s| s.version.as_number()).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
    }
}

#[test]
fn test_v1_v2_v3_example() {
    let set = MigrationSet::from_artifacts(artifacts(3)).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let executor = LifecycleExecutor::new(Arc::clone(&store), EventBus::new());

    let apply = build_apply_plan(&set, &[], &ApplyTarget::Latest).unwrap();
    assert_eq!(labels(&apply), ["apply v1", "apply v2", "apply v3"]);
    executor
        .execute(&apply, &FnRunner::new(ok), &CancellationToken::new())
        .unwrap();

    let records = store.current_state().unwrap();
    let rollback = build_rollback_plan(&set, &records, RollbackSelector::Steps(2)).unwrap();
    assert_eq!(labels(&rollback), ["rollback v3", "rollback v2"]);
}

#[test]
fn test_apply_then_rollback_round_trips() {
    let set = MigrationSet::from_artifacts(numbered(6)).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let executor = LifecycleExecutor::new(Arc::clone(&store), EventBus::new());
    let runner = FnRunner::new(ok);

    let first = build_apply_plan(&set, &[], &ApplyTarget::Version(Version::new("2"))).unwrap();
    executor.execute(&first, &runner, &CancellationToken::new()).unwrap();
    let before = store.current_state().unwrap();

    let records = store.current_state().unwrap();
    let apply = build_apply_plan(&set, &records, &ApplyTarget::Latest).unwrap();
    let applied = executor.execute(&apply, &runner, &CancellationToken::new()).unwrap();
    assert_eq!(applied.completed, 4);

    let records = store.current_state().unwrap();
    let rollback =
        build_rollback_plan(&set, &records, RollbackSelector::Steps(applied.completed)).unwrap();
    executor.execute(&rollback, &runner, &CancellationToken::new()).unwrap();

    assert_eq!(store.current_state().unwrap(), before);
}

#[test]
fn test_resquash_produces_identical_checksum() {
    let set = MigrationSet::from_artifacts(numbered(4)).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let executor = LifecycleExecutor::new(Arc::clone(&store), EventBus::new());
    let runner = FnRunner::new(ok);

    let apply = build_apply_plan(&set, &[], &ApplyTarget::Latest).unwrap();
    executor.execute(&apply, &runner, &CancellationToken::new()).unwrap();

    let (from, to) = (Version::new("2"), Version::new("3"));
    let records = store.current_state().unwrap();
    let squash = build_squash_plan(&set, &records, &from, &to).unwrap();
    executor.execute(&squash, &runner, &CancellationToken::new()).unwrap();
    let first_checksum = squash.steps[0].checksum.clone();

    let records = store.current_state().unwrap();
    assert_eq!(records.len(), 3);
    let again = build_squash_plan(&set, &records, &from, &to).unwrap();
    assert_eq!(again.steps[0].checksum, first_checksum);
    executor.execute(&again, &runner, &CancellationToken::new()).unwrap();

    let after = store.current_state().unwrap();
    let versions: Vec<_> = after.iter().map(|r| r.version.to_string()).collect();
    assert_eq!(versions, ["1", "3", "4"]);
    assert_eq!(after[1].checksum, first_checksum);
    assert_eq!(after[1].squash, records[1].squash);
}

#[test]
fn test_empty_plan_yields_only_info_findings() {
    let set = MigrationSet::from_artifacts(numbered(2)).unwrap();
    let store = InMemoryRecordStore::new();
    let plan = build_apply_plan(&set, &[], &ApplyTarget::Latest).unwrap();
    for step in &plan.steps {
        store
            .record_apply(tideline::migration::AppliedRecord::new(
                step.version.clone(),
                step.name.clone(),
                step.checksum.clone(),
                Utc::now(),
                tideline::migration::BatchId(1),
                None,
            ))
            .unwrap();
    }
    let records = store.current_state().unwrap();
    let empty = build_apply_plan(&set, &records, &ApplyTarget::Latest).unwrap();
    let report = SafetyGate::default().evaluate(&SafetyContext {
        plan: &empty,
        records: &records,
        set: &set,
        now: Utc::now(),
        force: false,
    });
    assert!(!report.findings.is_empty());
    assert!(report.findings.iter().all(|f| f.severity == Severity::Info));
}

#[test]
fn test_third_of_five_failing_resumes_at_three() {
    let set = MigrationSet::from_artifacts(numbered(5)).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let executor = LifecycleExecutor::new(Arc::clone(&store), EventBus::new());
    let failing = FnRunner::new(|req: &RunRequest<'_>| {
        if req.version.as_str() == "3" {
            Err(RunnerError::TimedOut(Duration::from_secs(30)))
        } else {
            Ok(RunOutcome::default())
        }
    });

    let plan = build_apply_plan(&set, &[], &ApplyTarget::Latest).unwrap();
    let result = executor.execute(&plan, &failing, &CancellationToken::new()).unwrap();
    assert_eq!(result.status, PlanStatus::PartiallyFailed);
    assert_eq!(result.completed, 2);
    assert!(result.failure.as_ref().unwrap().timed_out);

    let records = store.current_state().unwrap();
    let resumed = build_apply_plan(&set, &records, &ApplyTarget::Latest).unwrap();
    let versions: Vec<_> = resumed.steps.iter().map(|s| s.version.to_string()).collect();
    assert_eq!(versions, ["3", "4", "5"]);
}

#[test]
fn test_failed_rollback_resumes_in_reverse_from_failed_step() {
    let set = MigrationSet::from_artifacts(numbered(5)).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let executor = LifecycleExecutor::new(Arc::clone(&store), EventBus::new());
    let apply = build_apply_plan(&set, &[], &ApplyTarget::Latest).unwrap();
    executor.execute(&apply, &FnRunner::new(ok), &CancellationToken::new()).unwrap();

    let failing = FnRunner::new(|req: &RunRequest<'_>| {
        if req.version.as_str() == "3" {
            Err(RunnerError::Failed("lock timeout".to_string()))
        } else {
            Ok(RunOutcome::default())
        }
    });
    let records = store.current_state().unwrap();
    let rollback = build_rollback_plan(&set, &records, RollbackSelector::Steps(5)).unwrap();
    let result = executor.execute(&rollback, &failing, &CancellationToken::new()).unwrap();
    assert_eq!(result.status, PlanStatus::PartiallyFailed);
    assert_eq!(result.completed, 2);
    assert_eq!(result.failure.unwrap().version, Version::new("3"));

    let records = store.current_state().unwrap();
    let remaining = rollback.len() - result.completed;
    let resumed = build_rollback_plan(&set, &records, RollbackSelector::Steps(remaining)).unwrap();
    assert_eq!(labels(&resumed), ["rollback 3", "rollback 2", "rollback 1"]);
    executor.execute(&resumed, &FnRunner::new(ok), &CancellationToken::new()).unwrap();
    assert!(store.current_state().unwrap().is_empty());
}

#[test]
fn test_mixed_version_tokens_apply_in_total_order() {
    let tokens = ["1a", "10", "2"];
    let mixed: Vec<_> = tokens
        .iter()
        .map(|v| {
            MigrationArtifact::new(
                *v,
                format!("m_{v}"),
                Action::new(format!("apply {v}")),
                Some(Action::new(format!("revert {v}"))),
                Utc::now(),
            )
        })
        .collect();
    let set = MigrationSet::from_artifacts(mixed).unwrap();
    let order: Vec<_> = set.iter().map(|a| a.version.to_string()).collect();
    assert_eq!(order, ["2", "10", "1a"]);

    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let seen = Mutex::new(Vec::new());
    let runner = FnRunner::new(|req: &RunRequest<'_>| {
        seen.lock().unwrap().push(req.version.to_string());
        Ok(RunOutcome::default())
    });
    let plan = build_apply_plan(&set, &[], &ApplyTarget::Latest).unwrap();
    LifecycleExecutor::new(Arc::clone(&store), EventBus::new())
        .execute(&plan, &runner, &CancellationToken::new())
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), ["2", "10", "1a"]);
}

#[test]
fn test_cancel_between_steps_aborts_with_committed_prefix() {
    let set = MigrationSet::from_artifacts(numbered(4)).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let bus = EventBus::new();
    let events = bus.subscribe_pattern("apply");
    let executor = LifecycleExecutor::new(Arc::clone(&store), bus);
    let cancel = CancellationToken::new();
    let runner = {
        let cancel = cancel.clone();
        FnRunner::new(move |req: &RunRequest<'_>| {
            if req.version.as_str() == "2" {
                cancel.cancel();
            }
            Ok(RunOutcome::default())
        })
    };

    let plan = build_apply_plan(&set, &[], &ApplyTarget::Latest).unwrap();
    let result = executor.execute(&plan, &runner, &cancel).unwrap();
    assert_eq!(result.status, PlanStatus::Aborted);
    assert_eq!(result.completed, 2);
    assert_eq!(store.current_state().unwrap().len(), 2);

    let last = events.try_iter().last().unwrap();
    assert_eq!(last.event_type, "apply.aborted");
}

#[test]
fn test_concurrent_executions_are_mutually_exclusive() {
    let set = MigrationSet::from_artifacts(numbered(3)).unwrap();
    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let plan = build_apply_plan(&set, &[], &ApplyTarget::Latest).unwrap();

    // The first run parks inside its first step until the second run has tried
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let slow = {
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        let once = Mutex::new(true);
        FnRunner::new(move |_: &RunRequest<'_>| {
            let first = std::mem::replace(&mut *once.lock().unwrap(), false);
            if first {
                entered.wait();
                release.wait();
            }
            Ok(RunOutcome::default())
        })
    };

    let handle = {
        let store = Arc::clone(&store);
        let plan = plan.clone();
        thread::spawn(move || {
            LifecycleExecutor::new(store, EventBus::new())
                .execute(&plan, &slow, &CancellationToken::new())
                .unwrap()
        })
    };

    entered.wait();
    let second = LifecycleExecutor::new(Arc::clone(&store), EventBus::new()).execute(
        &plan,
        &FnRunner::new(ok),
        &CancellationToken::new(),
    );
    release.wait();

    assert!(matches!(second, Err(MigrationError::ConcurrentMigration { holder: Some(_) })));
    assert!(handle.join().unwrap().is_completed());
    assert_eq!(store.current_state().unwrap().len(), 3);
}

#[test]
fn test_edited_artifact_stops_apply() {
    let store = Arc::new(InMemoryRecordStore::new());
    let original = Migrator::new(
        Arc::new(StaticArtifactSource::new(numbered(2))),
        store.clone(),
        Arc::new(FnRunner::new(ok)),
    );
    original.apply(&ApplyOptions::default()).unwrap();

    let mut edited = numbered(3);
    edited[0] = MigrationArtifact::new(
        "1",
        "step_1",
        Action::new("apply 1, but different"),
        None,
        Utc::now(),
    );
    let migrator = Migrator::new(
        Arc::new(StaticArtifactSource::new(edited)),
        store,
        Arc::new(FnRunner::new(ok)),
    );

    let err = migrator.apply(&ApplyOptions::default()).unwrap_err();
    assert!(matches!(err, MigrationError::ChecksumMismatch { .. }));
    let envelope = err.envelope();
    assert_eq!(envelope.kind, "ChecksumMismatch");
    assert!(!envelope.code.is_empty());

    // Overriding lets the drift through to the gate, which reports it
    let report = migrator
        .apply(&ApplyOptions {
            override_safety: true,
            ..ApplyOptions::default()
        })
        .unwrap();
    assert!(report.findings.iter().any(|f| f.check == "checksum-drift"));
    assert!(report.execution.unwrap().is_completed());
}
