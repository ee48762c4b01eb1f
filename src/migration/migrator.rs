//! Migrator - front door of the lifecycle engine
//!
//! Owns the collaborators (artifact source, record store, runner, event bus,
//! safety gate) and turns each sub-operation into plan, gate, execute.

use crate::config::EngineConfig;
use crate::migration::executor::{CancellationToken, ExecutionResult, LifecycleExecutor, Runner};
use crate::migration::lock::MigrationLockGuard;
use crate::migration::plan::{
    build_apply_plan, build_rollback_plan, build_squash_plan, ApplyTarget, RollbackSelector,
};
use crate::migration::safety::{SafetyContext, SafetyFinding, SafetyGate};
use crate::migration::status::{MigrationStatus, VerifyReport};
use crate::migration::{
    AppliedRecord, ArtifactDraft, ArtifactSource, EventBus, HistoryEntry, MigrationError,
    MigrationSet, Operation, Plan, RecordStore, Version,
};
use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;

const NAME_PATTERN: &str = "^[a-z][a-z0-9_]*$";

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    pub target: ApplyTarget,
    pub dry_run: bool,
    /// Execute even if the safety gate blocks
    pub override_safety: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RollbackOptions {
    /// `None` uses `default_rollback_steps` from the config
    pub selector: Option<RollbackSelector>,
    /// Allow rolling back migrations older than the grace period
    pub force: bool,
    pub dry_run: bool,
    pub override_safety: bool,
}

#[derive(Debug, Clone)]
pub struct SquashOptions {
    pub from: Version,
    pub to: Version,
    pub dry_run: bool,
    pub override_safety: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CleanOptions {
    /// Prune orphaned records instead of only listing them
    pub force: bool,
    /// Force-release the advisory lock
    pub release_lock: bool,
}

/// Outcome of apply, rollback and squash
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub operation: Operation,
    pub plan: Plan,
    pub findings: Vec<SafetyFinding>,
    pub dry_run: bool,
    /// `None` for dry runs and empty plans
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionResult>,
}

impl LifecycleReport {
    /// Nothing needed doing
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.plan.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateReport {
    pub version: Version,
    pub name: String,
    /// Where the artifact source wrote the draft
    pub location: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanReport {
    pub orphans: Vec<AppliedRecord>,
    pub pruned: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub released_lock: Option<String>,
}

/// Migration lifecycle engine
pub struct Migrator {
    source: Arc<dyn ArtifactSource>,
    store: Arc<dyn RecordStore>,
    runner: Arc<dyn Runner>,
    bus: EventBus,
    gate: SafetyGate,
    config: EngineConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Migrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Migrator")
            .field("gate", &self.gate)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Migrator {
    /// Create a Migrator with default config and the built-in safety checks
    pub fn new(
        source: Arc<dyn ArtifactSource>,
        store: Arc<dyn RecordStore>,
        runner: Arc<dyn Runner>,
    ) -> Self {
        let config = EngineConfig::default();
        Self {
            source,
            store,
            runner,
            bus: EventBus::new(),
            gate: SafetyGate::new(config.grace_period()),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the config; the safety gate is rebuilt with its grace period
    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.gate = SafetyGate::new(config.grace_period());
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_safety_gate(mut self, gate: SafetyGate) -> Self {
        self.gate = gate;
        self
    }

    #[must_use]
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = bus;
        self
    }

    /// Share `cancel` with whatever stops runs (a signal handler, a supervisor)
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Token that stops the running plan between steps
    ///
    /// Cancellation is sticky: once cancelled, every later apply, rollback
    /// or squash on this Migrator aborts before its first step. Install a
    /// fresh token with [`Migrator::with_cancellation`] to run again.
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Create a new artifact through the source
    ///
    /// The version is the current UTC time as `YYYYMMDDHHMMSS`, bumped past
    /// the newest existing version so it always sorts last.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidName` for a bad name, or the source's
    /// error (`Unsupported` for read-only sources).
    pub fn generate(&self, name: &str) -> Result<GenerateReport, MigrationError> {
        let pattern = Regex::new(NAME_PATTERN).map_err(|e| MigrationError::Config(e.to_string()))?;
        if !pattern.is_match(name) {
            return Err(MigrationError::InvalidName(name.to_string()));
        }

        let set = MigrationSet::load_unverified(self.source.as_ref())?;
        let now = Utc::now();
        let mut version: u64 = now
            .format("%Y%m%d%H%M%S")
            .to_string()
            .parse()
            .map_err(|e| MigrationError::InvalidVersion(format!("timestamp version: {e}")))?;
        if let Some(latest) = set.latest_version().and_then(Version::as_number) {
            if latest >= version {
                version = latest + 1;
            }
        }

        let draft = ArtifactDraft {
            version: Version::new(version.to_string()),
            name: name.to_string(),
            apply_template: format!("-- {name}: apply\n"),
            rollback_template: format!("-- {name}: rollback\n"),
            generated_at: now,
        };
        let location = self.source.create(&draft)?;
        log::info!("Generated migration {}_{} at {}", draft.version, name, location);

        Ok(GenerateReport {
            version: draft.version,
            name: draft.name,
            location,
        })
    }

    /// Applied, pending, drifted and orphaned migrations
    ///
    /// # Errors
    ///
    /// Returns source or store errors, or `MigrationError::DuplicateVersion`.
    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let records = self.store.current_state()?;
        let set = MigrationSet::load_unverified(self.source.as_ref())?;
        Ok(MigrationStatus::from_state(&set, &records))
    }

    /// # Errors
    ///
    /// Same as [`status`](Self::status).
    pub fn verify(&self) -> Result<VerifyReport, MigrationError> {
        let report = VerifyReport::from_status(&self.status()?);
        if report.ok {
            log::info!("All applied migrations verified");
        } else {
            log::warn!(
                "Verification found {} drifted, {} orphaned, {} out-of-order migration(s)",
                report.drift.len(),
                report.orphans.len(),
                report.gaps.len()
            );
        }
        Ok(report)
    }

    /// Ledger entries, newest first
    ///
    /// # Errors
    ///
    /// Returns the store's error.
    pub fn history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>, MigrationError> {
        let entries = self.store.history()?;
        Ok(entries
            .into_iter()
            .rev()
            .take(limit.unwrap_or(usize::MAX))
            .collect())
    }

    /// Apply pending migrations up to the target
    ///
    /// # Errors
    ///
    /// See [`MigrationError`]; runner failures are reported in the result.
    pub fn apply(&self, options: &ApplyOptions) -> Result<LifecycleReport, MigrationError> {
        self.run(
            false,
            options.dry_run,
            options.override_safety,
            |set, records| build_apply_plan(set, records, &options.target),
        )
    }

    /// Roll back the most recent migrations
    ///
    /// # Errors
    ///
    /// See [`MigrationError`]; runner failures are reported in the result.
    pub fn rollback(&self, options: &RollbackOptions) -> Result<LifecycleReport, MigrationError> {
        let selector = options
            .selector
            .unwrap_or(RollbackSelector::Steps(self.config.default_rollback_steps));
        self.run(
            options.force,
            options.dry_run,
            options.override_safety,
            |set, records| build_rollback_plan(set, records, selector),
        )
    }

    /// Compact an applied range into one record
    ///
    /// # Errors
    ///
    /// See [`MigrationError`]; runner failures are reported in the result.
    pub fn squash(&self, options: &SquashOptions) -> Result<LifecycleReport, MigrationError> {
        self.run(
            false,
            options.dry_run,
            options.override_safety,
            |set, records| build_squash_plan(set, records, &options.from, &options.to),
        )
    }

    /// List orphaned records; prune them and release the lock on request
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::ConcurrentMigration` if pruning cannot take
    /// the lock, or source and store errors.
    pub fn clean(&self, options: CleanOptions) -> Result<CleanReport, MigrationError> {
        let released_lock = if options.release_lock {
            let previous = self.store.force_unlock()?;
            if let Some(holder) = &previous {
                log::warn!("Force-released migration lock held by {}", holder);
            }
            previous
        } else {
            None
        };

        let records = self.store.current_state()?;
        let set = MigrationSet::load_unverified(self.source.as_ref())?;
        let orphans: Vec<AppliedRecord> = set.orphans(&records).into_iter().cloned().collect();

        let pruned = options.force && !orphans.is_empty();
        if pruned {
            let _lock = MigrationLockGuard::acquire(
                self.store.as_ref(),
                format!("tideline-clean-{}", uuid::Uuid::new_v4()),
                self.config.lock_timeout(),
            )?;
            let versions: Vec<Version> = orphans.iter().map(|r| r.version.clone()).collect();
            let removed = self.store.prune(&versions)?;
            log::info!("Pruned {} orphaned record(s)", removed.len());
        }

        Ok(CleanReport {
            orphans,
            pruned,
            released_lock,
        })
    }

    /// Load, plan, gate, then execute unless dry or empty
    fn run<F>(
        &self,
        force: bool,
        dry_run: bool,
        override_safety: bool,
        build: F,
    ) -> Result<LifecycleReport, MigrationError>
    where
        F: FnOnce(&MigrationSet, &[AppliedRecord]) -> Result<Plan, MigrationError>,
    {
        let records = self.store.current_state()?;
        // Overriding the gate also lets drifted artifacts through to it as findings
        let set = if override_safety {
            MigrationSet::load_unverified(self.source.as_ref())?
        } else {
            MigrationSet::load(self.source.as_ref(), &records)?
        };

        let plan = build(&set, &records)?;
        let report = self.gate.evaluate_with_events(
            &SafetyContext {
                plan: &plan,
                records: &records,
                set: &set,
                now: Utc::now(),
                force,
            },
            &self.bus,
        );

        if report.is_blocked() {
            if !override_safety {
                return Err(MigrationError::Blocked {
                    findings: report.findings,
                });
            }
            log::warn!("Executing blocked {} plan on explicit override", plan.operation);
        }

        let operation = plan.operation;
        if plan.is_empty() || dry_run {
            if plan.is_empty() {
                log::info!("Nothing to {}", operation);
            }
            return Ok(LifecycleReport {
                operation,
                plan,
                findings: report.findings,
                dry_run,
                execution: None,
            });
        }

        let executor = LifecycleExecutor::new(Arc::clone(&self.store), self.bus.clone())
            .with_lock_timeout(self.config.lock_timeout());
        let execution = executor.execute(&plan, self.runner.as_ref(), &self.cancel)?;

        Ok(LifecycleReport {
            operation,
            plan,
            findings: report.findings,
            dry_run,
            execution: Some(execution),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::executor::{FnRunner, PlanStatus, RunOutcome, RunRequest, RunnerError};
    use crate::migration::{
        Action, BatchId, InMemoryRecordStore, MigrationArtifact, StaticArtifactSource,
    };
    use chrono::Duration;

    fn artifacts(n: usize) -> Vec<MigrationArtifact> {
        (1..=n)
            .map(|i| {
                MigrationArtifact::new(
                    i.to_string(),
                    format!("m{i}"),
                    Action::new(format!("up {i}")),
                    Some(Action::new(format!("down {i}"))),
                    Utc::now(),
                )
            })
            .collect()
    }

    fn ok(_: &RunRequest<'_>) -> Result<RunOutcome, RunnerError> {
        Ok(RunOutcome::default())
    }

    fn migrator(n: usize) -> Migrator {
        Migrator::new(
            Arc::new(StaticArtifactSource::new(artifacts(n))),
            Arc::new(InMemoryRecordStore::new()),
            Arc::new(FnRunner::new(ok)),
        )
    }

    #[test]
    fn test_apply_then_status_is_up_to_date() {
        let m = migrator(3);
        let report = m.apply(&ApplyOptions::default()).expect("apply");
        let execution = report.execution.expect("executed");
        assert_eq!(execution.status, PlanStatus::Completed);
        assert_eq!(execution.completed, 3);

        let status = m.status().expect("status");
        assert!(status.is_up_to_date());
        assert_eq!(status.applied_count, 3);
    }

    #[test]
    fn test_second_apply_is_noop() {
        let m = migrator(2);
        m.apply(&ApplyOptions::default()).expect("apply");
        let again = m.apply(&ApplyOptions::default()).expect("apply again");
        assert!(again.is_noop());
        assert!(again.execution.is_none());
        assert_eq!(again.findings.len(), 1);
    }

    #[test]
    fn test_dry_run_does_not_touch_store() {
        let m = migrator(2);
        let report = m
            .apply(&ApplyOptions {
                dry_run: true,
                ..ApplyOptions::default()
            })
            .expect("dry run");
        assert_eq!(report.plan.len(), 2);
        assert!(m.store().current_state().expect("state").is_empty());
    }

    #[test]
    fn test_rollback_defaults_to_one_step() {
        let m = migrator(3);
        m.apply(&ApplyOptions::default()).expect("apply");
        let report = m.rollback(&RollbackOptions::default()).expect("rollback");
        assert_eq!(report.plan.versions(), [&Version::new("3")]);
        assert_eq!(m.status().expect("status").pending_count, 1);
    }

    #[test]
    fn test_old_rollback_needs_force() {
        let store = Arc::new(InMemoryRecordStore::new());
        let set = artifacts(1);
        store
            .record_apply(AppliedRecord::new(
                set[0].version.clone(),
                set[0].name.clone(),
                set[0].checksum.clone(),
                Utc::now() - Duration::days(3),
                BatchId(1),
                None,
            ))
            .expect("seed");
        let m = Migrator::new(
            Arc::new(StaticArtifactSource::new(set)),
            store,
            Arc::new(FnRunner::new(ok)),
        );

        assert!(matches!(
            m.rollback(&RollbackOptions::default()),
            Err(MigrationError::Blocked { .. })
        ));
        let forced = m
            .rollback(&RollbackOptions {
                force: true,
                ..RollbackOptions::default()
            })
            .expect("forced rollback");
        assert!(forced.execution.expect("executed").is_completed());
    }

    #[test]
    fn test_generate_needs_a_writable_source() {
        let m = migrator(0);
        assert!(matches!(
            m.generate("Add Users"),
            Err(MigrationError::InvalidName(_))
        ));
        assert!(matches!(
            m.generate("add_users"),
            Err(MigrationError::Unsupported(_))
        ));
    }

    #[test]
    fn test_clean_lists_then_prunes_orphans() {
        let store = Arc::new(InMemoryRecordStore::new());
        store
            .record_apply(AppliedRecord::new(
                Version::new("99"),
                "gone".to_string(),
                "sum".to_string(),
                Utc::now(),
                BatchId(1),
                None,
            ))
            .expect("seed");
        assert!(store.try_lock("crashed-run").expect("lock"));
        let m = Migrator::new(
            Arc::new(StaticArtifactSource::new(artifacts(1))),
            store,
            Arc::new(FnRunner::new(ok)),
        );

        let listed = m.clean(CleanOptions::default()).expect("clean");
        assert_eq!(listed.orphans.len(), 1);
        assert!(!listed.pruned);
        assert_eq!(m.store().current_state().expect("state").len(), 1);

        let pruned = m
            .clean(CleanOptions {
                force: true,
                release_lock: true,
            })
            .expect("clean --force");
        assert!(pruned.pruned);
        assert_eq!(pruned.released_lock.as_deref(), Some("crashed-run"));
        assert!(m.store().current_state().expect("state").is_empty());
    }

    #[test]
    fn test_cancellation_sticks_until_token_is_replaced() {
        let migrator = migrator(2);
        migrator.cancellation().cancel();

        let report = migrator.apply(&ApplyOptions::default()).expect("apply");
        let execution = report.execution.expect("execution");
        assert_eq!(execution.status, PlanStatus::Aborted);
        assert_eq!(execution.completed, 0);
        let again = migrator.apply(&ApplyOptions::default()).expect("apply");
        assert_eq!(again.execution.expect("execution").status, PlanStatus::Aborted);

        let migrator = migrator.with_cancellation(CancellationToken::new());
        let resumed = migrator.apply(&ApplyOptions::default()).expect("apply");
        assert!(resumed.execution.expect("execution").is_completed());
    }

    #[test]
    fn test_history_is_newest_first() {
        let m = migrator(3);
        m.apply(&ApplyOptions::default()).expect("apply");
        m.rollback(&RollbackOptions::default()).expect("rollback");
        let history = m.history(Some(2)).expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].version, Version::new("3"));
        assert_eq!(history[0].action, crate::migration::HistoryAction::RolledBack);
    }
}
