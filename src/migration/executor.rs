//! Lifecycle executor - walks a plan step by step
//!
//! Each step is run through the [`Runner`] and committed to the record store
//! before the next one starts. A failing step halts the plan, leaving the
//! store at the last committed step, so rebuilding the plan resumes exactly
//! where the run stopped.

use crate::migration::events::{EventBus, EventKind};
use crate::migration::lock::MigrationLockGuard;
use crate::migration::record::state_checksum;
use crate::migration::{
    Action, AppliedRecord, BatchId, MigrationError, Operation, Plan, PlanStep, RecordStore,
    SquashRecord, Version,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// What the runner is asked to do for one step
#[derive(Debug, Clone, Copy)]
pub struct RunRequest<'a> {
    pub operation: Operation,
    pub version: &'a Version,
    pub name: &'a str,
    pub action: &'a Action,
}

/// Successful runner result
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Runner failure, always reported as a failed step
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("{0}")]
    Failed(String),
    #[error("timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

/// The collaborator that actually touches the data store
///
/// Squash steps are passed too; runners that only execute SQL usually treat
/// them as a no-op since the range has already been applied.
pub trait Runner: Send + Sync {
    /// # Errors
    ///
    /// Any `RunnerError` fails the step and halts the plan.
    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome, RunnerError>;
}

/// Closure-backed [`Runner`]
pub struct FnRunner<F>(F);

impl<F> FnRunner<F>
where
    F: Fn(&RunRequest<'_>) -> Result<RunOutcome, RunnerError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> Runner for FnRunner<F>
where
    F: Fn(&RunRequest<'_>) -> Result<RunOutcome, RunnerError> + Send + Sync,
{
    fn run(&self, request: &RunRequest<'_>) -> Result<RunOutcome, RunnerError> {
        (self.0)(request)
    }
}

/// Shared flag checked between steps
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    PartiallyFailed,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub index: usize,
    pub operation: Operation,
    pub version: Version,
    pub name: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// The step that stopped a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub index: usize,
    pub version: Version,
    pub name: String,
    pub error: String,
    pub timed_out: bool,
}

/// Outcome of [`LifecycleExecutor::execute`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub operation: Operation,
    pub status: PlanStatus,
    pub batch: BatchId,
    /// Steps committed to the record store
    pub completed: usize,
    pub total: usize,
    pub steps: Vec<StepReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionResult {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == PlanStatus::Completed
    }
}

/// State machine that executes plans against a record store
pub struct LifecycleExecutor {
    store: Arc<dyn RecordStore>,
    bus: EventBus,
    lock_timeout: Duration,
}

impl std::fmt::Debug for LifecycleExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleExecutor")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

impl LifecycleExecutor {
    /// Executor that fails immediately when the lock is taken
    #[must_use]
    pub fn new(store: Arc<dyn RecordStore>, bus: EventBus) -> Self {
        Self {
            store,
            bus,
            lock_timeout: Duration::ZERO,
        }
    }

    /// Wait up to `timeout` for the migration lock
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Run `plan` to completion, first failure, or cancellation
    ///
    /// Runner failures do not produce `Err`; they come back as a
    /// `partially-failed` result.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::ConcurrentMigration` if the lock is held,
    /// `MigrationError::StalePlan` if the store no longer matches the state
    /// the plan was built from, or the store's error when reading it fails.
    /// Nothing has been mutated in any of these cases.
    pub fn execute(
        &self,
        plan: &Plan,
        runner: &dyn Runner,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, MigrationError> {
        let run_id = Uuid::new_v4();
        let _lock = MigrationLockGuard::acquire(
            self.store.as_ref(),
            format!("tideline-{run_id}"),
            self.lock_timeout,
        )?;

        let actual = state_checksum(&self.store.current_state()?);
        if actual != plan.base_checksum {
            return Err(MigrationError::StalePlan {
                expected: plan.base_checksum.clone(),
                actual,
            });
        }

        let batch = self.store.next_batch()?;
        let operation = plan.operation;
        let started_at = Utc::now();
        let mut steps: Vec<StepReport> = plan
            .steps
            .iter()
            .enumerate()
            .map(|(index, step)| StepReport {
                index,
                operation: step.operation,
                version: step.version.clone(),
                name: step.name.clone(),
                status: StepStatus::Pending,
                duration_ms: None,
                detail: None,
            })
            .collect();

        log::info!("Starting {} run {} ({} step(s))", operation, run_id, plan.len());
        self.bus.publish(
            EventKind::Started,
            operation,
            json!({ "run_id": run_id, "batch": batch, "steps": plan.len() }),
        );

        let mut status = PlanStatus::Running;
        let mut completed = 0;
        let mut failure = None;

        for (index, step) in plan.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                log::warn!("{} run {} cancelled before step {}", operation, run_id, index + 1);
                status = PlanStatus::Aborted;
                break;
            }

            #[cfg(feature = "tracing")]
            let _span = tracing::info_span!(
                "migration_step",
                operation = %step.operation,
                version = %step.version,
                run_id = %run_id
            )
            .entered();

            steps[index].status = StepStatus::Running;
            self.bus.publish(
                EventKind::StepStarted,
                operation,
                json!({
                    "run_id": run_id,
                    "index": index,
                    "version": step.version,
                    "name": step.name,
                }),
            );

            let start = Instant::now();
            let outcome = self.run_and_commit(step, runner, batch, start);
            let elapsed = start.elapsed();
            let duration_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
            steps[index].duration_ms = Some(duration_ms);

            #[cfg(feature = "metrics")]
            METRICS.record_step(operation, elapsed, outcome.is_ok());

            match outcome {
                Ok(result) => {
                    completed += 1;
                    steps[index].status = StepStatus::Succeeded;
                    steps[index].detail = result.detail;
                    log::info!("{} succeeded in {}ms", step.label(), duration_ms);
                    self.bus.publish(
                        EventKind::StepSucceeded,
                        operation,
                        json!({
                            "run_id": run_id,
                            "index": index,
                            "version": step.version,
                            "name": step.name,
                            "duration_ms": duration_ms,
                        }),
                    );
                }
                Err(err) => {
                    if err.is_committed() {
                        completed += 1;
                    }
                    let timed_out = matches!(err, StepError::Runner(RunnerError::TimedOut(_)));
                    let message = err.to_string();
                    steps[index].status = StepStatus::Failed;
                    steps[index].detail = Some(message.clone());
                    log::error!("{} failed: {}", step.label(), message);
                    self.bus.publish(
                        EventKind::StepFailed,
                        operation,
                        json!({
                            "run_id": run_id,
                            "index": index,
                            "version": step.version,
                            "name": step.name,
                            "error": message,
                            "timed_out": timed_out,
                        }),
                    );
                    failure = Some(StepFailure {
                        index,
                        version: step.version.clone(),
                        name: step.name.clone(),
                        error: message,
                        timed_out,
                    });
                    status = PlanStatus::PartiallyFailed;
                    break;
                }
            }
        }

        if status == PlanStatus::Running {
            status = PlanStatus::Completed;
        }

        let summary = json!({
            "run_id": run_id,
            "status": status,
            "completed": completed,
            "total": plan.len(),
        });
        if status == PlanStatus::Aborted {
            self.bus.publish(EventKind::Aborted, operation, summary);
        } else {
            self.bus.publish(EventKind::Done, operation, summary);
        }
        log::info!(
            "{} run {} finished: {:?}, {}/{} step(s) committed",
            operation,
            run_id,
            status,
            completed,
            plan.len()
        );

        Ok(ExecutionResult {
            run_id,
            operation,
            status,
            batch,
            completed,
            total: plan.len(),
            steps,
            failure,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Run one step and commit its record store mutation
    fn run_and_commit(
        &self,
        step: &PlanStep,
        runner: &dyn Runner,
        batch: BatchId,
        start: Instant,
    ) -> Result<RunOutcome, StepError> {
        let outcome = runner
            .run(&RunRequest {
                operation: step.operation,
                version: &step.version,
                name: &step.name,
                action: &step.action,
            })
            .map_err(StepError::Runner)?;

        let now = Utc::now();
        match step.operation {
            Operation::Apply => {
                let elapsed_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
                self.store.record_apply(AppliedRecord::new(
                    step.version.clone(),
                    step.name.clone(),
                    step.checksum.clone(),
                    now,
                    batch,
                    Some(elapsed_ms),
                ))
            }
            Operation::Rollback => self.store.record_rollback(&step.version),
            Operation::Squash => {
                let range = step.squash.clone().ok_or_else(|| {
                    StepError::Commit(MigrationError::Store(format!(
                        "squash step {} has no range",
                        step.version
                    )))
                })?;
                self.store.record_squash(
                    SquashRecord {
                        range,
                        name: step.name.clone(),
                        checksum: step.checksum.clone(),
                        squashed_at: now,
                        batch,
                        replaced: Vec::new(),
                    },
                    &step.replaced,
                )
            }
        }
        .map_err(StepError::Commit)?;

        let actual = state_checksum(&self.store.current_state().map_err(StepError::Commit)?);
        if actual != step.expected_checksum {
            return Err(StepError::Diverged {
                expected: step.expected_checksum.clone(),
                actual,
            });
        }

        Ok(outcome)
    }
}

#[derive(Debug, Error)]
enum StepError {
    #[error("{0}")]
    Runner(RunnerError),
    #[error("record store commit failed: {0}")]
    Commit(MigrationError),
    #[error("state diverged after commit: expected {expected}, found {actual}")]
    Diverged { expected: String, actual: String },
}

impl StepError {
    /// The step's record store mutation went through
    fn is_committed(&self) -> bool {
        matches!(self, StepError::Diverged { .. })
    }
}
