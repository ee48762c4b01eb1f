//! Migration lifecycle engine
//!
//! This module turns versioned migration artifacts plus the applied-state
//! record into ordered, checked state transitions:
//! - Migration set loading and checksum validation
//! - Plan building for apply, rollback and squash
//! - Safety gate with pluggable checks
//! - Step-by-step execution with per-step commits and an event stream
//! - Command routing for the named sub-operations
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tideline::migration::{
//!     Action, ApplyOptions, FnRunner, InMemoryRecordStore, MigrationArtifact, Migrator,
//!     RunOutcome, RunRequest, RunnerError, StaticArtifactSource,
//! };
//!
//! fn run(request: &RunRequest<'_>) -> Result<RunOutcome, RunnerError> {
//!     println!("executing {}", request.action.body);
//!     Ok(RunOutcome::default())
//! }
//!
//! let source = StaticArtifactSource::new(vec![MigrationArtifact::new(
//!     "20240120120000",
//!     "create_users",
//!     Action::new("CREATE TABLE users (id BIGINT PRIMARY KEY)"),
//!     Some(Action::new("DROP TABLE users")),
//!     chrono::Utc::now(),
//! )]);
//!
//! let migrator = Migrator::new(
//!     Arc::new(source),
//!     Arc::new(InMemoryRecordStore::new()),
//!     Arc::new(FnRunner::new(run)),
//! );
//! let progress = migrator.events().subscribe_pattern("*.step");
//! let report = migrator.apply(&ApplyOptions::default())?;
//! for event in progress.try_iter() {
//!     println!("{}", event.event_type);
//! }
//! # let _ = report;
//! # Ok::<(), tideline::migration::MigrationError>(())
//! ```

pub mod artifact;
pub mod checksum;
pub mod error;
pub mod events;
pub mod executor;
pub mod lock;
pub mod migrator;
pub mod plan;
pub mod record;
pub mod router;
pub mod safety;
pub mod set;
pub mod status;
pub mod store;

pub use artifact::{
    Action, ArtifactDraft, ArtifactSource, MigrationArtifact, StaticArtifactSource, Version,
};
pub use checksum::{calculate_checksum, validate_checksum};
pub use error::{ErrorCategory, ErrorEnvelope, MigrationError};
pub use events::{Event, EventBus, EventFilter, EventKind};
pub use executor::{
    CancellationToken, ExecutionResult, FnRunner, LifecycleExecutor, PlanStatus, RunOutcome,
    RunRequest, Runner, RunnerError, StepFailure, StepReport, StepStatus,
};
pub use lock::{acquire_migration_lock, is_migration_lock_held, MigrationLockGuard};
pub use migrator::{
    ApplyOptions, CleanOptions, CleanReport, GenerateReport, LifecycleReport, Migrator,
    RollbackOptions, SquashOptions,
};
pub use plan::{
    build_apply_plan, build_rollback_plan, build_squash_plan, ApplyTarget, Operation, Plan,
    PlanStep, RollbackSelector,
};
pub use record::{
    state_checksum, AppliedRecord, BatchId, HistoryAction, HistoryEntry, RecordLedger,
    SquashRange, SquashRecord,
};
pub use router::{ArgKind, ArgSpec, CommandOutput, CommandRouter, HelpDescriptor, Route};
pub use safety::{SafetyCheck, SafetyContext, SafetyFinding, SafetyGate, SafetyReport, Severity};
pub use set::{ChecksumDrift, MigrationSet};
pub use status::{MigrationStatus, PendingMigration, VerifyReport};
pub use store::{InMemoryRecordStore, RecordStore};
