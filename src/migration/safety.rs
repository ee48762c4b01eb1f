//! Safety gate: pre-flight checks run against a plan before execution

use crate::migration::events::{EventBus, EventKind};
use crate::migration::{AppliedRecord, MigrationSet, Operation, Plan};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

/// How serious a finding is
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Blocking,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Blocking => "blocking",
        })
    }
}

/// Result of one check about one plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyFinding {
    pub severity: Severity,
    pub message: String,
    /// Name of the originating check
    pub check: String,
}

impl SafetyFinding {
    pub fn new(severity: Severity, check: &str, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            check: check.to_string(),
        }
    }
}

/// Everything a check may look at
pub struct SafetyContext<'a> {
    pub plan: &'a Plan,
    pub records: &'a [AppliedRecord],
    pub set: &'a MigrationSet,
    pub now: DateTime<Utc>,
    /// Explicit force flag from the caller
    pub force: bool,
}

/// A pre-flight check
pub trait SafetyCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Zero or more findings for this plan
    fn inspect(&self, ctx: &SafetyContext<'_>) -> Vec<SafetyFinding>;
}

/// Blocks rollbacks of migrations applied longer ago than the grace period
#[derive(Debug, Clone)]
pub struct DestructiveRollbackCheck {
    pub grace_period: Duration,
}

impl SafetyCheck for DestructiveRollbackCheck {
    fn name(&self) -> &str {
        "destructive-rollback"
    }

    fn inspect(&self, ctx: &SafetyContext<'_>) -> Vec<SafetyFinding> {
        ctx.plan
            .steps
            .iter()
            .filter(|step| step.operation == Operation::Rollback)
            .filter_map(|step| {
                let applied_at = step.applied_at?;
                let age = ctx.now.signed_duration_since(applied_at);
                if age <= self.grace_period {
                    return None;
                }
                let hours = age.num_hours();
                Some(if ctx.force {
                    SafetyFinding::new(
                        Severity::Warning,
                        self.name(),
                        format!(
                            "rolling back {}_{} applied {hours}h ago (forced)",
                            step.version, step.name
                        ),
                    )
                } else {
                    SafetyFinding::new(
                        Severity::Blocking,
                        self.name(),
                        format!(
                            "{}_{} was applied {hours}h ago, beyond the {}h grace period; \
                             pass force to roll it back",
                            step.version,
                            step.name,
                            self.grace_period.num_hours()
                        ),
                    )
                })
            })
            .collect()
    }
}

/// Blocks when any applied migration no longer matches its artifact
///
/// With an empty plan nothing would run, so drift is only reported as info.
#[derive(Debug, Clone, Default)]
pub struct ChecksumDriftCheck;

impl SafetyCheck for ChecksumDriftCheck {
    fn name(&self) -> &str {
        "checksum-drift"
    }

    fn inspect(&self, ctx: &SafetyContext<'_>) -> Vec<SafetyFinding> {
        let severity = if ctx.plan.is_empty() {
            Severity::Info
        } else {
            Severity::Blocking
        };
        ctx.set
            .drift(ctx.records)
            .into_iter()
            .map(|drift| {
                SafetyFinding::new(
                    severity,
                    self.name(),
                    format!(
                        "{}_{} changed since it was applied (stored {}, current {})",
                        drift.version, drift.name, drift.stored, drift.current
                    ),
                )
            })
            .collect()
    }
}

/// Notes that there is nothing to do
#[derive(Debug, Clone, Default)]
pub struct EmptyPlanCheck;

impl SafetyCheck for EmptyPlanCheck {
    fn name(&self) -> &str {
        "empty-plan"
    }

    fn inspect(&self, ctx: &SafetyContext<'_>) -> Vec<SafetyFinding> {
        if ctx.plan.is_empty() {
            vec![SafetyFinding::new(
                Severity::Info,
                self.name(),
                format!("nothing to {}", ctx.plan.operation),
            )]
        } else {
            Vec::new()
        }
    }
}

/// Overall outcome of an evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyReport {
    pub findings: Vec<SafetyFinding>,
}

impl SafetyReport {
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Blocking)
    }

    /// Highest severity found, `Info` when there are no findings
    #[must_use]
    pub fn verdict(&self) -> Severity {
        self.findings
            .iter()
            .map(|f| f.severity)
            .max()
            .unwrap_or(Severity::Info)
    }
}

/// Ordered battery of checks
pub struct SafetyGate {
    checks: Vec<Box<dyn SafetyCheck>>,
}

impl fmt::Debug for SafetyGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.checks.iter().map(|c| c.name()))
            .finish()
    }
}

impl SafetyGate {
    /// Built-in checks: destructive-rollback, checksum-drift, empty-plan
    #[must_use]
    pub fn new(grace_period: Duration) -> Self {
        Self {
            checks: vec![
                Box::new(DestructiveRollbackCheck { grace_period }),
                Box::new(ChecksumDriftCheck),
                Box::new(EmptyPlanCheck),
            ],
        }
    }

    /// Gate with no checks at all
    #[must_use]
    pub fn empty() -> Self {
        Self { checks: Vec::new() }
    }

    /// Append a check after the existing ones
    #[must_use]
    pub fn with_check(mut self, check: Box<dyn SafetyCheck>) -> Self {
        self.checks.push(check);
        self
    }

    #[must_use]
    pub fn check_names(&self) -> Vec<&str> {
        self.checks.iter().map(|c| c.name()).collect()
    }

    /// Run every check in order and collect findings
    pub fn evaluate(&self, ctx: &SafetyContext<'_>) -> SafetyReport {
        let findings = self
            .checks
            .iter()
            .flat_map(|check| check.inspect(ctx))
            .collect();
        SafetyReport { findings }
    }

    /// [`evaluate`](Self::evaluate), publishing each step on `bus`
    pub fn evaluate_with_events(&self, ctx: &SafetyContext<'_>, bus: &EventBus) -> SafetyReport {
        let operation = ctx.plan.operation;
        let mut findings = Vec::new();
        for check in &self.checks {
            bus.publish(
                EventKind::SafetyCheck,
                operation,
                json!({ "check": check.name(), "operation": operation }),
            );
            for finding in check.inspect(ctx) {
                bus.publish(EventKind::SafetyFinding, operation, json!(finding));
                findings.push(finding);
            }
        }
        let report = SafetyReport { findings };
        bus.publish(
            EventKind::SafetyVerdict,
            operation,
            json!({
                "operation": operation,
                "verdict": report.verdict(),
                "blocked": report.is_blocked(),
                "findings": report.findings.len(),
            }),
        );
        if report.is_blocked() {
            log::warn!("Safety gate blocked {} plan", operation);
        }
        report
    }
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}
