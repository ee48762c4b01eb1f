//! Plan builder: turn artifacts plus applied state into ordered steps

use crate::migration::checksum::fold_checksums;
use crate::migration::{
    Action, AppliedRecord, BatchId, MigrationError, MigrationSet, SquashRange, Version,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Apply,
    Rollback,
    Squash,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Apply => "apply",
            Operation::Rollback => "rollback",
            Operation::Squash => "squash",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How far an apply plan goes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ApplyTarget {
    #[default]
    Latest,
    Version(Version),
}

impl ApplyTarget {
    fn admits(&self, version: &Version) -> bool {
        match self {
            ApplyTarget::Latest => true,
            ApplyTarget::Version(target) => version <= target,
        }
    }
}

/// Which records a rollback plan takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackSelector {
    /// The newest `n` records
    Steps(usize),
    /// Every record of one batch
    Batch(BatchId),
    /// Every record of the newest batch
    LastBatch,
}

/// One operation of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub operation: Operation,
    /// Target version; the upper bound for a squash
    pub version: Version,
    pub name: String,
    /// Checksum recorded (apply, squash) or removed (rollback) by this step
    pub checksum: String,
    /// What the runner executes
    pub action: Action,
    /// When the rolled-back record was applied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub applied_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub squash: Option<SquashRange>,
    /// Record versions a squash replaces
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub replaced: Vec<Version>,
    /// State checksum once this step has committed
    pub expected_checksum: String,
}

impl PlanStep {
    #[must_use]
    pub fn label(&self) -> String {
        format!("{} {}_{}", self.operation, self.version, self.name)
    }
}

/// Ordered steps plus the state they were computed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub operation: Operation,
    pub steps: Vec<PlanStep>,
    /// State checksum the plan assumes before its first step
    pub base_checksum: String,
}

impl Plan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// State checksum after the whole plan
    #[must_use]
    pub fn final_checksum(&self) -> &str {
        self.steps
            .last()
            .map_or(self.base_checksum.as_str(), |s| s.expected_checksum.as_str())
    }

    #[must_use]
    pub fn versions(&self) -> Vec<&Version> {
        self.steps.iter().map(|s| &s.version).collect()
    }
}

/// Applied state being simulated while steps are planned
struct SimulatedState(BTreeMap<Version, String>);

impl SimulatedState {
    fn new(records: &[AppliedRecord]) -> Self {
        Self(
            records
                .iter()
                .map(|r| (r.version.clone(), r.checksum.clone()))
                .collect(),
        )
    }

    fn checksum(&self) -> String {
        fold_checksums(self.0.iter().map(|(v, c)| (v, c.as_str())))
    }
}

fn covered_versions(records: &[AppliedRecord]) -> Vec<Version> {
    let mut covered: Vec<Version> = records
        .iter()
        .flat_map(AppliedRecord::covered_versions)
        .collect();
    covered.sort();
    covered
}

/// Plan the contiguous run of unapplied artifacts up to `target`
///
/// An empty plan means there is nothing to apply; that is not an error.
///
/// # Errors
///
/// Returns `MigrationError::OutOfOrder` when a selected artifact is older
/// than the newest applied migration.
pub fn build_apply_plan(
    set: &MigrationSet,
    records: &[AppliedRecord],
    target: &ApplyTarget,
) -> Result<Plan, MigrationError> {
    let covered = covered_versions(records);
    let latest_applied = covered.last();
    let mut state = SimulatedState::new(records);
    let base_checksum = state.checksum();

    let mut steps = Vec::new();
    for artifact in set.iter() {
        if covered.binary_search(&artifact.version).is_ok() || !target.admits(&artifact.version) {
            continue;
        }
        if let Some(latest) = latest_applied {
            if &artifact.version < latest {
                return Err(MigrationError::OutOfOrder {
                    version: artifact.version.clone(),
                    latest_applied: latest.clone(),
                });
            }
        }
        state.0.insert(artifact.version.clone(), artifact.checksum.clone());
        steps.push(PlanStep {
            operation: Operation::Apply,
            version: artifact.version.clone(),
            name: artifact.name.clone(),
            checksum: artifact.checksum.clone(),
            action: artifact.apply.clone(),
            applied_at: None,
            squash: None,
            replaced: Vec::new(),
            expected_checksum: state.checksum(),
        });
    }

    log::debug!("Apply plan: {} step(s)", steps.len());
    Ok(Plan {
        operation: Operation::Apply,
        steps,
        base_checksum,
    })
}

/// Reverse action for a record, checked before anything runs
fn rollback_action(set: &MigrationSet, record: &AppliedRecord) -> Result<Action, MigrationError> {
    let reverse_one = |version: &Version, name: &str| -> Result<Action, MigrationError> {
        let artifact = set.get(version).ok_or_else(|| MigrationError::MissingArtifact {
            version: version.clone(),
            name: name.to_string(),
        })?;
        artifact
            .rollback
            .clone()
            .ok_or_else(|| MigrationError::Irreversible {
                version: artifact.version.clone(),
                name: artifact.name.clone(),
            })
    };

    match &record.squash {
        None => reverse_one(&record.version, &record.name),
        Some(range) => {
            let bodies = range
                .covers
                .iter()
                .rev()
                .map(|v| reverse_one(v, &record.name).map(|a| a.body))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Action::new(bodies.join("\n")))
        }
    }
}

/// Plan a rollback of the most recent records, newest version first
///
/// # Errors
///
/// Returns `MigrationError::Irreversible` or `MigrationError::MissingArtifact`
/// if any selected record cannot be reversed; no partial plan is returned.
pub fn build_rollback_plan(
    set: &MigrationSet,
    records: &[AppliedRecord],
    selector: RollbackSelector,
) -> Result<Plan, MigrationError> {
    let mut state = SimulatedState::new(records);
    let base_checksum = state.checksum();

    let mut newest_first: Vec<&AppliedRecord> = records.iter().collect();
    newest_first.sort_by(|a, b| b.version.cmp(&a.version));

    let selected: Vec<&AppliedRecord> = match selector {
        RollbackSelector::Steps(n) => newest_first.into_iter().take(n).collect(),
        RollbackSelector::Batch(batch) => newest_first
            .into_iter()
            .filter(|r| r.batch == batch)
            .collect(),
        RollbackSelector::LastBatch => match records.iter().map(|r| r.batch).max() {
            Some(last) => newest_first.into_iter().filter(|r| r.batch == last).collect(),
            None => Vec::new(),
        },
    };

    let mut steps = Vec::with_capacity(selected.len());
    for record in selected {
        let action = rollback_action(set, record)?;
        state.0.remove(&record.version);
        steps.push(PlanStep {
            operation: Operation::Rollback,
            version: record.version.clone(),
            name: record.name.clone(),
            checksum: record.checksum.clone(),
            action,
            applied_at: Some(record.applied_at),
            squash: record.squash.clone(),
            replaced: Vec::new(),
            expected_checksum: state.checksum(),
        });
    }

    log::debug!("Rollback plan: {} step(s)", steps.len());
    Ok(Plan {
        operation: Operation::Rollback,
        steps,
        base_checksum,
    })
}

/// Plan the compaction of an applied, contiguous range into one record
///
/// The synthetic checksum is the fold of the covered artifacts' checksums,
/// so squashing the same range again yields the same checksum.
///
/// # Errors
///
/// Returns `MigrationError::NonContiguousRange` if any artifact in the range
/// is unapplied, `MigrationError::Irreversible` if any lacks a rollback
/// action, and `MigrationError::InvalidArgument` for an inverted range or one
/// that cuts through an earlier squash.
pub fn build_squash_plan(
    set: &MigrationSet,
    records: &[AppliedRecord],
    from: &Version,
    to: &Version,
) -> Result<Plan, MigrationError> {
    let invalid = |reason: String| MigrationError::InvalidArgument {
        command: "squash".to_string(),
        argument: "from".to_string(),
        reason,
    };
    if from > to {
        return Err(invalid(format!("{from} is after {to}")));
    }

    let in_range: Vec<_> = set
        .iter()
        .filter(|a| &a.version >= from && &a.version <= to)
        .collect();
    let (Some(first), Some(last)) = (in_range.first(), in_range.last()) else {
        return Err(MigrationError::NonContiguousRange {
            from: from.clone(),
            to: to.clone(),
            missing: from.clone(),
        });
    };

    let covered = covered_versions(records);
    if let Some(unapplied) = in_range
        .iter()
        .find(|a| covered.binary_search(&a.version).is_err())
    {
        return Err(MigrationError::NonContiguousRange {
            from: from.clone(),
            to: to.clone(),
            missing: unapplied.version.clone(),
        });
    }
    if let Some(irreversible) = in_range.iter().find(|a| !a.is_reversible()) {
        return Err(MigrationError::Irreversible {
            version: irreversible.version.clone(),
            name: irreversible.name.clone(),
        });
    }

    let mut replaced = Vec::new();
    for record in records {
        let versions = record.covered_versions();
        let inside = versions.iter().filter(|v| *v >= from && *v <= to).count();
        if inside == 0 {
            continue;
        }
        if inside != versions.len() {
            return Err(invalid(format!(
                "range cuts through squash {}_{}",
                record.version, record.name
            )));
        }
        replaced.push(record.version.clone());
    }

    let covers: Vec<Version> = in_range.iter().map(|a| a.version.clone()).collect();
    let checksum = set
        .fold_range(&covers)
        .ok_or_else(|| invalid("range refers to missing artifacts".to_string()))?;
    let apply_body = in_range
        .iter()
        .map(|a| a.apply.body.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let mut state = SimulatedState::new(records);
    let base_checksum = state.checksum();
    for version in &replaced {
        state.0.remove(version);
    }
    state.0.insert(last.version.clone(), checksum.clone());

    let step = PlanStep {
        operation: Operation::Squash,
        version: last.version.clone(),
        name: format!("squash_{}_{}", first.version, last.version),
        checksum,
        action: Action::new(apply_body),
        applied_at: None,
        squash: Some(SquashRange {
            from: first.version.clone(),
            to: last.version.clone(),
            covers,
        }),
        replaced,
        expected_checksum: state.checksum(),
    };

    Ok(Plan {
        operation: Operation::Squash,
        steps: vec![step],
        base_checksum,
    })
}
