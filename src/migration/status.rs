//! Migration status tracking

use crate::migration::set::ChecksumDrift;
use crate::migration::{AppliedRecord, MigrationSet, Version};
use serde::Serialize;

/// Migration status information
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    /// Applied migrations (from the record store)
    pub applied: Vec<AppliedRecord>,

    /// Pending migrations (from the artifact source)
    pub pending: Vec<PendingMigration>,

    /// Applied migrations whose artifact changed since
    pub drift: Vec<ChecksumDrift>,

    /// Applied migrations with no artifact left
    pub orphans: Vec<AppliedRecord>,

    /// Total number of migrations (applied + pending)
    pub total: usize,

    /// Number of applied migrations
    pub applied_count: usize,

    /// Number of pending migrations
    pub pending_count: usize,
}

/// Represents a pending migration (not yet applied)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMigration {
    /// Migration version
    pub version: Version,

    /// Migration name
    pub name: String,

    /// Checksum
    pub checksum: String,

    /// Whether the artifact has a rollback action
    pub reversible: bool,
}

impl MigrationStatus {
    /// Create a new `MigrationStatus`
    #[must_use]
    pub fn new(applied: Vec<AppliedRecord>, pending: Vec<PendingMigration>) -> Self {
        let applied_count = applied.len();
        let pending_count = pending.len();
        let total = applied_count + pending_count;

        Self {
            applied,
            pending,
            drift: Vec::new(),
            orphans: Vec::new(),
            total,
            applied_count,
            pending_count,
        }
    }

    /// Compare artifacts against applied records without failing on drift
    #[must_use]
    pub fn from_state(set: &MigrationSet, records: &[AppliedRecord]) -> Self {
        let pending = set
            .iter()
            .filter(|a| !records.iter().any(|r| r.covers(&a.version)))
            .map(|a| PendingMigration {
                version: a.version.clone(),
                name: a.name.clone(),
                checksum: a.checksum.clone(),
                reversible: a.is_reversible(),
            })
            .collect();

        let mut status = Self::new(records.to_vec(), pending);
        status.drift = set.drift(records);
        status.orphans = set.orphans(records).into_iter().cloned().collect();
        status
    }

    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    /// Get the latest applied migration version
    #[must_use]
    pub fn latest_applied_version(&self) -> Option<&Version> {
        self.applied.iter().map(|m| &m.version).max()
    }

    /// Get the next pending migration version
    #[must_use]
    pub fn next_pending_version(&self) -> Option<&Version> {
        self.pending.first().map(|m| &m.version)
    }
}

/// Result of the `verify` operation
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub ok: bool,
    pub drift: Vec<ChecksumDrift>,
    pub orphans: Vec<AppliedRecord>,
    /// Unapplied artifacts older than the newest applied migration
    pub gaps: Vec<Version>,
}

impl VerifyReport {
    #[must_use]
    pub fn from_status(status: &MigrationStatus) -> Self {
        let gaps: Vec<Version> = match status.latest_applied_version() {
            Some(latest) => status
                .pending
                .iter()
                .filter(|p| &p.version < latest)
                .map(|p| p.version.clone())
                .collect(),
            None => Vec::new(),
        };
        Self {
            ok: status.drift.is_empty() && status.orphans.is_empty() && gaps.is_empty(),
            drift: status.drift.clone(),
            orphans: status.orphans.clone(),
            gaps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{Action, BatchId, MigrationArtifact};
    use chrono::Utc;

    fn artifact(version: &str) -> MigrationArtifact {
        MigrationArtifact::new(
            version,
            format!("m{version}"),
            Action::new(format!("up {version}")),
            None,
            Utc::now(),
        )
    }

    fn record_for(a: &MigrationArtifact) -> AppliedRecord {
        AppliedRecord::new(
            a.version.clone(),
            a.name.clone(),
            a.checksum.clone(),
            Utc::now(),
            BatchId(1),
            None,
        )
    }

    #[test]
    fn test_status_splits_applied_and_pending() {
        let set = MigrationSet::from_artifacts(vec![artifact("1"), artifact("2"), artifact("3")])
            .expect("set");
        let records = vec![record_for(&set.artifacts()[0])];
        let status = MigrationStatus::from_state(&set, &records);

        assert_eq!(status.applied_count, 1);
        assert_eq!(status.pending_count, 2);
        assert_eq!(status.total, 3);
        assert!(!status.is_up_to_date());
        assert_eq!(status.latest_applied_version(), Some(&Version::new("1")));
        assert_eq!(status.next_pending_version(), Some(&Version::new("2")));
        assert!(!status.pending[0].reversible);
    }

    #[test]
    fn test_verify_reports_gaps_and_orphans() {
        let set = MigrationSet::from_artifacts(vec![artifact("1"), artifact("2"), artifact("3")])
            .expect("set");
        let mut records = vec![record_for(&set.artifacts()[0]), record_for(&set.artifacts()[2])];
        records.push(record_for(&artifact("9")));

        let report = VerifyReport::from_status(&MigrationStatus::from_state(&set, &records));
        assert!(!report.ok);
        assert_eq!(report.gaps, [Version::new("2")]);
        assert_eq!(report.orphans.len(), 1);
        assert!(report.drift.is_empty());
    }

    #[test]
    fn test_clean_state_verifies_ok() {
        let set = MigrationSet::from_artifacts(vec![artifact("1")]).expect("set");
        let records = vec![record_for(&set.artifacts()[0])];
        let report = VerifyReport::from_status(&MigrationStatus::from_state(&set, &records));
        assert!(report.ok);
    }
}
