//! Applied-state records and the ledger that holds them

use crate::migration::checksum::fold_checksums;
use crate::migration::{MigrationError, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Groups migrations applied by the same run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inclusive version range covered by a squash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquashRange {
    pub from: Version,
    pub to: Version,
    /// Every original version folded into the squash, ascending
    pub covers: Vec<Version>,
}

/// One applied migration
///
/// This struct matches what a persistent store keeps per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedRecord {
    /// Migration version
    pub version: Version,

    /// Human-readable migration name
    pub name: String,

    /// Checksum of the artifact when it was applied
    pub checksum: String,

    /// When the migration was applied
    pub applied_at: DateTime<Utc>,

    /// Run that applied it
    pub batch: BatchId,

    /// Execution time in milliseconds (`None` if not recorded)
    pub execution_time_ms: Option<i64>,

    /// Set when this record stands in for a squashed range
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub squash: Option<SquashRange>,
}

impl AppliedRecord {
    /// Create a new `AppliedRecord`
    #[must_use]
    pub fn new(
        version: Version,
        name: String,
        checksum: String,
        applied_at: DateTime<Utc>,
        batch: BatchId,
        execution_time_ms: Option<i64>,
    ) -> Self {
        Self {
            version,
            name,
            checksum,
            applied_at,
            batch,
            execution_time_ms,
            squash: None,
        }
    }

    #[must_use]
    pub fn is_squash(&self) -> bool {
        self.squash.is_some()
    }

    /// Original versions this record accounts for
    #[must_use]
    pub fn covered_versions(&self) -> Vec<Version> {
        match &self.squash {
            Some(range) => range.covers.clone(),
            None => vec![self.version.clone()],
        }
    }

    /// Whether `version` is applied through this record
    #[must_use]
    pub fn covers(&self, version: &Version) -> bool {
        match &self.squash {
            Some(range) => range.covers.iter().any(|v| v == version),
            None => &self.version == version,
        }
    }
}

/// Compaction of a contiguous applied range into one synthetic record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquashRecord {
    pub range: SquashRange,
    pub name: String,
    /// Fold of the covered artifacts' checksums
    pub checksum: String,
    pub squashed_at: DateTime<Utc>,
    pub batch: BatchId,
    /// Records removed by the squash, kept for history
    pub replaced: Vec<AppliedRecord>,
}

impl SquashRecord {
    /// The synthetic record that replaces the range in the current state
    #[must_use]
    pub fn to_applied_record(&self) -> AppliedRecord {
        AppliedRecord {
            version: self.range.to.clone(),
            name: self.name.clone(),
            checksum: self.checksum.clone(),
            applied_at: self.squashed_at,
            batch: self.batch,
            execution_time_ms: None,
            squash: Some(self.range.clone()),
        }
    }
}

/// What happened in a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    Applied,
    RolledBack,
    Squashed,
}

impl fmt::Display for HistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HistoryAction::Applied => "applied",
            HistoryAction::RolledBack => "rolled_back",
            HistoryAction::Squashed => "squashed",
        })
    }
}

/// Append-only ledger line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub action: HistoryAction,
    pub version: Version,
    pub name: String,
    pub batch: BatchId,
    pub at: DateTime<Utc>,
}

/// Full persisted state of a record store
///
/// Stores keep one of these behind whatever exclusion they provide and
/// apply mutations through its methods, so every backend shares the same
/// transition rules.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLedger {
    #[serde(default)]
    pub records: BTreeMap<Version, AppliedRecord>,
    #[serde(default)]
    pub squashes: Vec<SquashRecord>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default)]
    pub lock_holder: Option<String>,
}

impl RecordLedger {
    /// Applied records, ascending by version
    #[must_use]
    pub fn current_state(&self) -> Vec<AppliedRecord> {
        self.records.values().cloned().collect()
    }

    /// Insert an applied record
    ///
    /// # Errors
    ///
    /// Fails if the version (or a squash covering it) is already recorded.
    pub fn apply(&mut self, record: AppliedRecord) -> Result<(), MigrationError> {
        if self.records.values().any(|r| r.covers(&record.version)) {
            return Err(MigrationError::Store(format!(
                "migration {} is already recorded as applied",
                record.version
            )));
        }
        self.history.push(HistoryEntry {
            action: HistoryAction::Applied,
            version: record.version.clone(),
            name: record.name.clone(),
            batch: record.batch,
            at: record.applied_at,
        });
        self.records.insert(record.version.clone(), record);
        Ok(())
    }

    /// Remove the record for `version`
    ///
    /// # Errors
    ///
    /// Fails if no record carries that version.
    pub fn rollback(&mut self, version: &Version) -> Result<AppliedRecord, MigrationError> {
        let record = self.records.remove(version).ok_or_else(|| {
            MigrationError::Store(format!("migration {version} is not recorded as applied"))
        })?;
        self.history.push(HistoryEntry {
            action: HistoryAction::RolledBack,
            version: record.version.clone(),
            name: record.name.clone(),
            batch: record.batch,
            at: Utc::now(),
        });
        Ok(record)
    }

    /// Replace `replaced` records with the squash's synthetic record
    ///
    /// # Errors
    ///
    /// Fails without changing anything if any replaced version is missing.
    pub fn squash(
        &mut self,
        mut squash: SquashRecord,
        replaced: &[Version],
    ) -> Result<(), MigrationError> {
        if let Some(missing) = replaced.iter().find(|v| !self.records.contains_key(*v)) {
            return Err(MigrationError::Store(format!(
                "cannot squash: migration {missing} is not recorded as applied"
            )));
        }
        squash.replaced = replaced
            .iter()
            .filter_map(|v| self.records.remove(v))
            .collect();
        let synthetic = squash.to_applied_record();
        self.history.push(HistoryEntry {
            action: HistoryAction::Squashed,
            version: synthetic.version.clone(),
            name: synthetic.name.clone(),
            batch: synthetic.batch,
            at: synthetic.applied_at,
        });
        self.records.insert(synthetic.version.clone(), synthetic);
        self.squashes.push(squash);
        Ok(())
    }

    /// Take the advisory lock if it is free or already ours
    pub fn try_lock(&mut self, holder: &str) -> bool {
        match &self.lock_holder {
            Some(current) if current != holder => false,
            _ => {
                self.lock_holder = Some(holder.to_string());
                true
            }
        }
    }

    /// Release the lock if `holder` owns it
    pub fn unlock(&mut self, holder: &str) {
        if self.lock_holder.as_deref() == Some(holder) {
            self.lock_holder = None;
        }
    }

    /// Drop every record whose version is in `versions`, returning them
    pub fn prune(&mut self, versions: &[Version]) -> Vec<AppliedRecord> {
        versions
            .iter()
            .filter_map(|v| self.records.remove(v))
            .collect()
    }

    /// Next batch number: one past the highest ever recorded
    #[must_use]
    pub fn next_batch(&self) -> BatchId {
        let highest = self.history.iter().map(|h| h.batch.0).max().unwrap_or(0);
        BatchId(highest + 1)
    }
}

/// Checksum of an ordered applied state
#[must_use]
pub fn state_checksum(records: &[AppliedRecord]) -> String {
    fold_checksums(records.iter().map(|r| (&r.version, r.checksum.as_str())))
}
