//! Record store abstraction and the in-memory reference implementation

use crate::migration::record::{AppliedRecord, HistoryEntry, RecordLedger, SquashRecord};
use crate::migration::{BatchId, MigrationError, Version};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Persistence for "which migrations have been applied"
///
/// Mutations must be atomic with respect to each other and visible to the
/// same caller's next `current_state()`. The store is also responsible for
/// mutual exclusion between executors, through the advisory lock methods.
pub trait RecordStore: Send + Sync {
    /// Applied records, ascending by version
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the state cannot be read.
    fn current_state(&self) -> Result<Vec<AppliedRecord>, MigrationError>;

    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the version is already recorded or the write fails.
    fn record_apply(&self, record: AppliedRecord) -> Result<(), MigrationError>;

    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the version is not recorded or the write fails.
    fn record_rollback(&self, version: &Version) -> Result<(), MigrationError>;

    /// # Errors
    ///
    /// Returns `MigrationError::Store` if a replaced version is missing or the write fails.
    fn record_squash(&self, squash: SquashRecord, replaced: &[Version])
        -> Result<(), MigrationError>;

    /// Ledger of every apply, rollback and squash, oldest first
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the history cannot be read.
    fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError>;

    /// Remove records outright (used by `clean` for orphans)
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the write fails.
    fn prune(&self, versions: &[Version]) -> Result<Vec<AppliedRecord>, MigrationError>;

    /// Batch identifier for the next run
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the state cannot be read.
    fn next_batch(&self) -> Result<BatchId, MigrationError>;

    /// Take the advisory lock; `Ok(false)` when someone else holds it
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the lock state cannot be written.
    fn try_lock(&self, holder: &str) -> Result<bool, MigrationError>;

    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the lock state cannot be written.
    fn unlock(&self, holder: &str) -> Result<(), MigrationError>;

    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the lock state cannot be read.
    fn lock_holder(&self) -> Result<Option<String>, MigrationError>;

    /// Release the lock whoever holds it, returning the previous holder
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the lock state cannot be written.
    fn force_unlock(&self) -> Result<Option<String>, MigrationError>;
}

/// Record store kept in process memory
///
/// Every mutation runs under one write lock, so concurrent readers never see
/// a half-applied transition.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    ledger: RwLock<RecordLedger>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing ledger (fixtures, snapshots)
    #[must_use]
    pub fn with_ledger(ledger: RecordLedger) -> Self {
        Self {
            ledger: RwLock::new(ledger),
        }
    }

    /// Copy of the whole ledger
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Store` if the lock is poisoned.
    pub fn snapshot(&self) -> Result<RecordLedger, MigrationError> {
        Ok(self.read()?.clone())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, RecordLedger>, MigrationError> {
        self.ledger
            .read()
            .map_err(|e| MigrationError::Store(format!("Failed to lock record store: {e}")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, RecordLedger>, MigrationError> {
        self.ledger
            .write()
            .map_err(|e| MigrationError::Store(format!("Failed to lock record store: {e}")))
    }
}

impl RecordStore for InMemoryRecordStore {
    fn current_state(&self) -> Result<Vec<AppliedRecord>, MigrationError> {
        Ok(self.read()?.current_state())
    }

    fn record_apply(&self, record: AppliedRecord) -> Result<(), MigrationError> {
        self.write()?.apply(record)
    }

    fn record_rollback(&self, version: &Version) -> Result<(), MigrationError> {
        self.write()?.rollback(version).map(|_| ())
    }

    fn record_squash(
        &self,
        squash: SquashRecord,
        replaced: &[Version],
    ) -> Result<(), MigrationError> {
        self.write()?.squash(squash, replaced)
    }

    fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        Ok(self.read()?.history.clone())
    }

    fn prune(&self, versions: &[Version]) -> Result<Vec<AppliedRecord>, MigrationError> {
        Ok(self.write()?.prune(versions))
    }

    fn next_batch(&self) -> Result<BatchId, MigrationError> {
        Ok(self.read()?.next_batch())
    }

    fn try_lock(&self, holder: &str) -> Result<bool, MigrationError> {
        Ok(self.write()?.try_lock(holder))
    }

    fn unlock(&self, holder: &str) -> Result<(), MigrationError> {
        self.write()?.unlock(holder);
        Ok(())
    }

    fn lock_holder(&self) -> Result<Option<String>, MigrationError> {
        Ok(self.read()?.lock_holder.clone())
    }

    fn force_unlock(&self) -> Result<Option<String>, MigrationError> {
        Ok(self.write()?.lock_holder.take())
    }
}
