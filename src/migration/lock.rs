//! Advisory migration lock held through the record store

use crate::migration::{MigrationError, RecordStore};
use std::time::{Duration, Instant};

/// Pause between attempts while waiting for the lock
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock guard that automatically releases the lock when dropped
///
/// This ensures that locks are always released, even if an error occurs
/// part-way through a plan.
pub struct MigrationLockGuard<'a> {
    store: &'a dyn RecordStore,
    holder: String,
}

impl std::fmt::Debug for MigrationLockGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationLockGuard")
            .field("holder", &self.holder)
            .finish()
    }
}

impl<'a> MigrationLockGuard<'a> {
    /// Acquire the migration lock and create guard
    ///
    /// With a zero `timeout` a single attempt is made, so a held lock fails
    /// immediately.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::ConcurrentMigration` if the lock is still held
    /// by someone else when the timeout expires.
    pub fn acquire(
        store: &'a dyn RecordStore,
        holder: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, MigrationError> {
        let holder = holder.into();
        acquire_migration_lock(store, &holder, timeout)?;
        Ok(Self { store, holder })
    }

    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        // Errors cannot propagate out of drop
        if let Err(e) = self.store.unlock(&self.holder) {
            log::warn!("Failed to release migration lock held by {}: {}", self.holder, e);
        }
    }
}

/// Acquire the migration lock, polling until `timeout` has elapsed
///
/// # Errors
///
/// Returns `MigrationError::ConcurrentMigration` on timeout, or the store's
/// error if the lock state cannot be written.
pub fn acquire_migration_lock(
    store: &dyn RecordStore,
    holder: &str,
    timeout: Duration,
) -> Result<(), MigrationError> {
    let start = Instant::now();

    loop {
        if store.try_lock(holder)? {
            log::debug!("Migration lock acquired by {holder}");
            return Ok(());
        }

        if start.elapsed() >= timeout {
            let current = store.lock_holder()?;
            log::warn!(
                "Migration lock not acquired within {}ms, held by {}",
                timeout.as_millis(),
                current.as_deref().unwrap_or("unknown")
            );
            return Err(MigrationError::ConcurrentMigration { holder: current });
        }

        std::thread::sleep(LOCK_POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
    }
}

/// Check if the migration lock is currently held
///
/// # Errors
///
/// Returns the store's error if the lock state cannot be read.
pub fn is_migration_lock_held(store: &dyn RecordStore) -> Result<bool, MigrationError> {
    Ok(store.lock_holder()?.is_some())
}
