//! Record store persisted as one JSON file
//!
//! Every access holds an OS file lock on a `<state>.lock` sidecar: shared for
//! reads, exclusive for read-modify-write cycles. Separate processes and
//! separate store instances on the same path therefore exclude each other.
//! Writes replace the file through a temp file in the same directory, so
//! readers never see a partially written state.

use crate::error::FileError;
use fd_lock::RwLock;
use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tideline::migration::{
    AppliedRecord, BatchId, HistoryEntry, MigrationError, RecordLedger, RecordStore,
    SquashRecord, Version,
};

#[derive(Debug)]
pub struct JsonFileRecordStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl JsonFileRecordStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_name = OsString::from(path.as_os_str());
        lock_name.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_name),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sidecar file the OS lock is taken on
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Current ledger; a missing file is an empty ledger
    ///
    /// # Errors
    ///
    /// Fails if the state file or its lock cannot be read, or the state is corrupt.
    pub fn load(&self) -> Result<RecordLedger, FileError> {
        let lock = self.open_lock()?;
        let _guard = lock.read().map_err(|source| self.lock_err(source))?;
        self.read_ledger()
    }

    fn lock_err(&self, source: std::io::Error) -> FileError {
        FileError::Lock {
            path: self.lock_path.clone(),
            source,
        }
    }

    fn open_lock(&self) -> Result<RwLock<File>, FileError> {
        if let Some(dir) = self.lock_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|source| self.lock_err(source))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|source| self.lock_err(source))?;
        Ok(RwLock::new(file))
    }

    fn read_ledger(&self) -> Result<RecordLedger, FileError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RecordLedger::default())
            }
            Err(source) => {
                return Err(FileError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        serde_json::from_str(&content).map_err(|source| FileError::CorruptState {
            path: self.path.clone(),
            source,
        })
    }

    fn save(&self, ledger: &RecordLedger) -> Result<(), FileError> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let write_err = |source| FileError::Write {
            path: self.path.clone(),
            source,
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;

        let mut tmp = NamedTempFile::new_in(&dir).map_err(write_err)?;
        let json = serde_json::to_vec_pretty(ledger).map_err(|source| FileError::CorruptState {
            path: self.path.clone(),
            source,
        })?;
        tmp.write_all(&json).map_err(write_err)?;
        tmp.as_file().sync_all().map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&RecordLedger) -> T) -> Result<T, MigrationError> {
        Ok(f(&self.load()?))
    }

    /// Load, mutate, persist under the exclusive lock; nothing is written when `f` fails
    fn update<T>(
        &self,
        f: impl FnOnce(&mut RecordLedger) -> Result<T, MigrationError>,
    ) -> Result<T, MigrationError> {
        let mut lock = self.open_lock()?;
        let _guard = lock.write().map_err(|source| self.lock_err(source))?;
        let mut ledger = self.read_ledger()?;
        let out = f(&mut ledger)?;
        self.save(&ledger)?;
        Ok(out)
    }
}

impl RecordStore for JsonFileRecordStore {
    fn current_state(&self) -> Result<Vec<AppliedRecord>, MigrationError> {
        self.read(RecordLedger::current_state)
    }

    fn record_apply(&self, record: AppliedRecord) -> Result<(), MigrationError> {
        self.update(|ledger| ledger.apply(record))
    }

    fn record_rollback(&self, version: &Version) -> Result<(), MigrationError> {
        self.update(|ledger| ledger.rollback(version).map(|_| ()))
    }

    fn record_squash(
        &self,
        squash: SquashRecord,
        replaced: &[Version],
    ) -> Result<(), MigrationError> {
        self.update(|ledger| ledger.squash(squash, replaced))
    }

    fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        self.read(|ledger| ledger.history.clone())
    }

    fn prune(&self, versions: &[Version]) -> Result<Vec<AppliedRecord>, MigrationError> {
        self.update(|ledger| Ok(ledger.prune(versions)))
    }

    fn next_batch(&self) -> Result<BatchId, MigrationError> {
        self.read(RecordLedger::next_batch)
    }

    fn try_lock(&self, holder: &str) -> Result<bool, MigrationError> {
        self.update(|ledger| Ok(ledger.try_lock(holder)))
    }

    fn unlock(&self, holder: &str) -> Result<(), MigrationError> {
        self.update(|ledger| {
            ledger.unlock(holder);
            Ok(())
        })
    }

    fn lock_holder(&self) -> Result<Option<String>, MigrationError> {
        self.read(|ledger| ledger.lock_holder.clone())
    }

    fn force_unlock(&self) -> Result<Option<String>, MigrationError> {
        self.update(|ledger| Ok(ledger.lock_holder.take()))
    }
}
