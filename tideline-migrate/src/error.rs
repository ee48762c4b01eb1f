//! Filesystem errors of the CLI collaborators

use std::path::PathBuf;
use thiserror::Error;
use tideline::migration::MigrationError;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Migrations directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error(
        "Migration file name '{0}' does not match expected pattern: {{VERSION}}_{{name}}.up.sql or .down.sql"
    )]
    BadFileName(String),

    #[error("Rollback file {} has no matching .up.sql", .0.display())]
    OrphanRollback(PathBuf),

    #[error("Refusing to overwrite existing migration {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("Failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("State file {} is corrupt: {source}", path.display())]
    CorruptState {
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl From<FileError> for MigrationError {
    fn from(error: FileError) -> Self {
        match error {
            FileError::CorruptState { .. } | FileError::Write { .. } | FileError::Lock { .. } => {
                MigrationError::Store(error.to_string())
            }
            _ => MigrationError::Source(error.to_string()),
        }
    }
}
