//! Migration-specific error types

use crate::migration::safety::{SafetyFinding, Severity};
use crate::migration::Version;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Migration-specific errors
///
/// Runner failures are not in here: they end up in
/// [`ExecutionResult`](crate::migration::ExecutionResult) as a
/// `partially-failed` outcome.
#[derive(Debug, Clone, Error)]
pub enum MigrationError {
    /// Two artifacts share a version token
    #[error("Duplicate migration version {version}: '{first}' and '{second}'")]
    DuplicateVersion {
        version: Version,
        first: String,
        second: String,
    },

    /// The router does not know this sub-operation
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    /// Squash range is not fully applied or not contiguous
    #[error("Cannot squash {from}..={to}: version {missing} is not applied")]
    NonContiguousRange {
        from: Version,
        to: Version,
        missing: Version,
    },

    /// Bad argument in a command's argument bag
    #[error("Invalid argument '{argument}' for '{command}': {reason}")]
    InvalidArgument {
        command: String,
        argument: String,
        reason: String,
    },

    /// An unapplied artifact is older than the newest applied one
    #[error(
        "Migration {version} is pending but {latest_applied} is already applied.\n\
         Suggestion: give the new migration a version above {latest_applied}"
    )]
    OutOfOrder {
        version: Version,
        latest_applied: Version,
    },

    /// Migration name is not usable for a new artifact
    #[error("Invalid migration name '{0}': expected lowercase letters, digits and underscores")]
    InvalidName(String),

    /// Version token the engine cannot use
    #[error("Invalid migration version: {0}")]
    InvalidVersion(String),

    /// An applied artifact was edited after being applied
    #[error(
        "Migration '{name}' (version {version}) has been modified after being applied.\n\
         Stored checksum: {stored}\n\
         Current checksum: {current}\n\
         This indicates the migration was edited after deployment."
    )]
    ChecksumMismatch {
        version: Version,
        name: String,
        stored: String,
        current: String,
    },

    /// Rollback requested for an artifact without rollback action
    #[error("Migration '{name}' (version {version}) has no rollback action and cannot be reversed")]
    Irreversible { version: Version, name: String },

    /// A record points at an artifact the source no longer has
    #[error(
        "Applied migration {version}_{name} not found in artifact source.\n\
         Suggestion: Ensure all migration files are present in migrations directory"
    )]
    MissingArtifact { version: Version, name: String },

    /// The safety gate returned at least one blocking finding
    #[error("Plan blocked by safety gate: {}", blocking_summary(.findings))]
    Blocked { findings: Vec<SafetyFinding> },

    /// Record store changed between planning and execution
    #[error("Plan is stale: built against state {expected}, store is at {actual}")]
    StalePlan { expected: String, actual: String },

    /// Another process holds the migration lock
    #[error(
        "Migration lock is held by {}.\n\
         Another process may be running migrations. If this persists, check for a stuck \
         migration process or release the lock with `clean --release-lock`",
        .holder.as_deref().unwrap_or("another process")
    )]
    ConcurrentMigration { holder: Option<String> },

    /// Record store failure
    #[error("Record store error: {0}")]
    Store(String),

    /// Artifact source failure
    #[error("Artifact source error: {0}")]
    Source(String),

    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// Collaborator does not support the requested operation
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

fn blocking_summary(findings: &[SafetyFinding]) -> String {
    findings
        .iter()
        .filter(|f| f.severity == Severity::Blocking)
        .map(|f| format!("[{}] {}", f.check, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Broad class of an error, deciding how callers react
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad request; nothing was attempted
    Input,
    /// Plan refused before touching the record store
    Precondition,
    /// Exclusive access could not be obtained
    Concurrency,
    /// A collaborator (store, source, config) failed
    Collaborator,
}

/// Common envelope for reporting any [`MigrationError`]
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
    pub kind: &'static str,
    pub category: ErrorCategory,
    pub message: String,
    pub code: &'static str,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
}

impl MigrationError {
    /// Variant name
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            MigrationError::DuplicateVersion { .. } => "DuplicateVersion",
            MigrationError::UnknownCommand(_) => "UnknownCommand",
            MigrationError::NonContiguousRange { .. } => "NonContiguousRange",
            MigrationError::InvalidArgument { .. } => "InvalidArgument",
            MigrationError::OutOfOrder { .. } => "OutOfOrder",
            MigrationError::InvalidName(_) => "InvalidName",
            MigrationError::InvalidVersion(_) => "InvalidVersion",
            MigrationError::ChecksumMismatch { .. } => "ChecksumMismatch",
            MigrationError::Irreversible { .. } => "Irreversible",
            MigrationError::MissingArtifact { .. } => "MissingArtifact",
            MigrationError::Blocked { .. } => "Blocked",
            MigrationError::StalePlan { .. } => "StalePlan",
            MigrationError::ConcurrentMigration { .. } => "ConcurrentMigration",
            MigrationError::Store(_) => "Store",
            MigrationError::Source(_) => "Source",
            MigrationError::Config(_) => "Config",
            MigrationError::Unsupported(_) => "Unsupported",
        }
    }

    /// Stable machine-readable code
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::DuplicateVersion { .. } => "TL001",
            MigrationError::UnknownCommand(_) => "TL002",
            MigrationError::NonContiguousRange { .. } => "TL003",
            MigrationError::InvalidArgument { .. } => "TL004",
            MigrationError::OutOfOrder { .. } => "TL005",
            MigrationError::InvalidName(_) => "TL006",
            MigrationError::InvalidVersion(_) => "TL007",
            MigrationError::ChecksumMismatch { .. } => "TL101",
            MigrationError::Irreversible { .. } => "TL102",
            MigrationError::MissingArtifact { .. } => "TL103",
            MigrationError::Blocked { .. } => "TL104",
            MigrationError::StalePlan { .. } => "TL105",
            MigrationError::ConcurrentMigration { .. } => "TL201",
            MigrationError::Store(_) => "TL301",
            MigrationError::Source(_) => "TL302",
            MigrationError::Config(_) => "TL303",
            MigrationError::Unsupported(_) => "TL304",
        }
    }

    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            MigrationError::DuplicateVersion { .. }
            | MigrationError::UnknownCommand(_)
            | MigrationError::NonContiguousRange { .. }
            | MigrationError::InvalidArgument { .. }
            | MigrationError::OutOfOrder { .. }
            | MigrationError::InvalidName(_)
            | MigrationError::InvalidVersion(_) => ErrorCategory::Input,
            MigrationError::ChecksumMismatch { .. }
            | MigrationError::Irreversible { .. }
            | MigrationError::MissingArtifact { .. }
            | MigrationError::Blocked { .. }
            | MigrationError::StalePlan { .. } => ErrorCategory::Precondition,
            MigrationError::ConcurrentMigration { .. } => ErrorCategory::Concurrency,
            MigrationError::Store(_)
            | MigrationError::Source(_)
            | MigrationError::Config(_)
            | MigrationError::Unsupported(_) => ErrorCategory::Collaborator,
        }
    }

    /// Whether the same invocation can be repeated as-is
    ///
    /// Everything except store failures is raised before the first record
    /// store mutation. A store failure may have interrupted a run, so the
    /// caller must rebuild the plan from the current state instead.
    #[must_use]
    pub fn is_retry_safe(&self) -> bool {
        !matches!(self, MigrationError::Store(_))
    }

    /// Variant-specific payload for the envelope
    fn context(&self) -> Value {
        match self {
            MigrationError::DuplicateVersion { version, first, second } => {
                json!({ "version": version, "first": first, "second": second })
            }
            MigrationError::UnknownCommand(token) => json!({ "command": token }),
            MigrationError::NonContiguousRange { from, to, missing } => {
                json!({ "from": from, "to": to, "missing": missing })
            }
            MigrationError::InvalidArgument { command, argument, reason } => {
                json!({ "command": command, "argument": argument, "reason": reason })
            }
            MigrationError::OutOfOrder { version, latest_applied } => {
                json!({ "version": version, "latest_applied": latest_applied })
            }
            MigrationError::InvalidName(name) => json!({ "name": name }),
            MigrationError::InvalidVersion(version) => json!({ "version": version }),
            MigrationError::ChecksumMismatch { version, name, stored, current } => {
                json!({ "version": version, "name": name, "stored": stored, "current": current })
            }
            MigrationError::Irreversible { version, name }
            | MigrationError::MissingArtifact { version, name } => {
                json!({ "version": version, "name": name })
            }
            MigrationError::Blocked { findings } => json!({ "findings": findings }),
            MigrationError::StalePlan { expected, actual } => {
                json!({ "expected": expected, "actual": actual })
            }
            MigrationError::ConcurrentMigration { holder } => json!({ "holder": holder }),
            MigrationError::Store(_)
            | MigrationError::Source(_)
            | MigrationError::Config(_)
            | MigrationError::Unsupported(_) => Value::Null,
        }
    }

    /// Wrap the error in the common reporting envelope
    #[must_use]
    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            kind: self.kind(),
            category: self.category(),
            message: self.to_string(),
            code: self.code(),
            context: self.context(),
            timestamp: Utc::now(),
        }
    }
}

impl From<config::ConfigError> for MigrationError {
    fn from(error: config::ConfigError) -> Self {
        MigrationError::Config(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_carries_kind_code_and_context() {
        let err = MigrationError::Irreversible {
            version: Version::new("20240101000000"),
            name: "drop_legacy".to_string(),
        };
        let envelope = err.envelope();
        assert_eq!(envelope.kind, "Irreversible");
        assert_eq!(envelope.code, "TL102");
        assert_eq!(envelope.category, ErrorCategory::Precondition);
        assert_eq!(envelope.context["name"], "drop_legacy");
        assert!(envelope.message.contains("cannot be reversed"));
    }

    #[test]
    fn test_unknown_command_names_token() {
        let err = MigrationError::UnknownCommand("migrate-all".to_string());
        assert_eq!(err.category(), ErrorCategory::Input);
        assert!(err.to_string().contains("migrate-all"));
    }

    #[test]
    fn test_store_errors_are_not_retry_safe() {
        assert!(!MigrationError::Store("disk full".to_string()).is_retry_safe());
        assert!(MigrationError::ConcurrentMigration { holder: None }.is_retry_safe());
    }
}
