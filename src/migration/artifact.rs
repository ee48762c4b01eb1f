//! Migration artifacts: versioned definitions with apply/rollback actions

use crate::migration::checksum::artifact_checksum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Monotonic version token of a migration
///
/// Tokens made only of ASCII digits compare numerically (so `9` sorts before
/// `10` and leading zeros are ignored). Every numeric token sorts before
/// every other token, and other tokens compare lexically among themselves.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn is_numeric(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit())
    }

    /// Numeric value of the token, when it is all digits and fits in `u64`
    #[must_use]
    pub fn as_number(&self) -> Option<u64> {
        if self.is_numeric() {
            self.0.parse().ok()
        } else {
            None
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_numeric(), other.is_numeric()) {
            (true, true) => {
                let a = self.0.trim_start_matches('0');
                let b = other.0.trim_start_matches('0');
                a.len().cmp(&b.len()).then_with(|| a.cmp(b))
            }
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Version {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for Version {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Opaque action descriptor handed to the runner
///
/// The engine never interprets `body`; it is whatever the runner understands
/// (SQL text, a script path, a command name).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub body: String,
}

impl Action {
    pub fn new(body: impl Into<String>) -> Self {
        Self { body: body.into() }
    }
}

/// One versioned migration definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationArtifact {
    pub version: Version,
    pub name: String,
    /// `SHA-256` of name, apply body and rollback body
    pub checksum: String,
    pub apply: Action,
    /// `None` means the migration is irreversible
    pub rollback: Option<Action>,
    pub created_at: DateTime<Utc>,
}

impl MigrationArtifact {
    /// Build an artifact and compute its content checksum
    pub fn new(
        version: impl Into<Version>,
        name: impl Into<String>,
        apply: Action,
        rollback: Option<Action>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let name = name.into();
        let checksum = artifact_checksum(&name, &apply, rollback.as_ref());
        Self {
            version: version.into(),
            name,
            checksum,
            apply,
            rollback,
            created_at,
        }
    }

    #[must_use]
    pub fn is_reversible(&self) -> bool {
        self.rollback.is_some()
    }

    /// `version_name`, the conventional display label
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }
}

/// A migration about to be written by the artifact source (`generate`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub version: Version,
    pub name: String,
    pub apply_template: String,
    pub rollback_template: String,
    pub generated_at: DateTime<Utc>,
}

/// Read-only enumeration of migration artifacts
///
/// Implemented outside the engine (directory scanner, embedded list, remote
/// store). Checksums must be stable between calls for unchanged content.
pub trait ArtifactSource: Send + Sync {
    /// Enumerate every artifact. Order does not matter; the set sorts.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Source` when the artifacts cannot be read.
    fn list(&self) -> Result<Vec<MigrationArtifact>, crate::migration::MigrationError>;

    /// Persist a freshly generated artifact and return where it was written
    ///
    /// # Errors
    ///
    /// The default implementation returns `MigrationError::Unsupported`.
    fn create(&self, draft: &ArtifactDraft) -> Result<String, crate::migration::MigrationError> {
        Err(crate::migration::MigrationError::Unsupported(format!(
            "artifact source cannot create '{}_{}'",
            draft.version, draft.name
        )))
    }
}

/// Artifact source backed by a fixed list
#[derive(Debug, Clone, Default)]
pub struct StaticArtifactSource {
    artifacts: Vec<MigrationArtifact>,
}

impl StaticArtifactSource {
    #[must_use]
    pub fn new(artifacts: Vec<MigrationArtifact>) -> Self {
        Self { artifacts }
    }
}

impl ArtifactSource for StaticArtifactSource {
    fn list(&self) -> Result<Vec<MigrationArtifact>, crate::migration::MigrationError> {
        Ok(self.artifacts.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_versions_compare_by_value() {
        assert!(Version::new("9") < Version::new("10"));
        assert!(Version::new("0010") > Version::new("9"));
        assert_eq!(Version::new("007"), Version::new("7"));
        assert!(Version::new("20240120120000") < Version::new("20240120120001"));
    }

    #[test]
    fn test_mixed_versions_compare_lexically() {
        assert!(Version::new("v1") < Version::new("v2"));
        assert!(Version::new("10") < Version::new("v1"));
        assert!(Version::new("v10") < Version::new("v2"));
    }

    #[test]
    fn test_numeric_tokens_sort_before_mixed_ones() {
        let (two, ten, mixed) = (Version::new("2"), Version::new("10"), Version::new("1a"));
        assert!(two < ten);
        assert!(ten < mixed);
        assert!(two < mixed);

        let mut versions = vec![mixed.clone(), ten.clone(), Version::new("0b"), two.clone()];
        versions.sort();
        let tokens: Vec<&str> = versions.iter().map(Version::as_str).collect();
        assert_eq!(tokens, ["2", "10", "0b", "1a"]);
    }

    #[test]
    fn test_checksum_depends_on_content() {
        let now = Utc::now();
        let a = MigrationArtifact::new("1", "users", Action::new("CREATE TABLE users"), None, now);
        let b = MigrationArtifact::new("1", "users", Action::new("CREATE TABLE users"), None, now);
        let c = MigrationArtifact::new(
            "1",
            "users",
            Action::new("CREATE TABLE users"),
            Some(Action::new("DROP TABLE users")),
            now,
        );
        assert_eq!(a.checksum, b.checksum);
        assert_ne!(a.checksum, c.checksum);
        assert_eq!(a.checksum.len(), 64);
        assert!(!a.is_reversible());
        assert!(c.is_reversible());
    }
}
