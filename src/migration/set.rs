//! Ordered, validated collection of migration artifacts

use crate::migration::checksum::{fold_checksums, validate_checksum};
use crate::migration::{AppliedRecord, ArtifactSource, MigrationArtifact, MigrationError, Version};
use serde::Serialize;

/// A recorded checksum that no longer matches the artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumDrift {
    pub version: Version,
    pub name: String,
    pub stored: String,
    pub current: String,
}

impl From<ChecksumDrift> for MigrationError {
    fn from(drift: ChecksumDrift) -> Self {
        MigrationError::ChecksumMismatch {
            version: drift.version,
            name: drift.name,
            stored: drift.stored,
            current: drift.current,
        }
    }
}

/// Artifacts sorted by version, ascending, with unique versions
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    artifacts: Vec<MigrationArtifact>,
}

impl MigrationSet {
    /// Sort artifacts and reject duplicate versions
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DuplicateVersion` if two artifacts share a version.
    pub fn from_artifacts(mut artifacts: Vec<MigrationArtifact>) -> Result<Self, MigrationError> {
        artifacts.sort_by(|a, b| a.version.cmp(&b.version));
        if let Some(pair) = artifacts.windows(2).find(|w| w[0].version == w[1].version) {
            return Err(MigrationError::DuplicateVersion {
                version: pair[1].version.clone(),
                first: pair[0].name.clone(),
                second: pair[1].name.clone(),
            });
        }
        Ok(Self { artifacts })
    }

    /// Load from a source without comparing against applied records
    ///
    /// Used by read-only reporting, which lists drift instead of failing.
    ///
    /// # Errors
    ///
    /// Returns the source's error or `MigrationError::DuplicateVersion`.
    pub fn load_unverified(source: &dyn ArtifactSource) -> Result<Self, MigrationError> {
        Self::from_artifacts(source.list()?)
    }

    /// Load from a source and check applied records against current content
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::DuplicateVersion` for shared versions and
    /// `MigrationError::ChecksumMismatch` for the first drifted artifact.
    pub fn load(
        source: &dyn ArtifactSource,
        applied: &[AppliedRecord],
    ) -> Result<Self, MigrationError> {
        let set = Self::load_unverified(source)?;
        set.verify_checksums(applied)?;
        Ok(set)
    }

    /// # Errors
    ///
    /// Returns `MigrationError::ChecksumMismatch` for the first drifted artifact.
    pub fn verify_checksums(&self, applied: &[AppliedRecord]) -> Result<(), MigrationError> {
        match self.drift(applied).into_iter().next() {
            Some(drift) => {
                validate_checksum(&drift.version, &drift.name, &drift.stored, &drift.current)
            }
            None => Ok(()),
        }
    }

    /// Every applied record whose checksum differs from current content
    ///
    /// A squash record is compared with the fold of the artifacts it covers,
    /// and skipped when some of them are gone (compacted away on purpose).
    /// Records with no artifact at all are orphans, not drift.
    #[must_use]
    pub fn drift(&self, applied: &[AppliedRecord]) -> Vec<ChecksumDrift> {
        applied
            .iter()
            .filter_map(|record| {
                let current = match &record.squash {
                    Some(range) => self.fold_range(&range.covers)?,
                    None => self.get(&record.version)?.checksum.clone(),
                };
                (current != record.checksum).then(|| ChecksumDrift {
                    version: record.version.clone(),
                    name: record.name.clone(),
                    stored: record.checksum.clone(),
                    current,
                })
            })
            .collect()
    }

    /// Applied records whose artifact is no longer in the set
    #[must_use]
    pub fn orphans<'r>(&self, applied: &'r [AppliedRecord]) -> Vec<&'r AppliedRecord> {
        applied
            .iter()
            .filter(|r| !r.is_squash() && self.get(&r.version).is_none())
            .collect()
    }

    /// Fold the checksums of `versions`, or `None` if any artifact is missing
    #[must_use]
    pub fn fold_range(&self, versions: &[Version]) -> Option<String> {
        let artifacts = versions
            .iter()
            .map(|v| self.get(v))
            .collect::<Option<Vec<_>>>()?;
        Some(fold_checksums(
            artifacts.iter().map(|a| (&a.version, a.checksum.as_str())),
        ))
    }

    #[must_use]
    pub fn get(&self, version: &Version) -> Option<&MigrationArtifact> {
        self.artifacts
            .binary_search_by(|a| a.version.cmp(version))
            .ok()
            .map(|i| &self.artifacts[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &MigrationArtifact> {
        self.artifacts.iter()
    }

    #[must_use]
    pub fn artifacts(&self) -> &[MigrationArtifact] {
        &self.artifacts
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    #[must_use]
    pub fn latest_version(&self) -> Option<&Version> {
        self.artifacts.last().map(|a| &a.version)
    }
}
