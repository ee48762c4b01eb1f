//! Checksum calculation for migration artifacts, squash ranges and state

use crate::migration::{Action, MigrationError, Version};
use sha2::{Digest, Sha256};

/// Calculate SHA-256 checksum of raw migration content
///
/// Returns the hexadecimal SHA-256 hash of `content`.
#[must_use]
pub fn calculate_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Checksum of an artifact's content
///
/// Covers the name and both action bodies. A NUL separator keeps
/// `("ab", "c")` and `("a", "bc")` apart.
#[must_use]
pub fn artifact_checksum(name: &str, apply: &Action, rollback: Option<&Action>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(apply.body.as_bytes());
    hasher.update([0u8]);
    if let Some(rollback) = rollback {
        hasher.update([1u8]);
        hasher.update(rollback.body.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Ordered hash-of-hashes over `(version, checksum)` pairs
///
/// Used both for the synthetic checksum of a squash and for the state
/// checksum of a record store. Same input order, same output.
pub fn fold_checksums<'a, I>(entries: I) -> String
where
    I: IntoIterator<Item = (&'a Version, &'a str)>,
{
    let mut hasher = Sha256::new();
    for (version, checksum) in entries {
        hasher.update(version.as_str().as_bytes());
        hasher.update(b":");
        hasher.update(checksum.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

/// Validate checksum against stored value
///
/// # Errors
///
/// Returns `MigrationError::ChecksumMismatch` if they differ.
pub fn validate_checksum(
    version: &Version,
    name: &str,
    stored_checksum: &str,
    current_checksum: &str,
) -> Result<(), MigrationError> {
    if stored_checksum == current_checksum {
        Ok(())
    } else {
        Err(MigrationError::ChecksumMismatch {
            version: version.clone(),
            name: name.to_string(),
            stored: stored_checksum.to_string(),
            current: current_checksum.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_checksum_is_hex_sha256() {
        let checksum = calculate_checksum("");
        assert_eq!(
            checksum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_fold_is_order_sensitive() {
        let v1 = Version::new("1");
        let v2 = Version::new("2");
        let forward = fold_checksums([(&v1, "aa"), (&v2, "bb")]);
        let again = fold_checksums([(&v1, "aa"), (&v2, "bb")]);
        let reversed = fold_checksums([(&v2, "bb"), (&v1, "aa")]);
        assert_eq!(forward, again);
        assert_ne!(forward, reversed);
    }

    #[test]
    fn test_validate_checksum_reports_both_values() {
        let version = Version::new("3");
        let err = validate_checksum(&version, "users", "old", "new").unwrap_err();
        match err {
            MigrationError::ChecksumMismatch { stored, current, .. } => {
                assert_eq!(stored, "old");
                assert_eq!(current, "new");
            }
            other => panic!("Expected ChecksumMismatch, got {other:?}"),
        }
    }
}
