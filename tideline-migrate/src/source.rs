//! Migration file discovery and generation
//!
//! A migration is a pair of files in one directory:
//! `{version}_{name}.up.sql` and, for reversible migrations,
//! `{version}_{name}.down.sql`. The file bodies are the apply and rollback
//! actions handed to the runner.

use crate::error::FileError;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tideline::migration::{
    Action, ArtifactDraft, ArtifactSource, MigrationArtifact, MigrationError, Version,
};

const FILE_PATTERN: &str = r"^(\d+)_([a-z][a-z0-9_]*)\.(up|down)\.sql$";

/// Parsed migration file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFileName {
    pub version: String,
    pub name: String,
    pub is_rollback: bool,
}

impl MigrationFileName {
    /// Parse migration file name to extract version and name
    ///
    /// # Example
    /// - `20240120120000_create_users.up.sql` → version `20240120120000`, name `create_users`
    pub fn parse(filename: &str) -> Result<Self, FileError> {
        let re = Regex::new(FILE_PATTERN)
            .map_err(|_| FileError::BadFileName(filename.to_string()))?;
        let caps = re
            .captures(filename)
            .ok_or_else(|| FileError::BadFileName(filename.to_string()))?;
        match (caps.get(1), caps.get(2), caps.get(3)) {
            (Some(version), Some(name), Some(direction)) => Ok(Self {
                version: version.as_str().to_string(),
                name: name.as_str().to_string(),
                is_rollback: direction.as_str() == "down",
            }),
            _ => Err(FileError::BadFileName(filename.to_string())),
        }
    }
}

#[derive(Default)]
struct FilePair {
    name: String,
    up: Option<PathBuf>,
    down: Option<PathBuf>,
}

/// Artifact source reading a migrations directory
#[derive(Debug, Clone)]
pub struct DirectoryArtifactSource {
    dir: PathBuf,
}

impl DirectoryArtifactSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Scan the directory; non-`.sql` files are ignored
    pub fn discover(&self) -> Result<Vec<MigrationArtifact>, FileError> {
        if !self.dir.is_dir() {
            return Err(FileError::MissingDirectory(self.dir.clone()));
        }

        let entries = fs::read_dir(&self.dir).map_err(|source| FileError::Read {
            path: self.dir.clone(),
            source,
        })?;

        // Keyed by the raw version token so `1` and `01` stay distinct and
        // the migration set reports them as duplicates
        let mut pairs: BTreeMap<(String, String), FilePair> = BTreeMap::new();
        for entry in entries {
            let path = entry
                .map_err(|source| FileError::Read {
                    path: self.dir.clone(),
                    source,
                })?
                .path();
            if path.extension().and_then(|s| s.to_str()) != Some("sql") {
                continue;
            }
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| FileError::BadFileName(path.display().to_string()))?;
            let parsed = MigrationFileName::parse(filename)?;

            let pair = pairs
                .entry((parsed.version, parsed.name.clone()))
                .or_default();
            pair.name = parsed.name;
            if parsed.is_rollback {
                pair.down = Some(path);
            } else {
                pair.up = Some(path);
            }
        }

        let mut artifacts = Vec::with_capacity(pairs.len());
        for ((version, _), pair) in pairs {
            let (up_path, down_path) = match (pair.up, pair.down) {
                (Some(up), down) => (up, down),
                (None, Some(down)) => return Err(FileError::OrphanRollback(down)),
                (None, None) => continue,
            };
            let apply = read_action(&up_path)?;
            let rollback = down_path.as_deref().map(read_action).transpose()?;
            let created_at = modified_at(&up_path);
            artifacts.push(MigrationArtifact::new(
                Version::new(version),
                pair.name,
                apply,
                rollback,
                created_at,
            ));
        }
        log::debug!("Discovered {} migration(s) in {}", artifacts.len(), self.dir.display());
        Ok(artifacts)
    }

    fn write_new(path: &Path, content: &str) -> Result<(), FileError> {
        if path.exists() {
            return Err(FileError::AlreadyExists(path.to_path_buf()));
        }
        fs::write(path, content).map_err(|source| FileError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

fn read_action(path: &Path) -> Result<Action, FileError> {
    fs::read_to_string(path)
        .map(Action::new)
        .map_err(|source| FileError::Read {
            path: path.to_path_buf(),
            source,
        })
}

fn modified_at(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

impl ArtifactSource for DirectoryArtifactSource {
    fn list(&self) -> Result<Vec<MigrationArtifact>, MigrationError> {
        Ok(self.discover()?)
    }

    fn create(&self, draft: &ArtifactDraft) -> Result<String, MigrationError> {
        fs::create_dir_all(&self.dir).map_err(|source| FileError::Write {
            path: self.dir.clone(),
            source,
        })?;

        let stem = format!("{}_{}", draft.version, draft.name);
        let header = format!(
            "-- Migration: {}\n-- Version: {}\n-- Generated: {}\n",
            draft.name,
            draft.version,
            draft.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let up = self.dir.join(format!("{stem}.up.sql"));
        let down = self.dir.join(format!("{stem}.down.sql"));
        Self::write_new(&up, &format!("{header}{}", draft.apply_template))?;
        Self::write_new(&down, &format!("{header}{}", draft.rollback_template))?;
        Ok(up.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_filename() {
        let parsed = MigrationFileName::parse("20240120120000_create_users.up.sql").expect("parse");
        assert_eq!(parsed.version, "20240120120000");
        assert_eq!(parsed.name, "create_users");
        assert!(!parsed.is_rollback);
        assert!(MigrationFileName::parse("m20240120120000_create_users.rs").is_err());
        assert!(MigrationFileName::parse("1_Users.up.sql").is_err());
    }
}
