//! Engine configuration
//!
//! [`EngineConfig::load`] reads the `[migrations]` table from
//! `config/config.toml` and `TIDELINE__MIGRATIONS__*` environment variables.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "config/config.toml";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_destructive_grace_seconds")]
    pub destructive_grace_seconds: u64,
    #[serde(default)]
    pub lock_timeout_seconds: u64,
    #[serde(default = "default_rollback_steps")]
    pub default_rollback_steps: usize,
    /// Program that receives each action body on stdin
    #[serde(default)]
    pub runner_command: Option<String>,
}

fn default_directory() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_state_file() -> PathBuf {
    PathBuf::from("migrations/.tideline-state.json")
}

fn default_destructive_grace_seconds() -> u64 {
    24 * 60 * 60 // one day
}

fn default_rollback_steps() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            state_file: default_state_file(),
            destructive_grace_seconds: default_destructive_grace_seconds(),
            lock_timeout_seconds: 0,
            default_rollback_steps: default_rollback_steps(),
            runner_command: None,
        }
    }
}

impl EngineConfig {
    /// Load from `config/config.toml`, falling back to env vars.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when neither source yields a valid `[migrations]` table.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Same as [`load`](Self::load) with an explicit file path
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when neither source yields a valid `[migrations]` table.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let builder = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("TIDELINE").separator("__"));

        let settings = match builder.build() {
            Ok(cfg) => cfg,
            Err(err) => {
                // An unreadable file is not fatal, the environment may still be enough
                if path.exists() {
                    log::warn!(
                        "Failed to load config file {}, falling back to env: {}",
                        path.display(),
                        err
                    );
                }
                Config::builder()
                    .add_source(Environment::with_prefix("TIDELINE").separator("__"))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                        ))
                    })?
            }
        };

        match settings.get::<EngineConfig>("migrations") {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(ConfigError::Message(format!(
                "Migration configuration could not be loaded from file or environment: {e}"
            ))),
        }
    }

    /// Age beyond which a rollback needs `force`
    #[must_use]
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.destructive_grace_seconds).unwrap_or(i64::MAX))
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }
}
