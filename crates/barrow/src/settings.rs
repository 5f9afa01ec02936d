//! Settings file.
//!
//! ```json
//! {
//!   "databases": { "main": { "path": "main.db" } },
//!   "applications": ["shop"]
//! }
//! ```
//!
//! Relative database paths are taken from the settings file's directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use barrow_store::{ConfigError, StorageConfig};

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database {database:?}: {source}")]
    Config {
        database: String,
        #[source]
        source: ConfigError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub databases: BTreeMap<String, StorageConfig>,
    /// Active applications, for the migration runner.
    #[serde(default)]
    pub applications: Vec<String>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let mut settings: Self = serde_json::from_slice(&fs::read(path)?)?;
        if let Some(dir) = path.parent() {
            for config in settings.databases.values_mut() {
                if !config.is_in_memory() && config.path.is_relative() {
                    config.path = dir.join(&config.path);
                }
            }
        }
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        for (database, config) in &self.databases {
            config.validate().map_err(|source| SettingsError::Config {
                database: database.clone(),
                source,
            })?;
        }
        Ok(())
    }
}
