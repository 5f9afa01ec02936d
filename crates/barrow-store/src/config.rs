use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path that opens a private in-memory SQLite database.
pub const IN_MEMORY: &str = ":memory:";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid table name: {0:?}")]
    InvalidTableName(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub path: PathBuf,
    #[serde(default = "default_objects_table")]
    pub objects_table_name: String,
    #[serde(default = "default_blobs_table")]
    pub blobs_table_name: String,
    #[serde(default)]
    pub read_only: bool,
}

fn default_objects_table() -> String {
    "objects".into()
}

fn default_blobs_table() -> String {
    "blobs".into()
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            objects_table_name: default_objects_table(),
            blobs_table_name: default_blobs_table(),
            read_only: false,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    pub fn is_in_memory(&self) -> bool {
        self.path == Path::new(IN_MEMORY)
    }

    /// Table names end up inside SQL text, so only plain identifiers pass.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for name in [&self.objects_table_name, &self.blobs_table_name] {
            if !is_identifier(name) {
                return Err(ConfigError::InvalidTableName(name.clone()));
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
