use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::StorageConfig;
use crate::storage::{SqliteStorage, Storage, StorageError};
use crate::transaction::{Transaction, TransactionManager};

/// A named, initialized storage and its transaction manager.
pub struct Database<S: Storage = SqliteStorage> {
    name: String,
    tm: TransactionManager<S>,
}

impl Database<SqliteStorage> {
    /// Open the SQLite database described by `config`, creating the schema
    /// and sentinel rows if needed.
    pub async fn open(name: impl Into<String>, config: StorageConfig) -> Result<Self, StorageError> {
        Self::from_storage(name, SqliteStorage::open(config)?).await
    }
}

impl<S: Storage> Database<S> {
    pub async fn from_storage(name: impl Into<String>, storage: S) -> Result<Self, StorageError> {
        storage.initialize().await?;
        let name = name.into();
        info!(database = %name, "Database ready");
        Ok(Self {
            name,
            tm: TransactionManager::new(Arc::new(storage)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn transaction_manager(&self) -> &TransactionManager<S> {
        &self.tm
    }

    pub fn storage(&self) -> &S {
        self.tm.storage()
    }

    pub async fn begin(&self, read_only: bool) -> Result<Transaction<S>, StorageError> {
        self.tm.begin(read_only).await
    }
}

/// Every configured database, by name.
pub struct Root<S: Storage = SqliteStorage> {
    databases: BTreeMap<String, Database<S>>,
}

impl<S: Storage> Default for Root<S> {
    fn default() -> Self {
        Self {
            databases: BTreeMap::new(),
        }
    }
}

impl Root<SqliteStorage> {
    /// Open and initialize every database in `configs`.
    pub async fn open(configs: &BTreeMap<String, StorageConfig>) -> Result<Self, StorageError> {
        let mut root = Self::default();
        for (name, config) in configs {
            root.insert(Database::open(name.clone(), config.clone()).await?);
        }
        Ok(root)
    }
}

impl<S: Storage> Root<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, database: Database<S>) {
        self.databases.insert(database.name.clone(), database);
    }

    pub fn get(&self, name: &str) -> Option<&Database<S>> {
        self.databases.get(name)
    }

    /// Databases in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Database<S>> {
        self.databases.values()
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}
