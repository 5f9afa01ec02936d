//! Barrow store - transactional object storage over SQL.
//!
//! Objects are addressed by [`Zoid`] and hang in a tree through their parent
//! (resources) or owner (annotations). Writes are buffered per
//! [`Transaction`] and applied atomically at commit with optimistic,
//! tid-based conflict detection. Soft-deleted subtrees are collected by the
//! [`vacuum`].

pub mod config;
pub mod database;
pub mod schema;
pub mod sql;
pub mod storage;
pub mod transaction;
pub mod vacuum;
pub mod zoid;

pub use config::{ConfigError, StorageConfig};
pub use database::{Database, Root};
pub use sql::{Dialect, RenderArgs, Sql, SqlError};
pub use storage::{
    BlobChunk, ChangeSet, ObjectLink, ObjectRecord, ObjectRow, RawConnection, SqliteStorage,
    Storage, StorageError,
};
pub use transaction::{Transaction, TransactionManager, TransactionStatus};
pub use vacuum::{VacuumError, VacuumOptions, VacuumReport, vacuum, vacuum_root};
pub use zoid::{ROOT_ID, TRASHED_ID, Tid, Zoid};
