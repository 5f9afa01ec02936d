use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::config::ConfigError;
use crate::sql::{Partitioned, SqlError};
use crate::zoid::{Tid, Zoid};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("SQL template error: {0}")]
    Sql(#[from] SqlError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Object not found: {0}")]
    NotFound(Zoid),

    #[error("Object {0} already exists")]
    Conflict(Zoid),

    #[error("Object {zoid} was changed by another transaction (read at tid {expected})")]
    TidConflict { zoid: Zoid, expected: Tid },

    #[error("Id {id:?} is already used in container {container}")]
    ConflictIdOnContainer { container: Zoid, id: String },

    #[error("Transaction is read-only")]
    ReadOnly,

    #[error("Transaction is already closed")]
    TransactionClosed,

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

impl StorageError {
    /// Conflicts are recoverable: retrying the whole transaction may succeed.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StorageError::Conflict(_)
                | StorageError::TidConflict { .. }
                | StorageError::ConflictIdOnContainer { .. }
        )
    }
}

/// Where a row hangs in the object tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectLink {
    /// Addressable content, contained by `parent_id`.
    Resource { parent_id: Option<Zoid> },
    /// Auxiliary data owned by the resource `of`.
    Annotation { of: Option<Zoid> },
}

impl ObjectLink {
    /// Build from the `resource`, `parent_id` and `of` columns.
    pub fn from_columns(resource: bool, parent_id: Option<Zoid>, of: Option<Zoid>) -> Self {
        if resource {
            ObjectLink::Resource { parent_id }
        } else {
            ObjectLink::Annotation { of }
        }
    }

    pub fn is_resource(&self) -> bool {
        matches!(self, ObjectLink::Resource { .. })
    }

    pub fn parent_id(&self) -> Option<Zoid> {
        match *self {
            ObjectLink::Resource { parent_id } => parent_id,
            ObjectLink::Annotation { .. } => None,
        }
    }

    pub fn of(&self) -> Option<Zoid> {
        match *self {
            ObjectLink::Resource { .. } => None,
            ObjectLink::Annotation { of } => of,
        }
    }

    /// The parent for resources, the owner for annotations.
    pub fn container(&self) -> Option<Zoid> {
        match *self {
            ObjectLink::Resource { parent_id } => parent_id,
            ObjectLink::Annotation { of } => of,
        }
    }
}

/// Linkage columns of one row, as loaded by the vacuum.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectRow {
    pub zoid: Zoid,
    pub link: ObjectLink,
}

/// A full object row.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRecord {
    pub zoid: Zoid,
    /// Tid of the stored version this record was read from; `None` until
    /// the object has been committed once.
    pub tid: Option<Tid>,
    pub link: ObjectLink,
    /// Traversal name within the container.
    pub id: Option<String>,
    pub type_name: String,
    pub part: i64,
    pub state: Vec<u8>,
}

impl ObjectRecord {
    pub fn resource(
        zoid: Zoid,
        parent_id: Zoid,
        id: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            zoid,
            tid: None,
            link: ObjectLink::Resource {
                parent_id: Some(parent_id),
            },
            id: Some(id.into()),
            type_name: type_name.into(),
            part: 0,
            state: Vec::new(),
        }
    }

    pub fn annotation(
        zoid: Zoid,
        of: Zoid,
        id: impl Into<String>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            zoid,
            tid: None,
            link: ObjectLink::Annotation { of: Some(of) },
            id: Some(id.into()),
            type_name: type_name.into(),
            part: 0,
            state: Vec::new(),
        }
    }

    pub fn with_state(mut self, state: impl Into<Vec<u8>>) -> Self {
        self.state = state.into();
        self
    }

    pub fn with_part(mut self, part: i64) -> Self {
        self.part = part;
        self
    }

    /// Decode the payload as JSON.
    pub fn state_json<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_slice(&self.state)?)
    }

    /// Replace the payload with `value` encoded as JSON.
    pub fn set_state_json<T: Serialize>(&mut self, value: &T) -> Result<(), StorageError> {
        self.state = serde_json::to_vec(value)?;
        Ok(())
    }
}

impl Partitioned for ObjectRecord {
    fn part_id(&self) -> i64 {
        self.part
    }
}

/// One chunk of a blob, stored alongside its owning object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobChunk {
    pub bid: String,
    pub zoid: Zoid,
    pub chunk_index: i32,
    pub data: Bytes,
}

/// Everything a transaction writes, applied atomically at commit.
#[derive(Clone, Debug, Default)]
pub struct ChangeSet {
    /// Objects never stored before.
    pub added: Vec<ObjectRecord>,
    /// Updates, checked against the tid they were read at.
    pub modified: Vec<ObjectRecord>,
    /// Soft deletes: re-parented under the trash, checked when the tid is known.
    pub trashed: Vec<(Zoid, Option<Tid>)>,
    /// Hard deletes: row and blobs removed.
    pub purged: Vec<Zoid>,
    pub blob_deletes: Vec<String>,
    pub blob_writes: Vec<BlobChunk>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.trashed.is_empty()
            && self.purged.is_empty()
            && self.blob_deletes.is_empty()
            && self.blob_writes.is_empty()
    }
}
