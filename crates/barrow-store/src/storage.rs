use async_trait::async_trait;

mod sqlite;
mod types;

pub use sqlite::SqliteStorage;
pub use types::{BlobChunk, ChangeSet, ObjectLink, ObjectRecord, ObjectRow, StorageError};

use crate::sql::{Dialect, PartitionSupport};
use crate::zoid::{Tid, Zoid};

/// Direct statement access, for administrative jobs that bypass the
/// transaction buffer.
#[async_trait]
pub trait RawConnection: Send + Sync {
    fn dialect(&self) -> Dialect;

    fn objects_table_name(&self) -> &str;

    fn blobs_table_name(&self) -> &str;

    /// Run a paged select returning `zoid, resource, parent_id, of`, binding
    /// `limit` and `offset` as the first and second parameters.
    async fn fetch_links(
        &self,
        sql: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ObjectRow>, StorageError>;

    /// Run a statement whose only parameter is a list of zoids.
    /// Returns the number of rows affected.
    async fn execute_zoids(&self, sql: &str, zoids: &[Zoid]) -> Result<u64, StorageError>;
}

#[async_trait]
pub trait Storage: RawConnection + PartitionSupport + 'static {
    fn read_only(&self) -> bool;

    // --- Lifecycle ---

    /// Create tables, indexes and sequences. Safe to call repeatedly.
    async fn create(&self) -> Result<(), StorageError>;

    /// Create the schema if needed and make sure the root and trash rows exist.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Drop everything `create` made.
    async fn remove(&self) -> Result<(), StorageError>;

    async fn next_tid(&self) -> Result<Tid, StorageError>;

    /// Last tid handed out, 0 on a fresh database.
    async fn current_tid(&self) -> Result<Tid, StorageError>;

    async fn next_zoid(&self) -> Result<Zoid, StorageError>;

    // --- Objects ---

    /// Load one object. Missing objects are `NotFound`.
    async fn load(&self, zoid: Zoid) -> Result<ObjectRecord, StorageError>;

    async fn get_child(&self, parent: Zoid, id: &str)
    -> Result<Option<ObjectRecord>, StorageError>;

    /// Children of `parent` among `ids`, in zoid order. Unknown ids are skipped.
    async fn get_children(
        &self,
        parent: Zoid,
        ids: &[String],
    ) -> Result<Vec<ObjectRecord>, StorageError>;

    async fn has_key(&self, parent: Zoid, id: &str) -> Result<bool, StorageError> {
        Ok(self.get_child(parent, id).await?.is_some())
    }

    async fn keys(&self, parent: Zoid) -> Result<Vec<String>, StorageError>;

    /// One page of child ids, pages numbered from 1.
    async fn page_of_keys(
        &self,
        parent: Zoid,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<String>, StorageError>;

    /// Number of children of `parent`.
    async fn len(&self, parent: Zoid) -> Result<u64, StorageError>;

    async fn get_annotation(
        &self,
        of: Zoid,
        id: &str,
    ) -> Result<Option<ObjectRecord>, StorageError>;

    async fn get_annotation_keys(&self, of: Zoid) -> Result<Vec<String>, StorageError>;

    // --- Blobs ---

    async fn read_blob_chunk(
        &self,
        bid: &str,
        chunk_index: i32,
    ) -> Result<Option<BlobChunk>, StorageError>;

    /// Every chunk of a blob, in chunk order.
    async fn read_blob_chunks(&self, bid: &str) -> Result<Vec<BlobChunk>, StorageError>;

    // --- Statistics ---

    async fn total_objects(&self) -> Result<u64, StorageError>;

    async fn total_resources(&self) -> Result<u64, StorageError>;

    async fn total_resources_of_type(&self, type_name: &str) -> Result<u64, StorageError>;

    // --- Writes ---

    /// Apply a commit atomically, stamping written rows with `tid`.
    /// On error nothing is applied.
    async fn apply(&self, changes: &ChangeSet, tid: Tid) -> Result<(), StorageError>;
}
