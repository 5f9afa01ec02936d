//! Transactions with optimistic concurrency.
//!
//! Reads go straight to storage (shadowed by this transaction's own pending
//! writes). Writes are buffered and applied in one atomic
//! [`Storage::apply`] at commit, stamped with a freshly allocated tid.
//! Updates and soft deletes are guarded by the tid each object was read
//! at, so of two transactions writing the same object from the same version
//! only the first to commit succeeds.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::{BlobChunk, ChangeSet, ObjectRecord, Storage, StorageError};
use crate::zoid::{Tid, Zoid};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionStatus::Active => "active",
            TransactionStatus::Committed => "committed",
            TransactionStatus::Aborted => "aborted",
        })
    }
}

/// Hands out transactions over one storage.
pub struct TransactionManager<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> Clone for TransactionManager<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: Storage> TransactionManager<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Start a transaction. Storages opened read-only only give read-only ones.
    pub async fn begin(&self, read_only: bool) -> Result<Transaction<S>, StorageError> {
        let start_tid = self.storage.current_tid().await?;
        let read_only = read_only || self.storage.read_only();
        let txn = Transaction {
            id: Uuid::new_v4(),
            storage: Arc::clone(&self.storage),
            start_tid,
            read_only,
            status: TransactionStatus::Active,
            added: BTreeMap::new(),
            modified: BTreeMap::new(),
            deleted: BTreeMap::new(),
            blob_writes: Vec::new(),
            blob_deletes: Vec::new(),
        };
        debug!(txn = %txn.id, %start_tid, read_only, "Began transaction");
        Ok(txn)
    }
}

#[derive(Clone, Debug)]
struct Deletion {
    tid: Option<Tid>,
    parent_id: Option<Zoid>,
    of: Option<Zoid>,
    id: Option<String>,
    purge: bool,
}

pub struct Transaction<S: Storage> {
    id: Uuid,
    storage: Arc<S>,
    start_tid: Tid,
    read_only: bool,
    status: TransactionStatus,
    added: BTreeMap<Zoid, ObjectRecord>,
    modified: BTreeMap<Zoid, ObjectRecord>,
    deleted: BTreeMap<Zoid, Deletion>,
    blob_writes: Vec<BlobChunk>,
    blob_deletes: Vec<String>,
}

impl<S: Storage> Transaction<S> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Last committed tid when this transaction began.
    pub fn start_tid(&self) -> Tid {
        self.start_tid
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    /// The storage underneath, for statements that bypass the buffer.
    pub fn connection(&self) -> &S {
        &self.storage
    }

    fn ensure_active(&self) -> Result<(), StorageError> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            _ => Err(StorageError::TransactionClosed),
        }
    }

    fn ensure_writable(&self) -> Result<(), StorageError> {
        self.ensure_active()?;
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    fn has_changes(&self) -> bool {
        !(self.added.is_empty()
            && self.modified.is_empty()
            && self.deleted.is_empty()
            && self.blob_writes.is_empty()
            && self.blob_deletes.is_empty())
    }

    /// The record as this transaction sees it, if it was written here.
    fn pending(&self, zoid: Zoid) -> Option<&ObjectRecord> {
        self.added.get(&zoid).or_else(|| self.modified.get(&zoid))
    }

    fn pending_records(&self) -> impl Iterator<Item = &ObjectRecord> {
        self.added.values().chain(self.modified.values())
    }

    /// Whether a stored record no longer looks the way storage says.
    fn shadowed(&self, zoid: Zoid) -> bool {
        self.deleted.contains_key(&zoid) || self.modified.contains_key(&zoid)
    }

    // --- Writes ---

    pub async fn new_zoid(&self) -> Result<Zoid, StorageError> {
        self.ensure_writable()?;
        self.storage.next_zoid().await
    }

    /// Stage a brand new object. Its zoid should come from [`Self::new_zoid`].
    pub fn add(&mut self, record: ObjectRecord) -> Result<(), StorageError> {
        self.ensure_writable()?;
        if record.tid.is_some() {
            return Err(StorageError::InvalidData(format!(
                "object {} is already stored",
                record.zoid
            )));
        }
        if record.zoid.is_sentinel() {
            return Err(StorageError::Conflict(record.zoid));
        }
        self.added.insert(record.zoid, record);
        Ok(())
    }

    /// Stage an update of an object previously read through this transaction.
    pub fn register(&mut self, record: ObjectRecord) -> Result<(), StorageError> {
        self.ensure_writable()?;
        if self.deleted.contains_key(&record.zoid) {
            return Err(StorageError::NotFound(record.zoid));
        }
        if let Some(pending) = self.added.get_mut(&record.zoid) {
            *pending = record;
            return Ok(());
        }
        if record.tid.is_none() {
            return Err(StorageError::InvalidData(format!(
                "object {} was never stored, use add",
                record.zoid
            )));
        }
        self.modified.insert(record.zoid, record);
        Ok(())
    }

    fn stage_deletion(&mut self, record: &ObjectRecord, purge: bool) -> Result<(), StorageError> {
        self.ensure_writable()?;
        if record.zoid.is_sentinel() {
            return Err(StorageError::InvalidData(format!(
                "object {} cannot be deleted",
                record.zoid
            )));
        }
        if self.added.remove(&record.zoid).is_some() {
            // never stored, nothing to tell storage
            self.blob_writes.retain(|chunk| chunk.zoid != record.zoid);
            return Ok(());
        }
        // the tid read is what guards the delete, not a later local edit
        let tid = self
            .modified
            .remove(&record.zoid)
            .and_then(|m| m.tid)
            .or(record.tid);
        self.deleted.insert(
            record.zoid,
            Deletion {
                tid,
                parent_id: record.link.parent_id(),
                of: record.link.of(),
                id: record.id.clone(),
                purge,
            },
        );
        Ok(())
    }

    /// Soft delete: the object moves under the trash and is collected later
    /// by the vacuum, along with everything below it.
    pub fn delete(&mut self, record: &ObjectRecord) -> Result<(), StorageError> {
        self.stage_deletion(record, false)
    }

    /// Hard delete of the row and its blobs. Children are left for the vacuum.
    pub fn purge(&mut self, record: &ObjectRecord) -> Result<(), StorageError> {
        self.stage_deletion(record, true)
    }

    // --- Reads ---

    pub async fn get(&self, zoid: Zoid) -> Result<ObjectRecord, StorageError> {
        self.ensure_active()?;
        if self.deleted.contains_key(&zoid) {
            return Err(StorageError::NotFound(zoid));
        }
        if let Some(record) = self.pending(zoid) {
            return Ok(record.clone());
        }
        self.storage.load(zoid).await
    }

    pub async fn get_child(
        &self,
        parent: Zoid,
        id: &str,
    ) -> Result<Option<ObjectRecord>, StorageError> {
        self.ensure_active()?;
        if let Some(record) = self
            .pending_records()
            .find(|r| r.link.parent_id() == Some(parent) && r.id.as_deref() == Some(id))
        {
            return Ok(Some(record.clone()));
        }
        let stored = self.storage.get_child(parent, id).await?;
        Ok(stored.filter(|r| !self.shadowed(r.zoid)))
    }

    pub async fn contains(&self, parent: Zoid, id: &str) -> Result<bool, StorageError> {
        Ok(self.get_child(parent, id).await?.is_some())
    }

    /// Child ids of `parent`: stored ones first, then ones added here.
    pub async fn keys(&self, parent: Zoid) -> Result<Vec<String>, StorageError> {
        self.ensure_active()?;
        let mut keys = self.storage.keys(parent).await?;

        // ids that moved away or were deleted in this transaction
        let gone: Vec<&str> = self
            .deleted
            .values()
            .filter(|d| d.parent_id == Some(parent))
            .filter_map(|d| d.id.as_deref())
            .collect();
        keys.retain(|k| !gone.contains(&k.as_str()));

        for record in self.modified.values() {
            if let Some(id) = &record.id
                && record.link.parent_id() != Some(parent)
            {
                keys.retain(|k| k != id);
            }
        }
        for record in self.pending_records() {
            if record.link.parent_id() == Some(parent)
                && let Some(id) = &record.id
                && !keys.contains(id)
            {
                keys.push(id.clone());
            }
        }
        Ok(keys)
    }

    pub async fn len(&self, parent: Zoid) -> Result<usize, StorageError> {
        Ok(self.keys(parent).await?.len())
    }

    pub async fn get_annotation(
        &self,
        of: Zoid,
        id: &str,
    ) -> Result<Option<ObjectRecord>, StorageError> {
        self.ensure_active()?;
        if let Some(record) = self
            .pending_records()
            .find(|r| r.link.of() == Some(of) && r.id.as_deref() == Some(id))
        {
            return Ok(Some(record.clone()));
        }
        let stored = self.storage.get_annotation(of, id).await?;
        Ok(stored.filter(|r| !self.shadowed(r.zoid)))
    }

    pub async fn get_annotation_keys(&self, of: Zoid) -> Result<Vec<String>, StorageError> {
        self.ensure_active()?;
        let mut keys = self.storage.get_annotation_keys(of).await?;
        let gone: Vec<&str> = self
            .deleted
            .values()
            .filter(|d| d.of == Some(of))
            .filter_map(|d| d.id.as_deref())
            .collect();
        keys.retain(|k| !gone.contains(&k.as_str()));
        for record in self.added.values() {
            if record.link.of() == Some(of)
                && let Some(id) = &record.id
                && !keys.contains(id)
            {
                keys.push(id.clone());
            }
        }
        Ok(keys)
    }

    // --- Blobs ---

    /// A fresh blob id.
    pub fn new_blob_id(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }

    pub fn write_blob_chunk(
        &mut self,
        bid: &str,
        zoid: Zoid,
        chunk_index: i32,
        data: impl Into<Bytes>,
    ) -> Result<(), StorageError> {
        self.ensure_writable()?;
        self.blob_writes
            .retain(|c| !(c.bid == bid && c.zoid == zoid && c.chunk_index == chunk_index));
        self.blob_writes.push(BlobChunk {
            bid: bid.to_string(),
            zoid,
            chunk_index,
            data: data.into(),
        });
        Ok(())
    }

    pub async fn read_blob_chunk(
        &self,
        bid: &str,
        chunk_index: i32,
    ) -> Result<Option<BlobChunk>, StorageError> {
        self.ensure_active()?;
        if let Some(chunk) = self
            .blob_writes
            .iter()
            .find(|c| c.bid == bid && c.chunk_index == chunk_index)
        {
            return Ok(Some(chunk.clone()));
        }
        if self.blob_deletes.iter().any(|b| b == bid) {
            return Ok(None);
        }
        self.storage.read_blob_chunk(bid, chunk_index).await
    }

    /// Drop every stored chunk of `bid` at commit, and any pending ones now.
    pub fn del_blob(&mut self, bid: &str) -> Result<(), StorageError> {
        self.ensure_writable()?;
        self.blob_writes.retain(|c| c.bid != bid);
        if !self.blob_deletes.iter().any(|b| b == bid) {
            self.blob_deletes.push(bid.to_string());
        }
        Ok(())
    }

    // --- Completion ---

    fn take_changes(&mut self) -> ChangeSet {
        let mut changes = ChangeSet {
            added: std::mem::take(&mut self.added).into_values().collect(),
            modified: std::mem::take(&mut self.modified).into_values().collect(),
            blob_deletes: std::mem::take(&mut self.blob_deletes),
            blob_writes: std::mem::take(&mut self.blob_writes),
            ..Default::default()
        };
        for (zoid, deletion) in std::mem::take(&mut self.deleted) {
            if deletion.purge {
                changes.purged.push(zoid);
            } else {
                changes.trashed.push((zoid, deletion.tid));
            }
        }
        changes
    }

    /// Apply every buffered write atomically.
    ///
    /// Returns the tid the writes were stamped with, or the start tid when
    /// there was nothing to write. On a conflict nothing is applied and the
    /// transaction ends aborted; check [`StorageError::is_conflict`] and
    /// retry from a new transaction.
    pub async fn commit(&mut self) -> Result<Tid, StorageError> {
        self.ensure_active()?;
        if !self.has_changes() {
            self.status = TransactionStatus::Committed;
            return Ok(self.start_tid);
        }
        self.ensure_writable()?;

        let changes = self.take_changes();
        let result = match self.storage.next_tid().await {
            Ok(tid) => self.storage.apply(&changes, tid).await.map(|()| tid),
            Err(err) => Err(err),
        };

        match result {
            Ok(tid) => {
                self.status = TransactionStatus::Committed;
                debug!(txn = %self.id, %tid, "Committed transaction");
                Ok(tid)
            }
            Err(err) => {
                self.status = TransactionStatus::Aborted;
                if err.is_conflict() {
                    warn!(txn = %self.id, %err, "Transaction conflict");
                }
                Err(err)
            }
        }
    }

    /// Discard buffered writes.
    pub fn abort(&mut self) {
        if self.status == TransactionStatus::Active {
            self.take_changes();
            self.status = TransactionStatus::Aborted;
            debug!(txn = %self.id, "Aborted transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ObjectLink, SqliteStorage};
    use crate::zoid::{ROOT_ID, TRASHED_ID};

    async fn manager() -> TransactionManager<SqliteStorage> {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage.initialize().await.unwrap();
        TransactionManager::new(Arc::new(storage))
    }

    async fn add_item(
        tm: &TransactionManager<SqliteStorage>,
        parent: Zoid,
        id: &str,
    ) -> Zoid {
        let mut txn = tm.begin(false).await.unwrap();
        let zoid = txn.new_zoid().await.unwrap();
        txn.add(ObjectRecord::resource(zoid, parent, id, "Item"))
            .unwrap();
        txn.commit().await.unwrap();
        zoid
    }

    #[tokio::test]
    async fn commit_stamps_tid() {
        let tm = manager().await;
        let mut txn = tm.begin(false).await.unwrap();
        assert_eq!(txn.start_tid(), Tid(0));
        let zoid = txn.new_zoid().await.unwrap();
        txn.add(ObjectRecord::resource(zoid, ROOT_ID, "a", "Item").with_state(b"x".to_vec()))
            .unwrap();

        // visible to the writer before commit
        let pending = txn.get(zoid).await.unwrap();
        assert_eq!(pending.tid, None);
        assert!(txn.contains(ROOT_ID, "a").await.unwrap());

        let tid = txn.commit().await.unwrap();
        assert_eq!(tid, Tid(1));
        assert_eq!(txn.status(), TransactionStatus::Committed);

        let txn = tm.begin(true).await.unwrap();
        assert_eq!(txn.start_tid(), Tid(1));
        let stored = txn.get(zoid).await.unwrap();
        assert_eq!(stored.tid, Some(Tid(1)));
        assert_eq!(stored.state, b"x");
    }

    #[tokio::test]
    async fn empty_commit_returns_start_tid() {
        let tm = manager().await;
        add_item(&tm, ROOT_ID, "a").await;
        let mut txn = tm.begin(true).await.unwrap();
        assert_eq!(txn.commit().await.unwrap(), Tid(1));
    }

    #[tokio::test]
    async fn closed_transactions_refuse_work() {
        let tm = manager().await;
        let mut txn = tm.begin(false).await.unwrap();
        txn.abort();
        assert_eq!(txn.status(), TransactionStatus::Aborted);
        assert!(matches!(
            txn.get(ROOT_ID).await,
            Err(StorageError::TransactionClosed)
        ));
        assert!(matches!(
            txn.commit().await,
            Err(StorageError::TransactionClosed)
        ));
    }

    #[tokio::test]
    async fn read_only_rejects_writes() {
        let tm = manager().await;
        let mut txn = tm.begin(true).await.unwrap();
        let record = ObjectRecord::resource(Zoid(10), ROOT_ID, "a", "Item");
        assert!(matches!(txn.add(record), Err(StorageError::ReadOnly)));
        assert!(matches!(txn.new_zoid().await, Err(StorageError::ReadOnly)));
    }

    #[tokio::test]
    async fn concurrent_writers_one_wins() {
        let tm = manager().await;
        let zoid = add_item(&tm, ROOT_ID, "a").await;

        let mut first = tm.begin(false).await.unwrap();
        let mut second = tm.begin(false).await.unwrap();

        let mut ours = first.get(zoid).await.unwrap();
        let mut theirs = second.get(zoid).await.unwrap();
        ours.state = b"first".to_vec();
        theirs.state = b"second".to_vec();
        first.register(ours).unwrap();
        second.register(theirs).unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(second.status(), TransactionStatus::Aborted);

        let txn = tm.begin(true).await.unwrap();
        assert_eq!(txn.get(zoid).await.unwrap().state, b"first");
    }

    #[tokio::test]
    async fn conflicting_delete_fails() {
        let tm = manager().await;
        let zoid = add_item(&tm, ROOT_ID, "a").await;

        let mut editor = tm.begin(false).await.unwrap();
        let mut deleter = tm.begin(false).await.unwrap();
        let mut record = editor.get(zoid).await.unwrap();
        let stale = deleter.get(zoid).await.unwrap();

        record.state = b"edited".to_vec();
        editor.register(record).unwrap();
        editor.commit().await.unwrap();

        deleter.delete(&stale).unwrap();
        assert!(matches!(
            deleter.commit().await,
            Err(StorageError::TidConflict { .. })
        ));
    }

    #[tokio::test]
    async fn same_id_in_container_conflicts() {
        let tm = manager().await;
        let mut first = tm.begin(false).await.unwrap();
        let mut second = tm.begin(false).await.unwrap();
        let a = first.new_zoid().await.unwrap();
        let b = second.new_zoid().await.unwrap();
        first
            .add(ObjectRecord::resource(a, ROOT_ID, "page", "Item"))
            .unwrap();
        second
            .add(ObjectRecord::resource(b, ROOT_ID, "page", "Item"))
            .unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, StorageError::ConflictIdOnContainer { .. }));
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn delete_moves_to_trash() {
        let tm = manager().await;
        let folder = add_item(&tm, ROOT_ID, "folder").await;
        let child = add_item(&tm, folder, "child").await;

        let mut txn = tm.begin(false).await.unwrap();
        let record = txn.get(folder).await.unwrap();
        txn.delete(&record).unwrap();
        assert!(matches!(
            txn.get(folder).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(txn.keys(ROOT_ID).await.unwrap().is_empty());
        txn.commit().await.unwrap();

        let txn = tm.begin(true).await.unwrap();
        let trashed = txn.get(folder).await.unwrap();
        assert_eq!(
            trashed.link,
            ObjectLink::Resource {
                parent_id: Some(TRASHED_ID)
            }
        );
        // the subtree stays until the vacuum runs
        assert_eq!(txn.get(child).await.unwrap().link.parent_id(), Some(folder));
        assert!(!txn.contains(ROOT_ID, "folder").await.unwrap());
    }

    #[tokio::test]
    async fn sentinels_cannot_be_deleted() {
        let tm = manager().await;
        let mut txn = tm.begin(false).await.unwrap();
        let root = txn.get(ROOT_ID).await.unwrap();
        assert!(txn.delete(&root).is_err());
        let trash = txn.get(TRASHED_ID).await.unwrap();
        assert!(txn.purge(&trash).is_err());
    }

    #[tokio::test]
    async fn purge_removes_row_and_blobs() {
        let tm = manager().await;
        let mut txn = tm.begin(false).await.unwrap();
        let zoid = txn.new_zoid().await.unwrap();
        txn.add(ObjectRecord::resource(zoid, ROOT_ID, "file", "File"))
            .unwrap();
        let bid = txn.new_blob_id();
        txn.write_blob_chunk(&bid, zoid, 0, &b"abc"[..]).unwrap();
        assert_eq!(
            txn.read_blob_chunk(&bid, 0).await.unwrap().unwrap().data,
            Bytes::from_static(b"abc")
        );
        txn.commit().await.unwrap();

        let mut txn = tm.begin(false).await.unwrap();
        let record = txn.get(zoid).await.unwrap();
        txn.purge(&record).unwrap();
        txn.commit().await.unwrap();

        let txn = tm.begin(true).await.unwrap();
        assert!(txn.read_blob_chunk(&bid, 0).await.unwrap().is_none());
        assert!(matches!(
            txn.get(zoid).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn del_blob_replaces_chunks() {
        let tm = manager().await;
        let mut txn = tm.begin(false).await.unwrap();
        let zoid = txn.new_zoid().await.unwrap();
        txn.add(ObjectRecord::resource(zoid, ROOT_ID, "file", "File"))
            .unwrap();
        txn.write_blob_chunk("blob", zoid, 0, &b"old"[..]).unwrap();
        txn.commit().await.unwrap();

        let mut txn = tm.begin(false).await.unwrap();
        txn.del_blob("blob").unwrap();
        assert!(txn.read_blob_chunk("blob", 0).await.unwrap().is_none());
        txn.write_blob_chunk("blob", zoid, 0, &b"new"[..]).unwrap();
        txn.commit().await.unwrap();

        let chunks = tm.storage().read_blob_chunks("blob").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data, Bytes::from_static(b"new"));
    }

    #[tokio::test]
    async fn annotations_and_pending_keys() {
        let tm = manager().await;
        let site = add_item(&tm, ROOT_ID, "site").await;
        add_item(&tm, site, "a").await;

        let mut txn = tm.begin(false).await.unwrap();
        let b = txn.new_zoid().await.unwrap();
        txn.add(ObjectRecord::resource(b, site, "b", "Item")).unwrap();
        let note = txn.new_zoid().await.unwrap();
        txn.add(ObjectRecord::annotation(note, site, "_registry", "Registry"))
            .unwrap();

        assert_eq!(txn.keys(site).await.unwrap(), vec!["a", "b"]);
        assert_eq!(txn.len(site).await.unwrap(), 2);
        assert_eq!(
            txn.get_annotation_keys(site).await.unwrap(),
            vec!["_registry"]
        );
        assert!(txn.get_annotation(site, "_registry").await.unwrap().is_some());
        txn.commit().await.unwrap();

        let txn = tm.begin(true).await.unwrap();
        let registry = txn.get_annotation(site, "_registry").await.unwrap().unwrap();
        assert_eq!(registry.zoid, note);
        assert_eq!(txn.keys(site).await.unwrap(), vec!["a", "b"]);
    }
}
