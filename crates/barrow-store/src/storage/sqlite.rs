//! SQLite storage backend.
//!
//! One connection behind an async mutex. Every statement is rendered from an
//! [`Sql`] template against the configured table names; sequences are
//! emulated with one-row tables (see [`Sequence::get_sql`]).

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, Params, Row, TransactionBehavior, ffi, params,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    BlobChunk, ChangeSet, ObjectLink, ObjectRecord, ObjectRow, RawConnection, Storage,
    StorageError,
};
use crate::config::StorageConfig;
use crate::schema::{Sequence, blobs_table, objects_table, tid_sequence, zoid_sequence};
use crate::sql::{Dialect, PartitionSupport, RenderArgs, Sql};
use crate::zoid::{ROOT_ID, Tid, Zoid};

macro_rules! object_columns {
    () => {
        "zoid, tid, resource, of, parent_id, id, type, part, state"
    };
}

const GET_OID: Sql = Sql::new(concat!(
    "SELECT ",
    object_columns!(),
    " FROM {table} WHERE zoid = ?1"
));

const GET_CHILD: Sql = Sql::new(concat!(
    "SELECT ",
    object_columns!(),
    " FROM {table} WHERE parent_id = ?1 AND id = ?2"
));

const GET_CHILDREN: Sql = Sql::new(concat!(
    "SELECT ",
    object_columns!(),
    " FROM {table} WHERE parent_id = ?1 AND id IN (SELECT value FROM json_each(?2)) ORDER BY zoid"
));

const GET_ANNOTATION: Sql = Sql::new(concat!(
    "SELECT ",
    object_columns!(),
    " FROM {table} WHERE of = ?1 AND id = ?2"
));

const GET_CHILDREN_KEYS: Sql = Sql::new("SELECT id FROM {table} WHERE parent_id = ?1 ORDER BY zoid");

const GET_CHILDREN_PAGE: Sql =
    Sql::new("SELECT id FROM {table} WHERE parent_id = ?1 ORDER BY zoid LIMIT ?2 OFFSET ?3");

const GET_ANNOTATION_KEYS: Sql = Sql::new("SELECT id FROM {table} WHERE of = ?1 ORDER BY zoid");

const NUM_CHILDREN: Sql = Sql::new("SELECT count(*) FROM {table} WHERE parent_id = ?1");

const NUM_ROWS: Sql = Sql::new("SELECT count(*) FROM {table}");

const NUM_RESOURCES: Sql = Sql::new("SELECT count(*) FROM {table} WHERE resource = TRUE");

const NUM_RESOURCES_BY_TYPE: Sql =
    Sql::new("SELECT count(*) FROM {table} WHERE resource = TRUE AND type = ?1");

const INSERT: Sql = Sql::new(
    "INSERT INTO {table} (zoid, tid, state_size, part, resource, of, otid, parent_id, id, type, state) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
);

// ?7 is the tid the update was based on: it becomes otid and guards the write.
const UPDATE: Sql = Sql::new(
    "UPDATE {table} SET tid = ?2, state_size = ?3, part = ?4, resource = ?5, of = ?6, \
     otid = ?7, parent_id = ?8, id = ?9, type = ?10, state = ?11 \
     WHERE zoid = ?1 AND tid = ?7",
);

macro_rules! trash_update {
    () => {
        "UPDATE {table} SET \
         parent_id = CASE WHEN resource THEN {trashed_id} ELSE parent_id END, \
         of = CASE WHEN resource THEN of ELSE {trashed_id} END, \
         otid = tid, tid = ?2 WHERE zoid = ?1"
    };
}

// Resources move under the trash by parent_id, annotations by of.
const TRASH: Sql = Sql::new(concat!(trash_update!(), " AND tid = ?3"));

const TRASH_UNCHECKED: Sql = Sql::new(trash_update!());

const DELETE_OBJECT: Sql = Sql::new("DELETE FROM {table} WHERE zoid = ?1");

const CREATE_ROOT: Sql = Sql::new(
    "INSERT INTO {table} (zoid, tid, state_size, part, resource, type) \
     SELECT {root_id}, 0, 0, 0, TRUE, 'Database' \
     WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE zoid = {root_id})",
);

const CREATE_TRASH: Sql = Sql::new(
    "INSERT INTO {table} (zoid, tid, state_size, part, resource, type) \
     SELECT {trashed_id}, 0, 0, 0, FALSE, 'TRASH_REF' \
     WHERE NOT EXISTS (SELECT 1 FROM {table} WHERE zoid = {trashed_id})",
);

const INSERT_BLOB_CHUNK: Sql = Sql::with_table(
    "INSERT INTO {table} (bid, zoid, chunk_index, data) VALUES (?1, ?2, ?3, ?4)",
    "blobs",
);

const READ_BLOB_CHUNK: Sql = Sql::with_table(
    "SELECT bid, zoid, chunk_index, data FROM {table} WHERE bid = ?1 AND chunk_index = ?2",
    "blobs",
);

const READ_BLOB_CHUNKS: Sql = Sql::with_table(
    "SELECT bid, zoid, chunk_index, data FROM {table} WHERE bid = ?1 ORDER BY chunk_index",
    "blobs",
);

const DELETE_BLOB: Sql = Sql::with_table("DELETE FROM {table} WHERE bid = ?1", "blobs");

const DELETE_OBJECT_BLOBS: Sql = Sql::with_table("DELETE FROM {table} WHERE zoid = ?1", "blobs");

/// Storage over a single SQLite database.
pub struct SqliteStorage {
    conn: Mutex<Connection>,
    config: StorageConfig,
}

impl SqliteStorage {
    /// Open (or create) the database file named by `config.path`.
    ///
    /// Does not create the schema; see [`Storage::initialize`].
    pub fn open(config: StorageConfig) -> Result<Self, StorageError> {
        config.validate()?;

        let conn = if config.is_in_memory() {
            Connection::open_in_memory()?
        } else if config.read_only {
            Connection::open_with_flags(
                &config.path,
                OpenFlags::SQLITE_OPEN_READ_ONLY
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            Connection::open(&config.path)?
        };
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.busy_timeout(Duration::from_secs(5))?;

        debug!(path = %config.path.display(), read_only = config.read_only, "Opened SQLite storage");
        Ok(Self {
            conn: Mutex::new(conn),
            config,
        })
    }

    /// Open a private in-memory database with the default table names.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::open(StorageConfig::in_memory())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    fn objects_args(&self) -> RenderArgs<'_> {
        RenderArgs::new()
            .storage(self)
            .table(&self.config.objects_table_name)
    }

    fn blobs_args(&self) -> RenderArgs<'_> {
        RenderArgs::new()
            .storage(self)
            .table(&self.config.blobs_table_name)
    }

    fn sequences(&self) -> [Sequence; 2] {
        let objects = &self.config.objects_table_name;
        [tid_sequence(objects), zoid_sequence(objects)]
    }

    async fn next_value(&self, sequence: Sequence) -> Result<i64, StorageError> {
        let sql = sequence.next_value_sql(Dialect::Sqlite);
        let conn = self.conn.lock().await;
        let value = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(value)
    }

    fn apply_changes(
        &self,
        conn: &Connection,
        changes: &ChangeSet,
        tid: Tid,
    ) -> Result<(), StorageError> {
        for record in &changes.added {
            let sql = INSERT.render(&self.objects_args().object(record))?;
            write_record(conn, &sql, record, tid, None)?;
        }

        for record in &changes.modified {
            let expected = record.tid.ok_or_else(|| {
                StorageError::InvalidData(format!("object {} was never loaded", record.zoid))
            })?;
            let sql = UPDATE.render(&self.objects_args().object(record))?;
            if write_record(conn, &sql, record, tid, Some(expected))? == 0 {
                return Err(StorageError::TidConflict {
                    zoid: record.zoid,
                    expected,
                });
            }
        }

        for &(zoid, expected) in &changes.trashed {
            match expected {
                Some(expected) => {
                    let sql = TRASH.render(&self.objects_args())?;
                    if conn.execute(&sql, params![zoid, tid, expected])? == 0 {
                        return Err(StorageError::TidConflict { zoid, expected });
                    }
                }
                None => {
                    let sql = TRASH_UNCHECKED.render(&self.objects_args())?;
                    if conn.execute(&sql, params![zoid, tid])? == 0 {
                        return Err(StorageError::NotFound(zoid));
                    }
                }
            }
        }

        for bid in &changes.blob_deletes {
            let sql = DELETE_BLOB.render(&self.blobs_args())?;
            conn.execute(&sql, params![bid])?;
        }

        for chunk in &changes.blob_writes {
            let sql = INSERT_BLOB_CHUNK.render(&self.blobs_args())?;
            conn.execute(
                &sql,
                params![chunk.bid, chunk.zoid, chunk.chunk_index, &chunk.data[..]],
            )?;
        }

        for &zoid in &changes.purged {
            let sql = DELETE_OBJECT_BLOBS.render(&self.blobs_args())?;
            conn.execute(&sql, params![zoid])?;
            let sql = DELETE_OBJECT.render(&self.objects_args())?;
            if conn.execute(&sql, params![zoid])? == 0 {
                return Err(StorageError::NotFound(zoid));
            }
        }

        Ok(())
    }
}

/// Run INSERT or UPDATE for `record`; both bind the same eleven columns.
fn write_record(
    conn: &Connection,
    sql: &str,
    record: &ObjectRecord,
    tid: Tid,
    otid: Option<Tid>,
) -> Result<usize, StorageError> {
    conn.execute(
        sql,
        params![
            record.zoid,
            tid,
            record.state.len() as i64,
            record.part,
            record.link.is_resource(),
            record.link.of(),
            otid,
            record.link.parent_id(),
            record.id,
            record.type_name,
            record.state,
        ],
    )
    .map_err(|err| constraint_error(err, record))
}

fn query_record(
    conn: &Connection,
    sql: &str,
    params: impl Params,
) -> Result<Option<ObjectRecord>, StorageError> {
    let record = conn.query_row(sql, params, record_from_row).optional()?;
    Ok(record)
}

fn query_ids(conn: &Connection, sql: &str, params: impl Params) -> Result<Vec<String>, StorageError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let ids = stmt
        .query_map(params, |row| row.get::<_, Option<String>>(0))?
        .filter_map(|id| id.transpose())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn query_count(conn: &Connection, sql: &str, params: impl Params) -> Result<u64, StorageError> {
    let count: i64 = conn.query_row(sql, params, |row| row.get(0))?;
    Ok(count as u64)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<ObjectRecord> {
    let resource: bool = row.get(2)?;
    Ok(ObjectRecord {
        zoid: row.get(0)?,
        tid: Some(row.get(1)?),
        link: ObjectLink::from_columns(resource, row.get(4)?, row.get(3)?),
        id: row.get(5)?,
        type_name: row.get(6)?,
        part: row.get(7)?,
        state: row.get::<_, Option<Vec<u8>>>(8)?.unwrap_or_default(),
    })
}

fn chunk_from_row(row: &Row<'_>) -> rusqlite::Result<BlobChunk> {
    Ok(BlobChunk {
        bid: row.get(0)?,
        zoid: row.get(1)?,
        chunk_index: row.get(2)?,
        data: Bytes::from(row.get::<_, Option<Vec<u8>>>(3)?.unwrap_or_default()),
    })
}

/// Translate key violations raised while writing `record`.
fn constraint_error(err: rusqlite::Error, record: &ObjectRecord) -> StorageError {
    if let rusqlite::Error::SqliteFailure(ref failure, _) = err {
        match failure.extended_code {
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY => return StorageError::Conflict(record.zoid),
            ffi::SQLITE_CONSTRAINT_UNIQUE => {
                return StorageError::ConflictIdOnContainer {
                    container: record.link.container().unwrap_or(ROOT_ID),
                    id: record.id.clone().unwrap_or_default(),
                };
            }
            _ => {}
        }
    }
    StorageError::Sqlite(err)
}

impl PartitionSupport for SqliteStorage {
    fn supports_partitioning(&self) -> bool {
        false
    }
}

#[async_trait]
impl RawConnection for SqliteStorage {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn objects_table_name(&self) -> &str {
        &self.config.objects_table_name
    }

    fn blobs_table_name(&self) -> &str {
        &self.config.blobs_table_name
    }

    async fn fetch_links(
        &self,
        sql: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ObjectRow>, StorageError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params![limit, offset], |row| {
                let resource: bool = row.get(1)?;
                Ok(ObjectRow {
                    zoid: row.get(0)?,
                    link: ObjectLink::from_columns(resource, row.get(2)?, row.get(3)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    async fn execute_zoids(&self, sql: &str, zoids: &[Zoid]) -> Result<u64, StorageError> {
        let list = serde_json::to_string(zoids)?;
        let conn = self.conn.lock().await;
        let affected = conn.execute(sql, params![list])?;
        Ok(affected as u64)
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    fn read_only(&self) -> bool {
        self.config.read_only
    }

    async fn create(&self) -> Result<(), StorageError> {
        let objects = &self.config.objects_table_name;
        let blobs = &self.config.blobs_table_name;

        let mut statements = objects_table(objects).get_statements(self, None);
        statements.extend(blobs_table(blobs, objects).get_statements(self, None));
        for sequence in self.sequences() {
            statements.extend(sequence.get_sql(Dialect::Sqlite));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        for statement in &statements {
            tx.execute_batch(statement)?;
        }
        tx.commit()?;

        info!(%objects, %blobs, "Created storage schema");
        Ok(())
    }

    async fn initialize(&self) -> Result<(), StorageError> {
        if self.config.read_only {
            debug!("Read-only storage, skipping schema creation");
            return Ok(());
        }

        self.create().await?;

        let root = CREATE_ROOT.render(&self.objects_args())?;
        let trash = CREATE_TRASH.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        conn.execute(&root, [])?;
        conn.execute(&trash, [])?;
        Ok(())
    }

    async fn remove(&self) -> Result<(), StorageError> {
        let objects = &self.config.objects_table_name;
        let mut statements = vec![
            blobs_table(&self.config.blobs_table_name, objects).drop(None),
            objects_table(objects).drop(None),
        ];
        statements.extend(self.sequences().iter().map(|s| s.drop(Dialect::Sqlite)));

        let conn = self.conn.lock().await;
        for statement in &statements {
            conn.execute_batch(statement)?;
        }
        info!(%objects, "Removed storage schema");
        Ok(())
    }

    async fn next_tid(&self) -> Result<Tid, StorageError> {
        let [tid, _] = self.sequences();
        Ok(Tid(self.next_value(tid).await?))
    }

    async fn current_tid(&self) -> Result<Tid, StorageError> {
        let [tid, _] = self.sequences();
        let sql = tid.current_value_sql();
        let conn = self.conn.lock().await;
        let value = conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(Tid(value))
    }

    async fn next_zoid(&self) -> Result<Zoid, StorageError> {
        let [_, zoid] = self.sequences();
        Ok(Zoid(self.next_value(zoid).await?))
    }

    async fn load(&self, zoid: Zoid) -> Result<ObjectRecord, StorageError> {
        let sql = GET_OID.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_record(&conn, &sql, params![zoid])?.ok_or(StorageError::NotFound(zoid))
    }

    async fn get_child(
        &self,
        parent: Zoid,
        id: &str,
    ) -> Result<Option<ObjectRecord>, StorageError> {
        let sql = GET_CHILD.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_record(&conn, &sql, params![parent, id])
    }

    async fn get_children(
        &self,
        parent: Zoid,
        ids: &[String],
    ) -> Result<Vec<ObjectRecord>, StorageError> {
        let sql = GET_CHILDREN.render(&self.objects_args())?;
        let list = serde_json::to_string(ids)?;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&sql)?;
        let records = stmt
            .query_map(params![parent, list], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    async fn keys(&self, parent: Zoid) -> Result<Vec<String>, StorageError> {
        let sql = GET_CHILDREN_KEYS.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_ids(&conn, &sql, params![parent])
    }

    async fn page_of_keys(
        &self,
        parent: Zoid,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<String>, StorageError> {
        let offset = page.saturating_sub(1) * page_size;
        let sql = GET_CHILDREN_PAGE.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_ids(
            &conn,
            &sql,
            params![parent, page_size as i64, offset as i64],
        )
    }

    async fn len(&self, parent: Zoid) -> Result<u64, StorageError> {
        let sql = NUM_CHILDREN.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_count(&conn, &sql, params![parent])
    }

    async fn get_annotation(
        &self,
        of: Zoid,
        id: &str,
    ) -> Result<Option<ObjectRecord>, StorageError> {
        let sql = GET_ANNOTATION.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_record(&conn, &sql, params![of, id])
    }

    async fn get_annotation_keys(&self, of: Zoid) -> Result<Vec<String>, StorageError> {
        let sql = GET_ANNOTATION_KEYS.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_ids(&conn, &sql, params![of])
    }

    async fn read_blob_chunk(
        &self,
        bid: &str,
        chunk_index: i32,
    ) -> Result<Option<BlobChunk>, StorageError> {
        let sql = READ_BLOB_CHUNK.render(&self.blobs_args())?;
        let conn = self.conn.lock().await;
        let chunk = conn
            .query_row(&sql, params![bid, chunk_index], chunk_from_row)
            .optional()?;
        Ok(chunk)
    }

    async fn read_blob_chunks(&self, bid: &str) -> Result<Vec<BlobChunk>, StorageError> {
        let sql = READ_BLOB_CHUNKS.render(&self.blobs_args())?;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&sql)?;
        let chunks = stmt
            .query_map(params![bid], chunk_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    async fn total_objects(&self) -> Result<u64, StorageError> {
        let sql = NUM_ROWS.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_count(&conn, &sql, [])
    }

    async fn total_resources(&self) -> Result<u64, StorageError> {
        let sql = NUM_RESOURCES.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_count(&conn, &sql, [])
    }

    async fn total_resources_of_type(&self, type_name: &str) -> Result<u64, StorageError> {
        let sql = NUM_RESOURCES_BY_TYPE.render(&self.objects_args())?;
        let conn = self.conn.lock().await;
        query_count(&conn, &sql, params![type_name])
    }

    async fn apply(&self, changes: &ChangeSet, tid: Tid) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        // dropping `tx` on error rolls everything back
        self.apply_changes(&tx, changes, tid)?;
        tx.commit()?;

        debug!(
            %tid,
            added = changes.added.len(),
            modified = changes.modified.len(),
            trashed = changes.trashed.len(),
            purged = changes.purged.len(),
            "Applied change set"
        );
        Ok(())
    }
}
