//! Garbage collection of orphaned rows.
//!
//! Soft deletes only re-parent an object under the trash; everything that
//! hung below it stays in the table. The vacuum snapshots the linkage
//! columns of the whole table, then repeatedly deletes rows whose parent (or
//! owner, for annotations) is missing or trashed, pruning them from the
//! snapshot after each pass, until a pass finds nothing. A subtree of depth
//! `d` below a trashed object therefore takes `d + 1` deleting passes plus
//! one empty pass.

use std::collections::BTreeMap;
use std::mem;

use thiserror::Error;
use tracing::{debug, info};

use crate::database::{Database, Root};
use crate::sql::{RenderArgs, Sql, SqlError};
use crate::storage::{ObjectLink, RawConnection, Storage, StorageError};
use crate::zoid::{ROOT_ID, TRASHED_ID, Zoid};

pub const PAGE_SIZE: i64 = 1000;
pub const DEFAULT_REMOVE_BATCH_SIZE: usize = 100;
pub const DEFAULT_MAX_PASSES: usize = 10_000;

const GET_OBJECTS: Sql =
    Sql::new("SELECT zoid, resource, parent_id, of FROM {table} ORDER BY zoid LIMIT $1 OFFSET $2");

const DELETE_BLOBS: Sql = Sql::with_table("DELETE FROM {table} WHERE zoid {zoids};", "blobs");

const DELETE_OBJECTS: Sql = Sql::new("DELETE FROM {table} WHERE zoid {zoids};");

#[derive(Debug, Error)]
pub enum VacuumError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("SQL template error: {0}")]
    Sql(#[from] SqlError),

    #[error("Vacuum did not converge after {passes} passes ({total} objects removed)")]
    DidNotConverge { passes: usize, total: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VacuumOptions {
    /// Report what would be removed without deleting anything.
    pub dry_run: bool,
    /// A batch is flushed once it holds more than this many zoids.
    pub remove_batch_size: usize,
    pub page_size: i64,
    /// Upper bound on passes; `None` runs until a pass finds nothing.
    ///
    /// The final empty pass counts against the bound, so a trashed chain of
    /// depth `d` needs `d + 1`.
    pub max_passes: Option<usize>,
}

impl Default for VacuumOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            remove_batch_size: DEFAULT_REMOVE_BATCH_SIZE,
            page_size: PAGE_SIZE,
            max_passes: Some(DEFAULT_MAX_PASSES),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VacuumReport {
    /// Objects removed (or that would be, on a dry run).
    pub total: usize,
    /// Passes run, including the final empty one.
    pub passes: usize,
    /// Removed zoids in removal order.
    pub removed: Vec<Zoid>,
    pub dry_run: bool,
}

/// One vacuum run over a raw connection.
pub struct Vacuum<'c, C: RawConnection + ?Sized> {
    conn: &'c C,
    options: VacuumOptions,
    objects: BTreeMap<Zoid, ObjectLink>,
    remove_batch: Vec<Zoid>,
    removed: Vec<Zoid>,
    total: usize,
    run_total: usize,
    passes: usize,
    all_removed: Vec<Zoid>,
}

impl<'c, C: RawConnection + ?Sized> Vacuum<'c, C> {
    pub fn new(conn: &'c C, options: VacuumOptions) -> Self {
        Self {
            conn,
            options,
            objects: BTreeMap::new(),
            remove_batch: Vec::new(),
            removed: Vec::new(),
            total: 0,
            run_total: 0,
            passes: 0,
            all_removed: Vec::new(),
        }
    }

    /// Load the linkage columns of every row into the snapshot.
    pub async fn gather_data(&mut self) -> Result<(), VacuumError> {
        let sql = GET_OBJECTS.render(&RenderArgs::new().table(self.conn.objects_table_name()))?;
        let page_size = self.options.page_size.max(1);
        let mut offset = 0;

        loop {
            let rows = self.conn.fetch_links(&sql, page_size, offset).await?;
            let count = rows.len() as i64;
            debug!(offset, rows = count, "Loaded object page");
            for row in rows {
                self.objects.insert(row.zoid, row.link);
            }
            if count < page_size {
                break;
            }
            offset += page_size;
        }

        info!(objects = self.objects.len(), "Gathered object snapshot");
        Ok(())
    }

    fn is_live_container(&self, zoid: Option<Zoid>) -> bool {
        match zoid {
            None => false,
            Some(zoid) if zoid == TRASHED_ID => false,
            Some(zoid) if zoid == ROOT_ID => true,
            Some(zoid) => self.objects.contains_key(&zoid),
        }
    }

    fn is_orphan(&self, zoid: Zoid, link: &ObjectLink) -> bool {
        if zoid.is_sentinel() {
            return false;
        }
        match *link {
            ObjectLink::Resource { parent_id } => !self.is_live_container(parent_id),
            ObjectLink::Annotation { of } => !self.is_live_container(of),
        }
    }

    async fn process_batch(&mut self) -> Result<(), VacuumError> {
        let batch = mem::take(&mut self.remove_batch);
        if batch.is_empty() {
            return Ok(());
        }

        if !self.options.dry_run {
            let zoids = self.conn.dialect().zoid_set("$1");
            let blobs = DELETE_BLOBS.render(
                &RenderArgs::new()
                    .table(self.conn.blobs_table_name())
                    .with("zoids", &zoids),
            )?;
            let objects = DELETE_OBJECTS.render(
                &RenderArgs::new()
                    .table(self.conn.objects_table_name())
                    .with("zoids", &zoids),
            )?;
            self.conn.execute_zoids(&blobs, &batch).await?;
            self.conn.execute_zoids(&objects, &batch).await?;
        }

        self.total += batch.len();
        self.run_total += batch.len();
        info!(
            batch = batch.len(),
            total = self.total,
            dry_run = self.options.dry_run,
            "Removed orphaned objects"
        );
        self.removed.extend(batch);
        Ok(())
    }

    /// One pass over the snapshot. Returns how many orphans it removed.
    async fn scan(&mut self) -> Result<usize, VacuumError> {
        let orphans: Vec<Zoid> = self
            .objects
            .iter()
            .filter(|(zoid, link)| self.is_orphan(**zoid, link))
            .map(|(zoid, _)| *zoid)
            .collect();

        for zoid in orphans {
            self.remove_batch.push(zoid);
            if self.remove_batch.len() > self.options.remove_batch_size {
                self.process_batch().await?;
            }
        }
        self.process_batch().await?;
        Ok(self.run_total)
    }

    /// Forget what the last pass removed so the next pass sees its children
    /// as orphans.
    fn prune(&mut self) {
        for zoid in mem::take(&mut self.removed) {
            self.objects.remove(&zoid);
            self.all_removed.push(zoid);
        }
        self.run_total = 0;
    }

    pub async fn run(mut self) -> Result<VacuumReport, VacuumError> {
        self.gather_data().await?;

        loop {
            if let Some(max) = self.options.max_passes
                && self.passes >= max
            {
                return Err(VacuumError::DidNotConverge {
                    passes: self.passes,
                    total: self.total,
                });
            }

            self.passes += 1;
            if self.scan().await? == 0 {
                break;
            }
            self.prune();
        }

        info!(
            total = self.total,
            passes = self.passes,
            dry_run = self.options.dry_run,
            "Vacuum finished"
        );
        Ok(VacuumReport {
            total: self.total,
            passes: self.passes,
            removed: self.all_removed,
            dry_run: self.options.dry_run,
        })
    }
}

/// Vacuum one database through the raw connection of a fresh transaction.
pub async fn vacuum<S: Storage>(
    db: &Database<S>,
    options: VacuumOptions,
) -> Result<VacuumReport, VacuumError> {
    info!(database = %db.name(), dry_run = options.dry_run, "Vacuuming");
    let mut txn = db.begin(false).await?;
    let result = Vacuum::new(txn.connection(), options).run().await;
    // deletes went straight to the connection; the transaction buffered nothing
    txn.abort();
    result
}

/// Vacuum every database in turn, stopping at the first failure.
pub async fn vacuum_root<S: Storage>(
    root: &Root<S>,
    options: &VacuumOptions,
) -> Result<BTreeMap<String, VacuumReport>, VacuumError> {
    let mut reports = BTreeMap::new();
    for db in root.iter() {
        let report = vacuum(db, options.clone()).await?;
        reports.insert(db.name().to_string(), report);
    }
    Ok(reports)
}
