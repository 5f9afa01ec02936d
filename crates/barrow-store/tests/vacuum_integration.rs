//! Integration tests for soft deletes and the vacuum.
//!
//! These run against file-backed SQLite databases in a temporary directory
//! and go through the public transaction API only.

use std::collections::BTreeMap;

use tempfile::TempDir;

use barrow_store::{
    Database, ObjectRecord, ROOT_ID, Root, Storage, StorageConfig, TRASHED_ID, VacuumOptions,
    Zoid, vacuum, vacuum_root,
};

struct Tree {
    site: Zoid,
    folder: Zoid,
    doc: Zoid,
    note: Zoid,
    other: Zoid,
    bid: String,
}

/// site / folder / doc (+ blob, + annotation), and site / other.
async fn build_tree(db: &Database) -> Tree {
    let mut txn = db.begin(false).await.unwrap();

    let site = txn.new_zoid().await.unwrap();
    txn.add(ObjectRecord::resource(site, ROOT_ID, "site", "Site"))
        .unwrap();
    let folder = txn.new_zoid().await.unwrap();
    txn.add(ObjectRecord::resource(folder, site, "folder", "Folder"))
        .unwrap();
    let doc = txn.new_zoid().await.unwrap();
    txn.add(ObjectRecord::resource(doc, folder, "doc", "File"))
        .unwrap();
    let note = txn.new_zoid().await.unwrap();
    txn.add(ObjectRecord::annotation(note, doc, "comments", "Annotation"))
        .unwrap();
    let other = txn.new_zoid().await.unwrap();
    txn.add(ObjectRecord::resource(other, site, "other", "Item"))
        .unwrap();

    let bid = txn.new_blob_id();
    txn.write_blob_chunk(&bid, doc, 0, &b"chunk zero"[..])
        .unwrap();
    txn.write_blob_chunk(&bid, doc, 1, &b"chunk one"[..])
        .unwrap();
    txn.commit().await.unwrap();

    Tree {
        site,
        folder,
        doc,
        note,
        other,
        bid,
    }
}

async fn trash(db: &Database, zoid: Zoid) {
    let mut txn = db.begin(false).await.unwrap();
    let record = txn.get(zoid).await.unwrap();
    txn.delete(&record).unwrap();
    txn.commit().await.unwrap();
}

async fn open(dir: &TempDir, name: &str) -> Database {
    let config = StorageConfig::new(dir.path().join(format!("{name}.db")));
    Database::open(name, config).await.unwrap()
}

#[tokio::test]
async fn vacuum_removes_trashed_subtree() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "main").await;
    let tree = build_tree(&db).await;
    trash(&db, tree.folder).await;

    let storage = db.storage();
    assert_eq!(storage.total_objects().await.unwrap(), 7);

    let report = vacuum(&db, VacuumOptions::default()).await.unwrap();
    assert_eq!(report.removed, vec![tree.folder, tree.doc, tree.note]);
    assert_eq!(report.total, 3);
    assert_eq!(report.passes, 4);

    assert_eq!(storage.total_objects().await.unwrap(), 4);
    assert!(storage.read_blob_chunks(&tree.bid).await.unwrap().is_empty());

    let txn = db.begin(true).await.unwrap();
    assert!(txn.get(ROOT_ID).await.is_ok());
    assert!(txn.get(TRASHED_ID).await.is_ok());
    assert!(txn.get(tree.site).await.is_ok());
    assert!(txn.get(tree.other).await.is_ok());
    assert_eq!(txn.keys(tree.site).await.unwrap(), vec!["other"]);

    // a clean tree takes one empty pass
    let report = vacuum(&db, VacuumOptions::default()).await.unwrap();
    assert_eq!(report.total, 0);
    assert_eq!(report.passes, 1);
}

#[tokio::test]
async fn dry_run_reports_without_deleting() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "main").await;
    let tree = build_tree(&db).await;
    trash(&db, tree.folder).await;

    let options = VacuumOptions {
        dry_run: true,
        ..Default::default()
    };
    let report = vacuum(&db, options).await.unwrap();
    assert_eq!(report.removed, vec![tree.folder, tree.doc, tree.note]);
    assert_eq!(db.storage().total_objects().await.unwrap(), 7);
    assert_eq!(db.storage().read_blob_chunks(&tree.bid).await.unwrap().len(), 2);
}

#[tokio::test]
async fn small_batches_and_pages() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "main").await;

    let mut txn = db.begin(false).await.unwrap();
    let folder = txn.new_zoid().await.unwrap();
    txn.add(ObjectRecord::resource(folder, ROOT_ID, "bulk", "Folder"))
        .unwrap();
    for i in 0..25 {
        let zoid = txn.new_zoid().await.unwrap();
        txn.add(ObjectRecord::resource(zoid, folder, format!("item-{i}"), "Item"))
            .unwrap();
    }
    txn.commit().await.unwrap();
    trash(&db, folder).await;

    let options = VacuumOptions {
        remove_batch_size: 4,
        page_size: 7,
        ..Default::default()
    };
    let report = vacuum(&db, options).await.unwrap();
    assert_eq!(report.total, 26);
    assert_eq!(report.passes, 3);
    assert_eq!(db.storage().total_objects().await.unwrap(), 2);
}

#[tokio::test]
async fn vacuum_every_database() {
    let dir = TempDir::new().unwrap();
    let mut configs = BTreeMap::new();
    for name in ["alpha", "beta"] {
        configs.insert(
            name.to_string(),
            StorageConfig::new(dir.path().join(format!("{name}.db"))),
        );
    }
    let root = Root::open(&configs).await.unwrap();

    let alpha = root.get("alpha").unwrap();
    let tree = build_tree(alpha).await;
    trash(alpha, tree.site).await;

    let reports = vacuum_root(&root, &VacuumOptions::default()).await.unwrap();
    assert_eq!(reports.len(), 2);
    // everything below the trashed site goes
    assert_eq!(reports["alpha"].total, 5);
    assert_eq!(reports["beta"].total, 0);
}

#[tokio::test]
async fn trashed_annotation_is_hidden_and_collected() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir, "main").await;
    let tree = build_tree(&db).await;
    trash(&db, tree.note).await;

    let txn = db.begin(true).await.unwrap();
    assert!(txn.get_annotation(tree.doc, "comments").await.unwrap().is_none());
    assert!(txn.get_annotation_keys(tree.doc).await.unwrap().is_empty());
    let trashed = txn.get(tree.note).await.unwrap();
    assert_eq!(trashed.link.of(), Some(TRASHED_ID));

    // the id is free again before the vacuum runs
    let mut txn = db.begin(false).await.unwrap();
    let replacement = txn.new_zoid().await.unwrap();
    txn.add(ObjectRecord::annotation(replacement, tree.doc, "comments", "Annotation"))
        .unwrap();
    txn.commit().await.unwrap();

    let report = vacuum(&db, VacuumOptions::default()).await.unwrap();
    assert_eq!(report.removed, vec![tree.note]);
    assert_eq!(report.passes, 2);

    let txn = db.begin(true).await.unwrap();
    let found = txn.get_annotation(tree.doc, "comments").await.unwrap().unwrap();
    assert_eq!(found.zoid, replacement);
    assert_eq!(txn.get_annotation_keys(tree.doc).await.unwrap(), vec!["comments"]);
    assert!(txn.get(tree.note).await.is_err());
}
