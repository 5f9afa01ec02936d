//! Sites and their registries.
//!
//! A site is a resource directly under a database root. Its state is a JSON
//! document. Each site owns a registry: an annotation with id `_registry`
//! whose state is a JSON object of settings, created on first write.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};
use tracing::info;

use barrow_store::{
    Database, ObjectRecord, ROOT_ID, Root, Storage, StorageError, Transaction, Zoid,
};

pub const SITE_TYPE: &str = "Site";
pub const REGISTRY_ID: &str = "_registry";
pub const REGISTRY_TYPE: &str = "Registry";

/// Registry key holding `application -> last applied migration version`.
pub const MIGRATION_DATA_REGISTRY_KEY: &str = "_migrations_info";

/// Where a site lives: database name and site zoid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteRef {
    pub database: String,
    pub id: String,
    pub zoid: Zoid,
}

impl SiteRef {
    /// `/database/site`
    pub fn path(&self) -> String {
        format!("/{}/{}", self.database, self.id)
    }
}

impl fmt::Display for SiteRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// A loaded site whose state can be changed and stored back.
#[derive(Debug)]
pub struct Site {
    record: ObjectRecord,
    path: String,
    state: Value,
}

impl Site {
    pub async fn load<S: Storage>(
        txn: &Transaction<S>,
        site: &SiteRef,
    ) -> Result<Self, StorageError> {
        let record = txn.get(site.zoid).await?;
        let state = if record.state.is_empty() {
            Value::Null
        } else {
            record.state_json()?
        };
        Ok(Self {
            record,
            path: site.path(),
            state,
        })
    }

    pub fn id(&self) -> &str {
        self.record.id.as_deref().unwrap_or_default()
    }

    pub fn zoid(&self) -> Zoid {
        self.record.zoid
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn type_name(&self) -> &str {
        &self.record.type_name
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut Value {
        &mut self.state
    }

    /// Stage the current state as an update in `txn`.
    pub fn store<S: Storage>(mut self, txn: &mut Transaction<S>) -> Result<(), StorageError> {
        self.record.set_state_json(&self.state)?;
        txn.register(self.record)
    }
}

/// The JSON settings object annotating a site.
#[derive(Debug)]
pub struct Registry {
    owner: Zoid,
    record: Option<ObjectRecord>,
    values: Map<String, Value>,
}

impl Registry {
    pub async fn load<S: Storage>(txn: &Transaction<S>, site: Zoid) -> Result<Self, StorageError> {
        let record = txn.get_annotation(site, REGISTRY_ID).await?;
        let values = match &record {
            Some(record) if !record.state.is_empty() => match record.state_json::<Value>()? {
                Value::Object(values) => values,
                other => {
                    return Err(StorageError::InvalidData(format!(
                        "registry of {site} is not an object: {other}"
                    )));
                }
            },
            _ => Map::new(),
        };
        Ok(Self {
            owner: site,
            record,
            values,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    /// Last applied migration version per application.
    pub fn installed_versions(&self) -> BTreeMap<String, String> {
        match self.get(MIGRATION_DATA_REGISTRY_KEY) {
            Some(Value::Object(versions)) => versions
                .iter()
                .filter_map(|(app, version)| Some((app.clone(), version.as_str()?.to_string())))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn record_version(&mut self, application: &str, version: &str) {
        let entry = self
            .values
            .entry(MIGRATION_DATA_REGISTRY_KEY)
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(versions) = entry {
            versions.insert(application.to_string(), Value::String(version.to_string()));
        }
    }

    /// Stage the registry in `txn`, creating the annotation on first use.
    pub async fn save<S: Storage>(self, txn: &mut Transaction<S>) -> Result<(), StorageError> {
        let state = Value::Object(self.values);
        match self.record {
            Some(mut record) => {
                record.set_state_json(&state)?;
                txn.register(record)
            }
            None => {
                let zoid = txn.new_zoid().await?;
                let mut record =
                    ObjectRecord::annotation(zoid, self.owner, REGISTRY_ID, REGISTRY_TYPE);
                record.set_state_json(&state)?;
                txn.add(record)
            }
        }
    }
}

/// Create an empty site under the root of `db`.
pub async fn create_site<S: Storage>(db: &Database<S>, id: &str) -> Result<SiteRef, StorageError> {
    let mut txn = db.begin(false).await?;
    if txn.contains(ROOT_ID, id).await? {
        txn.abort();
        return Err(StorageError::ConflictIdOnContainer {
            container: ROOT_ID,
            id: id.to_string(),
        });
    }

    let zoid = txn.new_zoid().await?;
    let mut record = ObjectRecord::resource(zoid, ROOT_ID, id, SITE_TYPE);
    record.set_state_json(&Value::Object(Map::new()))?;
    txn.add(record)?;
    txn.commit().await?;

    let site = SiteRef {
        database: db.name().to_string(),
        id: id.to_string(),
        zoid,
    };
    info!(site = %site, %zoid, "Created site");
    Ok(site)
}

/// Sites of `db`, in creation order.
pub async fn list_sites<S: Storage>(db: &Database<S>) -> Result<Vec<SiteRef>, StorageError> {
    let mut txn = db.begin(true).await?;
    let ids = txn.keys(ROOT_ID).await?;
    let mut sites = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(record) = txn.get_child(ROOT_ID, &id).await?
            && record.type_name == SITE_TYPE
        {
            sites.push(SiteRef {
                database: db.name().to_string(),
                id,
                zoid: record.zoid,
            });
        }
    }
    txn.abort();
    Ok(sites)
}

/// Sites of every database in `root`, by database name then creation order.
pub async fn list_all_sites<S: Storage>(
    root: &Root<S>,
) -> Result<Vec<(&Database<S>, SiteRef)>, StorageError> {
    let mut all = Vec::new();
    for db in root.iter() {
        all.extend(list_sites(db).await?.into_iter().map(|site| (db, site)));
    }
    Ok(all)
}

/// Find a site by its `/database/site` path.
pub async fn find_site<'r, S: Storage>(
    root: &'r Root<S>,
    path: &str,
) -> Result<Option<(&'r Database<S>, SiteRef)>, StorageError> {
    let mut parts = path.trim_matches('/').splitn(2, '/');
    let (Some(database), Some(id)) = (parts.next(), parts.next()) else {
        return Ok(None);
    };
    let Some(db) = root.get(database) else {
        return Ok(None);
    };
    let site = list_sites(db).await?.into_iter().find(|site| site.id == id);
    Ok(site.map(|site| (db, site)))
}

/// Installed migration versions of one site.
pub async fn installed_versions<S: Storage>(
    db: &Database<S>,
    site: &SiteRef,
) -> Result<BTreeMap<String, String>, StorageError> {
    let mut txn = db.begin(true).await?;
    let registry = Registry::load(&txn, site.zoid).await?;
    txn.abort();
    Ok(registry.installed_versions())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn database() -> Database {
        Database::open("db", barrow_store::StorageConfig::in_memory())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_and_list() {
        let db = database().await;
        let first = create_site(&db, "portal").await.unwrap();
        let second = create_site(&db, "intranet").await.unwrap();
        assert_eq!(first.path(), "/db/portal");

        let sites = list_sites(&db).await.unwrap();
        assert_eq!(sites, vec![first, second]);

        let err = create_site(&db, "portal").await.unwrap_err();
        assert!(matches!(err, StorageError::ConflictIdOnContainer { .. }));
    }

    #[tokio::test]
    async fn registry_is_created_on_first_save() {
        let db = database().await;
        let site = create_site(&db, "site").await.unwrap();
        assert!(installed_versions(&db, &site).await.unwrap().is_empty());

        let mut txn = db.begin(false).await.unwrap();
        let mut registry = Registry::load(&txn, site.zoid).await.unwrap();
        registry.record_version("barrow", "1.0");
        registry.set("title", json!("My site"));
        registry.save(&mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let mut txn = db.begin(false).await.unwrap();
        let mut registry = Registry::load(&txn, site.zoid).await.unwrap();
        assert_eq!(registry.get("title"), Some(&json!("My site")));
        registry.record_version("shop", "0.2");
        registry.save(&mut txn).await.unwrap();
        txn.commit().await.unwrap();

        let versions = installed_versions(&db, &site).await.unwrap();
        assert_eq!(versions.get("barrow").map(String::as_str), Some("1.0"));
        assert_eq!(versions.get("shop").map(String::as_str), Some("0.2"));

        // still a single registry annotation
        let txn = db.begin(true).await.unwrap();
        assert_eq!(
            txn.get_annotation_keys(site.zoid).await.unwrap(),
            vec![REGISTRY_ID]
        );
    }

    #[tokio::test]
    async fn find_by_path() {
        let mut root = Root::new();
        root.insert(database().await);
        let db = root.get("db").unwrap();
        let portal = create_site(db, "portal").await.unwrap();

        let (found_db, found) = find_site(&root, "/db/portal").await.unwrap().unwrap();
        assert_eq!(found_db.name(), "db");
        assert_eq!(found, portal);
        assert!(find_site(&root, "db/portal").await.unwrap().is_some());
        assert!(find_site(&root, "/db/missing").await.unwrap().is_none());
        assert!(find_site(&root, "/other/portal").await.unwrap().is_none());
        assert!(find_site(&root, "/db").await.unwrap().is_none());

        let all = list_all_sites(&root).await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn site_state_round_trips() {
        let db = database().await;
        let site = create_site(&db, "site").await.unwrap();

        let mut txn = db.begin(false).await.unwrap();
        let mut loaded = Site::load(&txn, &site).await.unwrap();
        assert_eq!(loaded.state(), &json!({}));
        assert_eq!(loaded.id(), "site");
        assert_eq!(loaded.path(), "/db/site");
        loaded.state_mut()["title"] = json!("Hello");
        loaded.store(&mut txn).unwrap();
        txn.commit().await.unwrap();

        let txn = db.begin(true).await.unwrap();
        let loaded = Site::load(&txn, &site).await.unwrap();
        assert_eq!(loaded.state(), &json!({"title": "Hello"}));
    }
}
