//! Site migrations.
//!
//! Applications register migration functions against the version they
//! upgrade a site to. For each site, the runner picks the migrations newer
//! than the version recorded in the site's registry, applies them in version
//! order and records each one as it commits, so a failed run resumes where
//! it stopped.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, info};

use barrow_store::{Database, Root, Storage, StorageError};

use crate::site::{Registry, Site, SiteRef, installed_versions, list_all_sites};
use crate::version::{Version, VersionError};

/// Application whose migrations run regardless of the active applications.
pub const FRAMEWORK_APPLICATION: &str = "barrow";

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type MigrationFn = Arc<dyn Fn(&mut Site) -> Result<(), BoxError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Version error: {0}")]
    Version(#[from] VersionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Migration of {application:?} to {version} failed on site {site}: {source}")]
    Failed {
        application: String,
        version: String,
        site: String,
        #[source]
        source: BoxError,
    },
}

/// One upgrade step of an application.
#[derive(Clone)]
pub struct Migration {
    application: String,
    func: MigrationFn,
    to_version: Version,
    to_version_raw: String,
}

impl Migration {
    pub fn new(
        application: impl Into<String>,
        to_version: &str,
        func: impl Fn(&mut Site) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Result<Self, VersionError> {
        Ok(Self {
            application: application.into(),
            func: Arc::new(func),
            to_version: Version::parse(to_version)?,
            to_version_raw: to_version.to_string(),
        })
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn to_version(&self) -> &Version {
        &self.to_version
    }

    /// The version as registered, which is what gets recorded.
    pub fn to_version_raw(&self) -> &str {
        &self.to_version_raw
    }

    pub fn apply(&self, site: &mut Site) -> Result<(), BoxError> {
        (self.func)(site)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("application", &self.application)
            .field("to_version", &self.to_version_raw)
            .finish_non_exhaustive()
    }
}

// Migrations compare by target version only.
impl PartialEq for Migration {
    fn eq(&self, other: &Self) -> bool {
        self.to_version == other.to_version
    }
}

impl PartialOrd for Migration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.to_version.cmp(&other.to_version))
    }
}

/// Every known migration, plus which applications are active.
#[derive(Clone, Debug, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
    applications: Vec<String>,
}

impl MigrationRegistry {
    pub fn new<I, A>(applications: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            migrations: Vec::new(),
            applications: applications.into_iter().map(Into::into).collect(),
        }
    }

    /// A registry holding the built-in migrations.
    pub fn with_builtin<I, A>(applications: I) -> Result<Self, VersionError>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let mut registry = Self::new(applications);
        register_builtin(&mut registry)?;
        Ok(registry)
    }

    pub fn is_active(&self, application: &str) -> bool {
        application == FRAMEWORK_APPLICATION || self.applications.iter().any(|a| a == application)
    }

    pub fn register(&mut self, migration: Migration) {
        self.migrations.push(migration);
    }

    /// Register `func` as the migration of `application` to `to_version`.
    pub fn migration(
        &mut self,
        application: &str,
        to_version: &str,
        func: impl Fn(&mut Site) -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Result<(), VersionError> {
        self.register(Migration::new(application, to_version, func)?);
        Ok(())
    }

    /// Migrations of `application` in registration order, active or not.
    pub fn list_for(&self, application: &str) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|m| m.application == application)
            .collect()
    }

    /// Active applications that have migrations, in first-registration order.
    pub fn migratable_applications(&self) -> Vec<&str> {
        let mut apps: Vec<&str> = Vec::new();
        for migration in &self.migrations {
            let app = migration.application.as_str();
            if !apps.contains(&app) && self.is_active(app) {
                apps.push(app);
            }
        }
        apps
    }

    /// Migrations of an active `application` newer than `from_version` and
    /// no newer than `to_version`, oldest first.
    pub fn get_migrations(
        &self,
        application: &str,
        from_version: Option<&str>,
        to_version: Option<&str>,
    ) -> Result<Vec<&Migration>, VersionError> {
        if !self.is_active(application) {
            return Ok(Vec::new());
        }
        let from = from_version.map(Version::parse).transpose()?;
        let to = to_version.map(Version::parse).transpose()?;

        let mut migrations: Vec<&Migration> = self
            .migrations
            .iter()
            .filter(|m| m.application == application)
            .filter(|m| from.as_ref().is_none_or(|from| m.to_version > *from))
            .filter(|m| to.as_ref().is_none_or(|to| m.to_version <= *to))
            .collect();
        migrations.sort_by(|a, b| a.to_version.cmp(&b.to_version));
        Ok(migrations)
    }
}

/// Apply `migrations` to one site, in order.
///
/// Each migration runs in its own transaction and records its version in
/// the site registry when it commits. On a dry run every transaction is
/// aborted instead. The first failure aborts its transaction and is
/// returned; migrations before it stay recorded.
pub async fn run_site_migrations<S: Storage>(
    db: &Database<S>,
    site: &SiteRef,
    migrations: &[&Migration],
    dry_run: bool,
) -> Result<usize, MigrationError> {
    let site_path = site.path();

    for migration in migrations {
        info!(
            application = %migration.application,
            version = %migration.to_version,
            site = %site_path,
            dry_run,
            "Running migration"
        );

        let mut txn = db.begin(false).await?;
        let mut loaded = Site::load(&txn, site).await?;
        if let Err(err) = migration.apply(&mut loaded) {
            error!(
                application = %migration.application,
                version = %migration.to_version,
                site = %site_path,
                %err,
                "Error running migration"
            );
            txn.abort();
            return Err(MigrationError::Failed {
                application: migration.application.clone(),
                version: migration.to_version_raw.clone(),
                site: site_path,
                source: err,
            });
        }
        loaded.store(&mut txn)?;

        let mut registry = Registry::load(&txn, site.zoid).await?;
        registry.record_version(&migration.application, &migration.to_version_raw);
        registry.save(&mut txn).await?;

        if dry_run {
            txn.abort();
        } else {
            txn.commit().await?;
        }
    }

    Ok(migrations.len())
}

/// Apply `migrations` to every site of every database, stopping at the
/// first failure.
pub async fn run_migrations<S: Storage>(
    root: &Root<S>,
    migrations: &[&Migration],
) -> Result<(), MigrationError> {
    for (db, site) in list_all_sites(root).await? {
        run_site_migrations(db, &site, migrations, false).await?;
    }
    Ok(())
}

/// Bring one site up to date for each of `applications`, starting from the
/// versions recorded in its registry. Returns the number of migrations run.
pub async fn migrate_site<S: Storage>(
    db: &Database<S>,
    site: &SiteRef,
    registry: &MigrationRegistry,
    applications: &[String],
    to_version: Option<&str>,
    dry_run: bool,
) -> Result<usize, MigrationError> {
    let installed = installed_versions(db, site).await?;
    let mut count = 0;
    for app in applications {
        let from = installed.get(app).map(String::as_str);
        let migrations = registry.get_migrations(app, from, to_version)?;
        if !migrations.is_empty() {
            count += run_site_migrations(db, site, &migrations, dry_run).await?;
        }
    }
    Ok(count)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportRow {
    pub application: String,
    pub installed: Option<String>,
    pub upgrade_to: Option<String>,
    pub pending: usize,
}

/// Installed and available versions of one site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SiteReport {
    pub site: String,
    pub rows: Vec<ReportRow>,
}

pub async fn report<S: Storage>(
    db: &Database<S>,
    site: &SiteRef,
    registry: &MigrationRegistry,
    applications: &[String],
    to_version: Option<&str>,
) -> Result<SiteReport, MigrationError> {
    let installed = installed_versions(db, site).await?;
    let mut rows = Vec::new();
    for app in applications {
        let current = installed.get(app).cloned();
        let migrations = registry.get_migrations(app, current.as_deref(), to_version)?;
        let upgrade_to = migrations.last().map(|m| m.to_version_raw.clone());
        if current.is_some() || upgrade_to.is_some() {
            rows.push(ReportRow {
                application: app.clone(),
                installed: current,
                upgrade_to,
                pending: migrations.len(),
            });
        }
    }
    Ok(SiteReport {
        site: site.path(),
        rows,
    })
}

impl fmt::Display for SiteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let title = format!("{} Migrations", self.site);
        writeln!(f, "{title}")?;
        writeln!(f, "{}", "=".repeat(title.len()))?;
        writeln!(f, "{:<20}{:<40}{:<60}", "application", "installed", "available")?;
        writeln!(f, "{:<20}{:<40}{:<60}", "-".repeat(11), "-".repeat(9), "-".repeat(9))?;
        for row in &self.rows {
            let available = match &row.upgrade_to {
                Some(version) => format!("{version} ({} migrations)", row.pending),
                None => "-".to_string(),
            };
            writeln!(
                f,
                "{:<20}{:<40}{:<60}",
                row.application,
                row.installed.as_deref().unwrap_or("-"),
                available
            )?;
        }
        Ok(())
    }
}

/// Sites before 1.0 could carry a non-object state.
fn normalize_site_state(site: &mut Site) -> Result<(), BoxError> {
    if !site.state().is_object() {
        *site.state_mut() = Value::Object(Map::new());
    }
    Ok(())
}

/// Register the framework's own migrations.
pub fn register_builtin(registry: &mut MigrationRegistry) -> Result<(), VersionError> {
    let builtin: [(&str, fn(&mut Site) -> Result<(), BoxError>); 1] =
        [("1.0", normalize_site_state)];
    for (version, func) in builtin {
        registry.register(Migration::new(FRAMEWORK_APPLICATION, version, func)?);
    }
    Ok(())
}

/// Installed versions of every site, keyed by site path.
pub async fn installed_by_site<S: Storage>(
    root: &Root<S>,
) -> Result<BTreeMap<String, BTreeMap<String, String>>, MigrationError> {
    let mut all = BTreeMap::new();
    for (db, site) in list_all_sites(root).await? {
        all.insert(site.path(), installed_versions(db, &site).await?);
    }
    Ok(all)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    use barrow_store::StorageConfig;
    use serde_json::json;

    use super::*;
    use crate::site::create_site;

    const UNSORTED: [&str; 8] = [
        "1.0", "0.2", "2.1a1", "0.5", "1.0a1", "1.0.1a1", "1.5.0", "1.0a9.dev0",
    ];

    fn noop(_: &mut Site) -> Result<(), BoxError> {
        Ok(())
    }

    fn registry_with(app: &str, versions: &[&str]) -> MigrationRegistry {
        let mut registry = MigrationRegistry::new([app]);
        for version in versions {
            registry.migration(app, version, noop).unwrap();
        }
        registry
    }

    fn raw(migrations: &[&Migration]) -> Vec<String> {
        migrations
            .iter()
            .map(|m| m.to_version_raw().to_string())
            .collect()
    }

    async fn database(name: &str) -> Database {
        Database::open(name, StorageConfig::in_memory())
            .await
            .unwrap()
    }

    #[test]
    fn sorted_by_version() {
        let registry = registry_with("app", &UNSORTED);
        let migrations = registry.get_migrations("app", None, None).unwrap();
        assert_eq!(
            raw(&migrations),
            ["0.2", "0.5", "1.0a1", "1.0a9.dev0", "1.0", "1.0.1a1", "1.5.0", "2.1a1"]
        );
        // registration order is kept for listing
        assert_eq!(raw(&registry.list_for("app"))[0], "1.0");
    }

    #[test]
    fn range_filters() {
        let registry = registry_with("app", &UNSORTED);

        let newer = registry.get_migrations("app", Some("1.0"), None).unwrap();
        assert_eq!(raw(&newer), ["1.0.1a1", "1.5.0", "2.1a1"]);

        let older = registry.get_migrations("app", None, Some("1.0")).unwrap();
        assert_eq!(raw(&older), ["0.2", "0.5", "1.0a1", "1.0a9.dev0", "1.0"]);

        let between = registry
            .get_migrations("app", Some("0.5"), Some("1.0a9"))
            .unwrap();
        assert_eq!(raw(&between), ["1.0a1", "1.0a9.dev0"]);

        assert!(registry.get_migrations("app", Some("nope"), None).is_err());
    }

    #[test]
    fn builtin_migrations_all_register() {
        let mut registry = MigrationRegistry::new(Vec::<String>::new());
        register_builtin(&mut registry).unwrap();
        let builtin = registry
            .get_migrations(FRAMEWORK_APPLICATION, None, None)
            .unwrap();
        assert_eq!(raw(&builtin), ["1.0"]);
    }

    #[test]
    fn only_active_applications() {
        let mut registry = MigrationRegistry::with_builtin(["shop"]).unwrap();
        registry.migration("shop", "1.0", noop).unwrap();
        registry.migration("blog", "1.0", noop).unwrap();

        assert!(registry.get_migrations("blog", None, None).unwrap().is_empty());
        assert_eq!(registry.get_migrations("shop", None, None).unwrap().len(), 1);
        assert_eq!(
            registry.get_migrations(FRAMEWORK_APPLICATION, None, None).unwrap().len(),
            1
        );
        assert_eq!(registry.migratable_applications(), ["barrow", "shop"]);
        assert_eq!(registry.list_for("blog").len(), 1);
    }

    #[test]
    fn migrations_compare_by_version() {
        let a = Migration::new("a", "1.0", noop).unwrap();
        let b = Migration::new("b", "1.0.0", noop).unwrap();
        let c = Migration::new("a", "1.1", noop).unwrap();
        assert!(a == b);
        assert!(a < c);
        assert_eq!(format!("{a:?}"), r#"Migration { application: "a", to_version: "1.0", .. }"#);
    }

    #[tokio::test]
    async fn failure_stops_and_keeps_progress() {
        let db = database("db").await;
        let site = create_site(&db, "site").await.unwrap();
        let third_ran = Arc::new(AtomicUsize::new(0));

        let mut registry = MigrationRegistry::new(["app"]);
        registry
            .migration("app", "0.1", |site: &mut Site| {
                site.state_mut()["step"] = json!(1);
                Ok(())
            })
            .unwrap();
        registry
            .migration("app", "0.2", |_: &mut Site| Err("boom".into()))
            .unwrap();
        let counter = Arc::clone(&third_ran);
        registry
            .migration("app", "0.3", move |_: &mut Site| {
                counter.fetch_add(1, AtomicOrdering::SeqCst);
                Ok(())
            })
            .unwrap();

        let migrations = registry.get_migrations("app", None, None).unwrap();
        let err = run_site_migrations(&db, &site, &migrations, false)
            .await
            .unwrap_err();
        match err {
            MigrationError::Failed {
                application,
                version,
                site: path,
                ..
            } => {
                assert_eq!(application, "app");
                assert_eq!(version, "0.2");
                assert_eq!(path, "/db/site");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(third_ran.load(AtomicOrdering::SeqCst), 0);

        let installed = installed_versions(&db, &site).await.unwrap();
        assert_eq!(installed.get("app").map(String::as_str), Some("0.1"));

        let txn = db.begin(true).await.unwrap();
        let loaded = Site::load(&txn, &site).await.unwrap();
        assert_eq!(loaded.state()["step"], json!(1));
    }

    #[tokio::test]
    async fn dry_run_records_nothing() {
        let db = database("db").await;
        let site = create_site(&db, "site").await.unwrap();
        let mut registry = MigrationRegistry::new(["app"]);
        registry
            .migration("app", "1.0", |site: &mut Site| {
                site.state_mut()["migrated"] = json!(true);
                Ok(())
            })
            .unwrap();

        let apps = vec!["app".to_string()];
        let count = migrate_site(&db, &site, &registry, &apps, None, true)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert!(installed_versions(&db, &site).await.unwrap().is_empty());

        let txn = db.begin(true).await.unwrap();
        let loaded = Site::load(&txn, &site).await.unwrap();
        assert_eq!(loaded.state(), &json!({}));
    }

    #[tokio::test]
    async fn migrate_site_resumes_from_installed() {
        let db = database("db").await;
        let site = create_site(&db, "site").await.unwrap();
        let registry = registry_with("app", &["0.1", "0.2", "0.3"]);
        let apps = vec!["app".to_string()];

        let count = migrate_site(&db, &site, &registry, &apps, Some("0.2"), false)
            .await
            .unwrap();
        assert_eq!(count, 2);

        let before = report(&db, &site, &registry, &apps, None).await.unwrap();
        assert_eq!(
            before.rows,
            vec![ReportRow {
                application: "app".into(),
                installed: Some("0.2".into()),
                upgrade_to: Some("0.3".into()),
                pending: 1,
            }]
        );
        let text = before.to_string();
        assert!(text.starts_with("/db/site Migrations\n"));
        assert!(text.contains("0.3 (1 migrations)"));

        let count = migrate_site(&db, &site, &registry, &apps, None, false)
            .await
            .unwrap();
        assert_eq!(count, 1);
        let after = report(&db, &site, &registry, &apps, None).await.unwrap();
        assert_eq!(after.rows[0].installed.as_deref(), Some("0.3"));
        assert_eq!(after.rows[0].upgrade_to, None);
    }

    #[tokio::test]
    async fn run_migrations_covers_every_site() {
        let mut root = Root::new();
        root.insert(database("first").await);
        root.insert(database("second").await);
        for db in root.iter() {
            create_site(db, "a").await.unwrap();
            create_site(db, "b").await.unwrap();
        }

        let registry = MigrationRegistry::with_builtin(Vec::<String>::new()).unwrap();
        let migrations = registry
            .get_migrations(FRAMEWORK_APPLICATION, None, None)
            .unwrap();
        run_migrations(&root, &migrations).await.unwrap();

        let all = installed_by_site(&root).await.unwrap();
        assert_eq!(
            all.keys().collect::<Vec<_>>(),
            ["/first/a", "/first/b", "/second/a", "/second/b"]
        );
        for versions in all.values() {
            assert_eq!(versions.get("barrow").map(String::as_str), Some("1.0"));
        }
    }

    #[tokio::test]
    async fn builtin_normalizes_state() {
        let db = database("db").await;
        let site = create_site(&db, "site").await.unwrap();

        // clobber the state with a non-object
        let mut txn = db.begin(false).await.unwrap();
        let mut loaded = Site::load(&txn, &site).await.unwrap();
        *loaded.state_mut() = json!([1, 2, 3]);
        loaded.store(&mut txn).unwrap();
        txn.commit().await.unwrap();

        let registry = MigrationRegistry::with_builtin(Vec::<String>::new()).unwrap();
        let apps: Vec<String> = registry
            .migratable_applications()
            .into_iter()
            .map(String::from)
            .collect();
        migrate_site(&db, &site, &registry, &apps, None, false)
            .await
            .unwrap();

        let txn = db.begin(true).await.unwrap();
        let loaded = Site::load(&txn, &site).await.unwrap();
        assert_eq!(loaded.state(), &json!({}));
    }
}
