//! Barrow - site management and migrations on top of `barrow-store`.

pub mod migrate;
pub mod settings;
pub mod site;
pub mod version;

pub use migrate::{
    FRAMEWORK_APPLICATION, Migration, MigrationError, MigrationRegistry, SiteReport,
    migrate_site, register_builtin, report, run_migrations, run_site_migrations,
};
pub use settings::{Settings, SettingsError};
pub use site::{Registry, Site, SiteRef, create_site, find_site, list_all_sites, list_sites};
pub use version::{Version, VersionError};
