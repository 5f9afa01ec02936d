//! Run site migrations, or report what would run

use clap::Args;
use tracing::info;

use barrow::{MigrationRegistry, Settings, find_site, list_all_sites, migrate_site, report};
use barrow_store::Root;

use super::CommandResult;

/// Run site migrations, or report what would run
#[derive(Args, Debug)]
pub struct MigrateArgs {
    /// Run every migration but commit nothing
    #[arg(long)]
    dry_run: bool,

    /// Only migrate this site, as /database/site
    #[arg(long)]
    site: Option<String>,

    /// Only print installed and available versions
    #[arg(long)]
    report: bool,

    /// Only migrate these applications (repeatable)
    #[arg(long)]
    app: Vec<String>,

    /// Do not migrate past this version
    #[arg(long)]
    to_version: Option<String>,
}

pub async fn run(args: MigrateArgs, settings: &Settings) -> CommandResult {
    let root = Root::open(&settings.databases).await?;
    let registry = MigrationRegistry::with_builtin(settings.applications.iter().cloned())?;

    let sites = match &args.site {
        Some(path) => match find_site(&root, path).await? {
            Some(found) => vec![found],
            None => return Err(format!("Site not found: {path}").into()),
        },
        None => list_all_sites(&root).await?,
    };
    if sites.is_empty() {
        eprintln!("No sites found");
        return Ok(());
    }

    let apps: Vec<String> = if args.app.is_empty() {
        registry
            .migratable_applications()
            .into_iter()
            .map(String::from)
            .collect()
    } else {
        args.app.clone()
    };
    let to_version = args.to_version.as_deref();

    if !args.report {
        let mut total = 0;
        for (db, site) in &sites {
            total +=
                migrate_site(*db, site, &registry, &apps, to_version, args.dry_run).await?;
        }
        info!(sites = sites.len(), migrations = total, dry_run = args.dry_run, "Migrations complete");
    }

    for (db, site) in &sites {
        let site_report = report(*db, site, &registry, &apps, to_version).await?;
        eprintln!("{site_report}");
    }

    Ok(())
}
