//! Remove trashed and orphaned objects

use std::collections::BTreeMap;

use clap::Args;
use tracing::info;

use barrow::Settings;
use barrow_store::{Root, VacuumOptions, VacuumReport, vacuum, vacuum_root};

use super::CommandResult;

/// Remove trashed and orphaned objects
#[derive(Args, Debug)]
pub struct VacuumArgs {
    /// Report what would be removed without deleting anything
    #[arg(long)]
    dry_run: bool,

    /// Only vacuum this database
    #[arg(long)]
    database: Option<String>,

    /// Objects removed per statement
    #[arg(long, default_value_t = barrow_store::vacuum::DEFAULT_REMOVE_BATCH_SIZE)]
    batch_size: usize,

    /// Stop after this many passes, counting the final empty one
    #[arg(long, default_value_t = barrow_store::vacuum::DEFAULT_MAX_PASSES)]
    max_passes: usize,
}

pub async fn run(args: VacuumArgs, settings: &Settings) -> CommandResult {
    let options = VacuumOptions {
        dry_run: args.dry_run,
        remove_batch_size: args.batch_size,
        max_passes: Some(args.max_passes),
        ..Default::default()
    };
    let root = Root::open(&settings.databases).await?;

    let reports: BTreeMap<String, VacuumReport> = match &args.database {
        Some(name) => {
            let db = root
                .get(name)
                .ok_or_else(|| format!("Unknown database: {name}"))?;
            let report = vacuum(db, options).await?;
            [(name.clone(), report)].into_iter().collect()
        }
        None => vacuum_root(&root, &options).await?,
    };

    let mut total = 0;
    for (name, report) in &reports {
        print_report(name, report);
        total += report.total;
    }
    info!(databases = reports.len(), total, dry_run = args.dry_run, "Vacuum complete");

    Ok(())
}

fn print_report(name: &str, report: &VacuumReport) {
    let verb = if report.dry_run {
        "would remove"
    } else {
        "removed"
    };
    eprintln!(
        "{}: {} {} objects in {} passes",
        name, verb, report.total, report.passes
    );
}
