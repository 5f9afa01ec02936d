//! Create the schema and sentinel objects of every configured database

use clap::Args;
use tracing::info;

use barrow::Settings;
use barrow_store::{Root, Storage};

use super::CommandResult;

/// Create the schema and sentinel objects of every configured database
#[derive(Args, Debug)]
pub struct InitArgs {}

pub async fn run(_args: InitArgs, settings: &Settings) -> CommandResult {
    if settings.databases.is_empty() {
        eprintln!("No databases configured");
        return Ok(());
    }

    // opening initializes
    let root = Root::open(&settings.databases).await?;
    for db in root.iter() {
        let storage = db.storage();
        let objects = storage.total_objects().await?;
        let tid = storage.current_tid().await?;
        info!(database = %db.name(), objects, %tid, "Initialized");
        eprintln!("{}: {} objects, tid {}", db.name(), objects, tid);
    }

    Ok(())
}
