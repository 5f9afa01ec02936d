//! Create and list sites

use clap::{Args, Subcommand};

use barrow::{Settings, create_site, list_all_sites};
use barrow_store::Root;

use super::CommandResult;

/// Create and list sites
#[derive(Args, Debug)]
pub struct SiteArgs {
    #[command(subcommand)]
    command: SiteCommand,
}

#[derive(Subcommand, Debug)]
enum SiteCommand {
    /// Create an empty site
    Add {
        /// Database to create the site in
        database: String,

        /// Site id
        id: String,
    },

    /// List the sites of every database
    List,
}

pub async fn run(args: SiteArgs, settings: &Settings) -> CommandResult {
    let root = Root::open(&settings.databases).await?;

    match args.command {
        SiteCommand::Add { database, id } => {
            let db = root
                .get(&database)
                .ok_or_else(|| format!("Unknown database: {database}"))?;
            let site = create_site(db, &id).await?;
            eprintln!("Created {} ({})", site, site.zoid);
        }
        SiteCommand::List => {
            let sites = list_all_sites(&root).await?;
            if sites.is_empty() {
                eprintln!("No sites found");
            }
            for (_, site) in sites {
                println!("{}", site);
            }
        }
    }

    Ok(())
}
