use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lloggs::LoggingArgs;
use tracing::debug;

use barrow::Settings;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "barrow")]
#[command(about = "Administer barrow object databases")]
struct Args {
    /// Settings file
    #[arg(long, default_value = "barrow.json")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    Init(commands::init::InitArgs),
    Site(commands::site::SiteArgs),
    Vacuum(commands::vacuum::VacuumArgs),
    Migrate(commands::migrate::MigrateArgs),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let _guard = args.logging.setup(|v| match v {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    })?;

    let settings = Settings::load(&args.config)?;
    debug!(config = ?args.config, databases = settings.databases.len(), "Loaded settings");

    match args.command {
        Command::Init(cmd) => commands::init::run(cmd, &settings).await,
        Command::Site(cmd) => commands::site::run(cmd, &settings).await,
        Command::Vacuum(cmd) => commands::vacuum::run(cmd, &settings).await,
        Command::Migrate(cmd) => commands::migrate::run(cmd, &settings).await,
    }
}
