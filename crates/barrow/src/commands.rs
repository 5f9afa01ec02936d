pub mod init;
pub mod migrate;
pub mod site;
pub mod vacuum;

pub type CommandResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;
