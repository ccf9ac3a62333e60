use std::path::PathBuf;

use clap::{Parser, Subcommand};

use weft_domain::config::Config;
use weft_domain::Result;

#[derive(Parser)]
#[command(name = "weft", about = "Conversational AI orchestration server")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "weft.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the server (the default).
    Serve,
    /// Config inspection helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the config file and report issues.
    Validate,
    /// Print the effective config.
    Show,
}

pub fn load_config(path: &PathBuf) -> Result<Config> {
    Config::load(path)
}
