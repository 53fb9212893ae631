// CLI - command-line argument parsing and config inspection handlers.

use clap::{Parser, Subcommand};

use crate::config::{Config, VERSION};

/// suzu - realtime conversation orchestrator for an AI VTuber pipeline
#[derive(Parser)]
#[command(name = "suzu")]
#[command(version = VERSION)]
#[command(about = "Realtime conversation orchestrator for an AI VTuber pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the orchestrator service (default)
    Serve,

    /// Supervise the worker process cohort
    Pipeline,

    /// Inspect configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,
    },
}

/// Handle `suzu config ...`; the caller exits afterwards.
pub fn handle_config(config: &Config, show: bool, path: bool) {
    if path {
        println!("{}", Config::config_path().display());
    } else if show {
        println!("{}", config.to_toml());
    } else {
        println!("Usage: suzu config [--show|--path]");
        println!();
        println!("Options:");
        println!("  --show    Display effective configuration");
        println!("  --path    Show config file path");
    }
}
