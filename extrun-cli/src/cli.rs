//! CLI argument parsing definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a single extension step and print its output
    Run {
        /// Extension id (example: --extension=@acme/shop-tools)
        #[arg(long, value_name = "ID")]
        extension: String,

        /// Step file relative to the extension folder
        #[arg(long, visible_alias = "path", value_name = "FILE")]
        step: String,

        /// JSON input for the step (example: --input-json='{"sku":"A-1"}')
        #[arg(long, value_name = "JSON")]
        input_json: Option<String>,

        /// Application the step runs for
        #[arg(long, value_name = "ID")]
        app_id: String,

        /// Device the step runs for
        #[arg(long, value_name = "ID")]
        device_id: String,

        /// Logged-in user, enables user storage
        #[arg(long, value_name = "ID")]
        user_id: Option<String>,

        /// Application folder (overrides configuration)
        #[arg(long, value_name = "PATH")]
        app_folder: Option<PathBuf>,

        /// Start the worker in debug-attach mode
        #[arg(long)]
        inspect: bool,
    },

    /// Keep a worker running and restart it whenever extension sources change
    Watch {
        /// Application folder (overrides configuration)
        #[arg(long, value_name = "PATH")]
        app_folder: Option<PathBuf>,

        /// Start the worker in debug-attach mode
        #[arg(long)]
        inspect: bool,
    },

    /// Run as worker process (internal use)
    #[command(hide = true)]
    Worker {
        /// Application folder the worker serves
        #[arg(long, value_name = "PATH")]
        app_folder: PathBuf,

        #[arg(long)]
        inspect: bool,
    },
}
