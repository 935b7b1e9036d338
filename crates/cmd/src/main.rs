use std::path::PathBuf;

use clap::{Parser, Subcommand};

use cmd::commands::update::{self, UpdateArgs};

/// Maintains a tree of differential btrfs backups in object storage.
#[derive(Parser)]
#[command(name = "snapship", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// One-time update of snapshots and backups
    Update {
        /// Path to the YAML config file
        config_file: PathBuf,

        /// Perform actions without prompting
        #[arg(long)]
        force: bool,

        /// Show the plan and exit without acting
        #[arg(long)]
        pretend: bool,

        /// Directory for upload spill files (system temp dir by default)
        #[arg(long)]
        spill_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let code = match cli.command {
        Commands::Update { config_file, force, pretend, spill_dir } => {
            update::run(UpdateArgs { config_file, force, pretend, spill_dir }).await
        }
    };
    std::process::exit(code);
}
