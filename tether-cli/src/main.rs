//! Tether: launch applications through the execution service and keep
//! track of them.
//!
//! # Usage
//!
//! ```text
//! tether start <application-id>
//! tether stop <application-id>
//! tether ps [--json]
//! tether daemon start|stop|status
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{daemon::DaemonCommand, ps::PsArgs, start::StartArgs, stop::StopArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "tether",
    version,
    about = "Launch applications and track their running processes",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch an application and start tracking its process.
    Start(StartArgs),

    /// Stop an application's process and stop tracking it.
    Stop(StopArgs),

    /// List tracked processes and their status channels.
    Ps(PsArgs),

    /// Manage the tether background daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => args.run(),
        Commands::Stop(args) => args.run(),
        Commands::Ps(args) => args.run(),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
