//! netprobe — privileged network scanning helper.
//!
//! # Usage
//!
//! ```text
//! netprobe service register|unregister|approve
//! netprobe service status [--json]
//! netprobe daemon run [--socket <path>]
//! netprobe daemon ping|privileges
//! netprobe discover --request <file|->
//! netprobe scan --request <file|->
//! ```

mod commands;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use commands::{daemon::DaemonCommand, operation::OperationArgs, service::ServiceCommand};
use netprobe_core::{LogFormat, OperationKind};

#[derive(Parser, Debug)]
#[command(
    name = "netprobe",
    version,
    about = "Register, run and talk to the privileged network scanning helper",
    long_about = None,
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register, inspect and approve the privileged launchd service.
    Service {
        #[command(subcommand)]
        command: ServiceCommand,
    },

    /// Run the helper daemon or probe a running one.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Discover hosts on the network described by the request.
    Discover(OperationArgs),

    /// Scan the targets described by the request.
    Scan(OperationArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // The daemon installs its own subscriber from config.
    if !matches!(
        cli.command,
        Commands::Daemon {
            command: DaemonCommand::Run(_)
        }
    ) {
        let level = match cli.verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        };
        netprobe_daemon::init_tracing(LogFormat::Text, level);
    }

    match cli.command {
        Commands::Service { command } => commands::service::run(command),
        Commands::Daemon { command } => commands::daemon::run(command),
        Commands::Discover(args) => commands::operation::run(OperationKind::Discover, args),
        Commands::Scan(args) => commands::operation::run(OperationKind::Scan, args),
    }
}
