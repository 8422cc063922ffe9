//! `netprobe daemon` — run the helper or probe a running one.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use netprobe_daemon::{start_blocking, Connection, DaemonError, OperationClient};

use super::{block_on, load_config};

#[derive(Subcommand, Debug)]
pub enum DaemonCommand {
    /// Run the daemon in the foreground (what launchd starts).
    Run(RunArgs),
    /// Check that the daemon answers on its socket.
    Ping,
    /// Ask the daemon whether it holds scanning privileges.
    Privileges,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Listen on this socket instead of the configured one.
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

pub fn run(command: DaemonCommand) -> Result<()> {
    let mut config = load_config()?;

    match command {
        DaemonCommand::Run(args) => {
            if let Some(socket) = args.socket {
                config.socket_path = socket;
            }
            start_blocking(config).context("daemon exited with error")?;
        }
        DaemonCommand::Ping => block_on(async {
            let connection = Connection::from_config(&config);
            if let Err(err) = connection.connect().await {
                return report_unreachable(err);
            }
            if connection.ping().await {
                println!("{} daemon is alive", "✓".green());
            } else {
                println!("{} daemon did not answer", "✗".red());
            }
            Ok(())
        })??,
        DaemonCommand::Privileges => block_on(async {
            let connection = Connection::from_config(&config);
            if let Err(err) = connection.connect().await {
                return report_unreachable(err);
            }
            let privileged = OperationClient::new(&connection)
                .check_privileges()
                .await
                .context("privilege check failed")?;
            if privileged {
                println!("{} daemon has scanning privileges", "✓".green());
            } else {
                println!("{} daemon lacks scanning privileges", "✗".yellow());
            }
            Ok::<_, anyhow::Error>(())
        })??,
    }

    Ok(())
}

fn report_unreachable(err: DaemonError) -> Result<()> {
    match err {
        DaemonError::DaemonNotRunning { socket } => {
            println!("daemon is not running (socket: {})", socket.display());
            Ok(())
        }
        err => Err(err).context("failed to reach daemon"),
    }
}
