//! `netprobe service` — launchd registration lifecycle.

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use colored::Colorize;

use netprobe_core::{DaemonStatus, RegistrationOutcome};
use netprobe_daemon::{LaunchdRegistry, RegistrationManager, SettingsLauncher};

use super::load_config;

#[derive(Subcommand, Debug)]
pub enum ServiceCommand {
    /// Install the launchd plist and bootstrap the service.
    Register,
    /// Boot out the service and remove its plist.
    Unregister,
    /// Show the registration state.
    Status(StatusArgs),
    /// Open the system settings page where the service is approved.
    Approve,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

pub fn run(command: ServiceCommand) -> Result<()> {
    let config = load_config()?;
    let registry = LaunchdRegistry::from_config(&config);
    let plist = registry.plist_path();
    let manager = RegistrationManager::new(registry);

    match command {
        ServiceCommand::Register => {
            match manager.register().context("failed to register service")? {
                RegistrationOutcome::Registered => {
                    println!("{} registered {}", "✓".green(), plist.display());
                }
                RegistrationOutcome::PendingApproval => {
                    println!(
                        "{} registered {}, waiting for approval",
                        "!".yellow(),
                        plist.display()
                    );
                    println!("run `netprobe service approve` to open the approval settings");
                }
            }
        }
        ServiceCommand::Unregister => {
            manager
                .unregister()
                .context("failed to unregister service")?;
            println!("unregistered {}", config.service_label);
        }
        ServiceCommand::Status(args) => {
            let status = manager.status();
            if args.json {
                let payload = serde_json::json!({
                    "label": config.service_label,
                    "code": status.code().as_i32(),
                    "status": status,
                });
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .context("failed to render service status JSON")?
                );
            } else {
                println!("{} {}", marker(&status), status.describe());
            }
        }
        ServiceCommand::Approve => {
            if !SettingsLauncher::from_config(&config).open_approval_settings() {
                bail!("could not open the approval settings on this system");
            }
            println!("opened approval settings; enable {} there", config.service_label);
        }
    }

    Ok(())
}

fn marker(status: &DaemonStatus) -> String {
    match status {
        DaemonStatus::Enabled => "■".green().bold().to_string(),
        DaemonStatus::NotRegistered => "■".bright_black().bold().to_string(),
        DaemonStatus::RequiresApproval => "■".yellow().bold().to_string(),
        DaemonStatus::Error(_) => "■".red().bold().to_string(),
        DaemonStatus::NotAvailable(_) => "■".magenta().bold().to_string(),
    }
}
