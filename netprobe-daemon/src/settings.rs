//! Opens the OS page where the user approves privileged login items.

use std::process::{Command, Stdio};

use netprobe_core::Config;

#[cfg(target_os = "macos")]
const LOGIN_ITEMS_URL: &str = "x-apple.systempreferences:com.apple.LoginItems-Settings.extension";

/// Stateless launcher for the approval UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsLauncher {
    command: Option<Vec<String>>,
}

impl Default for SettingsLauncher {
    fn default() -> Self {
        Self {
            command: platform_command(),
        }
    }
}

impl SettingsLauncher {
    /// Launch `argv` instead of the platform default.
    pub fn with_command(argv: Vec<String>) -> Self {
        Self {
            command: (!argv.is_empty()).then_some(argv),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        match &config.settings_command {
            Some(argv) => Self::with_command(argv.clone()),
            None => Self::default(),
        }
    }

    /// Best effort. `true` means the UI was opened, not that anything was approved.
    pub fn open_approval_settings(&self) -> bool {
        let Some((program, args)) = self.command.as_deref().and_then(<[String]>::split_first)
        else {
            tracing::debug!("no approval settings UI on this platform");
            return false;
        };

        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::warn!(program = %program, %status, "approval settings command failed");
                false
            }
            Err(err) => {
                tracing::warn!(program = %program, error = %err, "could not launch approval settings");
                false
            }
        }
    }
}

#[cfg(target_os = "macos")]
fn platform_command() -> Option<Vec<String>> {
    Some(vec!["open".to_string(), LOGIN_ITEMS_URL.to_string()])
}

#[cfg(not(target_os = "macos"))]
fn platform_command() -> Option<Vec<String>> {
    None
}
