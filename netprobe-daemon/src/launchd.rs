//! launchd-backed [`ServiceRegistry`] for the privileged helper.
//!
//! The helper runs as a system daemon (`system` domain), so its plist lives in
//! `/Library/LaunchDaemons`. A bootstrap that launchd refuses for lack of
//! authorization leaves the plist in place: the service is registered but
//! waits for the user to approve it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use netprobe_core::{Config, DaemonStatus, RegistrationOutcome};

use crate::paths::{launchd_plist_path, stderr_log_path, stdout_log_path};
use crate::registration::{RegistrationError, ServiceRegistry};

const LAUNCHD_DOMAIN: &str = "system";

/// Generate the launchd plist for the helper daemon.
pub fn generate_plist(label: &str, binary_path: &Path, socket_path: &Path, log_dir: &Path) -> String {
    let stdout = stdout_log_path(log_dir).display().to_string();
    let stderr = stderr_log_path(log_dir).display().to_string();
    let binary = binary_path.display().to_string();
    let socket = socket_path.display().to_string();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
  <key>Label</key>
  <string>{label}</string>
  <key>ProgramArguments</key>
  <array>
    <string>{binary}</string>
    <string>daemon</string>
    <string>run</string>
    <string>--socket</string>
    <string>{socket}</string>
  </array>
  <key>RunAtLoad</key>
  <true/>
  <key>KeepAlive</key>
  <true/>
  <key>StandardOutPath</key>
  <string>{stdout}</string>
  <key>StandardErrorPath</key>
  <string>{stderr}</string>
</dict>
</plist>
"#
    )
}

#[derive(Debug, Clone)]
pub struct LaunchdRegistry {
    label: String,
    launch_daemons_dir: PathBuf,
    program_path: PathBuf,
    socket_path: PathBuf,
    log_dir: PathBuf,
}

impl LaunchdRegistry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            label: config.service_label.clone(),
            launch_daemons_dir: config.launch_daemons_dir.clone(),
            program_path: config.program_path.clone(),
            socket_path: config.socket_path.clone(),
            log_dir: config.log_dir.clone(),
        }
    }

    pub fn plist_path(&self) -> PathBuf {
        launchd_plist_path(&self.launch_daemons_dir, &self.label)
    }

    fn service_target(&self) -> String {
        format!("{LAUNCHD_DOMAIN}/{}", self.label)
    }

    fn write_plist(&self) -> Result<PathBuf, RegistrationError> {
        if !self.launch_daemons_dir.exists() {
            fs::create_dir_all(&self.launch_daemons_dir).map_err(|e| {
                RegistrationError::Failed(format!(
                    "cannot create {}: {e}",
                    self.launch_daemons_dir.display()
                ))
            })?;
        }
        let plist = self.plist_path();
        let contents = generate_plist(
            &self.label,
            &self.program_path,
            &self.socket_path,
            &self.log_dir,
        );
        fs::write(&plist, contents).map_err(|e| {
            RegistrationError::Failed(format!("cannot write {}: {e}", plist.display()))
        })?;
        Ok(plist)
    }
}

impl ServiceRegistry for LaunchdRegistry {
    fn register(&self) -> Result<RegistrationOutcome, RegistrationError> {
        ensure_macos()?;

        let plist = self.write_plist()?;
        let _ = run_launchctl(&["bootout", &self.service_target()]);

        let plist_arg = plist.display().to_string();
        match run_launchctl(&["bootstrap", LAUNCHD_DOMAIN, &plist_arg]) {
            Ok(_) => Ok(RegistrationOutcome::Registered),
            Err(output) if needs_authorization(&output) => {
                tracing::info!(
                    plist = %plist.display(),
                    "launchd bootstrap needs authorization; service left pending approval",
                );
                Ok(RegistrationOutcome::PendingApproval)
            }
            Err(output) => Err(RegistrationError::Failed(output)),
        }
    }

    fn unregister(&self) -> Result<(), RegistrationError> {
        ensure_macos()?;

        let plist = self.plist_path();
        if plist.exists() {
            let _ = run_launchctl(&["bootout", &self.service_target()]);
            fs::remove_file(&plist).map_err(|e| {
                RegistrationError::Failed(format!("cannot remove {}: {e}", plist.display()))
            })?;
        }
        Ok(())
    }

    fn status(&self) -> DaemonStatus {
        if let Err(RegistrationError::NotAvailable(reason)) = ensure_macos() {
            return DaemonStatus::NotAvailable(reason);
        }
        if !self.plist_path().exists() {
            return DaemonStatus::NotRegistered;
        }
        match run_launchctl(&["print", &self.service_target()]) {
            Ok(_) => DaemonStatus::Enabled,
            Err(output) => classify_print_failure(&output),
        }
    }
}

/// Map a failed `launchctl print` on a registered plist to a status.
pub fn classify_print_failure(output: &str) -> DaemonStatus {
    let lowered = output.to_ascii_lowercase();
    if lowered.contains("could not find service") || lowered.contains("service is disabled") {
        DaemonStatus::RequiresApproval
    } else if output.trim().is_empty() {
        DaemonStatus::Error("launchctl print failed without output".to_string())
    } else {
        DaemonStatus::Error(output.trim().to_string())
    }
}

/// Whether a failed bootstrap means "the user has to authorize this".
pub fn needs_authorization(output: &str) -> bool {
    let lowered = output.to_ascii_lowercase();
    lowered.contains("operation not permitted")
        || lowered.contains("not privileged")
        || lowered.contains("bootstrap failed: 1:")
}

#[cfg(target_os = "macos")]
fn ensure_macos() -> Result<(), RegistrationError> {
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn ensure_macos() -> Result<(), RegistrationError> {
    Err(RegistrationError::NotAvailable(
        "launchd management is only supported on macOS".to_string(),
    ))
}

/// Run `launchctl`, returning stdout on success and combined output on failure.
fn run_launchctl(args: &[&str]) -> Result<String, String> {
    let output = Command::new("launchctl")
        .args(args)
        .output()
        .map_err(|e| format!("failed to execute launchctl: {e}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if output.status.success() {
        return Ok(stdout);
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    tracing::debug!(?args, status = %output.status, stderr = %stderr, "launchctl failed");
    Err(format!("{stdout} {stderr}").trim().to_string())
}
