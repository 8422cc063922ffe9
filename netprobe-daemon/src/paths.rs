use std::path::{Path, PathBuf};

pub const DAEMON_STDOUT_LOG: &str = "daemon.log";
pub const DAEMON_STDERR_LOG: &str = "daemon-err.log";

/// `<launch_daemons_dir>/<label>.plist`
pub fn launchd_plist_path(launch_daemons_dir: &Path, label: &str) -> PathBuf {
    launch_daemons_dir.join(format!("{label}.plist"))
}

pub fn stdout_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(DAEMON_STDOUT_LOG)
}

pub fn stderr_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(DAEMON_STDERR_LOG)
}
