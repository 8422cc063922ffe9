//! User configuration at `~/.netprobe/config.yaml`.
//!
//! # API pattern
//!
//! Every filesystem function has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! A missing file is not an error: [`Config::default`] is returned.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_FILE: &str = "config.yaml";
pub const DEFAULT_SERVICE_LABEL: &str = "dev.netprobe.helper";

/// Output format of the daemon's tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unix socket the daemon listens on and the client connects to.
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket after bind.
    pub socket_mode: u32,
    /// launchd label of the privileged service.
    pub service_label: String,
    /// Directory holding system daemon plists.
    pub launch_daemons_dir: PathBuf,
    /// Binary launchd starts for the service.
    pub program_path: PathBuf,
    /// Directory for the daemon's stdout/stderr logs.
    pub log_dir: PathBuf,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    /// Upper bound on a discover/scan operation; `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_timeout_ms: Option<u64>,
    /// External scanner invoked by the daemon; operation kind is appended as last argument.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scanner_command: Option<Vec<String>>,
    /// Overrides the command used to open the approval settings UI.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_command: Option<Vec<String>>,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/var/run/netprobe.sock"),
            socket_mode: 0o666,
            service_label: DEFAULT_SERVICE_LABEL.to_string(),
            launch_daemons_dir: PathBuf::from("/Library/LaunchDaemons"),
            program_path: PathBuf::from("/usr/local/bin/netprobe"),
            log_dir: PathBuf::from("/Library/Logs/netprobe"),
            connect_timeout_ms: 2_000,
            request_timeout_ms: 10_000,
            ping_timeout_ms: 500,
            operation_timeout_ms: None,
            scanner_command: None,
            settings_command: None,
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    /// Reject values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("connect_timeout_ms", self.connect_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("ping_timeout_ms", self.ping_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.operation_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "operation_timeout_ms",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        if self.service_label.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "service_label",
                reason: "must not be empty".to_string(),
            });
        }
        for (field, command) in [
            ("scanner_command", &self.scanner_command),
            ("settings_command", &self.settings_command),
        ] {
            if matches!(command, Some(argv) if argv.is_empty()) {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "command must name a program".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Load `<home>/.netprobe/config.yaml`, falling back to defaults when absent.
    pub fn load_at(home: &Path) -> Result<Self, ConfigError> {
        let path = config_path_at(home);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    /// `load_at` convenience wrapper.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_at(&home()?)
    }

    /// Atomically save to `<home>/.netprobe/config.yaml`.
    ///
    /// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
    pub fn save_at(&self, home: &Path) -> Result<PathBuf, ConfigError> {
        self.validate()?;
        let dir = netprobe_root(home);
        if !dir.exists() {
            std::fs::create_dir_all(&dir)?;
            set_dir_permissions(&dir)?;
        }
        let path = config_path_at(home);
        let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));

        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(&tmp_path, yaml)?;
        set_file_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(path)
    }

    /// `save_at` convenience wrapper.
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        self.save_at(&home()?)
    }
}

/// `<home>/.netprobe/`
pub fn netprobe_root(home: &Path) -> PathBuf {
    home.join(".netprobe")
}

/// `<home>/.netprobe/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    netprobe_root(home).join(CONFIG_FILE)
}

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let home = TempDir::new().unwrap();
        let config = Config::load_at(home.path()).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let home = TempDir::new().unwrap();
        std::fs::create_dir_all(netprobe_root(home.path())).unwrap();
        std::fs::write(
            config_path_at(home.path()),
            "socket_path: /tmp/probe.sock\nping_timeout_ms: 50\n",
        )
        .unwrap();

        let config = Config::load_at(home.path()).unwrap();
        assert_eq!(config.socket_path, PathBuf::from("/tmp/probe.sock"));
        assert_eq!(config.ping_timeout(), Duration::from_millis(50));
        assert_eq!(config.service_label, DEFAULT_SERVICE_LABEL);
        assert_eq!(config.operation_timeout(), None);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = Config {
            request_timeout_ms: 0,
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("request_timeout_ms"));
    }

    #[test]
    fn empty_scanner_command_is_rejected() {
        let config = Config {
            scanner_command: Some(vec![]),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "scanner_command", .. })
        ));
    }
}
