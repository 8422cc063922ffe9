use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use assert_cmd::prelude::*;
use predicates::str::contains;
use tempfile::TempDir;

use netprobe_core::Config;

fn netprobe_cmd(home: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("netprobe"));
    cmd.env("HOME", home)
        .env("USERPROFILE", home)
        .env_remove("RUST_LOG");
    cmd
}

/// Write a config whose socket and launchd paths all live under `home`.
fn write_config(home: &Path, scanner: Option<Vec<String>>) -> PathBuf {
    let socket = home.join("netprobe.sock");
    let config = Config {
        socket_path: socket.clone(),
        launch_daemons_dir: home.join("LaunchDaemons"),
        log_dir: home.join("logs"),
        connect_timeout_ms: 500,
        scanner_command: scanner,
        ..Config::default()
    };
    config.save_at(home).expect("save config");
    socket
}

struct DaemonProcess(Child);

impl Drop for DaemonProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn spawn_daemon(home: &Path, socket: &Path) -> DaemonProcess {
    let child = netprobe_cmd(home)
        .args(["daemon", "run"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn daemon");
    let daemon = DaemonProcess(child);
    for _ in 0..100 {
        if socket.exists() {
            return daemon;
        }
        sleep(Duration::from_millis(50));
    }
    panic!("daemon never created {}", socket.display());
}

#[test]
fn help_lists_the_command_groups() {
    let home = TempDir::new().expect("home");
    netprobe_cmd(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("service"))
        .stdout(contains("discover"));
}

#[test]
fn ping_without_daemon_reports_not_running() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), None);

    netprobe_cmd(home.path())
        .args(["daemon", "ping"])
        .assert()
        .success()
        .stdout(contains("daemon is not running"));
}

#[test]
fn discover_without_daemon_fails_with_hint() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), None);
    let request = home.path().join("request.json");
    fs::write(&request, "{}\n").expect("write request");

    netprobe_cmd(home.path())
        .args(["discover", "--request"])
        .arg(&request)
        .assert()
        .failure()
        .stderr(contains("cannot reach the helper daemon"));
}

#[test]
fn invalid_config_is_rejected() {
    let home = TempDir::new().expect("home");
    let dir = home.path().join(".netprobe");
    fs::create_dir_all(&dir).expect("config dir");
    fs::write(dir.join("config.yaml"), "ping_timeout_ms: 0\n").expect("write config");

    netprobe_cmd(home.path())
        .args(["daemon", "ping"])
        .assert()
        .failure()
        .stderr(contains("ping_timeout_ms"));
}

#[cfg(not(target_os = "macos"))]
#[test]
fn service_status_is_not_available_off_macos() {
    let home = TempDir::new().expect("home");
    write_config(home.path(), None);

    netprobe_cmd(home.path())
        .args(["service", "status", "--json"])
        .assert()
        .success()
        .stdout(contains("\"state\": \"not_available\""))
        .stdout(contains("\"code\": 4"));

    netprobe_cmd(home.path())
        .args(["service", "register"])
        .assert()
        .failure()
        .stderr(contains("not available"));
}

#[test]
fn daemon_serves_ping_privileges_and_scans() {
    let home = TempDir::new().expect("home");
    let script = r#"if [ "$1" = check ]; then echo '{"type":"check_result","success":false}'; exit 0; fi
read req
echo '{"type":"port_open","port":22}'
echo "{\"type\":\"${1}_complete\",\"request\":$req}""#;
    let socket = write_config(
        home.path(),
        Some(vec![
            "sh".into(),
            "-c".into(),
            script.into(),
            "scanner".into(),
        ]),
    );
    let _daemon = spawn_daemon(home.path(), &socket);

    netprobe_cmd(home.path())
        .args(["daemon", "ping"])
        .assert()
        .success()
        .stdout(contains("daemon is alive"));

    netprobe_cmd(home.path())
        .args(["daemon", "privileges"])
        .assert()
        .success()
        .stdout(contains("lacks scanning privileges"));

    let request = home.path().join("request.json");
    fs::write(&request, "{\"targets\":[\"127.0.0.1\"]}\n").expect("write request");
    netprobe_cmd(home.path())
        .args(["scan", "--request"])
        .arg(&request)
        .assert()
        .success()
        .stdout(contains(r#"{"type":"port_open","port":22}"#))
        .stdout(contains(
            r#"{"type":"scan_complete","request":{"targets":["127.0.0.1"]}}"#,
        ));
}
