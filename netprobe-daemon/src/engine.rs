//! The work behind `discover`/`scan`: what the daemon runs for each operation.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use netprobe_core::{Config, OperationKind};

/// How long a scanner may keep running after printing its final line.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The request itself is unusable; retrying the same payload won't help.
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Failed(String),

    #[error("cancelled")]
    Cancelled,
}

/// Executes privileged operations inside the daemon.
///
/// `run` streams opaque progress chunks through `progress` and must return
/// promptly once `cancel` flips to `true` (or its sender goes away).
pub trait ScanEngine: Send + Sync + 'static {
    fn check_privileges(&self) -> impl Future<Output = Result<bool, EngineError>> + Send;

    fn run(
        &self,
        kind: OperationKind,
        payload: Vec<u8>,
        progress: mpsc::Sender<Vec<u8>>,
        cancel: watch::Receiver<bool>,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, EngineError>> + Send;
}

/// Runs an external scanner speaking JSON Lines on stdout.
#[derive(Debug, Clone, Default)]
pub struct SidecarEngine {
    command: Option<Vec<String>>,
}

impl SidecarEngine {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command: (!command.is_empty()).then_some(command),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            command: config.scanner_command.clone(),
        }
    }

    fn argv(&self) -> Result<(&String, &[String]), EngineError> {
        self.command
            .as_deref()
            .and_then(<[String]>::split_first)
            .ok_or_else(|| EngineError::Rejected("no scanner command configured".to_string()))
    }
}

impl ScanEngine for SidecarEngine {
    async fn check_privileges(&self) -> Result<bool, EngineError> {
        let Ok((program, args)) = self.argv() else {
            return running_as_root().await;
        };

        let output = Command::new(program)
            .args(args)
            .arg("check")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EngineError::Failed(format!("cannot start scanner {program}: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        for value in stdout
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        {
            match value["type"].as_str() {
                Some("check_result") => {
                    if let Some(privileged) = value["success"].as_bool() {
                        return Ok(privileged);
                    }
                }
                Some("error") => {
                    let message = value["message"].as_str().unwrap_or("no message");
                    return Err(EngineError::Failed(format!(
                        "scanner privilege check failed: {message}"
                    )));
                }
                _ => {}
            }
        }
        Err(EngineError::Failed(format!(
            "scanner privilege check gave no check_result (exit {})",
            output.status
        )))
    }

    async fn run(
        &self,
        kind: OperationKind,
        payload: Vec<u8>,
        progress: mpsc::Sender<Vec<u8>>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Option<Vec<u8>>, EngineError> {
        let (program, args) = self.argv()?;
        if *cancel.borrow() {
            return Err(EngineError::Cancelled);
        }

        let mut child = Command::new(program)
            .args(args)
            .arg(kind.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Failed(format!("cannot start scanner {program}: {e}")))?;
        tracing::debug!(program = %program, kind = %kind, pid = ?child.id(), "scanner started");

        if let Some(mut stdin) = child.stdin.take() {
            let mut line = payload;
            line.push(b'\n');
            if let Err(err) = stdin.write_all(&line).await {
                tracing::warn!(error = %err, "scanner closed stdin before reading the request");
            }
        }

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut last = None;
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "scanner", "{line}");
                    if !line.trim().is_empty() {
                        last = Some(line);
                    }
                }
                last
            })
        });

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::Failed("scanner stdout unavailable".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();

        let mut terminal = None;
        while terminal.is_none() {
            tokio::select! {
                changed = cancel.changed() => {
                    if is_cancelled(changed, &cancel) {
                        stop(&mut child).await;
                        return Err(EngineError::Cancelled);
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => match classify_line(&line) {
                        // A full progress queue must not hide a cancel.
                        ScannerLine::Progress(bytes) => tokio::select! {
                            _ = progress.send(bytes) => {}
                            changed = cancel.changed() => {
                                if is_cancelled(changed, &cancel) {
                                    stop(&mut child).await;
                                    return Err(EngineError::Cancelled);
                                }
                            }
                        },
                        ScannerLine::Complete(bytes) => terminal = Some(Ok(Some(bytes))),
                        ScannerLine::Error(message) => {
                            terminal = Some(Err(EngineError::Failed(message)));
                        }
                        ScannerLine::Blank => {}
                    },
                    Ok(None) => break,
                    Err(err) => {
                        terminal = Some(Err(EngineError::Failed(format!(
                            "reading scanner output: {err}"
                        ))));
                    }
                },
            }
        }

        let grace = tokio::time::sleep(EXIT_GRACE);
        tokio::pin!(grace);
        let status = loop {
            tokio::select! {
                changed = cancel.changed() => {
                    if is_cancelled(changed, &cancel) {
                        stop(&mut child).await;
                        return Err(EngineError::Cancelled);
                    }
                }
                status = child.wait() => break status,
                _ = &mut grace, if terminal.is_some() => {
                    tracing::debug!(pid = ?child.id(), "scanner still running after its final line, stopping it");
                    stop(&mut child).await;
                    break child.wait().await;
                }
            }
        };

        if let Some(terminal) = terminal {
            return terminal;
        }
        let stderr_tail = match stderr_task {
            Some(task) => task.await.ok().flatten(),
            None => None,
        };
        match status {
            Ok(status) if status.success() => Ok(None),
            Ok(status) => Err(EngineError::Failed(
                stderr_tail.unwrap_or_else(|| format!("scanner exited with {status}")),
            )),
            Err(err) => Err(EngineError::Failed(format!("waiting for scanner: {err}"))),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ScannerLine {
    Progress(Vec<u8>),
    Complete(Vec<u8>),
    Error(String),
    Blank,
}

fn classify_line(line: &str) -> ScannerLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ScannerLine::Blank;
    }
    let bytes = trimmed.as_bytes().to_vec();
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return ScannerLine::Progress(bytes);
    };
    match value.get("type").and_then(Value::as_str) {
        Some("error") => ScannerLine::Error(
            value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or(trimmed)
                .to_string(),
        ),
        Some(kind) if kind.ends_with("_complete") || kind.ends_with("_result") => {
            ScannerLine::Complete(bytes)
        }
        _ => ScannerLine::Progress(bytes),
    }
}

fn is_cancelled(
    changed: Result<(), watch::error::RecvError>,
    cancel: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *cancel.borrow()
}

async fn stop(child: &mut Child) {
    if let Err(err) = child.kill().await {
        tracing::debug!(error = %err, "scanner already exited");
    }
}

async fn running_as_root() -> Result<bool, EngineError> {
    let output = Command::new("id")
        .arg("-u")
        .output()
        .await
        .map_err(|e| EngineError::Failed(format!("cannot determine effective uid: {e}")))?;
    Ok(String::from_utf8_lossy(&output.stdout).trim() == "0")
}
