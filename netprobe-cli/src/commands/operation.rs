//! `netprobe discover` / `netprobe scan` — stream one operation to stdout.

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use netprobe_core::OperationKind;
use netprobe_daemon::{Connection, OperationClient, OperationError};

use super::{block_on, load_config};

#[derive(Args, Debug)]
pub struct OperationArgs {
    /// Request payload file, or `-` to read stdin.
    #[arg(long, value_name = "FILE")]
    pub request: PathBuf,

    /// Print only the final result.
    #[arg(long)]
    pub quiet: bool,
}

pub fn run(kind: OperationKind, args: OperationArgs) -> Result<()> {
    let payload = read_request(&args.request)?;
    let config = load_config()?;
    let quiet = args.quiet;

    block_on(async move {
        let connection = Connection::from_config(&config);
        connection
            .connect()
            .await
            .context("cannot reach the helper daemon; is the service registered and approved?")?;
        let client = OperationClient::new(&connection);

        let sink = move |data: &[u8]| {
            if !quiet {
                println!("{}", String::from_utf8_lossy(data));
            }
        };
        let handle = client
            .start(kind, &payload, sink)
            .await
            .with_context(|| format!("failed to start {kind}"))?;
        let id = handle.id().clone();

        let wait = handle.wait();
        tokio::pin!(wait);
        let outcome = tokio::select! {
            outcome = &mut wait => outcome,
            _ = tokio::signal::ctrl_c() => {
                eprintln!("{} cancelling {id}", "!".yellow());
                client.cancel(&id).await;
                wait.await
            }
        };

        match outcome {
            Ok(Some(result)) => println!("{}", String::from_utf8_lossy(&result)),
            Ok(None) => {}
            Err(OperationError::Cancelled) => bail!("{kind} {id} cancelled"),
            Err(err) => return Err(err).with_context(|| format!("{kind} {id} failed")),
        }
        Ok::<_, anyhow::Error>(())
    })?
}

fn read_request(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut payload = Vec::new();
        std::io::stdin()
            .read_to_end(&mut payload)
            .context("failed to read request from stdin")?;
        return Ok(trim_newline(payload));
    }
    let payload =
        std::fs::read(path).with_context(|| format!("failed to read request {}", path.display()))?;
    Ok(trim_newline(payload))
}

/// The payload travels as one protocol line; a trailing newline from an
/// editor or `echo` is not part of it.
fn trim_newline(mut payload: Vec<u8>) -> Vec<u8> {
    while matches!(payload.last(), Some(b'\n' | b'\r')) {
        payload.pop();
    }
    payload
}
