pub mod daemon;
pub mod operation;
pub mod service;

use std::future::Future;

use anyhow::{Context, Result};

use netprobe_core::Config;

pub(crate) fn load_config() -> Result<Config> {
    Config::load().context("failed to load ~/.netprobe/config.yaml")
}

/// Drive one async command to completion on a fresh runtime.
pub(crate) fn block_on<F: Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    Ok(runtime.block_on(future))
}
