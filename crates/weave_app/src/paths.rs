use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base directory: `~/.weave/`
pub fn base_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".weave"))
}

/// Returns the network config path: `~/.weave/network.json`
pub fn config_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("network.json"))
}

/// Returns the identity path: `~/.weave/identity.json`
pub fn identity_path() -> Result<PathBuf> {
    Ok(base_dir()?.join("identity.json"))
}

/// Returns the logs directory: `~/.weave/logs/`
pub fn logs_dir() -> Result<PathBuf> {
    Ok(base_dir()?.join("logs"))
}
