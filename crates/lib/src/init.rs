//! Initialize the configuration directory: create ~/.switchboard, a default config and the sessions directory.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config;

/// Ensure the configuration directory has been initialized (config file and sessions directory exist).
pub fn require_initialized(config_path: &Path, config: &config::Config) -> Result<()> {
    if !config_path.exists() {
        anyhow::bail!(
            "configuration not initialized; run `switchboard init` first (config file not found: {})",
            config_path.display()
        );
    }
    let sessions_dir = config::resolve_sessions_dir(config, config_path);
    if !sessions_dir.is_dir() {
        anyhow::bail!(
            "configuration not initialized; run `switchboard init` first (sessions directory not found: {})",
            sessions_dir.display()
        );
    }
    Ok(())
}

/// Create the config directory and default files if they do not exist.
/// - Creates the config directory (parent of config file path).
/// - Writes `config.json` with `{}` if missing.
/// - Creates the sessions directory (`sessions.directory` or `sessions` next to the config).
pub fn init_config_dir(config_path: &Path) -> Result<PathBuf> {
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;

    if !config_path.exists() {
        std::fs::write(config_path, b"{}")
            .with_context(|| format!("writing default config to {}", config_path.display()))?;
        log::info!("created default config at {}", config_path.display());
    }

    let (config, _) = config::load_config(Some(config_path.to_path_buf()))?;
    let sessions_dir = config::resolve_sessions_dir(&config, config_path);
    if !sessions_dir.exists() {
        std::fs::create_dir_all(&sessions_dir)
            .with_context(|| format!("creating sessions directory {}", sessions_dir.display()))?;
        log::info!("created sessions directory at {}", sessions_dir.display());
    } else {
        log::debug!("sessions directory already exists at {}, skipping", sessions_dir.display());
    }

    Ok(config_dir.to_path_buf())
}
