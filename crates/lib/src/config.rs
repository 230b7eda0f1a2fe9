//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.switchboard/config.json`) and environment.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Top-level application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Where sessions keep their settings, and which ones start at boot.
    #[serde(default)]
    pub sessions: SessionsConfig,

    /// Base client settings. Per-session overrides are deep-merged on top.
    #[serde(default = "empty_object")]
    pub client: Value,

    /// Watchdog that probes the gateway and kills it when it stops answering.
    #[serde(default)]
    pub health: HealthConfig,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            sessions: SessionsConfig::default(),
            client: empty_object(),
            health: HealthConfig::default(),
        }
    }
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for HTTP and WebSocket (default 9503).
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require a bearer token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret. Overridden by SWITCHBOARD_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    #[default]
    None,
    Token,
}

fn default_gateway_port() -> u16 {
    9503
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsConfig {
    /// Directory for per-session settings files. Relative paths are resolved against
    /// the config file's parent; default is the `sessions` subdirectory there.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Sessions added at startup.
    #[serde(default)]
    pub autoload: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between checks (default 30).
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,

    /// Per-request timeout for the session listing and each probe (default 15).
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,

    /// Self-identity method probed on every logged-in session.
    #[serde(default = "default_probe_method")]
    pub probe_method: String,
}

fn default_true() -> bool {
    true
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    15
}

fn default_probe_method() -> String {
    "getSelf".to_string()
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            probe_method: default_probe_method(),
        }
    }
}

/// Resolve the gateway token: env SWITCHBOARD_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    std::env::var("SWITCHBOARD_GATEWAY_TOKEN")
        .ok()
        .and_then(|s| {
            let t = s.trim();
            if t.is_empty() {
                None
            } else {
                Some(t.to_string())
            }
        })
        .or_else(|| {
            config
                .gateway
                .auth
                .token
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Base URL a local client (the watchdog) uses to reach the gateway.
pub fn local_base_url(config: &Config) -> String {
    let bind = config.gateway.bind.trim();
    let host = match bind {
        "" | "0.0.0.0" => "127.0.0.1",
        "::" | "::1" => "[::1]",
        other => other,
    };
    format!("http://{}:{}", host, config.gateway.port)
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("SWITCHBOARD_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".switchboard").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used (for resolving the sessions directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    if !config.client.is_object() {
        anyhow::bail!("config key \"client\" must be an object ({})", path.display());
    }
    Ok((config, path))
}

fn config_parent(config_path: &Path) -> &Path {
    config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Resolve the sessions directory: `sessions.directory` if set (relative paths
/// resolved against the config file's parent), otherwise `sessions` next to the config.
pub fn resolve_sessions_dir(config: &Config, config_path: &Path) -> PathBuf {
    let parent = config_parent(config_path);
    match &config.sessions.directory {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                parent.join(d)
            }
        }
        _ => parent.join("sessions"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_port_and_bind() {
        let g = GatewayConfig::default();
        assert_eq!(g.port, 9503);
        assert_eq!(g.bind, "127.0.0.1");
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert!(config.client.as_object().unwrap().is_empty());
        assert!(config.health.enabled);
        assert_eq!(config.health.probe_method, "getSelf");
        assert!(config.sessions.autoload.is_empty());
    }

    #[test]
    fn camel_case_keys() {
        let config: Config = serde_json::from_str(
            r#"{"health":{"intervalSecs":5,"enabled":false},"sessions":{"autoload":["work"]},"client":{"limit":1}}"#,
        )
        .unwrap();
        assert_eq!(config.health.interval_secs, 5);
        assert!(!config.health.enabled);
        assert_eq!(config.sessions.autoload, vec!["work".to_string()]);
        assert_eq!(config.client["limit"], 1);
    }

    #[test]
    fn resolve_sessions_dir_default() {
        let config = Config::default();
        let path = Path::new("/home/user/.switchboard/config.json");
        assert_eq!(
            resolve_sessions_dir(&config, path),
            PathBuf::from("/home/user/.switchboard/sessions")
        );
    }

    #[test]
    fn resolve_sessions_dir_override_relative() {
        let mut config = Config::default();
        config.sessions.directory = Some(PathBuf::from("data/sessions"));
        let path = Path::new("/home/user/.switchboard/config.json");
        assert_eq!(
            resolve_sessions_dir(&config, path),
            PathBuf::from("/home/user/.switchboard/data/sessions")
        );
    }

    #[test]
    fn resolve_sessions_dir_override_absolute() {
        let mut config = Config::default();
        config.sessions.directory = Some(PathBuf::from("/var/lib/switchboard"));
        let path = Path::new("/home/user/.switchboard/config.json");
        assert_eq!(
            resolve_sessions_dir(&config, path),
            PathBuf::from("/var/lib/switchboard")
        );
    }

    #[test]
    fn local_base_url_maps_wildcard_bind() {
        let mut config = Config::default();
        config.gateway.bind = "0.0.0.0".to_string();
        config.gateway.port = 8080;
        assert_eq!(local_base_url(&config), "http://127.0.0.1:8080");
    }
}
