//! Per-session settings: deep merge, the on-disk override store, and the typed
//! client settings built from a merged document.
//!
//! Overrides live next to each other in the sessions directory as
//! `<name>.settings.json`. The effective settings of a session are the base
//! `client` document from the config with the override merged on top.

use crate::error::{GatewayError, Result};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

const SETTINGS_SUFFIX: &str = ".settings.json";

/// Merge `overlay` into `base`. Objects merge key by key; any other value in
/// `overlay` replaces what `base` had.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// True for `null`, `{}` and `[]`.
pub fn is_empty_document(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Key to document store for per-session overrides, one JSON file per session.
pub struct SettingsStore {
    dir: PathBuf,
}

impl SettingsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Trim surrounding path separators and reject names that escape the
    /// sessions directory or point at an existing directory.
    pub fn normalize_name(&self, raw: &str) -> Result<String> {
        let name = raw.trim().trim_matches(|c| c == '/' || c == '\\');
        if name.is_empty() {
            return Err(GatewayError::InvalidParams("session name is empty".to_string()));
        }
        let escapes = Path::new(name)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(GatewayError::InvalidParams(format!(
                "session name {:?} must be a relative path without '.' or '..'",
                name
            )));
        }
        if self.dir.join(name).is_dir() {
            return Err(GatewayError::InvalidParams(format!(
                "session name {:?} resolves to a directory",
                name
            )));
        }
        Ok(name.to_string())
    }

    /// File that holds the override document for `name`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, SETTINGS_SUFFIX))
    }

    /// Persisted override for `name`, or None when nothing was saved.
    pub async fn load(&self, name: &str) -> Result<Option<Value>> {
        let path = self.path_for(name);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(GatewayError::io(format!("reading {}", path.display()), e));
            }
        };
        let doc = serde_json::from_str(&text).map_err(|e| {
            GatewayError::Settings(format!("parsing {}: {}", path.display(), e))
        })?;
        Ok(Some(doc))
    }

    pub async fn save(&self, name: &str, settings: &Value) -> Result<()> {
        let path = self.path_for(name);
        let json = serde_json::to_string_pretty(settings)
            .map_err(|e| GatewayError::Settings(e.to_string()))?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GatewayError::io(format!("creating {}", parent.display()), e))?;
        }
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| GatewayError::io(format!("writing {}", path.display()), e))
    }

    /// Delete the override file. Returns false when there was none.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(GatewayError::io(format!("removing {}", path.display()), e)),
        }
    }
}

/// Typed settings consumed by [`crate::client::RemoteClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub upstream: UpstreamSettings,
    pub updates: UpdatesSettings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamSettings {
    /// Base URL of the bridge that hosts the messaging client.
    pub url: String,
    pub token: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdatesSettings {
    /// Long-poll timeout passed to the bridge.
    pub poll_timeout_secs: u64,
    /// Pause after a failed poll before retrying.
    pub retry_delay_ms: u64,
    pub batch_limit: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            upstream: UpstreamSettings {
                url: "http://127.0.0.1:9504".to_string(),
                token: None,
                timeout_secs: 30,
            },
            updates: UpdatesSettings {
                poll_timeout_secs: 25,
                retry_delay_ms: 1_000,
                batch_limit: 100,
            },
        }
    }
}

type Setter = fn(&mut ClientSettings, &Value) -> Result<(), String>;

/// Every accepted leaf key path. Sections are derived from the prefixes.
const SETTERS: &[(&str, Setter)] = &[
    ("upstream.url", set_upstream_url),
    ("upstream.token", set_upstream_token),
    ("upstream.timeoutSecs", set_upstream_timeout),
    ("updates.pollTimeoutSecs", set_poll_timeout),
    ("updates.retryDelayMs", set_retry_delay),
    ("updates.batchLimit", set_batch_limit),
];

fn expect_str(v: &Value) -> Result<String, String> {
    v.as_str()
        .map(|s| s.trim().to_string())
        .ok_or_else(|| format!("expected a string, got {}", v))
}

fn expect_u64(v: &Value) -> Result<u64, String> {
    v.as_u64()
        .ok_or_else(|| format!("expected a non-negative integer, got {}", v))
}

fn set_upstream_url(s: &mut ClientSettings, v: &Value) -> Result<(), String> {
    let url = expect_str(v)?;
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(format!("expected an http(s) URL, got {:?}", url));
    }
    s.upstream.url = url.trim_end_matches('/').to_string();
    Ok(())
}

fn set_upstream_token(s: &mut ClientSettings, v: &Value) -> Result<(), String> {
    s.upstream.token = if v.is_null() {
        None
    } else {
        Some(expect_str(v)?).filter(|t| !t.is_empty())
    };
    Ok(())
}

fn set_upstream_timeout(s: &mut ClientSettings, v: &Value) -> Result<(), String> {
    s.upstream.timeout_secs = expect_u64(v)?;
    Ok(())
}

fn set_poll_timeout(s: &mut ClientSettings, v: &Value) -> Result<(), String> {
    s.updates.poll_timeout_secs = expect_u64(v)?;
    Ok(())
}

fn set_retry_delay(s: &mut ClientSettings, v: &Value) -> Result<(), String> {
    s.updates.retry_delay_ms = expect_u64(v)?;
    Ok(())
}

fn set_batch_limit(s: &mut ClientSettings, v: &Value) -> Result<(), String> {
    let n = expect_u64(v)?;
    if n == 0 {
        return Err("must be at least 1".to_string());
    }
    s.updates.batch_limit = n;
    Ok(())
}

impl ClientSettings {
    /// Build from a merged settings document. Unknown keys are rejected.
    pub fn from_document(doc: &Value) -> Result<Self> {
        let mut settings = Self::default();
        if doc.is_null() {
            return Ok(settings);
        }
        apply(&mut settings, "", doc)?;
        Ok(settings)
    }
}

fn apply(settings: &mut ClientSettings, prefix: &str, value: &Value) -> Result<()> {
    let Value::Object(map) = value else {
        let at = if prefix.is_empty() { "<root>" } else { prefix };
        return Err(GatewayError::Settings(format!("{}: expected an object", at)));
    };
    for (key, v) in map {
        let path = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{}.{}", prefix, key)
        };
        if let Some((_, setter)) = SETTERS.iter().find(|(k, _)| *k == path) {
            setter(settings, v).map_err(|e| GatewayError::Settings(format!("{}: {}", path, e)))?;
            continue;
        }
        let section = format!("{}.", path);
        if SETTERS.iter().any(|(k, _)| k.starts_with(&section)) {
            apply(settings, &path, v)?;
            continue;
        }
        return Err(GatewayError::Settings(format!("unknown setting {}", path)));
    }
    Ok(())
}
