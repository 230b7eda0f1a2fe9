//! Gateway-level operations under `/system/{op}`: session lifecycle and listing.
//!
//! Parameters are named and read from the merged body/query mapping. A query
//! value for `settings` is parsed as JSON.

use super::server::GatewayState;
use crate::error::{GatewayError, Result};
use crate::health;
use crate::session::trim_name;
use serde_json::{json, Map, Value};

pub const ADD_SESSION: &str = "addSession";
pub const REMOVE_SESSION: &str = "removeSession";
pub const UNLINK_SESSION_FILE: &str = "unlinkSessionFile";
pub const SAVE_SESSION_SETTINGS: &str = "saveSessionSettings";
pub const GET_SESSION_LIST: &str = "getSessionList";

fn required_str<'a>(params: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::InvalidParams(format!("missing parameter: {}", key)))
}

fn settings_param(params: &Map<String, Value>) -> Result<Value> {
    match params.get("settings") {
        None | Some(Value::Null) => Ok(Value::Null),
        Some(Value::String(s)) => serde_json::from_str(s)
            .map_err(|e| GatewayError::InvalidParams(format!("settings is not valid JSON: {}", e))),
        Some(v) => Ok(v.clone()),
    }
}

/// Resident memory of this process, e.g. "51234 kB".
fn process_memory() -> String {
    match health::current_memory() {
        Some(bytes) => format!("{} kB", bytes / 1024),
        None => "unknown".to_string(),
    }
}

pub async fn session_list(state: &GatewayState) -> Value {
    let mut sessions = Map::new();
    for summary in state.sessions.list().await {
        let name = summary.session.clone();
        sessions.insert(name, json!(summary));
    }
    json!({ "sessions": sessions, "memory": process_memory() })
}

/// Run the system operation `op`.
pub async fn call(state: &GatewayState, op: &str, params: &Map<String, Value>) -> Result<Value> {
    match op {
        ADD_SESSION => {
            let name = required_str(params, "session")?;
            let session = state.sessions.add(name, settings_param(params)?).await?;
            Ok(json!({
                "session": session.name(),
                "file": session.file().display().to_string(),
            }))
        }
        REMOVE_SESSION => {
            let name = required_str(params, "session")?;
            state.remove_session(name).await?;
            Ok(json!({ "session": trim_name(name) }))
        }
        UNLINK_SESSION_FILE => {
            let name = required_str(params, "session")?;
            state.sessions.unlink(name).await?;
            Ok(json!({ "session": name }))
        }
        SAVE_SESSION_SETTINGS => {
            let name = required_str(params, "session")?;
            let settings = settings_param(params)?;
            let file = state.sessions.save_overrides(name, &settings).await?;
            Ok(json!({ "session": name, "file": file.display().to_string() }))
        }
        GET_SESSION_LIST => Ok(session_list(state).await),
        other => Err(GatewayError::not_found(format!("unknown system method {}", other))),
    }
}
