//! Gateway wire types: the response envelope and the streamed event frames.

use crate::error::GatewayError;
use crate::logging::LogEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of `errors`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub code: i64,
    pub message: String,
    /// Error class, e.g. `NotFound` or `Upstream`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// Response to every API and system call:
/// `{ "success", "errors": [{ "code", "message", ... }], "response" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    pub errors: Vec<ErrorEntry>,
    pub response: Option<Value>,
}

impl Envelope {
    pub fn ok(response: Value) -> Self {
        Self {
            success: true,
            errors: Vec::new(),
            response: Some(response),
        }
    }

    pub fn err(error: &GatewayError) -> Self {
        Self {
            success: false,
            errors: vec![ErrorEntry {
                code: error.code(),
                message: error.to_string(),
                kind: Some(error.kind().to_string()),
            }],
            response: None,
        }
    }
}

const JSONRPC_VERSION: &str = "2.0";

/// `{ "jsonrpc": "2.0", "result": ..., "id": null }` frame pushed to stream subscribers.
#[derive(Debug, Serialize)]
pub struct StreamFrame<T> {
    pub jsonrpc: &'static str,
    pub result: T,
    pub id: Option<u64>,
}

impl<T> StreamFrame<T> {
    pub fn new(result: T) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            result,
            id: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UpdateResult<'a> {
    pub session: Option<&'a str>,
    pub update: &'a Value,
}

/// Update frame: `result = { "session", "update" }`.
pub fn update_frame<'a>(session: Option<&'a str>, update: &'a Value) -> StreamFrame<UpdateResult<'a>> {
    StreamFrame::new(UpdateResult { session, update })
}

#[derive(Debug, Serialize)]
pub struct LogResult<'a> {
    pub level: String,
    pub message: &'a str,
    pub context: &'a Value,
}

/// Log frame: `result = { "level", "message", "context" }`.
pub fn log_frame(event: &LogEvent) -> StreamFrame<LogResult<'_>> {
    StreamFrame::new(LogResult {
        level: event.level.as_str().to_lowercase(),
        message: &event.message,
        context: &event.context,
    })
}
