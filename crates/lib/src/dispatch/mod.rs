//! Request dispatch: dotted method path + positional parameters -> client call.
//!
//! Resolution order:
//! 1. a single-segment path naming a registered extension runs the extension;
//! 2. a leading `API` segment switches to the client's low-level surface;
//! 3. the remaining 1 to 3 segments are called on the chosen surface.
//!
//! Anything else is a malformed path, whether or not such a method exists.

mod extensions;
mod html;

pub use extensions::{Extension, ExtensionRegistry};
pub use html::entities_to_html;

use crate::error::{GatewayError, Result};
use crate::session::SessionStore;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Prefix selecting the low-level call surface.
pub const API_PREFIX: &str = "API";

const MAX_DEPTH: usize = 3;

/// Split a dotted method path, rejecting empty segments.
pub fn parse_method(method: &str) -> Result<Vec<&str>> {
    let method = method.trim();
    if method.is_empty() {
        return Err(GatewayError::MalformedPath(method.to_string()));
    }
    let segments: Vec<&str> = method.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(GatewayError::MalformedPath(method.to_string()));
    }
    Ok(segments)
}

/// Overlay query fields on body fields. Body order is kept, a colliding query
/// field replaces the value in place, new query fields are appended.
pub fn merge_parameters(body: Map<String, Value>, query: Vec<(String, String)>) -> Map<String, Value> {
    let mut merged = body;
    for (key, value) in query {
        merged.insert(key, Value::String(value));
    }
    merged
}

/// Positional argument list in merge order.
pub fn positional(params: Map<String, Value>) -> Vec<Value> {
    params.into_iter().map(|(_, v)| v).collect()
}

pub struct Dispatcher {
    sessions: Arc<SessionStore>,
    extensions: ExtensionRegistry,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionStore>, extensions: ExtensionRegistry) -> Self {
        Self {
            sessions,
            extensions,
        }
    }

    pub fn extensions(&self) -> &ExtensionRegistry {
        &self.extensions
    }

    /// Call `method` on `session` (or the only session) with `args`.
    pub async fn dispatch(
        &self,
        session: Option<&str>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let path = parse_method(method)?;
        let (raw, rest) = match path.split_first() {
            Some((&API_PREFIX, rest)) => (true, rest),
            _ => (false, path.as_slice()),
        };
        if rest.is_empty() || rest.len() > MAX_DEPTH {
            return Err(GatewayError::MalformedPath(method.to_string()));
        }

        let session = self.sessions.get(session).await?;
        let client = session.client();

        if let [name] = path.as_slice() {
            if let Some(ext) = self.extensions.get(name) {
                return ext.invoke(client, args).await;
            }
        }

        if raw {
            client.api().call(rest, args).await
        } else {
            client.call(rest, args).await
        }
    }
}
