//! Higher-level operations built on top of raw client calls.

use super::html::entities_to_html;
use crate::client::MessagingClient;
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// A named operation invoked instead of a raw single-segment call.
#[async_trait]
pub trait Extension: Send + Sync {
    fn name(&self) -> &'static str;

    async fn invoke(&self, client: &dyn MessagingClient, args: Vec<Value>) -> Result<Value>;
}

#[derive(Default)]
pub struct ExtensionRegistry {
    inner: HashMap<&'static str, Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every extension shipped with the gateway.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register(Arc::new(GetHistoryHtml));
        r.register(Arc::new(GetMessages));
        r
    }

    /// Register an extension, replacing one with the same name.
    pub fn register(&mut self, ext: Arc<dyn Extension>) {
        self.inner.insert(ext.name(), ext);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.inner.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.inner.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn first_object(args: &[Value], op: &str) -> Result<serde_json::Map<String, Value>> {
    match args.first() {
        Some(Value::Object(m)) => Ok(m.clone()),
        None => Ok(serde_json::Map::new()),
        Some(other) => Err(GatewayError::InvalidParams(format!(
            "{} expects an object, got {}",
            op, other
        ))),
    }
}

/// `messages.getHistory` with each message's entities rendered into its text as HTML.
struct GetHistoryHtml;

#[async_trait]
impl Extension for GetHistoryHtml {
    fn name(&self) -> &'static str {
        "getHistoryHtml"
    }

    async fn invoke(&self, client: &dyn MessagingClient, args: Vec<Value>) -> Result<Value> {
        let request = first_object(&args, self.name())?;
        let mut history = client
            .call(&["messages", "getHistory"], vec![Value::Object(request)])
            .await?;
        if let Some(messages) = history.get_mut("messages").and_then(Value::as_array_mut) {
            for message in messages {
                render_message(message);
            }
        }
        Ok(history)
    }
}

fn render_message(message: &mut Value) {
    let Some(obj) = message.as_object_mut() else {
        return;
    };
    let Some(text) = obj.get("message").and_then(Value::as_str) else {
        return;
    };
    let entities = obj
        .get("entities")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let html = entities_to_html(text, entities);
    obj.insert("message".to_string(), Value::String(html));
    obj.remove("entities");
}

/// Message lookup that picks the channel or the private-chat method from the peer.
struct GetMessages;

/// Marked channel ids are `-100` followed by the channel id.
const CHANNEL_ID_OFFSET: i64 = -1_000_000_000_000;

fn is_channel_peer(peer: &Value) -> bool {
    match peer {
        Value::Number(n) => n.as_i64().map_or(false, |id| id <= CHANNEL_ID_OFFSET),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_or(false, |id| id <= CHANNEL_ID_OFFSET),
        Value::Object(m) => m
            .get("_")
            .and_then(Value::as_str)
            .map_or(false, |t| t.starts_with("inputChannel") || t.starts_with("inputPeerChannel")),
        _ => false,
    }
}

#[async_trait]
impl Extension for GetMessages {
    fn name(&self) -> &'static str {
        "getMessages"
    }

    async fn invoke(&self, client: &dyn MessagingClient, args: Vec<Value>) -> Result<Value> {
        let request = first_object(&args, self.name())?;
        let ids = request
            .get("id")
            .cloned()
            .ok_or_else(|| GatewayError::InvalidParams("getMessages requires id".to_string()))?;
        match request.get("peer").or_else(|| request.get("channel")) {
            Some(peer) if is_channel_peer(peer) => {
                client
                    .call(
                        &["channels", "getMessages"],
                        vec![json!({ "channel": peer, "id": ids })],
                    )
                    .await
            }
            _ => {
                client
                    .call(&["messages", "getMessages"], vec![json!({ "id": ids })])
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockClient;

    #[test]
    fn channel_peers_are_recognized() {
        assert!(is_channel_peer(&json!(-1001234567890_i64)));
        assert!(is_channel_peer(&json!("-1001234567890")));
        assert!(is_channel_peer(&json!({ "_": "inputPeerChannel", "channel_id": 1 })));
        assert!(!is_channel_peer(&json!(12345)));
        assert!(!is_channel_peer(&json!("@someone")));
    }

    #[tokio::test]
    async fn get_messages_routes_private_peers() {
        let client = MockClient::new(Value::Null);
        let out = GetMessages
            .invoke(&client, vec![json!({ "peer": 42, "id": [1, 2] })])
            .await
            .unwrap();
        assert_eq!(out["path"], "messages.getMessages");
        assert_eq!(out["args"], json!([{ "id": [1, 2] }]));
    }

    #[tokio::test]
    async fn get_messages_requires_ids() {
        let client = MockClient::new(Value::Null);
        let err = GetMessages
            .invoke(&client, vec![json!({ "peer": 42 })])
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidParams(_)));
    }

    #[test]
    fn render_message_replaces_text_and_drops_entities() {
        let mut m = json!({
            "message": "hi there",
            "entities": [{ "_": "messageEntityBold", "offset": 3, "length": 5 }]
        });
        render_message(&mut m);
        assert_eq!(m, json!({ "message": "hi <b>there</b>" }));
    }

    #[test]
    fn builtins_are_registered() {
        assert_eq!(
            ExtensionRegistry::with_builtins().names(),
            vec!["getHistoryHtml", "getMessages"]
        );
    }
}
