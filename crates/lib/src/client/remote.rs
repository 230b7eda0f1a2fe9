//! Remote client: forwards calls to an out-of-process messaging client over a
//! small JSON bridge protocol and long-polls it for updates.
//!
//! Bridge replies are `{ "ok": true, "result": ... }` or
//! `{ "ok": false, "error": { "code", "message" } }`.

use super::{AuthorizationState, CallSurface, ClientFactory, MessagingClient, UpdateHandler};
use crate::error::{GatewayError, Result};
use crate::settings::ClientSettings;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// Code reported when the bridge itself cannot be reached.
const BRIDGE_UNAVAILABLE: i64 = 502;

/// Slack on top of the poll timeout the bridge is asked to honour.
const POLL_GRACE_SECS: u64 = 10;

#[derive(Debug, Deserialize)]
struct BridgeReply<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    error: Option<BridgeError>,
}

#[derive(Debug, Deserialize)]
struct BridgeError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolledUpdate {
    update_id: i64,
    update: Value,
}

/// HTTP side of one session, shared by the client, its raw surface and the poll task.
struct Transport {
    session: String,
    settings: ClientSettings,
    http: reqwest::Client,
}

impl Transport {
    /// `<upstream>/sessions/<session>/<op>`, with the session name as one encoded segment.
    fn url(&self, op: &str) -> Result<reqwest::Url> {
        let base = &self.settings.upstream.url;
        let mut url = reqwest::Url::parse(base)
            .map_err(|e| GatewayError::Settings(format!("upstream.url {}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::Settings(format!("upstream.url {} cannot be a base", base)))?
            .pop_if_empty()
            .extend(["sessions", self.session.as_str(), op]);
        Ok(url)
    }

    /// Client-side deadline for one long poll.
    fn poll_deadline(&self) -> Duration {
        Duration::from_secs(self.settings.updates.poll_timeout_secs.saturating_add(POLL_GRACE_SECS))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.settings.upstream.token {
            Some(ref t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn read_reply<T: serde::de::DeserializeOwned>(res: reqwest::Response) -> Result<T> {
        let status = res.status();
        let reply: BridgeReply<T> = res.json().await.map_err(|e| {
            GatewayError::upstream(BRIDGE_UNAVAILABLE, format!("bridge reply ({}): {}", status, e))
        })?;
        if !reply.ok {
            let err = reply.error.unwrap_or(BridgeError {
                code: None,
                message: "bridge returned ok: false".to_string(),
            });
            return Err(GatewayError::upstream(
                err.code.unwrap_or(status.as_u16() as i64),
                err.message,
            ));
        }
        reply
            .result
            .ok_or_else(|| GatewayError::upstream(BRIDGE_UNAVAILABLE, "bridge reply without result"))
    }

    async fn call(&self, path: &[&str], args: Vec<Value>, raw: bool) -> Result<Value> {
        let body = json!({
            "method": path.join("."),
            "params": args,
            "raw": raw,
        });
        let req = self
            .http
            .post(self.url("call")?)
            .timeout(Duration::from_secs(self.settings.upstream.timeout_secs))
            .json(&body);
        let res = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(BRIDGE_UNAVAILABLE, e.to_string()))?;
        Self::read_reply(res).await
    }

    async fn authorization(&self) -> Result<AuthorizationState> {
        let req = self
            .http
            .get(self.url("authorization")?)
            .timeout(Duration::from_secs(self.settings.upstream.timeout_secs));
        let res = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(BRIDGE_UNAVAILABLE, e.to_string()))?;
        Self::read_reply(res).await
    }

    /// One long poll. Returns (updates, next_offset).
    async fn poll(&self, offset: Option<i64>) -> Result<(Vec<PolledUpdate>, Option<i64>)> {
        let updates = &self.settings.updates;
        let mut query = vec![
            ("limit", updates.batch_limit.to_string()),
            ("timeout", updates.poll_timeout_secs.to_string()),
        ];
        if let Some(off) = offset {
            query.push(("offset", off.to_string()));
        }
        let req = self
            .http
            .get(self.url("updates")?)
            .query(&query)
            .timeout(self.poll_deadline());
        let res = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| GatewayError::upstream(BRIDGE_UNAVAILABLE, e.to_string()))?;
        let batch: Vec<PolledUpdate> = Self::read_reply(res).await?;
        let next = batch.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((batch, next))
    }
}

/// Low-level surface: the same bridge call with `raw: true`.
struct RawSurface {
    transport: Arc<Transport>,
}

#[async_trait]
impl CallSurface for RawSurface {
    async fn call(&self, path: &[&str], args: Vec<Value>) -> Result<Value> {
        self.transport.call(path, args, true).await
    }
}

struct Poller {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Client whose protocol implementation runs behind an HTTP bridge.
pub struct RemoteClient {
    transport: Arc<Transport>,
    raw: RawSurface,
    poller: Mutex<Option<Poller>>,
}

impl RemoteClient {
    pub fn new(session: impl Into<String>, settings: ClientSettings) -> Self {
        let transport = Arc::new(Transport {
            session: session.into(),
            settings,
            http: reqwest::Client::new(),
        });
        Self {
            raw: RawSurface {
                transport: transport.clone(),
            },
            transport,
            poller: Mutex::new(None),
        }
    }

    async fn stop_poller(&self) {
        if let Some(poller) = self.poller.lock().await.take() {
            poller.running.store(false, Ordering::SeqCst);
            poller.handle.abort();
            log::debug!("session {}: update poll loop stopped", self.transport.session);
        }
    }
}

async fn run_poll_loop(transport: Arc<Transport>, running: Arc<AtomicBool>, handler: UpdateHandler) {
    let mut offset = None;
    let retry = Duration::from_millis(transport.settings.updates.retry_delay_ms);
    while running.load(Ordering::SeqCst) {
        match transport.poll(offset).await {
            Ok((batch, next)) => {
                if next.is_some() {
                    offset = next;
                }
                for item in batch {
                    if !running.load(Ordering::SeqCst) {
                        return;
                    }
                    handler(item.update);
                }
            }
            Err(e) => {
                log::warn!("session {}: update poll failed: {}", transport.session, e);
                tokio::time::sleep(retry).await;
            }
        }
    }
}

#[async_trait]
impl MessagingClient for RemoteClient {
    async fn call(&self, path: &[&str], args: Vec<Value>) -> Result<Value> {
        self.transport.call(path, args, false).await
    }

    fn api(&self) -> &dyn CallSurface {
        &self.raw
    }

    async fn authorization_state(&self) -> Result<AuthorizationState> {
        self.transport.authorization().await
    }

    async fn set_update_handler(&self, handler: UpdateHandler) -> Result<()> {
        // Fail the attach up front when the bridge is unreachable.
        self.transport.authorization().await?;
        self.stop_poller().await;
        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(run_poll_loop(
            self.transport.clone(),
            running.clone(),
            handler,
        ));
        *self.poller.lock().await = Some(Poller { running, handle });
        log::debug!("session {}: update poll loop started", self.transport.session);
        Ok(())
    }

    async fn unset_update_handler(&self) {
        self.stop_poller().await;
    }

    async fn close(&self) {
        self.stop_poller().await;
    }
}

/// Factory used by the binary: validates the merged settings and builds a [`RemoteClient`].
#[derive(Default)]
pub struct RemoteClientFactory;

#[async_trait]
impl ClientFactory for RemoteClientFactory {
    async fn create(&self, name: &str, settings: &Value) -> Result<Arc<dyn MessagingClient>> {
        let settings = ClientSettings::from_document(settings)?;
        log::debug!("session {}: bridge at {}", name, settings.upstream.url);
        Ok(Arc::new(RemoteClient::new(name, settings)))
    }
}
