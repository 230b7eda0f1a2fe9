//! In-memory client used by unit tests.

use super::{AuthorizationState, CallSurface, ClientFactory, MessagingClient, UpdateHandler};
use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Echoes calls back as `{ "surface", "path", "args" }`. The path `fail` returns
/// an upstream error carrying the code in `args[0]`.
pub(crate) struct MockClient {
    pub settings: Value,
    pub attaches: AtomicUsize,
    pub detaches: AtomicUsize,
    pub closed: AtomicBool,
    pub fail_attach: AtomicBool,
    pub attach_delay: Mutex<Option<Duration>>,
    pub state: Mutex<AuthorizationState>,
    handler: Mutex<Option<UpdateHandler>>,
    raw: MockRaw,
}

struct MockRaw;

fn echo(surface: &str, path: &[&str], args: Vec<Value>) -> Result<Value> {
    if path == ["fail"] {
        let code = args.first().and_then(|v| v.as_i64()).unwrap_or(500);
        return Err(GatewayError::upstream(code, "MOCK_FAILURE"));
    }
    Ok(json!({ "surface": surface, "path": path.join("."), "args": args }))
}

#[async_trait]
impl CallSurface for MockRaw {
    async fn call(&self, path: &[&str], args: Vec<Value>) -> Result<Value> {
        echo("raw", path, args)
    }
}

impl MockClient {
    pub fn new(settings: Value) -> Self {
        Self {
            settings,
            attaches: AtomicUsize::new(0),
            detaches: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
            attach_delay: Mutex::new(None),
            state: Mutex::new(AuthorizationState::LoggedIn),
            handler: Mutex::new(None),
            raw: MockRaw,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.handler.lock().unwrap().is_some()
    }

    /// Push an update through the attached handler, if any.
    pub fn emit(&self, update: Value) {
        let handler = self.handler.lock().unwrap().clone();
        if let Some(h) = handler {
            h(update);
        }
    }
}

#[async_trait]
impl MessagingClient for MockClient {
    async fn call(&self, path: &[&str], args: Vec<Value>) -> Result<Value> {
        echo("client", path, args)
    }

    fn api(&self) -> &dyn CallSurface {
        &self.raw
    }

    async fn authorization_state(&self) -> Result<AuthorizationState> {
        Ok(*self.state.lock().unwrap())
    }

    async fn set_update_handler(&self, handler: UpdateHandler) -> Result<()> {
        let delay = *self.attach_delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(GatewayError::upstream(503, "attach refused"));
        }
        self.attaches.fetch_add(1, Ordering::SeqCst);
        *self.handler.lock().unwrap() = Some(handler);
        Ok(())
    }

    async fn unset_update_handler(&self) {
        if self.handler.lock().unwrap().take().is_some() {
            self.detaches.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Records every client it builds so tests can reach them by session name.
#[derive(Default)]
pub(crate) struct MockFactory {
    pub delay: Option<Duration>,
    pub created: AtomicUsize,
    clients: Mutex<HashMap<String, Arc<MockClient>>>,
}

impl MockFactory {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn client(&self, name: &str) -> Arc<MockClient> {
        self.clients.lock().unwrap().get(name).cloned().expect("mock client")
    }
}

#[async_trait]
impl ClientFactory for MockFactory {
    async fn create(&self, name: &str, settings: &Value) -> Result<Arc<dyn MessagingClient>> {
        if let Some(d) = self.delay {
            tokio::time::sleep(d).await;
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let client = Arc::new(MockClient::new(settings.clone()));
        self.clients
            .lock()
            .unwrap()
            .insert(name.to_string(), client.clone());
        Ok(client as Arc<dyn MessagingClient>)
    }
}
