//! Gateway HTTP + WebSocket server (single port).

use crate::client::ClientFactory;
use crate::config::{self, Config};
use crate::dispatch::{merge_parameters, positional, Dispatcher, ExtensionRegistry};
use crate::error::GatewayError;
use crate::events::{EventBus, EventStreamSupervisor};
use crate::gateway::protocol::{log_frame, update_frame, Envelope};
use crate::gateway::system;
use crate::init;
use crate::logging::{LogBus, LogEvent};
use crate::session::{trim_name, SessionStore};
use crate::settings::SettingsStore;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        rejection::QueryRejection,
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// When auth mode is token and a token is configured, returns it for request validation.
fn require_request_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway (config, sessions, dispatch, streams).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, every request must carry `Authorization: Bearer <token>`.
    pub required_token: Option<String>,
    pub sessions: Arc<SessionStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub streams: Arc<EventStreamSupervisor>,
    pub logs: Arc<LogBus>,
    /// Fired once on shutdown; open streams close when they see it.
    pub shutdown_tx: broadcast::Sender<()>,
}

impl GatewayState {
    pub fn new(
        config: Config,
        sessions_dir: PathBuf,
        factory: Arc<dyn ClientFactory>,
        logs: Arc<LogBus>,
    ) -> Self {
        let required_token = require_request_token(&config);
        let sessions = Arc::new(SessionStore::new(
            config.client.clone(),
            SettingsStore::new(sessions_dir),
            factory,
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            sessions.clone(),
            ExtensionRegistry::with_builtins(),
        ));
        let streams = Arc::new(EventStreamSupervisor::new(
            sessions.clone(),
            Arc::new(EventBus::new()),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config: Arc::new(config),
            required_token,
            sessions,
            dispatcher,
            streams,
            logs,
            shutdown_tx,
        }
    }

    /// Force-detach the update stream, then remove the session and release its client.
    pub async fn remove_session(&self, name: &str) -> crate::error::Result<()> {
        let name = trim_name(name);
        if self.sessions.contains(name).await {
            self.streams.stop(Some(name), true).await;
        }
        self.sessions.remove(name).await
    }

    /// Remove every session. Errors are logged; shutdown continues.
    pub async fn remove_all_sessions(&self) {
        for name in self.sessions.names().await {
            if let Err(e) = self.remove_session(&name).await {
                log::warn!("removing session {} on shutdown: {}", name, e);
            }
        }
    }

    fn authorize(&self, headers: &HeaderMap) -> crate::error::Result<()> {
        let Some(required) = self.required_token.as_deref() else {
            return Ok(());
        };
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim);
        if provided == Some(required) {
            Ok(())
        } else {
            Err(GatewayError::Unauthorized("missing or invalid gateway token".to_string()))
        }
    }
}

/// Start the sessions listed in `sessions.autoload`. Failures are logged.
pub async fn autoload_sessions(state: &GatewayState) {
    for name in &state.config.sessions.autoload {
        match state.sessions.add(name, Value::Null).await {
            Ok(s) => log::info!("autoloaded session {}", s.name()),
            Err(e) => log::warn!("autoloading session {} failed: {}", name, e),
        }
    }
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/api/*path", get(api_http).post(api_http))
        .route("/system/:method", get(system_http).post(system_http))
        .route("/events", get(events_all_ws))
        .route("/events/*session", get(events_session_ws))
        .route("/log", get(log_all_ws))
        .route("/log/:level", get(log_level_ws))
        .with_state(state)
}

/// Blocks until shutdown (e.g. Ctrl+C).
/// `config_path` is the path to the config file (used to resolve the sessions directory).
/// Requires the configuration directory to be initialized (`switchboard init`).
pub async fn run_gateway(
    config: Config,
    config_path: PathBuf,
    factory: Arc<dyn ClientFactory>,
    logs: Arc<LogBus>,
) -> Result<()> {
    init::require_initialized(&config_path, &config)?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or SWITCHBOARD_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let sessions_dir = config::resolve_sessions_dir(&config, &config_path);
    let port = config.gateway.port;
    let state = GatewayState::new(config, sessions_dir, factory, logs);
    autoload_sessions(&state).await;

    let app = router(state.clone());
    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Closes open streams, then removes every session.
async fn shutdown_signal(state: GatewayState) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing streams and removing sessions");

    let _ = state.shutdown_tx.send(());
    state.remove_all_sessions().await;
    log::info!("all sessions removed");
}

fn reply(result: crate::error::Result<Value>) -> (StatusCode, Json<Envelope>) {
    match result {
        Ok(v) => (StatusCode::OK, Json(Envelope::ok(v))),
        Err(e) => {
            let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::BAD_REQUEST);
            (status, Json(Envelope::err(&e)))
        }
    }
}

/// Log a failed call: notices briefly, everything else with its kind and cause chain.
fn report(method: &str, session: Option<&str>, e: &GatewayError) {
    let session = session.unwrap_or("-");
    if e.is_notice() {
        log::info!("{} [{}]: {}", method, session, e);
    } else {
        log::error!(
            "{} [{}] failed: kind={} code={} message={} cause={}",
            method,
            session,
            e.kind(),
            e.code(),
            e,
            e.cause_chain()
        );
    }
}

fn body_fields(body: &Bytes) -> crate::error::Result<Map<String, Value>> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Map::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(m)) => Ok(m),
        Ok(Value::Null) => Ok(Map::new()),
        Ok(other) => Err(GatewayError::InvalidParams(format!(
            "request body must be a JSON object, got {}",
            other
        ))),
        Err(e) => Err(GatewayError::InvalidParams(format!("invalid JSON body: {}", e))),
    }
}

fn request_params(
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    body: &Bytes,
) -> crate::error::Result<Map<String, Value>> {
    let Query(query) = query.map_err(|e| GatewayError::InvalidParams(e.body_text()))?;
    Ok(merge_parameters(body_fields(body)?, query))
}

/// Split `/api/{session...}/{method}`: the last segment is the method, the rest the session.
fn split_api_path(path: &str) -> (Option<&str>, &str) {
    let path = path.trim_matches('/');
    match path.rsplit_once('/') {
        Some((session, method)) => (Some(session), method),
        None => (None, path),
    }
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "runtime": "running",
        "port": state.config.gateway.port,
        "sessions": state.sessions.names().await.len(),
    }))
}

/// GET|POST /api/{session...}/{method}: dispatch to a session's client.
async fn api_http(
    State(state): State<GatewayState>,
    Path(path): Path<String>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    body: Bytes,
) -> (StatusCode, Json<Envelope>) {
    let (session, method) = split_api_path(&path);
    let result = async {
        state.authorize(&headers)?;
        let params = request_params(query, &body)?;
        state
            .dispatcher
            .dispatch(session, method, positional(params))
            .await
    }
    .await;
    if let Err(ref e) = result {
        report(method, session, e);
    }
    reply(result)
}

/// GET|POST /system/{method}: session lifecycle and listing.
async fn system_http(
    State(state): State<GatewayState>,
    Path(method): Path<String>,
    headers: HeaderMap,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    body: Bytes,
) -> (StatusCode, Json<Envelope>) {
    let result = async {
        state.authorize(&headers)?;
        let params = request_params(query, &body)?;
        system::call(&state, &method, &params).await
    }
    .await;
    if let Err(ref e) = result {
        report(&method, None, e);
    }
    reply(result)
}

fn reject(e: GatewayError) -> Response {
    report("stream", None, &e);
    reply(Err(e)).into_response()
}

/// GET /events: stream updates from every session registered at connect time.
async fn events_all_ws(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = state.authorize(&headers) {
        return reject(e);
    }
    ws.on_upgrade(move |socket| handle_events(socket, state, None))
}

/// GET /events/{session}: stream updates from one session.
async fn events_session_ws(
    State(state): State<GatewayState>,
    Path(session): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = state.authorize(&headers) {
        return reject(e);
    }
    let session = session.trim_matches('/').to_string();
    if !state.sessions.contains(&session).await {
        return reject(GatewayError::not_found(format!("session {} not found", session)));
    }
    ws.on_upgrade(move |socket| handle_events(socket, state, Some(session)))
}

/// GET /log: stream every enabled log record.
async fn log_all_ws(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = state.authorize(&headers) {
        return reject(e);
    }
    ws.on_upgrade(move |socket| handle_log(socket, state, log::Level::Trace))
}

/// GET /log/{level}: stream log records at or above `level`.
async fn log_level_ws(
    State(state): State<GatewayState>,
    Path(level): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = state.authorize(&headers) {
        return reject(e);
    }
    let Ok(level) = log::Level::from_str(level.trim()) else {
        return reject(GatewayError::InvalidParams(format!("unknown log level {}", level)));
    };
    ws.on_upgrade(move |socket| handle_log(socket, state, level))
}

/// Forward frames from `rx` to the socket until the client goes away or the gateway shuts down.
async fn pump(socket: &mut WebSocket, rx: &mut mpsc::UnboundedReceiver<String>, state: &GatewayState) {
    let mut shutdown_rx = state.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            frame = rx.recv() => {
                let Some(text) = frame else { break };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Subscribe `id` to the update bus. Frames for `session` (or every session when
/// None) arrive on the returned receiver.
fn subscribe_updates(
    bus: &EventBus<Value>,
    id: &str,
    session: Option<&str>,
) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let filter = session.map(|s| trim_name(s).to_string());
    bus.subscribe(id, move |update: &Value, tag: Option<&str>| {
        if let Some(ref want) = filter {
            if tag != Some(want.as_str()) {
                return;
            }
        }
        match serde_json::to_string(&update_frame(tag, update)) {
            Ok(text) => {
                let _ = tx.send(text);
            }
            Err(e) => log::debug!("encoding update frame: {}", e),
        }
    });
    rx
}

/// Subscribe `id` to the log bus. Records at or above `min_level` arrive on the
/// returned receiver.
fn subscribe_log(logs: &LogBus, id: &str, min_level: log::Level) -> mpsc::UnboundedReceiver<String> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    logs.subscribe(id, move |event: &LogEvent, _session: Option<&str>| {
        if event.level > min_level {
            return;
        }
        if let Ok(text) = serde_json::to_string(&log_frame(event)) {
            let _ = tx.send(text);
        }
    });
    rx
}

async fn handle_events(mut socket: WebSocket, state: GatewayState, session: Option<String>) {
    let id = uuid::Uuid::new_v4().to_string();
    let mut rx = subscribe_updates(state.streams.updates(), &id, session.as_deref());
    let tickets = state.streams.start(session.as_deref()).await;
    log::debug!("events subscriber {} connected ({} session(s))", id, tickets.len());

    pump(&mut socket, &mut rx, &state).await;

    state.streams.updates().unsubscribe(&id);
    state.streams.release(tickets).await;
    log::debug!("events subscriber {} disconnected", id);
}

async fn handle_log(mut socket: WebSocket, state: GatewayState, min_level: log::Level) {
    let id = uuid::Uuid::new_v4().to_string();
    let mut rx = subscribe_log(&state.logs, &id, min_level);

    pump(&mut socket, &mut rx, &state).await;

    state.logs.unsubscribe(&id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockFactory;

    fn state() -> (GatewayState, Arc<MockFactory>) {
        let dir = std::env::temp_dir().join(format!("switchboard-server-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let factory = Arc::new(MockFactory::default());
        let state = GatewayState::new(Config::default(), dir, factory.clone(), Arc::new(LogBus::new()));
        (state, factory)
    }

    fn event(level: log::Level, message: &str) -> LogEvent {
        LogEvent {
            level,
            message: message.to_string(),
            context: json!({}),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[test]
    fn log_stream_honours_minimum_level() {
        let logs = LogBus::new();
        let mut warn_only = subscribe_log(&logs, "w", log::Level::Warn);
        let mut everything = subscribe_log(&logs, "t", log::Level::Trace);
        for (level, message) in [
            (log::Level::Error, "e"),
            (log::Level::Warn, "w"),
            (log::Level::Info, "i"),
            (log::Level::Debug, "d"),
        ] {
            logs.notify(&event(level, message), None);
        }

        let levels: Vec<Value> = drain(&mut warn_only)
            .into_iter()
            .map(|f| f["result"]["level"].clone())
            .collect();
        assert_eq!(levels, vec![json!("error"), json!("warn")]);
        assert_eq!(drain(&mut everything).len(), 4);

        logs.unsubscribe("w");
        logs.notify(&event(log::Level::Error, "late"), None);
        assert!(drain(&mut warn_only).is_empty());
    }

    #[test]
    fn update_stream_filters_by_session() {
        let bus = EventBus::new();
        let mut work = subscribe_updates(&bus, "a", Some("/work/"));
        let mut all = subscribe_updates(&bus, "b", None);
        bus.notify(&json!({ "n": 1 }), Some("work"));
        bus.notify(&json!({ "n": 2 }), Some("home"));

        let frames = drain(&mut work);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["result"]["session"], "work");
        assert_eq!(drain(&mut all).len(), 2);
    }

    #[tokio::test]
    async fn removing_a_wrapped_name_clears_stream_interest() {
        let (state, factory) = state();
        state.sessions.add("work", Value::Null).await.unwrap();
        state.streams.start(Some("work")).await;
        assert_eq!(state.streams.interest("work"), 1);

        state.remove_session("/work/").await.unwrap();
        assert_eq!(state.streams.interest("work"), 0);
        assert!(!state.sessions.contains("work").await);

        state.sessions.add("work", Value::Null).await.unwrap();
        let tickets = state.streams.start(Some("work")).await;
        assert_eq!(tickets.len(), 1);
        assert_eq!(state.streams.interest("work"), 1);
        assert!(factory.client("work").is_attached());
    }

    #[test]
    fn api_path_split() {
        assert_eq!(split_api_path("getSelf"), (None, "getSelf"));
        assert_eq!(
            split_api_path("work/messages.getHistory"),
            (Some("work"), "messages.getHistory")
        );
        assert_eq!(split_api_path("team/alice/getSelf/"), (Some("team/alice"), "getSelf"));
    }

    #[test]
    fn body_must_be_an_object() {
        assert!(body_fields(&Bytes::from_static(b"")).unwrap().is_empty());
        assert_eq!(body_fields(&Bytes::from_static(br#"{"a":1}"#)).unwrap()["a"], 1);
        assert!(matches!(
            body_fields(&Bytes::from_static(b"[1]")),
            Err(GatewayError::InvalidParams(_))
        ));
        assert!(matches!(
            body_fields(&Bytes::from_static(b"{oops")),
            Err(GatewayError::InvalidParams(_))
        ));
    }

    #[test]
    fn error_replies_use_error_status() {
        let (status, Json(env)) = reply(Err(GatewayError::upstream(420, "FLOOD_WAIT")));
        assert_eq!(status.as_u16(), 420);
        assert!(!env.success);
        let (status, _) = reply(Err(GatewayError::Fatal("boom".to_string())));
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
