//! Watchdog: exercises the gateway's own HTTP surface on a timer and kills the
//! gateway process when it stops answering.
//!
//! Runs on its own OS thread with a single-threaded runtime (or as a separate
//! `switchboard watchdog` process), so a wedged gateway runtime cannot stall it.

use crate::config::{self, Config};
use crate::error::{GatewayError, Result};
use crate::gateway::Envelope;
use futures_util::future::join_all;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, Signal, System};

const LOGGED_IN: &str = "LOGGED_IN";

/// The process the watchdog guards.
pub trait MonitoredProcess: Send + Sync {
    fn is_alive(&self) -> bool;

    /// Immediate, non-graceful termination.
    fn kill(&self) -> std::io::Result<()>;

    fn describe(&self) -> String;
}

/// A process addressed by pid, inspected and signalled through `sysinfo`.
pub struct PidProcess {
    pid: Pid,
    system: Mutex<System>,
}

impl PidProcess {
    pub fn new(pid: u32) -> Self {
        Self {
            pid: Pid::from_u32(pid),
            system: Mutex::new(System::new()),
        }
    }

    pub fn current() -> Self {
        Self::new(std::process::id())
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_u32()
    }

    fn system(&self) -> MutexGuard<'_, System> {
        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);
        system
    }
}

impl MonitoredProcess for PidProcess {
    fn is_alive(&self) -> bool {
        self.system()
            .process(self.pid)
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    fn kill(&self) -> std::io::Result<()> {
        let system = self.system();
        let Some(process) = system.process(self.pid) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("pid {} not found", self.pid),
            ));
        };
        match process.kill_with(Signal::Kill) {
            Some(true) => Ok(()),
            Some(false) => Err(std::io::Error::other(format!("sending SIGKILL to pid {} failed", self.pid))),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "SIGKILL is not supported on this platform",
            )),
        }
    }

    fn describe(&self) -> String {
        format!("pid {}", self.pid)
    }
}

/// Resident memory of this process in bytes, when the platform reports it.
pub fn current_memory() -> Option<u64> {
    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map(sysinfo::Process::memory)
}

/// Result of one watchdog tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Healthy,
    /// The monitored process was already gone.
    ProcessGone,
    /// The check failed and the process was killed.
    Killed,
}

pub struct HealthSupervisor {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    probe_method: String,
    timeout: Duration,
    interval: Duration,
    process: Arc<dyn MonitoredProcess>,
}

impl HealthSupervisor {
    pub fn new(
        base_url: impl Into<String>,
        process: Arc<dyn MonitoredProcess>,
        interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            probe_method: "getSelf".to_string(),
            timeout,
            interval,
            process,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_probe_method(mut self, method: impl Into<String>) -> Self {
        self.probe_method = method.into();
        self
    }

    /// Supervisor for the gateway described by `config`.
    pub fn from_config(config: &Config, process: Arc<dyn MonitoredProcess>) -> Self {
        let token = if config.gateway.auth.mode == config::GatewayAuthMode::Token {
            config::resolve_gateway_token(config)
        } else {
            None
        };
        Self::new(
            config::local_base_url(config),
            process,
            Duration::from_secs(config.health.interval_secs.max(1)),
            Duration::from_secs(config.health.timeout_secs.max(1)),
        )
        .with_token(token)
        .with_probe_method(config.health.probe_method.clone())
    }

    async fn get_envelope(&self, url: &str) -> Result<Envelope> {
        let mut req = self.http.get(url).timeout(self.timeout);
        if let Some(ref t) = self.token {
            req = req.bearer_auth(t);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| GatewayError::Fatal(format!("GET {}: {}", url, e)))?;
        let status = resp.status();
        if status.is_server_error() {
            return Err(GatewayError::Fatal(format!("GET {}: {}", url, status)));
        }
        let envelope: Envelope = resp
            .json()
            .await
            .map_err(|e| GatewayError::Fatal(format!("GET {}: unreadable reply: {}", url, e)))?;
        if !envelope.success {
            let message = envelope
                .errors
                .first()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            log::warn!(target: "health", "GET {} answered {}: {}", url, status, message);
        }
        Ok(envelope)
    }

    /// Names of the listed sessions that report a logged-in state.
    fn logged_in(listing: &Envelope) -> Vec<String> {
        listing
            .response
            .as_ref()
            .and_then(|r| r.get("sessions"))
            .and_then(Value::as_object)
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|(_, s)| s.get("status").and_then(Value::as_str) == Some(LOGGED_IN))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One pass over the gateway: list sessions, then probe every logged-in one concurrently.
    pub async fn check(&self) -> Result<()> {
        let listing = self
            .get_envelope(&format!("{}/system/getSessionList", self.base_url))
            .await?;
        if !listing.success {
            return Err(GatewayError::Fatal("session listing failed".to_string()));
        }
        let names = Self::logged_in(&listing);
        let probes = names.iter().map(|name| {
            let url = format!("{}/api/{}/{}", self.base_url, name, self.probe_method);
            async move { self.get_envelope(&url).await }
        });
        for result in join_all(probes).await {
            result?;
        }
        log::debug!(target: "health", "{} logged-in session(s) answered", names.len());
        Ok(())
    }

    pub async fn tick(&self) -> TickOutcome {
        if !self.process.is_alive() {
            log::error!(target: "health", "critical: {} is not running", self.process.describe());
            return TickOutcome::ProcessGone;
        }
        let Err(e) = self.check().await else {
            log::debug!(target: "health", "gateway healthy");
            return TickOutcome::Healthy;
        };
        log::error!(target: "health", "critical: health check failed: {}", e);
        if !self.process.is_alive() {
            return TickOutcome::ProcessGone;
        }
        log::error!(target: "health", "critical: killing {}", self.process.describe());
        if let Err(e) = self.process.kill() {
            log::error!(target: "health", "critical: kill failed: {}", e);
        }
        TickOutcome::Killed
    }

    /// Tick every interval until the process dies or is killed.
    pub async fn run(&self) -> TickOutcome {
        log::info!(
            target: "health",
            "watching {} via {} every {:?}",
            self.process.describe(),
            self.base_url,
            self.interval
        );
        loop {
            tokio::time::sleep(self.interval).await;
            match self.tick().await {
                TickOutcome::Healthy => continue,
                outcome => return outcome,
            }
        }
    }

    /// Run on a dedicated OS thread with its own single-threaded runtime.
    pub fn spawn_watchdog(self) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("health".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!(target: "health", "critical: watchdog runtime failed to start: {}", e);
                        return;
                    }
                };
                let outcome = rt.block_on(self.run());
                log::info!(target: "health", "watchdog stopped: {:?}", outcome);
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::get, Json, Router};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FakeProcess {
        alive: AtomicBool,
        kills: AtomicUsize,
    }

    impl FakeProcess {
        fn new(alive: bool) -> Arc<Self> {
            Arc::new(Self {
                alive: AtomicBool::new(alive),
                kills: AtomicUsize::new(0),
            })
        }
    }

    impl MonitoredProcess for FakeProcess {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn kill(&self) -> std::io::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn describe(&self) -> String {
            "fake".to_string()
        }
    }

    /// Fake gateway: one logged-in session `work` whose probe answers after `delay`
    /// with `probe`.
    async fn fake_gateway(delay: Duration, probe: Value) -> String {
        let app = Router::new()
            .route(
                "/system/getSessionList",
                get(|| async {
                    Json(json!({
                        "success": true,
                        "errors": [],
                        "response": {
                            "sessions": {
                                "work": { "session": "work", "file": "work.settings.json", "status": "LOGGED_IN" },
                                "idle": { "session": "idle", "file": "idle.settings.json", "status": "WAITING_CODE" }
                            },
                            "memory": "1 kB"
                        }
                    }))
                }),
            )
            .route(
                "/api/work/getSelf",
                get(move || {
                    let probe = probe.clone();
                    async move {
                        tokio::time::sleep(delay).await;
                        Json(probe)
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{}", addr)
    }

    fn supervisor(base: &str, process: Arc<FakeProcess>) -> HealthSupervisor {
        HealthSupervisor::new(
            base,
            process,
            Duration::from_millis(10),
            Duration::from_millis(100),
        )
    }

    fn ok_probe() -> Value {
        json!({ "success": true, "errors": [], "response": { "id": 1 } })
    }

    #[tokio::test]
    async fn healthy_tick_does_not_kill() {
        let base = fake_gateway(Duration::ZERO, ok_probe()).await;
        let process = FakeProcess::new(true);
        let outcome = supervisor(&base, process.clone()).tick().await;
        assert_eq!(outcome, TickOutcome::Healthy);
        assert_eq!(process.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn probe_timeout_kills_exactly_once() {
        let base = fake_gateway(Duration::from_millis(500), ok_probe()).await;
        let process = FakeProcess::new(true);
        let sup = supervisor(&base, process.clone());
        assert_eq!(sup.tick().await, TickOutcome::Killed);
        assert_eq!(sup.tick().await, TickOutcome::ProcessGone);
        assert_eq!(process.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_error_probe_is_not_fatal() {
        let probe = json!({ "success": false, "errors": [{ "code": 420, "message": "FLOOD_WAIT" }], "response": null });
        let base = fake_gateway(Duration::ZERO, probe).await;
        let process = FakeProcess::new(true);
        assert_eq!(supervisor(&base, process.clone()).tick().await, TickOutcome::Healthy);
        assert_eq!(process.kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_gateway_is_killed() {
        let port = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let process = FakeProcess::new(true);
        let sup = supervisor(&format!("http://127.0.0.1:{}", port), process.clone());
        assert_eq!(sup.tick().await, TickOutcome::Killed);
        assert_eq!(process.kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_process_is_reported_without_kill() {
        let process = FakeProcess::new(false);
        let sup = supervisor("http://127.0.0.1:9", process.clone());
        assert_eq!(sup.run().await, TickOutcome::ProcessGone);
        assert_eq!(process.kills.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn own_process_is_alive() {
        let me = PidProcess::current();
        assert_eq!(me.pid(), std::process::id());
        assert!(me.is_alive());
        assert!(current_memory().is_some_and(|bytes| bytes > 0));
    }

    #[test]
    fn unknown_pid_is_gone_and_cannot_be_killed() {
        let ghost = PidProcess::new(u32::MAX - 1);
        assert!(!ghost.is_alive());
        let err = ghost.kill().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
