//! Session registry: named client instances, created and torn down on request.
//!
//! Sessions are keyed by a path-safe name. Creation is serialized per name so two
//! concurrent `add`s for the same name never both build a client; adds for
//! different names run independently.

use crate::client::{AuthorizationState, ClientFactory, MessagingClient};
use crate::error::{GatewayError, Result};
use crate::settings::{deep_merge, is_empty_document, SettingsStore};
use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// A registered session. The client handle is only reachable by reference.
pub struct Session {
    name: String,
    generation: u64,
    file: PathBuf,
    settings: Value,
    client: Arc<dyn MessagingClient>,
}

impl Session {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Distinguishes this instance from earlier sessions registered under the same name.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Settings file backing this session's override document.
    pub fn file(&self) -> &Path {
        &self.file
    }

    /// Effective settings: base config with the persisted override merged on top.
    pub fn settings(&self) -> &Value {
        &self.settings
    }

    pub fn client(&self) -> &dyn MessagingClient {
        self.client.as_ref()
    }
}

/// One row of the session listing.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session: String,
    pub file: String,
    /// None when the client could not report its state.
    pub status: Option<AuthorizationState>,
}

/// Owns every session and the client inside it.
pub struct SessionStore {
    sessions: RwLock<BTreeMap<String, Arc<Session>>>,
    creating: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
    generations: AtomicU64,
    factory: Arc<dyn ClientFactory>,
    overrides: SettingsStore,
    base: Value,
}

impl SessionStore {
    pub fn new(base: Value, overrides: SettingsStore, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            creating: std::sync::Mutex::new(HashMap::new()),
            generations: AtomicU64::new(1),
            factory,
            overrides,
            base,
        }
    }

    pub fn overrides(&self) -> &SettingsStore {
        &self.overrides
    }

    fn creation_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut g = self.creating.lock().unwrap_or_else(|e| e.into_inner());
        g.entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the per-name lock once nobody else is waiting on it.
    fn release_creation_lock(&self, name: &str, lock: Arc<Mutex<()>>) {
        let mut g = self.creating.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) <= 2 {
            g.remove(name);
        }
    }

    /// Register a new session. Persists `overrides` when non-empty, then builds
    /// the client from the merged settings.
    pub async fn add(&self, name: &str, overrides: Value) -> Result<Arc<Session>> {
        let name = self.overrides.normalize_name(name)?;
        if !(overrides.is_null() || overrides.is_object()) {
            return Err(GatewayError::InvalidParams(
                "session settings must be an object".to_string(),
            ));
        }
        let lock = self.creation_lock(&name);
        let result = {
            let _guard = lock.lock().await;
            self.create_locked(&name, overrides).await
        };
        self.release_creation_lock(&name, lock);
        result
    }

    async fn create_locked(&self, name: &str, overrides: Value) -> Result<Arc<Session>> {
        if self.sessions.read().await.contains_key(name) {
            return Err(GatewayError::Conflict(format!("session {} already exists", name)));
        }
        if !is_empty_document(&overrides) {
            self.overrides.save(name, &overrides).await?;
        }
        let mut settings = self.base.clone();
        if let Some(persisted) = self.overrides.load(name).await? {
            deep_merge(&mut settings, persisted);
        }
        let client = self.factory.create(name, &settings).await?;
        let session = Arc::new(Session {
            name: name.to_string(),
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            file: self.overrides.path_for(name),
            settings,
            client,
        });
        self.sessions
            .write()
            .await
            .insert(name.to_string(), session.clone());
        log::info!("session {} added", name);
        Ok(session)
    }

    /// Unregister a session and release its client: updates are detached first,
    /// then the client is closed.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let name = trim_name(name);
        let session = self
            .sessions
            .write()
            .await
            .remove(name)
            .ok_or_else(|| GatewayError::not_found(format!("session {} not found", name)))?;
        session.client.unset_update_handler().await;
        session.client.close().await;
        log::info!("session {} removed", name);
        Ok(())
    }

    /// Look up a session. With no name, the only registered session is returned.
    pub async fn get(&self, name: Option<&str>) -> Result<Arc<Session>> {
        let g = self.sessions.read().await;
        if g.is_empty() {
            return Err(GatewayError::not_found("no sessions available"));
        }
        match name.map(trim_name).filter(|n| !n.is_empty()) {
            Some(name) => g
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::not_found(format!("session {} not found", name))),
            None if g.len() == 1 => g
                .values()
                .next()
                .cloned()
                .ok_or_else(|| GatewayError::not_found("no sessions available")),
            None => Err(GatewayError::Ambiguous),
        }
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(trim_name(name))
    }

    /// Registered names, sorted.
    pub async fn names(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Every session with its current authorization state.
    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let states = join_all(sessions.iter().map(|s| s.client.authorization_state())).await;
        sessions
            .iter()
            .zip(states)
            .map(|(s, state)| SessionSummary {
                session: s.name.clone(),
                file: s.file.display().to_string(),
                status: match state {
                    Ok(st) => Some(st),
                    Err(e) => {
                        log::debug!("session {}: authorization state unavailable: {}", s.name, e);
                        None
                    }
                },
            })
            .collect()
    }

    /// Persist an override document without touching a running session.
    pub async fn save_overrides(&self, name: &str, overrides: &Value) -> Result<PathBuf> {
        let name = self.overrides.normalize_name(name)?;
        if !overrides.is_object() {
            return Err(GatewayError::InvalidParams(
                "session settings must be an object".to_string(),
            ));
        }
        self.overrides.save(&name, overrides).await?;
        Ok(self.overrides.path_for(&name))
    }

    /// Delete the persisted override of a stopped session.
    pub async fn unlink(&self, name: &str) -> Result<()> {
        let name = self.overrides.normalize_name(name)?;
        if self.contains(&name).await {
            return Err(GatewayError::Conflict(format!(
                "session {} is running, remove it first",
                name
            )));
        }
        if !self.overrides.remove(&name).await? {
            return Err(GatewayError::not_found(format!(
                "no settings file for session {}",
                name
            )));
        }
        log::info!("settings file for session {} removed", name);
        Ok(())
    }
}

/// Session name with surrounding whitespace and path separators removed.
pub fn trim_name(name: &str) -> &str {
    name.trim().trim_matches(|c| c == '/' || c == '\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::MockFactory;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("switchboard-sessions-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn store_with(factory: Arc<MockFactory>, base: Value) -> SessionStore {
        SessionStore::new(base, SettingsStore::new(temp_dir()), factory)
    }

    fn store() -> (SessionStore, Arc<MockFactory>) {
        let factory = Arc::new(MockFactory::default());
        (store_with(factory.clone(), json!({})), factory)
    }

    #[tokio::test]
    async fn duplicate_add_conflicts_and_keeps_first() {
        let (store, factory) = store();
        store.add("work", json!({ "limit": 2 })).await.unwrap();
        let err = store.add("work", json!({ "limit": 9 })).await.err().unwrap();
        assert!(matches!(err, GatewayError::Conflict(_)));
        let s = store.get(Some("work")).await.unwrap();
        assert_eq!(s.settings()["limit"], 2);
        assert!(!factory.client("work").closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn remove_unknown_is_not_found() {
        let (store, _) = store();
        store.add("work", Value::Null).await.unwrap();
        let err = store.remove("home").await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(store.names().await, vec!["work".to_string()]);
    }

    #[tokio::test]
    async fn remove_detaches_and_closes_client() {
        let (store, factory) = store();
        let session = store.add("work", Value::Null).await.unwrap();
        session
            .client()
            .set_update_handler(Arc::new(|_| {}))
            .await
            .unwrap();
        store.remove("/work/").await.unwrap();
        let client = factory.client("work");
        assert!(!client.is_attached());
        assert!(client.closed.load(Ordering::SeqCst));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn concurrent_adds_for_one_name_create_once() {
        let factory = Arc::new(MockFactory::with_delay(Duration::from_millis(30)));
        let store = store_with(factory.clone(), json!({}));
        let (a, b) = tokio::join!(store.add("work", Value::Null), store.add("work", Value::Null));
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        let err = a.err().or(b.err()).unwrap();
        assert!(matches!(err, GatewayError::Conflict(_)));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);
        assert_eq!(store.names().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_adds_for_different_names_both_succeed() {
        let factory = Arc::new(MockFactory::with_delay(Duration::from_millis(20)));
        let store = store_with(factory, json!({}));
        let (a, b) = tokio::join!(store.add("a", Value::Null), store.add("b", Value::Null));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(store.names().await, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn get_resolves_sole_session_and_rejects_ambiguity() {
        let (store, _) = store();
        let err = store.get(None).await.err().unwrap();
        assert!(matches!(err, GatewayError::NotFound(_)));

        store.add("only", Value::Null).await.unwrap();
        assert_eq!(store.get(None).await.unwrap().name(), "only");

        store.add("second", Value::Null).await.unwrap();
        assert!(matches!(store.get(None).await.err().unwrap(), GatewayError::Ambiguous));
        assert!(matches!(
            store.get(Some("third")).await.err().unwrap(),
            GatewayError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn settings_are_merged_over_base_and_persisted() {
        let factory = Arc::new(MockFactory::default());
        let store = store_with(factory.clone(), json!({ "limit": 1, "region": "eu" }));
        let s = store.add("work", json!({ "limit": 5 })).await.unwrap();
        assert_eq!(s.settings(), &json!({ "limit": 5, "region": "eu" }));
        assert_eq!(factory.client("work").settings, json!({ "limit": 5, "region": "eu" }));
        assert!(s.file().exists());
        assert_eq!(
            store.overrides().load("work").await.unwrap(),
            Some(json!({ "limit": 5 }))
        );
    }

    #[tokio::test]
    async fn persisted_override_is_reused_on_readd() {
        let (store, _) = store();
        let first = store.add("work", json!({ "limit": 5 })).await.unwrap();
        store.remove("work").await.unwrap();
        let s = store.add("work", Value::Null).await.unwrap();
        assert_eq!(s.settings()["limit"], 5);
        assert_ne!(s.generation(), first.generation());
    }

    #[tokio::test]
    async fn unlink_requires_stopped_session() {
        let (store, _) = store();
        store.add("work", json!({ "limit": 5 })).await.unwrap();
        assert!(matches!(store.unlink("work").await, Err(GatewayError::Conflict(_))));
        store.remove("work").await.unwrap();
        store.unlink("work").await.unwrap();
        assert!(matches!(store.unlink("work").await, Err(GatewayError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_reports_authorization_state() {
        let (store, factory) = store();
        store.add("a", Value::Null).await.unwrap();
        store.add("b", Value::Null).await.unwrap();
        *factory.client("b").state.lock().unwrap() = AuthorizationState::WaitingCode;
        let list = store.list().await;
        assert_eq!(list[0].session, "a");
        assert_eq!(list[0].status, Some(AuthorizationState::LoggedIn));
        assert_eq!(list[1].status, Some(AuthorizationState::WaitingCode));
    }
}
