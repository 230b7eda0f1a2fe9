//! Attaches and detaches upstream update handlers on demand.
//!
//! Each session has an interest count: the number of live subscribers that need
//! its updates. The handler is attached on the 0 -> 1 transition and detached on
//! the 1 -> 0 transition (or unconditionally with `force`). Attached handlers
//! publish every update onto the update bus tagged with the session name.
//!
//! Counts belong to one session instance. A subscriber gets a [`StreamTicket`]
//! per session it started, and releasing a ticket issued for an earlier instance
//! of a name leaves the current instance alone. Transitions for one name are
//! serialized; different names never wait on each other.

use super::EventBus;
use crate::error::Result;
use crate::session::{trim_name, Session, SessionStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Interest taken in one session instance by a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTicket {
    pub session: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy)]
struct Interest {
    generation: u64,
    count: usize,
}

pub struct EventStreamSupervisor {
    sessions: Arc<SessionStore>,
    updates: Arc<EventBus<Value>>,
    interest: std::sync::Mutex<HashMap<String, Interest>>,
    transitions: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl EventStreamSupervisor {
    pub fn new(sessions: Arc<SessionStore>, updates: Arc<EventBus<Value>>) -> Self {
        Self {
            sessions,
            updates,
            interest: std::sync::Mutex::new(HashMap::new()),
            transitions: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn updates(&self) -> &Arc<EventBus<Value>> {
        &self.updates
    }

    /// Current interest count for a session (0 when untracked).
    pub fn interest(&self, name: &str) -> usize {
        self.counts()
            .get(trim_name(name))
            .map_or(0, |i| i.count)
    }

    /// Take interest in one session, or in every registered session when `session`
    /// is None. Returns a ticket per session whose count was incremented; attach
    /// failures are logged, rolled back and left out.
    pub async fn start(&self, session: Option<&str>) -> Vec<StreamTicket> {
        let targets = match session {
            Some(name) => vec![trim_name(name).to_string()],
            None => self.sessions.names().await,
        };
        let mut tickets = Vec::with_capacity(targets.len());
        for name in targets {
            let gate = self.gate(&name);
            let ticket = {
                let _guard = gate.lock().await;
                self.start_locked(&name).await
            };
            self.release_gate(&name, gate);
            tickets.extend(ticket);
        }
        tickets
    }

    async fn start_locked(&self, name: &str) -> Option<StreamTicket> {
        let session = match self.sessions.get(Some(name)).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("update stream: {}", e);
                return None;
            }
        };
        let generation = session.generation();
        let first = {
            let mut interest = self.counts();
            let entry = interest
                .entry(name.to_string())
                .or_insert(Interest { generation, count: 0 });
            if entry.generation != generation {
                *entry = Interest { generation, count: 0 };
            }
            entry.count += 1;
            entry.count == 1
        };
        if first {
            if let Err(e) = self.attach(&session).await {
                self.counts().remove(name);
                log::warn!("update stream: attaching to session {} failed: {}", name, e);
                return None;
            }
            log::info!("update stream: attached to session {}", name);
        }
        Some(StreamTicket {
            session: name.to_string(),
            generation,
        })
    }

    /// Drop interest in one session, or in every tracked and registered session when
    /// `session` is None. Detaches when the count reaches zero or `force` is set.
    pub async fn stop(&self, session: Option<&str>, force: bool) {
        let targets: Vec<String> = match session {
            Some(name) => vec![trim_name(name).to_string()],
            None => {
                let mut names = self.sessions.names().await;
                for name in self.counts().keys() {
                    if !names.contains(name) {
                        names.push(name.clone());
                    }
                }
                names
            }
        };
        for name in targets {
            self.stop_one(&name, None, force).await;
        }
    }

    /// Give back the interest a subscriber took with `start`. Tickets for a session
    /// instance that has since been replaced are ignored.
    pub async fn release(&self, tickets: Vec<StreamTicket>) {
        for ticket in tickets {
            self.stop_one(&ticket.session, Some(ticket.generation), false)
                .await;
        }
    }

    async fn stop_one(&self, name: &str, generation: Option<u64>, force: bool) {
        let gate = self.gate(name);
        {
            let _guard = gate.lock().await;
            // Outer None: keep attached. Inner: the instance the count belonged to.
            let detach: Option<Option<u64>> = {
                let mut interest = self.counts();
                match interest.get_mut(name) {
                    Some(entry) if generation.map_or(true, |g| g == entry.generation) => {
                        entry.count = entry.count.saturating_sub(1);
                        if entry.count == 0 || force {
                            let owner = entry.generation;
                            interest.remove(name);
                            Some(Some(owner))
                        } else {
                            None
                        }
                    }
                    Some(_) => {
                        log::debug!("update stream: stale ticket for session {}", name);
                        None
                    }
                    None => force.then_some(None),
                }
            };
            if let Some(owner) = detach {
                self.detach(name, owner).await;
                log::info!("update stream: detached from session {}", name);
            }
        }
        self.release_gate(name, gate);
    }

    fn counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, Interest>> {
        self.interest.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn gate(&self, name: &str) -> Arc<Mutex<()>> {
        let mut g = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        g.entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_gate(&self, name: &str, gate: Arc<Mutex<()>>) {
        let mut g = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        // One reference in the map, one held here.
        if Arc::strong_count(&gate) <= 2 {
            g.remove(name);
        }
    }

    async fn attach(&self, session: &Session) -> Result<()> {
        let updates = self.updates.clone();
        let tag = session.name().to_string();
        session
            .client()
            .set_update_handler(Arc::new(move |update: Value| {
                updates.notify(&update, Some(&tag));
            }))
            .await
    }

    /// Detach the registered session, but only if it is the instance `owner` names.
    async fn detach(&self, name: &str, owner: Option<u64>) {
        match self.sessions.get(Some(name)).await {
            Ok(session) if owner.map_or(true, |g| g == session.generation()) => {
                session.client().unset_update_handler().await
            }
            Ok(_) => log::debug!("update stream: session {} was replaced, not detaching", name),
            Err(e) => log::debug!("update stream: nothing to detach for {}: {}", name, e),
        }
    }
}
