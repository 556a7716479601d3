//! Process-wide registry of live relay sessions.
//!
//! [`SessionManager`] maps session id → [`Session`]. Observers and
//! administrative closes reach a session only through this registry.
//!
//! ## Concurrency
//!
//! The map is behind an `RwLock`: lookups take a read lock, add/delete take
//! a write lock. Entries are `Arc<Session>`, so a reader always sees either a
//! whole session or none. Locks are never held across session I/O.

pub mod session;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

use crate::error::Disconnect;
pub use session::{AccessMode, CloseSignal, CloseWatch, Observer, ObserverRegistry, Session, SessionState};

/// Cloneable handle; all clones share the same map.
#[derive(Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
}

/// Summary of a live session returned by [`SessionManager::list`].
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub protocol: String,
    pub connection_id: String,
    pub mode: AccessMode,
    pub state: SessionState,
    pub created_at: u64,
    pub observers: Vec<String>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session, replacing any session with the same id.
    /// Returns the replaced session.
    pub async fn add(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        session.set_state(SessionState::Registered);
        let mut sessions = self.sessions.write().await;
        let previous = sessions.insert(session.id.clone(), session);
        info!("Session registered, total: {}", sessions.len());
        previous
    }

    pub async fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn delete(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions.write().await.remove(session_id)
    }

    /// Remove `session` only if it is still the one registered under its id.
    pub async fn remove_if_same(&self, session: &Arc<Session>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get(&session.id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                sessions.remove(&session.id);
                true
            }
            _ => false,
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut items = Vec::with_capacity(sessions.len());
        for s in sessions {
            items.push(SessionSummary {
                session_id: s.id.clone(),
                protocol: s.protocol.clone(),
                connection_id: s.connection_id.clone(),
                mode: s.mode,
                state: s.state(),
                created_at: s.created_at,
                observers: s.observers.ids().await,
            });
        }
        items.sort_by_key(|i| i.created_at);
        items
    }

    /// Administrative close. The pumps do the actual teardown and removal.
    /// Returns `false` if no such session is registered.
    pub async fn close(&self, session_id: &str, disconnect: Disconnect) -> bool {
        match self.get(session_id).await {
            Some(session) => {
                session.close(disconnect);
                true
            }
            None => false,
        }
    }

    /// Close every registered session (used during shutdown).
    pub async fn close_all(&self, disconnect: &Disconnect) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        for session in &sessions {
            session.close(disconnect.clone());
        }
        if !sessions.is_empty() {
            info!("Closed {} session(s): {disconnect}", sessions.len());
        }
        sessions.len()
    }
}
