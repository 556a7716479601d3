//! Live relay state for one client connection.
//!
//! A [`Session`] does not hold its socket or tunnel. Those are owned by the
//! pump tasks, which watch the session's [`CloseSignal`]; firing the signal
//! unblocks their reads and drops both ends. Observers work the same way,
//! each with a signal of its own.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tracing::info;

use crate::error::Disconnect;
use crate::util::now_ms;

/// Whether the primary viewer may send input.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    #[default]
    Interactive,
    ReadOnly,
}

/// Session lifecycle.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Registered,
    Active,
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Registered,
            2 => Self::Active,
            _ => Self::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Registered => 1,
            Self::Active => 2,
            Self::Closed => 3,
        }
    }
}

/// One-shot close notification. The first `close` wins; later calls are
/// ignored so the original reason is what the client sees. Clones share the
/// same signal.
#[derive(Clone)]
pub struct CloseSignal {
    tx: Arc<watch::Sender<Option<Disconnect>>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Returns `false` if already closed.
    pub fn close(&self, disconnect: Disconnect) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(disconnect);
            true
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub fn reason(&self) -> Option<Disconnect> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> CloseWatch {
        CloseWatch {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of a [`CloseSignal`].
#[derive(Clone)]
pub struct CloseWatch {
    rx: watch::Receiver<Option<Disconnect>>,
}

impl CloseWatch {
    /// Resolve once the signal fires. A dropped signal counts as a forced
    /// close.
    pub async fn closed(&mut self) -> Disconnect {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(disconnect) = current {
                return disconnect;
            }
            if self.rx.changed().await.is_err() {
                return Disconnect::forced("session dropped");
            }
        }
    }
}

/// A read-only viewer attached to a primary session.
pub struct Observer {
    pub id: String,
    pub attached_at: u64,
    signal: CloseSignal,
}

impl Observer {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attached_at: now_ms(),
            signal: CloseSignal::new(),
        }
    }

    pub fn close(&self, disconnect: Disconnect) -> bool {
        self.signal.close(disconnect)
    }

    pub fn subscribe(&self) -> CloseWatch {
        self.signal.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    pub fn signal(&self) -> CloseSignal {
        self.signal.clone()
    }
}

/// Observers attached to one primary session, in attach order.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: Mutex<Vec<Arc<Observer>>>,
}

impl ObserverRegistry {
    pub async fn add(&self, observer: Arc<Observer>) {
        self.observers.lock().await.push(observer);
    }

    /// Remove by the observer's own id.
    pub async fn delete(&self, observer_id: &str) -> Option<Arc<Observer>> {
        let mut observers = self.observers.lock().await;
        let index = observers.iter().position(|o| o.id == observer_id)?;
        Some(observers.remove(index))
    }

    pub async fn get(&self, observer_id: &str) -> Option<Arc<Observer>> {
        self.observers
            .lock()
            .await
            .iter()
            .find(|o| o.id == observer_id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.observers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.observers.lock().await.is_empty()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.observers
            .lock()
            .await
            .iter()
            .map(|o| o.id.clone())
            .collect()
    }

    /// Close and remove every observer. Returns how many were attached.
    pub async fn disconnect_all(&self, disconnect: &Disconnect) -> usize {
        let drained: Vec<Arc<Observer>> = self.observers.lock().await.drain(..).collect();
        for observer in &drained {
            observer.close(disconnect.clone());
        }
        drained.len()
    }
}

/// An interactive relay registered in the [`super::SessionManager`].
pub struct Session {
    pub id: String,
    pub protocol: String,
    /// guacd connection id, the target for observer tunnels.
    pub connection_id: String,
    pub mode: AccessMode,
    pub created_at: u64,
    pub observers: ObserverRegistry,
    state: AtomicU8,
    signal: CloseSignal,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        protocol: impl Into<String>,
        connection_id: impl Into<String>,
        mode: AccessMode,
    ) -> Self {
        Self {
            id: id.into(),
            protocol: protocol.into(),
            connection_id: connection_id.into(),
            mode,
            created_at: now_ms(),
            observers: ObserverRegistry::default(),
            state: AtomicU8::new(SessionState::Created.as_u8()),
            signal: CloseSignal::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle. A closed session stays closed.
    pub fn set_state(&self, state: SessionState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != SessionState::Closed.as_u8()).then_some(state.as_u8())
            });
    }

    /// Ask the pumps to stop. Returns `false` if the session was already
    /// closing.
    pub fn close(&self, disconnect: Disconnect) -> bool {
        let first = self.signal.close(disconnect.clone());
        if first {
            info!(session_id = %self.id, "Session closing: {disconnect}");
        }
        self.set_state(SessionState::Closed);
        first
    }

    pub fn is_closed(&self) -> bool {
        self.signal.is_closed()
    }

    pub fn close_reason(&self) -> Option<Disconnect> {
        self.signal.reason()
    }

    pub fn subscribe(&self) -> CloseWatch {
        self.signal.subscribe()
    }

    /// Handle for the pumps. Closing through it skips the log line and state
    /// change of [`Session::close`]; the relay records both at teardown.
    pub fn signal(&self) -> CloseSignal {
        self.signal.clone()
    }
}
