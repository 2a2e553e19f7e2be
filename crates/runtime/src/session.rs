//! Session persistence, per-session locking and per-query state.

use crate::config::BusyPolicy;
use crate::detect::Detector;
use crate::executor::CircuitBreaker;
use crate::model::Message;
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use storage::{Event, EventKind, EventStore, SessionId};
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

/// Trait for session persistence.
///
/// The runtime repairs whatever `load` returns, so stores do not need to
/// validate message sequences.
pub trait SessionStore: Send + Sync {
    /// Messages of a session in append order; empty for unknown sessions.
    fn load(&self, session_id: SessionId) -> impl Future<Output = Result<Vec<Message>>> + Send;

    /// Append one message.
    fn append(
        &self,
        session_id: SessionId,
        message: &Message,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Mark a session as ended.
    fn end(&self, session_id: SessionId) -> impl Future<Output = Result<()>> + Send;
}

/// Decode stored message payloads, skipping any that no longer parse.
pub fn decode_messages(values: Vec<Value>) -> Vec<Message> {
    values
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Message>(value) {
            Ok(message) => Some(message),
            Err(err) => {
                warn!(error = %err, "skipping undecodable stored message");
                None
            }
        })
        .collect()
}

/// Session store backed by the SQLite event log.
pub struct SqliteStore {
    store: Mutex<EventStore>,
}

impl SqliteStore {
    pub fn new(store: EventStore) -> Self {
        Self {
            store: Mutex::new(store),
        }
    }

    fn with_store<T>(&self, f: impl FnOnce(&EventStore) -> storage::Result<T>) -> Result<T> {
        let store = self.store.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&store)?)
    }
}

impl SessionStore for SqliteStore {
    async fn load(&self, session_id: SessionId) -> Result<Vec<Message>> {
        let values = self.with_store(|store| store.load_messages(session_id))?;
        Ok(decode_messages(values))
    }

    async fn append(&self, session_id: SessionId, message: &Message) -> Result<()> {
        let payload = serde_json::to_value(message).map_err(storage::Error::from)?;
        self.with_store(|store| {
            if !store.has_session(session_id)? {
                store.append(&Event::new(session_id, EventKind::SessionStart))?;
            }
            store.append(&Event::message(session_id, message.role, payload))
        })
    }

    async fn end(&self, session_id: SessionId) -> Result<()> {
        self.with_store(|store| store.append(&Event::new(session_id, EventKind::SessionEnd)))
    }
}

/// In-memory session store.
#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, Vec<Message>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    async fn load(&self, session_id: SessionId) -> Result<Vec<Message>> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(sessions.get(&session_id).cloned().unwrap_or_default())
    }

    async fn append(&self, session_id: SessionId, message: &Message) -> Result<()> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions.entry(session_id).or_default().push(message.clone());
        Ok(())
    }

    async fn end(&self, _session_id: SessionId) -> Result<()> {
        Ok(())
    }
}

type SessionMutex = Arc<tokio::sync::Mutex<()>>;
type LockMap = Arc<Mutex<HashMap<SessionId, SessionMutex>>>;

/// Held while a query runs on a session.
///
/// Dropping the last guard of an idle session removes its lock entry.
#[derive(Debug)]
pub struct SessionGuard {
    guard: Option<OwnedMutexGuard<()>>,
    lock: SessionMutex,
    session_id: SessionId,
    locks: LockMap,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = locks
            .get(&self.session_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2);
        // Map entry plus this guard: nobody else is waiting.
        if idle {
            locks.remove(&self.session_id);
        }
    }
}

/// One lock per session; a session runs at most one query at a time.
#[derive(Debug, Clone, Default)]
pub struct SessionLocks {
    locks: LockMap,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the session, waiting or failing per `policy`.
    pub async fn acquire(&self, session_id: SessionId, policy: BusyPolicy) -> Result<SessionGuard> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(session_id).or_default().clone()
        };
        // Dropping this cleans up after a rejected or abandoned attempt too.
        let mut guard = SessionGuard {
            guard: None,
            lock: Arc::clone(&lock),
            session_id,
            locks: Arc::clone(&self.locks),
        };
        guard.guard = Some(match policy {
            BusyPolicy::Queue => lock.lock_owned().await,
            BusyPolicy::Reject => lock
                .try_lock_owned()
                .map_err(|_| Error::SessionBusy(session_id))?,
        });
        Ok(guard)
    }

    /// Sessions with a running or waiting query.
    pub fn active(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Mutable state of one user query.
#[derive(Debug)]
pub struct TurnState {
    /// Model requests issued so far.
    pub iteration: u32,
    pub breaker: CircuitBreaker,
    pub detector: Detector,
}

impl TurnState {
    /// `used_ids` are the call ids already present in the session history.
    pub fn new<I, S>(repeat_threshold: u32, used_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            iteration: 0,
            breaker: CircuitBreaker::new(repeat_threshold),
            detector: Detector::new().reserve(used_ids),
        }
    }
}
