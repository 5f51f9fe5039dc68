//! # Session Registry
//!
//! Process-wide map of live sessions keyed by connection id. The registry
//! only holds the lock-free [`SessionShared`] part of a session; the session
//! task owns everything else. Diagnostic endpoints and the external idle
//! checker read it through [`SessionSnapshot`]s.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::VoiceError;

/// Session state visible outside the session task.
///
/// ## Rust Concepts:
/// - Every mutable field is an atomic, so an `Arc<SessionShared>` can be read
///   by HTTP handlers and updated by the session task without a `Mutex`
/// - Counters use `Relaxed`: they are independent statistics. The `busy` and
///   `open` flags use acquire/release so a reply task that wins `busy` also
///   sees a teardown that happened before it
#[derive(Debug)]
pub struct SessionShared {
    pub connection_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub client_id: String,
    pub started_at: DateTime<Utc>,

    last_activity_ms: AtomicI64,
    /// An utterance is being processed
    busy: AtomicBool,
    /// Cleared at teardown; no new utterance may start afterwards
    open: AtomicBool,
    recognizer_ready: AtomicBool,
    /// Running without a recognizer: none could be opened, or the link
    /// was lost for good
    degraded: AtomicBool,

    bytes_received: AtomicU64,
    bytes_forwarded: AtomicU64,
    bytes_pending: AtomicU64,
    bytes_dropped: AtomicU64,
}

impl SessionShared {
    pub fn new(connection_id: &str, session_id: &str, agent_id: &str, client_id: &str) -> Self {
        let now = Utc::now();
        Self {
            connection_id: connection_id.to_string(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            client_id: client_id.to_string(),
            started_at: now,
            last_activity_ms: AtomicI64::new(now.timestamp_millis()),
            busy: AtomicBool::new(false),
            open: AtomicBool::new(true),
            recognizer_ready: AtomicBool::new(false),
            degraded: AtomicBool::new(false),
            bytes_received: AtomicU64::new(0),
            bytes_forwarded: AtomicU64::new(0),
            bytes_pending: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
        }
    }

    /// Record inbound activity.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        // Millisecond precision is all the idle checker needs
        let ms = self.last_activity_ms.load(Ordering::Relaxed);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(self.started_at)
    }

    /// Claim the busy flag. Fails if it is already held or the session closed.
    pub fn try_acquire_busy(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        // Only one caller can flip false -> true
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release_busy(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Mark the session as torn down. In-flight replies finish; new ones
    /// are refused by `try_acquire_busy`.
    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
        self.recognizer_ready.store(false, Ordering::Relaxed);
    }

    pub fn set_recognizer_ready(&self, ready: bool) {
        self.recognizer_ready.store(ready, Ordering::Relaxed);
    }

    pub fn set_degraded(&self) {
        self.degraded.store(true, Ordering::Relaxed);
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_forwarded(&self, bytes: usize) {
        self.bytes_forwarded.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, bytes: usize) {
        self.bytes_dropped.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Bytes buffered in the accumulator plus bytes queued for the link.
    pub fn set_pending(&self, bytes: usize) {
        self.bytes_pending.store(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            connection_id: self.connection_id.clone(),
            session_id: self.session_id.clone(),
            agent_id: self.agent_id.clone(),
            client_id: self.client_id.clone(),
            started_at: self.started_at,
            last_activity: self.last_activity(),
            busy: self.is_busy(),
            recognizer_ready: self.recognizer_ready.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_forwarded: self.bytes_forwarded.load(Ordering::Relaxed),
            bytes_pending: self.bytes_pending.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one session, as served by `/api/v1/sessions`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub connection_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub client_id: String,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub busy: bool,
    pub recognizer_ready: bool,
    pub degraded: bool,
    pub bytes_received: u64,
    pub bytes_forwarded: u64,
    pub bytes_pending: u64,
    pub bytes_dropped: u64,
}

/// Shared, capacity-limited map of live sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<SessionShared>>>>,
    capacity: usize,
}

impl SessionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Register a session under its connection id.
    ///
    /// ## Errors:
    /// - `Protocol` if the connection already has a session
    /// - `Configuration` if the registry is at capacity
    pub async fn register(&self, session: Arc<SessionShared>) -> Result<(), VoiceError> {
        // Both checks and the insert happen under one write lock
        let mut sessions = self.sessions.write().await;

        if sessions.contains_key(&session.connection_id) {
            return Err(VoiceError::Protocol(format!(
                "connection {} already has a session",
                session.connection_id
            )));
        }

        if sessions.len() >= self.capacity {
            return Err(VoiceError::Configuration(format!(
                "session capacity reached ({} active)",
                sessions.len()
            )));
        }

        info!(
            connection_id = %session.connection_id,
            session_id = %session.session_id,
            active = sessions.len() + 1,
            "Session registered"
        );
        sessions.insert(session.connection_id.clone(), session);
        Ok(())
    }

    pub async fn remove(&self, connection_id: &str) -> Option<Arc<SessionShared>> {
        let removed = self.sessions.write().await.remove(connection_id);
        if removed.is_some() {
            debug!(connection_id = %connection_id, "Session removed from registry");
        }
        removed
    }

    /// Look a session up by session id or connection id.
    pub async fn find(&self, id: &str) -> Option<SessionSnapshot> {
        let sessions = self.sessions.read().await;
        // Connection id is the key; session id needs a scan
        if let Some(session) = sessions.get(id) {
            return Some(session.snapshot());
        }
        sessions
            .values()
            .find(|s| s.session_id == id)
            .map(|s| s.snapshot())
    }

    /// Snapshots of every session, oldest first.
    pub async fn snapshots(&self) -> Vec<SessionSnapshot> {
        let mut snapshots: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.snapshot())
            .collect();
        snapshots.sort_by_key(|s| s.started_at);
        snapshots
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
