//! # Application State
//!
//! Shared state handed to every HTTP handler and WebSocket actor through
//! `web::Data<AppState>`. Everything inside is either immutable after startup
//! (`config`, `services`) or internally synchronized (`registry` behind a
//! tokio `RwLock`, `metrics` as plain atomics), so cloning the state is cheap
//! and no handler ever holds a lock across an await on someone else's behalf.

use crate::config::AppConfig;
use crate::services::Collaborators;
use crate::session::SessionRegistry;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    /// Effective configuration, fixed at startup
    pub config: Arc<AppConfig>,

    /// External collaborators shared by every session
    pub services: Collaborators,

    /// Live sessions by connection id
    pub registry: SessionRegistry,

    /// Process-wide voice counters
    pub metrics: Arc<VoiceMetrics>,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, services: Collaborators) -> Self {
        let registry = SessionRegistry::new(config.session.max_concurrent_sessions);
        Self {
            config: Arc::new(config),
            services,
            registry,
            metrics: Arc::new(VoiceMetrics::default()),
            start_time: Instant::now(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

/// Counters collected across all sessions.
///
/// ## Counters:
/// - **sessions_started / sessions_ended / start_failures**: lifecycle
/// - **frames_forwarded**: frames handed to a ready recognizer link
/// - **audio_bytes_dropped**: audio discarded in degraded mode, including
///   the backlog of a link that could not be reopened
/// - **utterances_processed / utterances_dropped**: dropped = arrived while busy
/// - **llm_fallbacks**: apology substituted for a failed or empty reply
/// - **synthesis_failures**: replies that produced no audio
/// - **protocol_errors**: malformed client messages
#[derive(Debug, Default)]
pub struct VoiceMetrics {
    sessions_started: AtomicU64,
    sessions_ended: AtomicU64,
    start_failures: AtomicU64,
    frames_forwarded: AtomicU64,
    audio_bytes_dropped: AtomicU64,
    utterances_processed: AtomicU64,
    utterances_dropped: AtomicU64,
    llm_fallbacks: AtomicU64,
    synthesis_failures: AtomicU64,
    protocol_errors: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl VoiceMetrics {
    pub fn session_started(&self) {
        bump(&self.sessions_started, 1);
    }

    pub fn session_ended(&self) {
        bump(&self.sessions_ended, 1);
    }

    pub fn start_failed(&self) {
        bump(&self.start_failures, 1);
    }

    pub fn frames_forwarded(&self, frames: usize) {
        bump(&self.frames_forwarded, frames as u64);
    }

    pub fn audio_dropped(&self, bytes: usize) {
        bump(&self.audio_bytes_dropped, bytes as u64);
    }

    pub fn utterance_processed(&self) {
        bump(&self.utterances_processed, 1);
    }

    pub fn utterance_dropped(&self) {
        bump(&self.utterances_dropped, 1);
    }

    pub fn llm_fallback(&self) {
        bump(&self.llm_fallbacks, 1);
    }

    pub fn synthesis_failed(&self) {
        bump(&self.synthesis_failures, 1);
    }

    pub fn protocol_error(&self) {
        bump(&self.protocol_errors, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            sessions_started: load(&self.sessions_started),
            sessions_ended: load(&self.sessions_ended),
            start_failures: load(&self.start_failures),
            frames_forwarded: load(&self.frames_forwarded),
            audio_bytes_dropped: load(&self.audio_bytes_dropped),
            utterances_processed: load(&self.utterances_processed),
            utterances_dropped: load(&self.utterances_dropped),
            llm_fallbacks: load(&self.llm_fallbacks),
            synthesis_failures: load(&self.synthesis_failures),
            protocol_errors: load(&self.protocol_errors),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub sessions_started: u64,
    pub sessions_ended: u64,
    pub start_failures: u64,
    pub frames_forwarded: u64,
    pub audio_bytes_dropped: u64,
    pub utterances_processed: u64,
    pub utterances_dropped: u64,
    pub llm_fallbacks: u64,
    pub synthesis_failures: u64,
    pub protocol_errors: u64,
}

impl MetricsSnapshot {
    /// Share of processed utterances answered with the apology.
    pub fn fallback_rate(&self) -> f64 {
        if self.utterances_processed > 0 {
            self.llm_fallbacks as f64 / self.utterances_processed as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = VoiceMetrics::default();
        metrics.session_started();
        metrics.frames_forwarded(3);
        metrics.utterance_processed();
        metrics.utterance_processed();
        metrics.llm_fallback();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sessions_started, 1);
        assert_eq!(snapshot.frames_forwarded, 3);
        assert_eq!(snapshot.fallback_rate(), 0.5);
        assert_eq!(MetricsSnapshot::default().fallback_rate(), 0.0);
    }
}
