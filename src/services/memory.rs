//! In-process store implementations, used when no store URL is configured.

use super::{AgentConfig, AgentStore, DirectiveStore, TranscriptStore};
use crate::error::VoiceError;
use crate::transcript::{NewTranscript, TranscriptEntry, TranscriptHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Agents defined in the `[agents.<id>]` tables of the configuration.
pub struct StaticAgentStore {
    agents: HashMap<String, AgentConfig>,
}

impl StaticAgentStore {
    pub fn new(agents: HashMap<String, AgentConfig>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl AgentStore for StaticAgentStore {
    async fn fetch_agent(&self, agent_id: &str) -> Result<AgentConfig, VoiceError> {
        self.agents
            .get(agent_id)
            .cloned()
            .ok_or_else(|| VoiceError::NotFound(format!("agent '{}'", agent_id)))
    }
}

/// A fixed global directive (empty means none).
pub struct StaticDirectiveStore {
    directive: Option<String>,
}

impl StaticDirectiveStore {
    pub fn new(directive: &str) -> Self {
        let directive = Some(directive.to_string()).filter(|d| !d.trim().is_empty());
        Self { directive }
    }
}

#[async_trait]
impl DirectiveStore for StaticDirectiveStore {
    async fn default_directive(&self) -> Result<Option<String>, VoiceError> {
        Ok(self.directive.clone())
    }
}

#[derive(Debug, Clone)]
struct StoredTranscript {
    record: NewTranscript,
    entries: Vec<TranscriptEntry>,
    ended_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Shelf {
    /// Transcripts of sessions still running
    live: HashMap<TranscriptHandle, StoredTranscript>,

    /// Recently ended transcripts, oldest first
    ended: VecDeque<(TranscriptHandle, StoredTranscript)>,
}

impl Shelf {
    #[cfg(test)]
    fn find(&self, handle: &TranscriptHandle) -> Option<&StoredTranscript> {
        self.live.get(handle).or_else(|| {
            self.ended
                .iter()
                .find(|(h, _)| h == handle)
                .map(|(_, t)| t)
        })
    }
}

/// In-process transcript store.
///
/// ## Memory Bound:
/// Live transcripts are kept until their session ends. Ended ones move to a
/// ring of at most `retention` records; the oldest is evicted when it fills,
/// so a long-running process holds a bounded number of finished calls.
pub struct InMemoryTranscriptStore {
    shelf: RwLock<Shelf>,
    retention: usize,
}

/// Ended transcripts kept by [`InMemoryTranscriptStore::default`].
pub const DEFAULT_TRANSCRIPT_RETENTION: usize = 64;

impl Default for InMemoryTranscriptStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_TRANSCRIPT_RETENTION)
    }
}

impl InMemoryTranscriptStore {
    pub fn with_retention(retention: usize) -> Self {
        Self {
            shelf: RwLock::new(Shelf::default()),
            retention,
        }
    }

    #[cfg(test)]
    pub async fn entries(&self, handle: &TranscriptHandle) -> Vec<TranscriptEntry> {
        self.shelf
            .read()
            .await
            .find(handle)
            .map(|t| t.entries.clone())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub async fn is_ended(&self, handle: &TranscriptHandle) -> bool {
        self.shelf
            .read()
            .await
            .find(handle)
            .is_some_and(|t| t.ended_at.is_some())
    }

    /// Handle of the transcript created for `session_id`, if still held.
    #[cfg(test)]
    pub async fn handle_for_session(&self, session_id: &str) -> Option<TranscriptHandle> {
        let shelf = self.shelf.read().await;
        shelf
            .live
            .iter()
            .chain(shelf.ended.iter().map(|(h, t)| (h, t)))
            .find(|(_, t)| t.record.session_id == session_id)
            .map(|(handle, _)| handle.clone())
    }

    /// Live plus retained transcripts.
    #[cfg(test)]
    pub async fn held(&self) -> usize {
        let shelf = self.shelf.read().await;
        shelf.live.len() + shelf.ended.len()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn create_session(&self, record: &NewTranscript) -> Result<TranscriptHandle, VoiceError> {
        let handle = TranscriptHandle(Uuid::new_v4().to_string());
        self.shelf.write().await.live.insert(
            handle.clone(),
            StoredTranscript {
                record: record.clone(),
                entries: Vec::new(),
                ended_at: None,
            },
        );
        Ok(handle)
    }

    async fn append_event(
        &self,
        handle: &TranscriptHandle,
        entry: &TranscriptEntry,
    ) -> Result<(), VoiceError> {
        let mut shelf = self.shelf.write().await;
        let transcript = shelf
            .live
            .get_mut(handle)
            .ok_or_else(|| VoiceError::Persistence(format!("no open transcript {}", handle.0)))?;
        transcript.entries.push(entry.clone());
        Ok(())
    }

    async fn mark_ended(
        &self,
        handle: &TranscriptHandle,
        ended_at: DateTime<Utc>,
    ) -> Result<(), VoiceError> {
        let mut shelf = self.shelf.write().await;
        let Some(mut transcript) = shelf.live.remove(handle) else {
            // Ending twice is fine; ending something never created is not
            if shelf.ended.iter().any(|(h, _)| h == handle) {
                return Ok(());
            }
            return Err(VoiceError::Persistence(format!("unknown transcript {}", handle.0)));
        };

        transcript.ended_at = Some(ended_at);
        shelf.ended.push_back((handle.clone(), transcript));

        while shelf.ended.len() > self.retention {
            if let Some((_, evicted)) = shelf.ended.pop_front() {
                debug!(
                    session_id = %evicted.record.session_id,
                    entries = evicted.entries.len(),
                    "Evicting ended transcript from memory"
                );
            }
        }
        Ok(())
    }
}
