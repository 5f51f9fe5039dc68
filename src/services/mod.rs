//! # External Collaborators
//!
//! Everything the session talks to besides the call client sits behind an
//! async trait so the orchestrator can be driven by HTTP clients in
//! production and by in-memory fakes in tests.
//!
//! ## Collaborators:
//! - **AgentStore**: read-only agent configuration lookup
//! - **TranscriptStore**: durable transcript (create / append / mark ended)
//! - **DirectiveStore**: optional global system directive
//! - **LanguageModel**: retrieval-augmented reply generation
//! - **SpeechSynthesizer**: text to audio
//! - **RecognizerConnector** (in `crate::recognizer`): streaming speech recognition

pub mod http;
pub mod memory;

#[cfg(test)]
pub mod testing;

use crate::config::AppConfig;
use crate::error::VoiceError;
use crate::recognizer::{DeepgramConnector, RecognizerConnector};
use crate::transcript::{NewTranscript, TranscriptEntry, TranscriptHandle};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of an agent's configuration, fetched once per session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Recognition and synthesis language (e.g. `en-US`)
    #[serde(default)]
    pub language: String,

    /// Synthesis voice identifier
    #[serde(default, alias = "voice", alias = "voice_selection")]
    pub voice_selection: String,

    /// Agent-specific directive for the language model
    #[serde(default, alias = "system_prompt")]
    pub system_prompt: String,

    /// Greeting spoken when the call starts
    #[serde(default, alias = "first_message")]
    pub first_message: String,
}

/// One language-model round trip.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmQuery {
    pub session_id: String,
    pub client_id: String,
    pub agent_id: String,
    pub session_token: Option<String>,
    pub query: String,
    pub system_prompt: String,
}

/// One synthesis request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub language: String,
    pub voice: String,
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    /// Fetch an agent; `VoiceError::NotFound` when the id does not resolve.
    async fn fetch_agent(&self, agent_id: &str) -> Result<AgentConfig, VoiceError>;
}

/// Durable transcript records. Every call happens on a session's background
/// writer, never on the session task itself.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn create_session(&self, record: &NewTranscript) -> Result<TranscriptHandle, VoiceError>;

    async fn append_event(
        &self,
        handle: &TranscriptHandle,
        entry: &TranscriptEntry,
    ) -> Result<(), VoiceError>;

    /// Nothing is appended after this for the same handle.
    async fn mark_ended(
        &self,
        handle: &TranscriptHandle,
        ended_at: DateTime<Utc>,
    ) -> Result<(), VoiceError>;
}

#[async_trait]
pub trait DirectiveStore: Send + Sync {
    /// The global directive prefix, if one is configured.
    async fn default_directive(&self) -> Result<Option<String>, VoiceError>;
}

/// Any `Err` (or blank answer) is replaced by the apology at the call site.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn query(&self, request: &LlmQuery) -> Result<String, VoiceError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Returns the encoded audio payload.
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, VoiceError>;
}

/// The full set of collaborators a session needs.
#[derive(Clone)]
pub struct Collaborators {
    pub agents: Arc<dyn AgentStore>,
    pub transcripts: Arc<dyn TranscriptStore>,
    pub directives: Arc<dyn DirectiveStore>,
    pub language_model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub recognizer: Arc<dyn RecognizerConnector>,
}

impl Collaborators {
    /// Build production collaborators from configuration.
    ///
    /// Stores with an empty URL fall back to their in-memory/static
    /// implementation so a single binary can run without the surrounding
    /// data services.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store_timeout = Duration::from_secs(config.stores.timeout_secs);

        let agents: Arc<dyn AgentStore> = if config.stores.agents_url.is_empty() {
            Arc::new(memory::StaticAgentStore::new(config.agents.clone()))
        } else {
            Arc::new(http::HttpAgentStore::new(&config.stores.agents_url, store_timeout)?)
        };

        // In memory, finished transcripts are kept only up to the retention
        let transcripts: Arc<dyn TranscriptStore> = if config.stores.transcripts_url.is_empty() {
            Arc::new(memory::InMemoryTranscriptStore::with_retention(
                config.stores.transcript_retention,
            ))
        } else {
            Arc::new(http::HttpTranscriptStore::new(
                &config.stores.transcripts_url,
                store_timeout,
            )?)
        };

        let directives: Arc<dyn DirectiveStore> = if config.stores.directives_url.is_empty() {
            Arc::new(memory::StaticDirectiveStore::new(&config.session.default_directive))
        } else {
            Arc::new(http::HttpDirectiveStore::new(
                &config.stores.directives_url,
                store_timeout,
            )?)
        };

        Ok(Self {
            agents,
            transcripts,
            directives,
            language_model: Arc::new(http::HttpLanguageModel::new(&config.language_model)?),
            synthesizer: Arc::new(http::HttpSpeechSynthesizer::new(&config.synthesis)?),
            recognizer: Arc::new(DeepgramConnector::new(&config.recognizer)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_accepts_both_casings() {
        let camel: AgentConfig = serde_json::from_str(
            r#"{"language":"es-ES","voiceSelection":"aura","systemPrompt":"Be brief.","firstMessage":"Hola"}"#,
        )
        .unwrap();
        let snake: AgentConfig = serde_json::from_str(
            r#"{"language":"es-ES","voice":"aura","system_prompt":"Be brief.","first_message":"Hola"}"#,
        )
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.first_message, "Hola");
    }

    #[test]
    fn test_collaborators_from_default_config() {
        let config = AppConfig::default();
        assert!(Collaborators::from_config(&config).is_ok());
    }
}
