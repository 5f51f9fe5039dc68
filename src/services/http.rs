//! # HTTP Collaborator Clients
//!
//! `reqwest`-backed implementations of the collaborator traits. Each client
//! owns its own `reqwest::Client` with a request timeout, so a hung service
//! surfaces as an `Upstream` error instead of stalling a session forever.
//!
//! ## Endpoints:
//! - Agents: `GET {agents_url}/{agent_id}` → agent JSON (404 = unknown agent).
//!   The agent id comes from the call client, so it is appended as a single
//!   percent-encoded path segment and can never add segments or a query.
//! - Transcripts: `POST {url}` → `{ "id": ... }`, `POST {url}/{id}/events`,
//!   `POST {url}/{id}/end`
//! - Directive: `GET {url}` → `{ "directive": ... }` (404 = none)
//! - Language model: `POST {url}` → `{ "response": ... }`
//! - Synthesis: `POST {url}` → raw audio body

use super::{
    AgentConfig, AgentStore, DirectiveStore, LanguageModel, LlmQuery, SpeechSynthesizer,
    SynthesisRequest, TranscriptStore,
};
use crate::config::ServiceEndpoint;
use crate::error::VoiceError;
use crate::transcript::{NewTranscript, TranscriptEntry, TranscriptHandle};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

fn build_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("voice-bridge/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}

/// Parse a store base URL that path segments can be appended to.
fn base_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).with_context(|| format!("invalid store URL '{}'", url))?;
    if parsed.cannot_be_a_base() {
        anyhow::bail!("store URL '{}' cannot take a path", url);
    }
    Ok(parsed)
}

/// `base` with `segments` appended, each one percent-encoded (`/` and `?`
/// included). `None` for segments that would not name a child of `base`.
fn child_url(base: &Url, segments: &[&str]) -> Option<Url> {
    if segments
        .iter()
        .any(|segment| segment.is_empty() || *segment == "." || *segment == "..")
    {
        return None;
    }

    let mut url = base.clone();
    // `pop_if_empty` turns `.../agents/` + `id` into `.../agents/id`
    url.path_segments_mut().ok()?.pop_if_empty().extend(segments);
    Some(url)
}

pub struct HttpAgentStore {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpAgentStore {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url(base)?,
        })
    }
}

#[async_trait]
impl AgentStore for HttpAgentStore {
    async fn fetch_agent(&self, agent_id: &str) -> Result<AgentConfig, VoiceError> {
        let url = child_url(&self.base_url, &[agent_id])
            .ok_or_else(|| VoiceError::NotFound(format!("agent '{}'", agent_id)))?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| VoiceError::Configuration(format!("agent store unavailable: {}", e)))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(VoiceError::NotFound(format!("agent '{}'", agent_id)));
        }

        response
            .error_for_status()
            .map_err(|e| VoiceError::Configuration(format!("agent store error: {}", e)))?
            .json::<AgentConfig>()
            .await
            .map_err(|e| VoiceError::Configuration(format!("invalid agent record: {}", e)))
    }
}

pub struct HttpTranscriptStore {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpTranscriptStore {
    pub fn new(base: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url(base)?,
        })
    }

    /// `{base}/{id}/{action}` for one transcript record.
    fn record_url(&self, handle: &TranscriptHandle, action: &str) -> Result<Url, VoiceError> {
        child_url(&self.base_url, &[handle.0.as_str(), action])
            .ok_or_else(|| VoiceError::Persistence(format!("invalid transcript id '{}'", handle.0)))
    }
}

#[derive(Deserialize)]
struct CreatedTranscript {
    id: String,
}

fn persistence(err: reqwest::Error) -> VoiceError {
    VoiceError::Persistence(err.to_string())
}

#[async_trait]
impl TranscriptStore for HttpTranscriptStore {
    async fn create_session(&self, record: &NewTranscript) -> Result<TranscriptHandle, VoiceError> {
        // Transport errors and non-2xx statuses both become `Persistence`
        let created: CreatedTranscript = self
            .client
            .post(self.base_url.clone())
            .json(record)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(persistence)?
            .json()
            .await
            .map_err(persistence)?;
        Ok(TranscriptHandle(created.id))
    }

    async fn append_event(
        &self,
        handle: &TranscriptHandle,
        entry: &TranscriptEntry,
    ) -> Result<(), VoiceError> {
        self.client
            .post(self.record_url(handle, "events")?)
            .json(entry)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(persistence)?;
        Ok(())
    }

    async fn mark_ended(
        &self,
        handle: &TranscriptHandle,
        ended_at: DateTime<Utc>,
    ) -> Result<(), VoiceError> {
        self.client
            .post(self.record_url(handle, "end")?)
            .json(&json!({ "endedAt": ended_at }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(persistence)?;
        Ok(())
    }
}

pub struct HttpDirectiveStore {
    client: reqwest::Client,
    url: String,
}

impl HttpDirectiveStore {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.to_string(),
        })
    }
}

/// Accepts the field names the directive services in use return.
#[derive(Deserialize)]
struct DirectiveRecord {
    #[serde(default, alias = "systemPrompt", alias = "prompt")]
    directive: Option<String>,
}

#[async_trait]
impl DirectiveStore for HttpDirectiveStore {
    async fn default_directive(&self) -> Result<Option<String>, VoiceError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| VoiceError::upstream("directive store", e))?;

        // No directive configured upstream
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let record: DirectiveRecord = response
            .error_for_status()
            .map_err(|e| VoiceError::upstream("directive store", e))?
            .json()
            .await
            .map_err(|e| VoiceError::upstream("directive store", e))?;

        Ok(record.directive.filter(|d| !d.trim().is_empty()))
    }
}

pub struct HttpLanguageModel {
    client: reqwest::Client,
    url: String,
}

impl HttpLanguageModel {
    pub fn new(endpoint: &ServiceEndpoint) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(endpoint.timeout_secs))?,
            url: endpoint.url.clone(),
        })
    }
}

/// A reply without any of these fields is an `Upstream` error.
#[derive(Deserialize)]
struct LlmReply {
    #[serde(default, alias = "answer", alias = "text")]
    response: Option<String>,
}

#[async_trait]
impl LanguageModel for HttpLanguageModel {
    async fn query(&self, request: &LlmQuery) -> Result<String, VoiceError> {
        let reply: LlmReply = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| VoiceError::upstream("language model", e))?
            .json()
            .await
            .map_err(|e| VoiceError::upstream("language model", format!("malformed response: {}", e)))?;

        reply
            .response
            .ok_or_else(|| VoiceError::upstream("language model", "response field missing"))
    }
}

pub struct HttpSpeechSynthesizer {
    client: reqwest::Client,
    url: String,
}

impl HttpSpeechSynthesizer {
    pub fn new(endpoint: &ServiceEndpoint) -> Result<Self> {
        Ok(Self {
            client: build_client(Duration::from_secs(endpoint.timeout_secs))?,
            url: endpoint.url.clone(),
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for HttpSpeechSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, VoiceError> {
        let audio = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| VoiceError::upstream("speech synthesis", e))?
            .bytes()
            .await
            .map_err(|e| VoiceError::upstream("speech synthesis", e))?;

        if audio.is_empty() {
            return Err(VoiceError::upstream("speech synthesis", "empty audio payload"));
        }
        Ok(audio.to_vec())
    }
}
