//! Fake collaborators for unit tests. No network, fully observable.

use super::{
    AgentConfig, AgentStore, Collaborators, DirectiveStore, LanguageModel, LlmQuery,
    SpeechSynthesizer, SynthesisRequest, TranscriptStore,
};
use crate::error::VoiceError;
use crate::recognizer::{LinkCommand, LinkNotice, LinkParams, RecognizerConnector};
use crate::services::memory::{InMemoryTranscriptStore, StaticAgentStore};
use crate::transcript::{NewTranscript, TranscriptEntry, TranscriptHandle};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

pub const AGENT_ID: &str = "agent-1";

pub fn test_agent() -> AgentConfig {
    AgentConfig {
        language: "en-US".to_string(),
        voice_selection: "aura-asteria".to_string(),
        system_prompt: "You are a helpful receptionist.".to_string(),
        first_message: "Hello, how can I help?".to_string(),
    }
}

/// Creates records fine, then fails every write.
#[derive(Default)]
pub struct FailingTranscriptStore {
    appends: AtomicUsize,
}

impl FailingTranscriptStore {
    pub fn append_attempts(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TranscriptStore for FailingTranscriptStore {
    async fn create_session(&self, record: &NewTranscript) -> Result<TranscriptHandle, VoiceError> {
        Ok(TranscriptHandle(format!("failing-{}", record.session_id)))
    }

    async fn append_event(&self, _: &TranscriptHandle, _: &TranscriptEntry) -> Result<(), VoiceError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        Err(VoiceError::Persistence("store offline".to_string()))
    }

    async fn mark_ended(&self, _: &TranscriptHandle, _: DateTime<Utc>) -> Result<(), VoiceError> {
        Err(VoiceError::Persistence("store offline".to_string()))
    }
}

pub struct FakeDirectiveStore {
    reply: Result<Option<String>, VoiceError>,
}

impl FakeDirectiveStore {
    pub fn with(directive: Option<&str>) -> Self {
        Self {
            reply: Ok(directive.map(str::to_string)),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: Err(VoiceError::upstream("directive store", "unreachable")),
        }
    }
}

#[async_trait]
impl DirectiveStore for FakeDirectiveStore {
    async fn default_directive(&self) -> Result<Option<String>, VoiceError> {
        self.reply.clone()
    }
}

/// Replies from a script, then with `"Default reply"`. Records every query.
/// A gated model waits for a permit before answering.
#[derive(Default)]
pub struct ScriptedLanguageModel {
    replies: Mutex<VecDeque<Result<String, VoiceError>>>,
    queries: Mutex<Vec<LlmQuery>>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedLanguageModel {
    pub fn replying(replies: Vec<Result<String, VoiceError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            ..Self::default()
        }
    }

    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let model = Self {
            gate: Some(gate.clone()),
            ..Self::default()
        };
        (model, gate)
    }

    pub fn queries(&self) -> Vec<LlmQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLanguageModel {
    async fn query(&self, request: &LlmQuery) -> Result<String, VoiceError> {
        self.queries.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("Default reply".to_string()))
    }
}

/// Returns `AUDIO:<text>` as the payload, or fails when built with `failing`.
#[derive(Default)]
pub struct RecordingSynthesizer {
    fail: bool,
    requests: Mutex<Vec<SynthesisRequest>>,
}

impl RecordingSynthesizer {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<SynthesisRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>, VoiceError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(VoiceError::upstream("speech synthesis", "voice unavailable"));
        }
        Ok(format!("AUDIO:{}", request.text).into_bytes())
    }
}

/// The test's end of an opened link.
pub struct FakeLink {
    pub params: LinkParams,
    pub commands: mpsc::UnboundedReceiver<LinkCommand>,
    pub notices: mpsc::UnboundedSender<LinkNotice>,
}

impl FakeLink {
    /// Frames received so far, in order.
    pub fn drain_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(command) = self.commands.try_recv() {
            if let LinkCommand::Frame(frame) = command {
                frames.push(frame);
            }
        }
        frames
    }
}

/// Channel-backed connector; never touches the network.
#[derive(Default)]
pub struct FakeRecognizer {
    unconfigured: bool,
    links: Mutex<Vec<FakeLink>>,
}

impl FakeRecognizer {
    pub fn unconfigured() -> Self {
        Self {
            unconfigured: true,
            ..Self::default()
        }
    }

    pub fn take_link(&self) -> FakeLink {
        self.links.lock().unwrap().remove(0)
    }

    /// Opened links not yet taken by the test.
    pub fn pending_links(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

impl RecognizerConnector for FakeRecognizer {
    fn name(&self) -> &str {
        "fake"
    }

    fn open(
        &self,
        params: &LinkParams,
        notices: mpsc::UnboundedSender<LinkNotice>,
    ) -> Result<mpsc::UnboundedSender<LinkCommand>, VoiceError> {
        if self.unconfigured {
            return Err(VoiceError::Configuration(
                "speech recognizer API key is not set".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().unwrap().push(FakeLink {
            params: params.clone(),
            commands: rx,
            notices,
        });
        Ok(tx)
    }
}

/// Concrete handles to every fake, plus the trait-object bundle built from them.
pub struct TestServices {
    pub transcripts: Arc<InMemoryTranscriptStore>,
    pub language_model: Arc<ScriptedLanguageModel>,
    pub synthesizer: Arc<RecordingSynthesizer>,
    pub recognizer: Arc<FakeRecognizer>,
    pub directives: Arc<FakeDirectiveStore>,
}

impl Default for TestServices {
    fn default() -> Self {
        Self {
            transcripts: Arc::new(InMemoryTranscriptStore::default()),
            language_model: Arc::new(ScriptedLanguageModel::default()),
            synthesizer: Arc::new(RecordingSynthesizer::default()),
            recognizer: Arc::new(FakeRecognizer::default()),
            directives: Arc::new(FakeDirectiveStore::with(None)),
        }
    }
}

impl TestServices {
    pub fn collaborators(&self) -> Collaborators {
        let mut agents = HashMap::new();
        agents.insert(AGENT_ID.to_string(), test_agent());
        let agents: Arc<dyn AgentStore> = Arc::new(StaticAgentStore::new(agents));

        Collaborators {
            agents,
            transcripts: self.transcripts.clone(),
            directives: self.directives.clone(),
            language_model: self.language_model.clone(),
            synthesizer: self.synthesizer.clone(),
            recognizer: self.recognizer.clone(),
        }
    }
}
