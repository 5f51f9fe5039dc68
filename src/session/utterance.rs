//! # Utterance Processor
//!
//! Turns one final user utterance into a spoken reply:
//!
//! 1. echo the utterance to the client and the transcript
//! 2. build the system directive (global directive + agent prompt)
//! 3. ask the language model, substituting the apology on failure or an
//!    empty answer
//! 4. send the reply text, then synthesize it and send the audio
//!
//! At most one utterance runs per session. The busy flag lives in
//! [`SessionShared`] and is held by a [`BusyGuard`] for the whole run, so it
//! is released on every exit path. An utterance that arrives while busy is
//! dropped, not queued.

use crate::protocol::{encode_media, ServerEvent};
use crate::services::{AgentConfig, Collaborators, LlmQuery, SynthesisRequest};
use crate::session::{Outbound, SessionShared};
use crate::state::VoiceMetrics;
use crate::transcript::{TranscriptEvent, TranscriptLogger};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-session facts every utterance needs.
#[derive(Debug, Clone)]
pub struct UtteranceContext {
    pub session_id: String,
    pub client_id: String,
    pub agent_id: String,
    pub session_token: Option<String>,
    pub agent: AgentConfig,
    /// Language used for synthesis
    pub language: String,
}

/// Outcome of one processed utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// The apology replaced the model's answer
    pub fell_back: bool,
    /// Audio reached the client
    pub spoken: bool,
}

/// Holds the session's busy flag; dropping it clears the flag.
///
/// ## Rust Concepts:
/// - RAII: the flag is released in `Drop`, so a reply task that returns
///   early, panics or is aborted still frees the session
/// - `acquire` returns `Option<Self>`; owning a guard is proof the flag is held
struct BusyGuard {
    shared: Arc<SessionShared>,
}

impl BusyGuard {
    fn acquire(shared: &Arc<SessionShared>) -> Option<Self> {
        shared.try_acquire_busy().then(|| Self {
            shared: shared.clone(),
        })
    }
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.shared.release_busy();
    }
}

struct ProcessorInner {
    context: UtteranceContext,
    shared: Arc<SessionShared>,
    services: Collaborators,
    transcript: TranscriptLogger,
    outbound: Outbound,
    apology: String,
    metrics: Arc<VoiceMetrics>,
}

#[derive(Clone)]
pub struct UtteranceProcessor {
    inner: Arc<ProcessorInner>,
}

impl UtteranceProcessor {
    pub fn new(
        context: UtteranceContext,
        shared: Arc<SessionShared>,
        services: Collaborators,
        transcript: TranscriptLogger,
        outbound: Outbound,
        apology: String,
        metrics: Arc<VoiceMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(ProcessorInner {
                context,
                shared,
                services,
                transcript,
                outbound,
                apology,
                metrics,
            }),
        }
    }

    /// Start processing `text` in the background.
    ///
    /// ## Returns:
    /// `None` when the utterance was not accepted:
    /// - the text is blank
    /// - another utterance is still running (the drop is logged)
    /// - the session already closed
    pub fn submit(&self, text: &str) -> Option<JoinHandle<Reply>> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let inner = &self.inner;
        if !inner.shared.is_open() {
            return None;
        }

        let Some(guard) = BusyGuard::acquire(&inner.shared) else {
            // Dropped, not queued; the transcript still records what was said
            inner.metrics.utterance_dropped();
            inner.transcript.log(TranscriptEvent::UtteranceDropped {
                text: text.to_string(),
            });
            debug!(
                session_id = %inner.context.session_id,
                utterance = %text,
                "Utterance dropped, session is busy"
            );
            return None;
        };

        // The guard moves into the task and lives exactly as long as the run
        let this = self.clone();
        let text = text.to_string();
        Some(tokio::spawn(async move { this.run(text, guard).await }))
    }

    async fn run(&self, utterance: String, _busy: BusyGuard) -> Reply {
        let inner = &self.inner;
        let ctx = &inner.context;
        info!(session_id = %ctx.session_id, utterance = %utterance, "Processing utterance");

        // Echo first, so the client shows what was heard before the reply
        inner.outbound.send(ServerEvent::user_message(utterance.as_str()));
        inner.transcript.log(TranscriptEvent::UserMessage {
            text: utterance.clone(),
        });

        // Fetched per utterance so directive edits apply mid-call
        let global = match inner.services.directives.default_directive().await {
            Ok(directive) => directive,
            Err(err) => {
                warn!(session_id = %ctx.session_id, error = %err, "Default directive unavailable");
                None
            }
        };

        let query = LlmQuery {
            session_id: ctx.session_id.clone(),
            client_id: ctx.client_id.clone(),
            agent_id: ctx.agent_id.clone(),
            session_token: ctx.session_token.clone(),
            query: utterance,
            system_prompt: compose_directive(global.as_deref(), &ctx.agent.system_prompt),
        };

        // Whitespace-only counts as empty; anything else is spoken as returned
        let (text, fell_back) = match inner.services.language_model.query(&query).await {
            Ok(answer) if !answer.trim().is_empty() => (answer, false),
            Ok(_) => {
                warn!(session_id = %ctx.session_id, "Language model returned an empty reply");
                (inner.apology.clone(), true)
            }
            Err(err) => {
                warn!(session_id = %ctx.session_id, error = %err, "Language model call failed");
                inner.transcript.log_error(&err);
                (inner.apology.clone(), true)
            }
        };
        if fell_back {
            inner.metrics.llm_fallback();
        }

        let spoken = self.speak(&text).await;
        inner.metrics.utterance_processed();

        Reply {
            text,
            fell_back,
            spoken,
        }
    }

    /// Speak the agent's greeting, if it has one. Does not take the busy flag.
    pub fn greet(&self) -> Option<JoinHandle<bool>> {
        let greeting = self.inner.context.agent.first_message.trim();
        if greeting.is_empty() {
            return None;
        }

        let this = self.clone();
        let greeting = greeting.to_string();
        Some(tokio::spawn(async move { this.speak(&greeting).await }))
    }

    /// Send reply text, then its audio. Returns whether audio was sent.
    async fn speak(&self, text: &str) -> bool {
        let inner = &self.inner;
        let ctx = &inner.context;

        inner.outbound.send(ServerEvent::ai_response(text));
        inner.transcript.log(TranscriptEvent::AiResponse {
            text: text.to_string(),
        });

        // Text goes out even when synthesis fails below
        let request = SynthesisRequest {
            text: text.to_string(),
            language: ctx.language.clone(),
            voice: ctx.agent.voice_selection.clone(),
        };

        match inner.services.synthesizer.synthesize(&request).await {
            Ok(audio) => {
                debug!(session_id = %ctx.session_id, bytes = audio.len(), "Sending synthesized audio");
                inner.outbound.send(ServerEvent::Media {
                    payload: encode_media(&audio),
                });
                true
            }
            Err(err) => {
                warn!(session_id = %ctx.session_id, error = %err, "Speech synthesis failed");
                inner.metrics.synthesis_failed();
                inner.transcript.log_error(&err);
                false
            }
        }
    }
}

/// Join the global directive and the agent prompt with a blank line,
/// skipping whichever is empty.
pub fn compose_directive(global: Option<&str>, agent_prompt: &str) -> String {
    [global.unwrap_or_default(), agent_prompt]
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}
