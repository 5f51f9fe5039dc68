//! # Session Orchestrator
//!
//! Per-connection state machine. Owned by exactly one session task, so no
//! field here is shared except through [`SessionShared`].
//!
//! ## Lifecycle:
//! ```text
//! Uninitialized --start--> Active --stop / transport close--> Closing --> Closed
//! ```
//! - `start` fetches the agent, registers the session, opens the transcript
//!   and the recognizer link, acknowledges, then speaks the greeting.
//! - `media` is buffered into 100 ms frames and forwarded (or queued until the
//!   link is ready). Without a link the audio is dropped.
//! - A recognizer link that drops is reopened up to
//!   `recognizer.max_reconnects` times; the backlog reaches the new link in
//!   order. When the attempts run out the session carries on without live
//!   transcription, like a session that never had a credential.
//! - Final transcripts that differ from the previous final one trigger the
//!   utterance processor.
//! - Teardown is idempotent. Anything arriving after it is ignored.

use crate::audio::{AudioAccumulator, AudioFormat};
use crate::config::AppConfig;
use crate::error::VoiceError;
use crate::protocol::{decode_media, ClientEvent, LogLevel, ServerEvent, StartPayload};
use crate::recognizer::{
    FrameOutcome, LinkNotice, LinkParams, RecognizerEvent, RecognizerLink,
};
use crate::services::Collaborators;
use crate::session::registry::{SessionRegistry, SessionShared};
use crate::session::utterance::{UtteranceContext, UtteranceProcessor};
use crate::session::Outbound;
use crate::state::VoiceMetrics;
use crate::transcript::{NewTranscript, TranscriptEvent, TranscriptLogger};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Closing,
    Closed,
}

/// Everything that exists only while the session is active.
struct ActiveSession {
    shared: Arc<SessionShared>,
    transcript: TranscriptLogger,
    /// `None` in degraded mode
    link: Option<RecognizerLink>,
    /// Kept for reopening the link
    link_params: LinkParams,
    /// Reopen attempts since the link was last ready
    reconnects: u32,
    accumulator: AudioAccumulator,
    last_final_transcript: Option<String>,
    processor: UtteranceProcessor,
}

pub struct SessionOrchestrator {
    connection_id: String,
    state: SessionState,
    config: Arc<AppConfig>,
    services: Collaborators,
    registry: SessionRegistry,
    metrics: Arc<VoiceMetrics>,
    outbound: Outbound,
    session: Option<ActiveSession>,
    link_notices: Option<mpsc::UnboundedReceiver<LinkNotice>>,
}

impl SessionOrchestrator {
    pub fn new(
        connection_id: String,
        config: Arc<AppConfig>,
        services: Collaborators,
        registry: SessionRegistry,
        metrics: Arc<VoiceMetrics>,
        outbound: Outbound,
    ) -> Self {
        Self {
            connection_id,
            state: SessionState::Uninitialized,
            config,
            services,
            registry,
            metrics,
            outbound,
            session: None,
            link_notices: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    #[cfg(test)]
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.shared.session_id.as_str())
    }

    /// Hand the link's notice receiver to the session task. A reopened link
    /// produces a new receiver that replaces the old one.
    pub fn take_link_notices(&mut self) -> Option<mpsc::UnboundedReceiver<LinkNotice>> {
        self.link_notices.take()
    }

    pub async fn handle_client_event(&mut self, event: ClientEvent) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            debug!(connection_id = %self.connection_id, event = event.name(), "Ignoring event after teardown");
            return;
        }
        if let Some(session) = &self.session {
            session.shared.touch();
        }

        match event {
            ClientEvent::Start(payload) => self.handle_start(payload).await,
            ClientEvent::Media { payload } => self.handle_media(&payload),
            ClientEvent::UserMessage { text } => self.handle_user_message(&text),
            ClientEvent::Stop => self.teardown("client stop", true).await,
        }
    }

    /// The transport went away (client close, heartbeat timeout, error).
    pub async fn handle_transport_closed(&mut self) {
        self.teardown("transport closed", false).await;
        self.state = SessionState::Closed;
    }

    /// A frame from the client could not be parsed.
    pub fn report_protocol_error(&self, err: &VoiceError) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.metrics.protocol_error();
        warn!(connection_id = %self.connection_id, error = %err, "Protocol error");
        self.outbound.send(ServerEvent::error(err.to_string()));
        if let Some(session) = &self.session {
            // A frame that failed to parse is still a sign of life
            session.shared.touch();
            session.transcript.log_error(err);
        }
    }

    /// `uninitialized → active`.
    ///
    /// ## Steps:
    /// 1. Resolve the agent; an unknown id rejects the start
    /// 2. Register under the connection id; a full registry rejects the start
    /// 3. Open the transcript and log the start with the auxiliary data
    /// 4. Acknowledge with `start`
    /// 5. Open the recognizer link, or enter degraded mode without one
    /// 6. Speak the greeting
    ///
    /// Nothing is registered or opened when steps 1 or 2 fail.
    async fn handle_start(&mut self, payload: StartPayload) {
        if self.state == SessionState::Active {
            self.report_protocol_error(&VoiceError::Protocol(
                "session already started on this connection".to_string(),
            ));
            return;
        }

        let agent_id = payload.agent_id.trim().to_string();
        if agent_id.is_empty() {
            self.report_protocol_error(&VoiceError::Protocol("agentId is required".to_string()));
            return;
        }

        let agent = match self.services.agents.fetch_agent(&agent_id).await {
            Ok(agent) => agent,
            Err(err) => return self.reject_start(&agent_id, err),
        };

        // Undecodable auxiliary data is logged inside and treated as absent
        let aux = payload.auxiliary();
        let session_id = Uuid::new_v4().to_string();
        let shared = Arc::new(SessionShared::new(
            &self.connection_id,
            &session_id,
            &agent_id,
            &payload.client_id,
        ));
        if let Err(err) = self.registry.register(shared.clone()).await {
            return self.reject_start(&agent_id, err);
        }

        // From here on the session exists; every failure below degrades
        // instead of rejecting

        let (transcript, _, _) = TranscriptLogger::open(
            self.services.transcripts.clone(),
            NewTranscript {
                session_id: session_id.clone(),
                agent_id: agent_id.clone(),
                client_id: payload.client_id.clone(),
                started_at: shared.started_at,
            },
        )
        .await;
        transcript.log(TranscriptEvent::SessionStarted {
            agent_id: agent_id.clone(),
            client_id: payload.client_id.clone(),
            metadata: aux.extra,
        });

        // Agent language wins, the recognizer default fills the gap
        let language = if agent.language.trim().is_empty() {
            self.config.recognizer.default_language.clone()
        } else {
            agent.language.clone()
        };

        let processor = UtteranceProcessor::new(
            UtteranceContext {
                session_id: session_id.clone(),
                client_id: payload.client_id.clone(),
                agent_id: agent_id.clone(),
                session_token: aux.session_token,
                agent,
                language: language.clone(),
            },
            shared.clone(),
            self.services.clone(),
            transcript.clone(),
            self.outbound.clone(),
            self.config.session.apology_text.clone(),
            self.metrics.clone(),
        );

        // The ack goes out before the greeting is even synthesized
        self.outbound.send(ServerEvent::Start {
            session_id: session_id.clone(),
            client_id: payload.client_id.clone(),
        });

        let format = AudioFormat::from(&self.config.audio);
        let threshold = format.bytes_for_duration(self.config.audio.flush_interval_ms);
        let link_params = LinkParams {
            format,
            language: language.clone(),
        };

        // `open` returns before the handshake; `Opened` arrives as a notice
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();
        let opened = self.services.recognizer.open(&link_params, notice_tx);

        let (link, link_error) = match opened {
            Ok(commands) => {
                self.link_notices = Some(notice_rx);
                (Some(RecognizerLink::new(commands)), None)
            }
            Err(err) => {
                shared.set_degraded();
                (None, Some(err))
            }
        };

        self.session = Some(ActiveSession {
            shared,
            transcript,
            link,
            link_params,
            reconnects: 0,
            accumulator: AudioAccumulator::new(threshold),
            last_final_transcript: None,
            processor,
        });
        self.state = SessionState::Active;
        self.metrics.session_started();

        self.diagnostic(
            LogLevel::Info,
            "Session started",
            json!({
                "sessionId": session_id,
                "agentId": agent_id,
                "clientId": payload.client_id,
                "language": language,
                "frameBytes": threshold,
            }),
        );

        match link_error {
            Some(err) => {
                if let Some(session) = &self.session {
                    session.transcript.log_error(&err);
                }
                self.diagnostic(
                    LogLevel::Error,
                    "Speech recognition unavailable, call audio will be dropped",
                    json!({ "kind": err.kind(), "error": err.to_string() }),
                );
            }
            None => self.diagnostic(
                LogLevel::Info,
                "Connecting to speech recognizer",
                json!({ "provider": self.services.recognizer.name() }),
            ),
        }

        // Fire and forget: the greeting task reports its own failures
        if let Some(session) = &self.session {
            session.processor.greet();
        }
    }

    fn reject_start(&self, agent_id: &str, err: VoiceError) {
        self.metrics.start_failed();
        warn!(
            connection_id = %self.connection_id,
            agent_id = %agent_id,
            error = %err,
            "Session start rejected"
        );
        self.outbound.send(ServerEvent::error(err.to_string()));
    }

    fn handle_media(&mut self, payload: &str) {
        if self.state != SessionState::Active {
            debug!(connection_id = %self.connection_id, "Media before start ignored");
            return;
        }

        let audio = match decode_media(payload) {
            Ok(audio) => audio,
            Err(err) => return self.report_protocol_error(&err),
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let shared = &session.shared;

        // Degraded: no recognizer, nothing to buffer for
        let Some(link) = session.link.as_mut() else {
            shared.record_dropped(audio.len());
            self.metrics.audio_dropped(audio.len());
            return;
        };

        shared.record_received(audio.len());
        // Whole frames only; the remainder waits in the accumulator
        let mut forwarded = 0;
        for frame in session.accumulator.push(audio) {
            let len = frame.len();
            if link.send_frame(frame) == FrameOutcome::Forwarded {
                shared.record_forwarded(len);
                forwarded += 1;
            }
        }
        self.metrics.frames_forwarded(forwarded);
        shared.set_pending(session.accumulator.pending_bytes() + link.queued_bytes());
    }

    fn handle_user_message(&mut self, text: &str) {
        if self.state != SessionState::Active {
            return;
        }
        if let Some(session) = &self.session {
            session.processor.submit(text);
        }
    }

    pub async fn handle_link_notice(&mut self, notice: LinkNotice) {
        if self.state != SessionState::Active {
            return;
        }

        match notice {
            LinkNotice::Opened => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let Some(link) = session.link.as_mut() else {
                    return;
                };
                let flushed = link.mark_ready();
                session.reconnects = 0;
                session.shared.set_recognizer_ready(true);
                session.shared.record_forwarded(flushed.bytes);
                session
                    .shared
                    .set_pending(session.accumulator.pending_bytes() + link.queued_bytes());
                self.metrics.frames_forwarded(flushed.frames);
                let flushed_ms = session.link_params.format.duration_ms(flushed.bytes);

                self.diagnostic(
                    LogLevel::Info,
                    "Speech recognizer connected",
                    json!({
                        "flushedFrames": flushed.frames,
                        "flushedBytes": flushed.bytes,
                        "flushedMs": flushed_ms,
                    }),
                );
            }
            LinkNotice::Event(RecognizerEvent::Transcript { text, is_final }) => {
                self.handle_transcript(&text, is_final);
            }
            LinkNotice::Event(RecognizerEvent::Other { kind }) => {
                debug!(connection_id = %self.connection_id, kind = %kind, "Recognizer event");
            }
            LinkNotice::Closed { reason } => self.handle_link_closed(reason),
        }
    }

    /// The upstream link ended. The session stays up: audio keeps queueing
    /// while a new link is opened, and typed messages are answered as usual.
    fn handle_link_closed(&mut self, reason: Option<String>) {
        let max_reconnects = self.config.recognizer.max_reconnects;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        // Degraded already, or a late close from a link given up on
        let Some(link) = session.link.as_mut() else {
            return;
        };

        let was_ready = link.mark_closed();
        session.shared.set_recognizer_ready(false);
        let queued_frames = link.queued_frames();

        let mut reopen_error = None;
        if session.reconnects < max_reconnects {
            session.reconnects += 1;
            let attempt = session.reconnects;

            let (notice_tx, notice_rx) = mpsc::unbounded_channel();
            match self.services.recognizer.open(&session.link_params, notice_tx) {
                Ok(commands) => {
                    link.reattach(commands);
                    self.link_notices = Some(notice_rx);
                    self.diagnostic(
                        LogLevel::Warn,
                        "Speech recognizer link closed, reconnecting",
                        json!({
                            "reason": reason,
                            "wasReady": was_ready,
                            "attempt": attempt,
                            "queuedFrames": queued_frames,
                        }),
                    );
                    return;
                }
                Err(err) => reopen_error = Some(err),
            }
        }

        // Out of attempts: drop the backlog and run like a session without
        // a credential
        let discarded = link.close();
        session.link = None;
        session.shared.set_degraded();
        session.shared.record_dropped(discarded);
        session.shared.set_pending(session.accumulator.pending_bytes());
        self.metrics.audio_dropped(discarded);

        if let Some(err) = &reopen_error {
            session.transcript.log_error(err);
        }
        self.diagnostic(
            LogLevel::Error,
            "Speech recognizer link lost, call audio will be dropped",
            json!({
                "reason": reason,
                "reconnects": max_reconnects,
                "discardedBytes": discarded,
                "error": reopen_error.map(|e| e.to_string()),
            }),
        );
    }

    fn handle_transcript(&mut self, text: &str, is_final: bool) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };

        self.outbound.send(ServerEvent::Transcript {
            text: text.to_string(),
            is_final,
        });
        session.transcript.log(TranscriptEvent::Transcript {
            text: text.to_string(),
            is_final,
        });

        if !is_final {
            return;
        }
        if session.last_final_transcript.as_deref() == Some(text) {
            debug!(connection_id = %self.connection_id, transcript = %text, "Duplicate final transcript ignored");
            return;
        }
        session.last_final_transcript = Some(text.to_string());
        session.processor.submit(text);
    }

    /// Close the link, finish the transcript and leave the registry. Runs at
    /// most once; `acknowledge` sends the `stop` event.
    async fn teardown(&mut self, reason: &str, acknowledge: bool) {
        if self.state != SessionState::Active {
            return;
        }
        self.state = SessionState::Closing;

        self.diagnostic(LogLevel::Info, "Session stopping", json!({ "reason": reason }));

        // Taking the session out makes every later event a no-op
        if let Some(mut session) = self.session.take() {
            // Immediate close; queued frames are not drained
            if let Some(link) = session.link.as_mut() {
                link.close();
            }
            session.accumulator.clear();
            session.shared.close();
            session.shared.set_pending(0);

            session.transcript.log(TranscriptEvent::SessionStopped {
                reason: reason.to_string(),
            });
            session.transcript.end();

            self.registry.remove(&self.connection_id).await;
            self.metrics.session_ended();

            if acknowledge {
                self.outbound.send(ServerEvent::Stop {
                    session_id: session.shared.session_id.clone(),
                });
            }
            info!(
                connection_id = %self.connection_id,
                session_id = %session.shared.session_id,
                reason = %reason,
                audio_received = session.accumulator.received_bytes(),
                audio_framed = session.accumulator.framed_bytes(),
                "Session closed"
            );
        }

        self.link_notices = None;
        self.state = SessionState::Closed;
    }

    /// Trace locally, tell the client, and record in the transcript.
    fn diagnostic(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        match level {
            LogLevel::Error => error!(connection_id = %self.connection_id, %metadata, "{}", message),
            LogLevel::Warn => warn!(connection_id = %self.connection_id, %metadata, "{}", message),
            LogLevel::Info => info!(connection_id = %self.connection_id, %metadata, "{}", message),
            LogLevel::Debug => debug!(connection_id = %self.connection_id, %metadata, "{}", message),
        }

        self.outbound.send(ServerEvent::Log {
            level,
            message: message.to_string(),
            metadata: metadata.clone(),
        });
        if let Some(session) = &self.session {
            session.transcript.log(TranscriptEvent::Log {
                level,
                message: message.to_string(),
                metadata,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::encode_media;
    use crate::services::testing::{FakeLink, FakeRecognizer, TestServices, AGENT_ID};
    use crate::transcript::TranscriptEntry;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    struct Harness {
        orchestrator: SessionOrchestrator,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        registry: SessionRegistry,
        services: TestServices,
    }

    fn harness_with(services: TestServices, config: AppConfig) -> Harness {
        let registry = SessionRegistry::new(config.session.max_concurrent_sessions);
        let (outbound, events) = Outbound::channel();
        let orchestrator = SessionOrchestrator::new(
            "conn-1".to_string(),
            Arc::new(config),
            services.collaborators(),
            registry.clone(),
            Arc::new(VoiceMetrics::default()),
            outbound,
        );
        Harness {
            orchestrator,
            events,
            registry,
            services,
        }
    }

    fn harness() -> Harness {
        harness_with(TestServices::default(), AppConfig::default())
    }

    fn start_event(agent_id: &str) -> ClientEvent {
        ClientEvent::Start(StartPayload {
            agent_id: agent_id.to_string(),
            client_id: "client-1".to_string(),
            data: Some(BASE64.encode(r#"{"sessionToken":"tok-1"}"#)),
        })
    }

    fn media(bytes: usize, fill: u8) -> ClientEvent {
        ClientEvent::Media {
            payload: encode_media(&vec![fill; bytes]),
        }
    }

    impl Harness {
        async fn start(&mut self) -> FakeLink {
            self.orchestrator.handle_client_event(start_event(AGENT_ID)).await;
            assert_eq!(self.orchestrator.state(), SessionState::Active);
            self.services.recognizer.take_link()
        }

        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        /// Let spawned utterance and greeting tasks run to completion.
        async fn settle(&mut self) -> Vec<ServerEvent> {
            for _ in 0..50 {
                tokio::task::yield_now().await;
            }
            self.drain()
        }

        async fn transcript_entries(&self) -> Vec<TranscriptEntry> {
            let session_id = self.orchestrator.session_id().unwrap().to_string();
            let handle = self
                .services
                .transcripts
                .handle_for_session(&session_id)
                .await
                .unwrap();
            self.services.transcripts.entries(&handle).await
        }
    }

    #[tokio::test]
    async fn test_start_acknowledges_then_greets() {
        let mut h = harness();
        let _link = h.start().await;

        let events = h.settle().await;
        let ack = events
            .iter()
            .position(|e| matches!(e, ServerEvent::Start { client_id, .. } if client_id == "client-1"))
            .expect("start ack");
        let greeting = events
            .iter()
            .position(|e| matches!(e, ServerEvent::Media { .. }))
            .expect("greeting audio");
        assert!(ack < greeting);
        assert!(events.contains(&ServerEvent::ai_response("Hello, how can I help?")));

        let session_id = h.orchestrator.session_id().unwrap().to_string();
        assert_eq!(h.registry.find("conn-1").await.unwrap().session_id, session_id);
    }

    #[tokio::test]
    async fn test_unknown_agent_is_rejected() {
        let mut h = harness();
        h.orchestrator.handle_client_event(start_event("ghost")).await;

        assert_eq!(h.orchestrator.state(), SessionState::Uninitialized);
        assert_eq!(h.registry.len().await, 0);
        assert_eq!(h.services.recognizer.pending_links(), 0);

        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], ServerEvent::Error { message } if message.contains("ghost")));
    }

    #[tokio::test]
    async fn test_frames_queue_until_ready_then_forward() {
        let mut h = harness();
        let mut link = h.start().await;
        assert_eq!(link.params.format.sample_rate, 8000);
        assert_eq!(link.params.language, "en-US");

        // 3200 bytes before the link is ready: two full frames, queued
        h.orchestrator.handle_client_event(media(1000, 1)).await;
        h.orchestrator.handle_client_event(media(2200, 2)).await;
        assert!(link.drain_frames().is_empty());

        h.orchestrator.handle_link_notice(LinkNotice::Opened).await;
        let flushed = link.drain_frames();
        assert_eq!(flushed.len(), 2);
        assert!(flushed.iter().all(|f| f.len() == 1600));
        assert_eq!(&flushed[0][..1000], &vec![1u8; 1000][..]);
        assert_eq!(&flushed[0][1000..], &vec![2u8; 600][..]);

        // Once ready, every full frame goes straight through
        h.orchestrator.handle_client_event(media(1500, 3)).await;
        assert!(link.drain_frames().is_empty());
        h.orchestrator.handle_client_event(media(100, 3)).await;
        assert_eq!(link.drain_frames(), vec![vec![3u8; 1600]]);

        let snapshot = h.registry.find("conn-1").await.unwrap();
        assert!(snapshot.recognizer_ready);
        assert_eq!(snapshot.bytes_forwarded, 4800);
        assert_eq!(snapshot.bytes_pending, 0);
    }

    #[tokio::test]
    async fn test_duplicate_final_processed_once_but_logged_twice() {
        let mut h = harness();
        let _link = h.start().await;
        h.settle().await;

        let final_event = |text: &str| {
            LinkNotice::Event(RecognizerEvent::Transcript {
                text: text.to_string(),
                is_final: true,
            })
        };
        h.orchestrator.handle_link_notice(final_event("What are your hours")).await;
        h.settle().await;
        h.orchestrator.handle_link_notice(final_event(" What are your hours ")).await;
        let events = h.settle().await;

        let queries = h.services.language_model.queries();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].query, "What are your hours");
        assert_eq!(queries[0].session_token.as_deref(), Some("tok-1"));
        assert!(events.contains(&ServerEvent::Transcript {
            text: "What are your hours".to_string(),
            is_final: true
        }));

        let logged = h
            .transcript_entries()
            .await
            .into_iter()
            .filter(|e| matches!(&e.event, TranscriptEvent::Transcript { is_final: true, .. }))
            .count();
        assert_eq!(logged, 2);
    }

    #[tokio::test]
    async fn test_interim_and_empty_hypotheses_do_not_trigger_replies() {
        let mut h = harness();
        let _link = h.start().await;
        h.settle().await;

        h.orchestrator
            .handle_link_notice(LinkNotice::Event(RecognizerEvent::Transcript {
                text: "what are".to_string(),
                is_final: false,
            }))
            .await;
        h.orchestrator
            .handle_link_notice(LinkNotice::Event(RecognizerEvent::Transcript {
                text: "  ".to_string(),
                is_final: true,
            }))
            .await;
        let events = h.settle().await;

        assert!(h.services.language_model.queries().is_empty());
        let transcripts: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, ServerEvent::Transcript { .. }))
            .collect();
        assert_eq!(transcripts.len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_mode_drops_audio() {
        let services = TestServices {
            recognizer: Arc::new(FakeRecognizer::unconfigured()),
            ..TestServices::default()
        };
        let mut h = harness_with(services, AppConfig::default());
        h.orchestrator.handle_client_event(start_event(AGENT_ID)).await;
        assert_eq!(h.orchestrator.state(), SessionState::Active);

        let events = h.drain();
        assert!(events.iter().any(|e| matches!(e, ServerEvent::Start { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Log { level: LogLevel::Error, .. })));

        h.orchestrator.handle_client_event(media(3200, 7)).await;
        let snapshot = h.registry.find("conn-1").await.unwrap();
        assert!(snapshot.degraded);
        assert_eq!(snapshot.bytes_dropped, 3200);
        assert_eq!(snapshot.bytes_forwarded, 0);
        assert!(h.orchestrator.take_link_notices().is_none());

        // Typed messages still get answers
        h.orchestrator
            .handle_client_event(ClientEvent::UserMessage {
                text: "anyone there?".to_string(),
            })
            .await;
        h.settle().await;
        assert_eq!(h.services.language_model.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let mut h = harness();
        let mut link = h.start().await;
        h.orchestrator.handle_link_notice(LinkNotice::Opened).await;
        let session_id = h.orchestrator.session_id().unwrap().to_string();
        h.settle().await;

        h.orchestrator.handle_client_event(ClientEvent::Stop).await;
        assert_eq!(h.orchestrator.state(), SessionState::Closed);
        assert_eq!(h.registry.len().await, 0);

        let events = h.drain();
        assert_eq!(
            events.last(),
            Some(&ServerEvent::Stop {
                session_id: session_id.clone()
            })
        );
        assert!(matches!(link.commands.try_recv(), Ok(crate::recognizer::LinkCommand::Close)));

        // Everything afterwards is a no-op
        h.orchestrator.handle_client_event(ClientEvent::Stop).await;
        h.orchestrator.handle_client_event(media(3200, 1)).await;
        h.orchestrator.handle_transport_closed().await;
        assert!(h.drain().is_empty());
        assert!(link.drain_frames().is_empty());

        let handle = h
            .services
            .transcripts
            .handle_for_session(&session_id)
            .await
            .unwrap();
        h.settle().await;
        assert!(h.services.transcripts.is_ended(&handle).await);
    }

    #[tokio::test]
    async fn test_transport_close_tears_down_without_ack() {
        let mut h = harness();
        let _link = h.start().await;
        h.drain();

        h.orchestrator.handle_transport_closed().await;
        assert!(h.orchestrator.is_closed());
        assert_eq!(h.registry.len().await, 0);
        assert!(!h
            .drain()
            .iter()
            .any(|e| matches!(e, ServerEvent::Stop { .. })));
    }

    #[tokio::test]
    async fn test_malformed_media_and_second_start() {
        let mut h = harness();
        let _link = h.start().await;
        h.drain();

        h.orchestrator
            .handle_client_event(ClientEvent::Media {
                payload: "***".to_string(),
            })
            .await;
        h.orchestrator.handle_client_event(start_event(AGENT_ID)).await;

        let errors: Vec<_> = h
            .drain()
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::Error { .. }))
            .collect();
        assert_eq!(errors.len(), 2);
        assert_eq!(h.orchestrator.state(), SessionState::Active);
        assert_eq!(h.services.recognizer.pending_links(), 0);
    }

    #[tokio::test]
    async fn test_capacity_rejects_start() {
        let mut config = AppConfig::default();
        config.session.max_concurrent_sessions = 1;
        let mut h = harness_with(TestServices::default(), config);
        h.registry
            .register(Arc::new(SessionShared::new("other", "s0", AGENT_ID, "c0")))
            .await
            .unwrap();

        h.orchestrator.handle_client_event(start_event(AGENT_ID)).await;
        assert_eq!(h.orchestrator.state(), SessionState::Uninitialized);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, ServerEvent::Error { .. })));
    }

    #[tokio::test]
    async fn test_typed_messages_are_not_deduplicated() {
        let mut h = harness();
        let _link = h.start().await;
        h.settle().await;

        for _ in 0..2 {
            h.orchestrator
                .handle_client_event(ClientEvent::UserMessage {
                    text: "same question".to_string(),
                })
                .await;
            h.settle().await;
        }

        assert_eq!(h.services.language_model.queries().len(), 2);
        let replies = h
            .transcript_entries()
            .await
            .into_iter()
            .filter(|e| e.event == TranscriptEvent::AiResponse { text: "Default reply".to_string() })
            .count();
        assert_eq!(replies, 2);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_ignored() {
        let mut h = harness();
        h.orchestrator.handle_client_event(ClientEvent::Stop).await;
        assert_eq!(h.orchestrator.state(), SessionState::Uninitialized);
        assert!(h.drain().is_empty());

        let _link = h.start().await;
    }

    fn link_closed(reason: &str) -> LinkNotice {
        LinkNotice::Closed {
            reason: Some(reason.to_string()),
        }
    }

    #[tokio::test]
    async fn test_link_close_keeps_session_and_reconnects() {
        let mut h = harness();
        let mut first = h.start().await;
        h.orchestrator.handle_link_notice(LinkNotice::Opened).await;
        h.settle().await;

        h.orchestrator.handle_link_notice(link_closed("network")).await;
        let mut second = h.services.recognizer.take_link();
        assert_eq!(second.params.language, "en-US");
        assert!(h.orchestrator.take_link_notices().is_some());

        // Audio while the new link handshakes is held, not forwarded or refused
        h.orchestrator.handle_client_event(media(3200, 4)).await;
        assert!(first.drain_frames().is_empty());
        assert!(second.drain_frames().is_empty());

        let snapshot = h.registry.find("conn-1").await.unwrap();
        assert!(!snapshot.recognizer_ready);
        assert!(!snapshot.degraded);
        assert_eq!(snapshot.bytes_pending, 3200);
        assert_eq!(snapshot.bytes_dropped, 0);

        h.orchestrator
            .handle_client_event(ClientEvent::UserMessage {
                text: "still there?".to_string(),
            })
            .await;
        let events = h.settle().await;
        assert_eq!(h.services.language_model.queries().len(), 1);
        assert!(!events.iter().any(|e| matches!(e, ServerEvent::Error { .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ServerEvent::Log { level: LogLevel::Warn, .. })));

        // The backlog reaches the new link in order
        h.orchestrator.handle_link_notice(LinkNotice::Opened).await;
        assert_eq!(second.drain_frames(), vec![vec![4u8; 1600], vec![4u8; 1600]]);
        let snapshot = h.registry.find("conn-1").await.unwrap();
        assert!(snapshot.recognizer_ready);
        assert_eq!(snapshot.bytes_pending, 0);
    }

    #[tokio::test]
    async fn test_link_gives_up_after_reconnects_run_out() {
        let mut config = AppConfig::default();
        config.recognizer.max_reconnects = 1;
        let mut h = harness_with(TestServices::default(), config);
        let _first = h.start().await;
        h.orchestrator.handle_link_notice(LinkNotice::Opened).await;

        h.orchestrator.handle_link_notice(link_closed("network")).await;
        let _second = h.services.recognizer.take_link();
        h.orchestrator.handle_client_event(media(1600, 5)).await;
        h.drain();

        // The reopened link never became ready
        h.orchestrator.handle_link_notice(link_closed("handshake failed")).await;
        assert_eq!(h.services.recognizer.pending_links(), 0);
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, ServerEvent::Log { level: LogLevel::Error, .. })));

        h.orchestrator.handle_client_event(media(800, 5)).await;
        let snapshot = h.registry.find("conn-1").await.unwrap();
        assert!(snapshot.degraded);
        assert_eq!(snapshot.bytes_dropped, 2400);
        assert_eq!(snapshot.bytes_pending, 0);

        // A late close from the abandoned link changes nothing
        h.orchestrator.handle_link_notice(LinkNotice::Closed { reason: None }).await;
        assert!(h.drain().is_empty());
        assert_eq!(h.orchestrator.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_malformed_frame_counts_as_activity() {
        let mut h = harness();
        let _link = h.start().await;
        let before = h.registry.find("conn-1").await.unwrap().last_activity;

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        h.orchestrator
            .report_protocol_error(&VoiceError::Protocol("unreadable frame".to_string()));

        let after = h.registry.find("conn-1").await.unwrap().last_activity;
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_start_data_is_recorded_with_the_session() {
        let mut h = harness();
        h.orchestrator
            .handle_client_event(ClientEvent::Start(StartPayload {
                agent_id: AGENT_ID.to_string(),
                client_id: "client-1".to_string(),
                data: Some(BASE64.encode(r#"{"sessionToken":"tok-1","campaign":"spring"}"#)),
            }))
            .await;
        h.settle().await;

        let entries = h.transcript_entries().await;
        let Some(TranscriptEvent::SessionStarted { metadata, .. }) = entries.first().map(|e| &e.event)
        else {
            panic!("first entry should be session_started");
        };
        assert_eq!(metadata.get("campaign"), Some(&json!("spring")));
        assert!(!metadata.contains_key("sessionToken"));
    }
}
