//! # Transcript Logger
//!
//! Best-effort, append-only persistence of everything that happens in a call:
//! lifecycle changes, raw recognizer hypotheses, user utterances, replies and
//! errors.
//!
//! ## Delivery Model:
//! Each session owns one background writer task fed by an unbounded channel.
//! Callers never wait on the store, entries reach it in the order they were
//! logged, and a failed write is logged locally and skipped. Nothing here can
//! fail a session.

use crate::error::VoiceError;
use crate::protocol::LogLevel;
use crate::services::TranscriptStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Reference to the durable transcript record of one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TranscriptHandle(pub String);

/// Data needed to create the transcript record at session start.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTranscript {
    pub session_id: String,
    pub agent_id: String,
    pub client_id: String,
    pub started_at: DateTime<Utc>,
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptEvent {
    SessionStarted {
        agent_id: String,
        client_id: String,
        /// Auxiliary start data other than the session token
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        metadata: serde_json::Map<String, serde_json::Value>,
    },
    /// A raw recognizer hypothesis, logged whether or not it was acted on
    Transcript {
        text: String,
        is_final: bool,
    },
    UserMessage {
        text: String,
    },
    AiResponse {
        text: String,
    },
    /// An utterance that arrived while another one was being answered
    UtteranceDropped {
        text: String,
    },
    Log {
        level: LogLevel,
        message: String,
        metadata: serde_json::Value,
    },
    Error {
        error_kind: String,
        message: String,
    },
    SessionStopped {
        reason: String,
    },
}

/// One appended line of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEntry {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: TranscriptEvent,
}

enum WriterCommand {
    Append(TranscriptEntry),
    End,
}

/// Handle used by a session to log events. Cheap to clone; all clones feed
/// the same writer.
#[derive(Clone)]
pub struct TranscriptLogger {
    session_id: String,
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl TranscriptLogger {
    /// Create the transcript record and start the writer task.
    ///
    /// ## Returns:
    /// The logger plus the writer's join handle. If the record cannot be
    /// created the logger still works but entries are only traced locally.
    pub async fn open(
        store: Arc<dyn TranscriptStore>,
        record: NewTranscript,
    ) -> (Self, Option<TranscriptHandle>, JoinHandle<()>) {
        let handle = match store.create_session(&record).await {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(
                    session_id = %record.session_id,
                    error = %err,
                    "Transcript record could not be created, continuing without persistence"
                );
                None
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(run_writer(store, handle.clone(), record.session_id.clone(), rx));

        (
            Self {
                session_id: record.session_id,
                tx,
            },
            handle,
            writer,
        )
    }

    /// Queue an event for persistence. Never blocks, never fails.
    pub fn log(&self, event: TranscriptEvent) {
        let entry = TranscriptEntry {
            session_id: self.session_id.clone(),
            timestamp: Utc::now(),
            event,
        };
        if self.tx.send(WriterCommand::Append(entry)).is_err() {
            debug!(session_id = %self.session_id, "Transcript already closed, entry dropped");
        }
    }

    pub fn log_error(&self, err: &VoiceError) {
        self.log(TranscriptEvent::Error {
            error_kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }

    /// Mark the transcript ended once every entry queued so far is written.
    pub fn end(&self) {
        let _ = self.tx.send(WriterCommand::End);
    }
}

/// Drain the logger's channel into the store, one entry at a time.
///
/// ## Rust Concepts:
/// - The task owns the receiver; it ends on `End` or when every
///   `TranscriptLogger` clone is dropped (`recv` yields `None`)
/// - Awaiting each append before taking the next keeps store order equal to
///   log order
async fn run_writer(
    store: Arc<dyn TranscriptStore>,
    handle: Option<TranscriptHandle>,
    session_id: String,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Append(entry) => {
                let Some(handle) = handle.as_ref() else {
                    debug!(session_id = %session_id, event = ?entry.event, "Transcript entry (not persisted)");
                    continue;
                };
                if let Err(err) = store.append_event(handle, &entry).await {
                    warn!(session_id = %session_id, error = %err, "Failed to append transcript entry");
                }
            }
            WriterCommand::End => {
                // Entries logged after `end` are never written
                if let Some(handle) = handle.as_ref() {
                    if let Err(err) = store.mark_ended(handle, Utc::now()).await {
                        warn!(session_id = %session_id, error = %err, "Failed to mark transcript ended");
                    }
                }
                break;
            }
        }
    }
}
