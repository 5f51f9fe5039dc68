//! # Speech Recognizer Bridge
//!
//! Streams session audio to an external recognizer over a long-lived
//! WebSocket and turns its replies into typed [`RecognizerEvent`]s.
//!
//! ## Shape:
//! - A [`RecognizerConnector`] opens one link per session. Opening returns at
//!   once with a command channel; the handshake runs in a background task.
//! - The link task reports back through [`LinkNotice`]s: `Opened` when audio
//!   may flow, `Event` for every parsed message, `Closed` when it ends.
//! - The session keeps a [`RecognizerLink`] that queues frames until
//!   `Opened` arrives.

pub mod deepgram;
pub mod events;
pub mod link;

pub use deepgram::DeepgramConnector;
pub use events::RecognizerEvent;
pub use link::{FrameOutcome, RecognizerLink};

use crate::audio::AudioFormat;
use crate::error::VoiceError;
use tokio::sync::mpsc;

/// Parameters of one recognizer link.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkParams {
    pub format: AudioFormat,
    pub language: String,
}

/// Session → link task.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCommand {
    /// One flushed PCM frame
    Frame(Vec<u8>),
    /// Finish the stream and close the socket
    Close,
}

/// Link task → session.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkNotice {
    Opened,
    Event(RecognizerEvent),
    Closed { reason: Option<String> },
}

/// Opens recognizer links.
pub trait RecognizerConnector: Send + Sync {
    /// Provider name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Start a link without waiting for its handshake.
    ///
    /// ## Errors:
    /// `VoiceError::Configuration` when no credential is available. The
    /// session then runs without live transcription.
    fn open(
        &self,
        params: &LinkParams,
        notices: mpsc::UnboundedSender<LinkNotice>,
    ) -> Result<mpsc::UnboundedSender<LinkCommand>, VoiceError>;
}
