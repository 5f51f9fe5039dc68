//! # Voice Sessions
//!
//! One session per call socket. The transport actor in `websocket.rs` only
//! frames messages; everything else happens here:
//!
//! - [`registry`]: process-wide map of live sessions
//! - [`orchestrator`]: the per-connection state machine
//! - [`utterance`]: turning a final utterance into a spoken reply
//! - [`actor`]: the task that feeds the orchestrator from the client and the
//!   recognizer link

pub mod actor;
pub mod orchestrator;
pub mod registry;
pub mod utterance;

pub use actor::{spawn_session, SessionCommand};
pub use orchestrator::SessionOrchestrator;
pub use registry::{SessionRegistry, SessionShared};

use crate::protocol::ServerEvent;
use tokio::sync::mpsc;
use tracing::debug;

/// Sending half of a connection's outbound event stream.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<ServerEvent>,
}

impl Outbound {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue an event for the client. A closed socket swallows it.
    pub fn send(&self, event: ServerEvent) {
        if let Err(mpsc::error::SendError(event)) = self.tx.send(event) {
            debug!(event = ?event, "Client socket gone, event dropped");
        }
    }
}
