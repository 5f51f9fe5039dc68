//! The session task: one per connection, sole owner of its orchestrator.

use crate::error::VoiceError;
use crate::protocol::ClientEvent;
use crate::recognizer::LinkNotice;
use crate::session::SessionOrchestrator;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Transport actor → session task.
#[derive(Debug)]
pub enum SessionCommand {
    Client(ClientEvent),
    /// A text frame that did not parse
    Malformed(VoiceError),
    TransportClosed,
}

/// Spawn the session task. Dropping every sender counts as a transport close.
pub fn spawn_session(
    orchestrator: SessionOrchestrator,
) -> (mpsc::UnboundedSender<SessionCommand>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(run(orchestrator, rx));
    (tx, task)
}

/// Feed the orchestrator until it reports closed.
///
/// ## Rust Concepts:
/// - `tokio::select!` waits on client commands and link notices at once and
///   runs whichever is ready first; each handler runs to completion before
///   the next event is taken, so the orchestrator needs no lock
/// - The `if notices.is_some()` guard disables the link branch while there
///   is no link
async fn run(
    mut orchestrator: SessionOrchestrator,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
) {
    let mut notices: Option<mpsc::UnboundedReceiver<LinkNotice>> = None;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SessionCommand::Client(event)) => orchestrator.handle_client_event(event).await,
                Some(SessionCommand::Malformed(err)) => orchestrator.report_protocol_error(&err),
                Some(SessionCommand::TransportClosed) | None => {
                    orchestrator.handle_transport_closed().await;
                }
            },
            notice = next_notice(&mut notices), if notices.is_some() => match notice {
                Some(notice) => orchestrator.handle_link_notice(notice).await,
                None => {
                    // Link task exited without a close notice
                    notices = None;
                    orchestrator
                        .handle_link_notice(LinkNotice::Closed { reason: None })
                        .await;
                }
            },
        }

        if orchestrator.is_closed() {
            break;
        }
        // A new receiver means the link was (re)opened; the old one is done
        if let Some(rx) = orchestrator.take_link_notices() {
            notices = Some(rx);
        }
    }

    debug!("Session task finished");
}

async fn next_notice(
    notices: &mut Option<mpsc::UnboundedReceiver<LinkNotice>>,
) -> Option<LinkNotice> {
    match notices {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
