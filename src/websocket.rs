//! # Call Socket Transport
//!
//! Handles the `/ws/voice` WebSocket. The actor here is transport only: it
//! frames JSON text messages, answers pings, enforces the heartbeat timeout
//! and relays everything else to the connection's session task.
//!
//! ## Message Flow:
//! 1. **Connection**: a connection id is generated and `connected` is sent
//! 2. **Inbound**: each text frame is parsed into a `ClientEvent` and sent to
//!    the session task (unparseable frames become protocol errors there)
//! 3. **Outbound**: the session task's event channel is attached to the actor
//!    as a stream; every `ServerEvent` becomes one JSON text frame
//! 4. **Close**: client close, protocol error or heartbeat timeout stops the
//!    actor, which tells the session task the transport is gone

use crate::error::VoiceError;
use crate::protocol::{ClientEvent, ServerEvent};
use crate::session::{spawn_session, Outbound, SessionCommand, SessionOrchestrator};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// WebSocket actor for one call connection.
pub struct VoiceWebSocket {
    connection_id: String,

    state: AppState,

    /// Channel into the session task, set once the actor starts
    commands: Option<mpsc::UnboundedSender<SessionCommand>>,

    /// Last time the client showed signs of life
    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(state: AppState) -> Self {
        Self {
            connection_id: Uuid::new_v4().to_string(),
            state,
            commands: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn forward(&self, command: SessionCommand) {
        let Some(commands) = &self.commands else {
            return;
        };
        if commands.send(command).is_err() {
            debug!(connection_id = %self.connection_id, "Session task gone, frame ignored");
        }
    }
}

/// Turn one inbound text frame into a session command.
fn decode_frame(text: &str) -> SessionCommand {
    match ClientEvent::parse(text) {
        Ok(event) => SessionCommand::Client(event),
        Err(err) => SessionCommand::Malformed(err),
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    /// ## What this does:
    /// - Sends `connected` before anything else
    /// - Attaches the outbound channel as an actor stream
    /// - Spawns the session task that owns the orchestrator
    /// - Starts the heartbeat check
    fn started(&mut self, ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "Call socket connected");

        let (outbound, events) = Outbound::channel();
        outbound.send(ServerEvent::Connected {
            connection_id: self.connection_id.clone(),
        });
        ctx.add_stream(UnboundedReceiverStream::new(events));

        let orchestrator = SessionOrchestrator::new(
            self.connection_id.clone(),
            self.state.config.clone(),
            self.state.services.clone(),
            self.state.registry.clone(),
            self.state.metrics.clone(),
            outbound,
        );
        // The task ends on its own after `TransportClosed`; no need to join it
        let (commands, _task) = spawn_session(orchestrator);
        self.commands = Some(commands);

        let interval = Duration::from_secs(self.state.config.server.heartbeat_interval_secs.max(1));
        let timeout = Duration::from_secs(self.state.config.server.client_timeout_secs);
        // Any inbound frame resets the clock, not only pongs
        ctx.run_interval(interval, move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > timeout {
                warn!(connection_id = %act.connection_id, "Call socket heartbeat timeout, closing");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(connection_id = %self.connection_id, "Call socket closed");
        self.forward(SessionCommand::TransportClosed);
        // Dropping the sender also ends the task if the command above was lost
        self.commands = None;
    }
}

/// Outbound events from the session task.
impl StreamHandler<ServerEvent> for VoiceWebSocket {
    fn handle(&mut self, event: ServerEvent, ctx: &mut Self::Context) {
        match event.to_json() {
            Ok(json) => ctx.text(json),
            Err(err) => error!(connection_id = %self.connection_id, error = %err, "Dropping outbound event"),
        }
    }

    /// The session task ended (after `stop`); keep the socket open until the
    /// client closes it.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!(connection_id = %self.connection_id, "Session event stream finished");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => self.forward(decode_frame(&text)),
            // Audio must arrive as base64 `media` events
            Ok(ws::Message::Binary(data)) => {
                self.forward(SessionCommand::Malformed(VoiceError::Protocol(format!(
                    "binary frames are not supported ({} bytes); send base64 media events",
                    data.len()
                ))));
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id, reason = ?reason, "Client closed call socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(connection_id = %self.connection_id, "Unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(connection_id = %self.connection_id, error = %err, "Call socket protocol error");
                ctx.stop();
            }
        }
    }
}

/// `GET /ws/voice`
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "Call socket upgrade requested");
    ws::start(VoiceWebSocket::new(app_state.get_ref().clone()), &req, stream)
}
