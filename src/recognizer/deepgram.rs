//! Deepgram-compatible live transcription link over `tokio-tungstenite`.
//!
//! Each `open` spawns one task that owns the socket. The session talks to it
//! only through channels: [`LinkCommand`]s in, [`LinkNotice`]s out. The task
//! always ends with exactly one `Closed` notice.

use super::{LinkCommand, LinkNotice, LinkParams, RecognizerConnector, RecognizerEvent};
use crate::config::RecognizerConfig;
use crate::error::VoiceError;
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;

pub struct DeepgramConnector {
    config: RecognizerConfig,
}

impl DeepgramConnector {
    pub fn new(config: &RecognizerConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    /// Listen URL with the audio format and recognition options as query
    /// parameters.
    pub fn listen_url(&self, params: &LinkParams) -> Result<Url, VoiceError> {
        let mut url = Url::parse(&self.config.url).map_err(|e| {
            VoiceError::Configuration(format!("invalid recognizer url '{}': {}", self.config.url, e))
        })?;

        url.query_pairs_mut()
            .append_pair("encoding", &params.format.encoding)
            .append_pair("sample_rate", &params.format.sample_rate.to_string())
            .append_pair("channels", &params.format.channels.to_string())
            .append_pair("language", &params.language)
            .append_pair("model", &self.config.model)
            .append_pair("interim_results", &self.config.interim_results.to_string());

        Ok(url)
    }
}

impl RecognizerConnector for DeepgramConnector {
    fn name(&self) -> &str {
        "deepgram"
    }

    fn open(
        &self,
        params: &LinkParams,
        notices: mpsc::UnboundedSender<LinkNotice>,
    ) -> Result<mpsc::UnboundedSender<LinkCommand>, VoiceError> {
        let api_key = self.config.api_key.trim();
        if api_key.is_empty() {
            return Err(VoiceError::Configuration(
                "speech recognizer API key is not set".to_string(),
            ));
        }

        let url = self.listen_url(params)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Configuration(format!("invalid recognizer request: {}", e)))?;
        let token = HeaderValue::from_str(&format!("Token {}", api_key))
            .map_err(|_| VoiceError::Configuration("recognizer API key is not a valid header".to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, token);

        // Connecting happens inside the task; `open` never blocks on the network
        let (tx, rx) = mpsc::unbounded_channel();
        let keepalive = Duration::from_secs(self.config.keepalive_secs.max(1));

        tokio::spawn(async move {
            let reason = run_link(request, keepalive, rx, &notices).await;
            let _ = notices.send(LinkNotice::Closed { reason });
        });

        Ok(tx)
    }
}

/// Drive one link until it closes. Returns the close reason, if abnormal.
///
/// ## What this does:
/// 1. Connects and sends `Opened` once the handshake succeeds
/// 2. Forwards audio frames as binary messages
/// 3. Sends a `KeepAlive` text message every `keepalive` so silence does not
///    time the stream out
/// 4. Parses every text message into a [`RecognizerEvent`]
///
/// A `Close` command (or the session dropping its sender) ends the stream
/// politely with `CloseStream`. Any socket error ends it with a reason.
async fn run_link(
    request: tokio_tungstenite::tungstenite::handshake::client::Request,
    keepalive: Duration,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
    notices: &mpsc::UnboundedSender<LinkNotice>,
) -> Option<String> {
    let stream = match connect_async(request).await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!(error = %e, "Speech recognizer connection failed");
            return Some(format!("connect failed: {}", e));
        }
    };
    info!("Speech recognizer link opened");

    let (mut sink, mut source) = stream.split();
    if notices.send(LinkNotice::Opened).is_err() {
        // Session already gone
        let _ = sink.close().await;
        return None;
    }

    let mut ticker = tokio::time::interval(keepalive);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Frame(frame)) => {
                    if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                        return Some(format!("send failed: {}", e));
                    }
                }
                Some(LinkCommand::Close) | None => {
                    let _ = sink.send(Message::Text(CLOSE_STREAM_MESSAGE.to_string().into())).await;
                    let _ = sink.close().await;
                    debug!("Speech recognizer link closed by session");
                    return None;
                }
            },
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Text(KEEPALIVE_MESSAGE.to_string().into())).await {
                    return Some(format!("keepalive failed: {}", e));
                }
            }
            message = source.next() => match message {
                Some(Ok(Message::Text(text))) => match RecognizerEvent::parse(&text) {
                    Ok(event) => {
                        if notices.send(LinkNotice::Event(event)).is_err() {
                            return None;
                        }
                    }
                    Err(e) => warn!(error = %e, "Skipping unparseable recognizer message"),
                },
                // A normal close without a frame is not worth reporting
                Some(Ok(Message::Close(frame))) => {
                    return frame.map(|f| format!("closed by recognizer: {} {}", u16::from(f.code), f.reason));
                }
                // Ping/pong is answered by tungstenite; binary is unexpected
                Some(Ok(_)) => {}
                Some(Err(e)) => return Some(format!("receive failed: {}", e)),
                None => return Some("recognizer stream ended".to_string()),
            },
        }
    }
}
