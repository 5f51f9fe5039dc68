//! # Call Socket Protocol
//!
//! JSON-framed events exchanged with the call client over `/ws/voice`. Every
//! message is an object tagged by its `event` field.
//!
//! ## Client → Server:
//! - `start`: `{ "event": "start", "agentId": "...", "clientId": "...", "data": "<base64>" }`
//! - `media`: `{ "event": "media", "payload": "<base64 PCM>" }`
//! - `user_message`: `{ "event": "user_message", "text": "..." }`
//! - `stop`: `{ "event": "stop" }`
//!
//! ## Server → Client:
//! `connected`, `start`, `log`, `transcript`, `conversation`, `media`,
//! `error`, `stop`.

use crate::error::VoiceError;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Messages sent by the call client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Opens the session for an agent
    Start(StartPayload),

    /// A chunk of raw call audio
    Media {
        /// Base64-encoded 16-bit PCM
        payload: String,
    },

    /// Typed text that bypasses speech recognition
    UserMessage { text: String },

    /// Ends the session
    Stop,
}

/// Body of the `start` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    #[serde(alias = "agent_id")]
    pub agent_id: String,

    #[serde(default, alias = "client_id")]
    pub client_id: String,

    /// Base64-encoded JSON with auxiliary call metadata
    #[serde(default)]
    pub data: Option<String>,
}

/// Decoded form of [`StartPayload::data`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuxiliaryData {
    #[serde(default, alias = "session_token")]
    pub session_token: Option<String>,

    /// Everything else the client chose to send; recorded with the
    /// `session_started` transcript entry
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StartPayload {
    /// Decode the auxiliary data. Missing or undecodable data yields the
    /// default; the session still starts.
    pub fn auxiliary(&self) -> AuxiliaryData {
        let Some(encoded) = self.data.as_deref().filter(|d| !d.trim().is_empty()) else {
            return AuxiliaryData::default();
        };

        match decode_auxiliary(encoded) {
            Ok(aux) => aux,
            Err(err) => {
                warn!(agent_id = %self.agent_id, error = %err, "Ignoring undecodable start data");
                AuxiliaryData::default()
            }
        }
    }
}

fn decode_auxiliary(encoded: &str) -> Result<AuxiliaryData, VoiceError> {
    let bytes = BASE64.decode(encoded.trim())?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl ClientEvent {
    /// Parse one text frame from the client.
    pub fn parse(text: &str) -> Result<Self, VoiceError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::Start(_) => "start",
            ClientEvent::Media { .. } => "media",
            ClientEvent::UserMessage { .. } => "user_message",
            ClientEvent::Stop => "stop",
        }
    }
}

/// Decode a base64 media payload into raw PCM bytes.
pub fn decode_media(payload: &str) -> Result<Vec<u8>, VoiceError> {
    Ok(BASE64.decode(payload.trim())?)
}

/// Encode synthesized audio for a `media` event.
pub fn encode_media(audio: &[u8]) -> String {
    BASE64.encode(audio)
}

/// Severity of a diagnostic `log` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Messages sent to the call client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent as soon as the socket opens
    #[serde(rename_all = "camelCase")]
    Connected { connection_id: String },

    /// Acknowledges `start`
    #[serde(rename_all = "camelCase")]
    Start {
        session_id: String,
        client_id: String,
    },

    /// Diagnostic message
    Log {
        level: LogLevel,
        message: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },

    /// Live caption from the recognizer
    Transcript {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },

    /// One side of the conversation
    #[serde(rename_all = "camelCase")]
    Conversation {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        user_message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        ai_response: Option<String>,
    },

    /// Synthesized speech, base64-encoded
    Media { payload: String },

    Error { message: String },

    /// Acknowledges `stop`
    #[serde(rename_all = "camelCase")]
    Stop { session_id: String },
}

impl ServerEvent {
    pub fn user_message(text: impl Into<String>) -> Self {
        ServerEvent::Conversation {
            user_message: Some(text.into()),
            ai_response: None,
        }
    }

    pub fn ai_response(text: impl Into<String>) -> Self {
        ServerEvent::Conversation {
            user_message: None,
            ai_response: Some(text.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// Serialize for a text frame.
    pub fn to_json(&self) -> Result<String, VoiceError> {
        serde_json::to_string(self)
            .map_err(|e| VoiceError::Protocol(format!("failed to encode event: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_events() {
        let start = ClientEvent::parse(
            r#"{"event":"start","agentId":"agent-1","clientId":"client-9","data":null}"#,
        )
        .unwrap();
        assert_eq!(
            start,
            ClientEvent::Start(StartPayload {
                agent_id: "agent-1".to_string(),
                client_id: "client-9".to_string(),
                data: None,
            })
        );

        let media = ClientEvent::parse(r#"{"event":"media","payload":"AAEC"}"#).unwrap();
        assert_eq!(media.name(), "media");

        let text = ClientEvent::parse(r#"{"event":"user_message","text":"hello"}"#).unwrap();
        assert_eq!(
            text,
            ClientEvent::UserMessage {
                text: "hello".to_string()
            }
        );

        assert_eq!(ClientEvent::parse(r#"{"event":"stop"}"#).unwrap(), ClientEvent::Stop);
    }

    #[test]
    fn test_malformed_messages_are_protocol_errors() {
        for raw in ["not json", r#"{"event":"dance"}"#, r#"{"event":"media"}"#] {
            let err = ClientEvent::parse(raw).unwrap_err();
            assert!(matches!(err, VoiceError::Protocol(_)), "{raw}");
        }
    }

    #[test]
    fn test_auxiliary_session_token() {
        let aux_json = r#"{"sessionToken":"tok-123","campaign":"spring"}"#;
        let start = StartPayload {
            agent_id: "a".to_string(),
            client_id: "c".to_string(),
            data: Some(BASE64.encode(aux_json)),
        };

        let aux = start.auxiliary();
        assert_eq!(aux.session_token.as_deref(), Some("tok-123"));
        assert_eq!(aux.extra.get("campaign").and_then(|v| v.as_str()), Some("spring"));
    }

    #[test]
    fn test_bad_auxiliary_data_is_ignored() {
        let start = StartPayload {
            agent_id: "a".to_string(),
            client_id: "c".to_string(),
            data: Some("%%%".to_string()),
        };
        assert_eq!(start.auxiliary(), AuxiliaryData::default());
    }

    #[test]
    fn test_server_event_wire_format() {
        let json = ServerEvent::Transcript {
            text: "hi there".to_string(),
            is_final: true,
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"event":"transcript","text":"hi there","final":true}"#);

        let json = ServerEvent::ai_response("Sure.").to_json().unwrap();
        assert_eq!(json, r#"{"event":"conversation","aiResponse":"Sure."}"#);

        let json = ServerEvent::Connected {
            connection_id: "c1".to_string(),
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"event":"connected","connectionId":"c1"}"#);
    }

    #[test]
    fn test_media_codec() {
        let pcm = vec![0u8, 1, 2, 255];
        assert_eq!(decode_media(&encode_media(&pcm)).unwrap(), pcm);
        assert!(decode_media("not base64!").is_err());
    }
}
