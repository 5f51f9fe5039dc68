//! Parsing of the JSON events a streaming recognizer sends back.
//!
//! Two shapes are accepted:
//! - flat: `{ "type": "Results", "transcript": "...", "final": true }`
//! - Deepgram live results: `{ "type": "Results", "is_final": true,
//!   "channel": { "alternatives": [ { "transcript": "..." } ] } }`
//!
//! `channel` is only an object on results. `SpeechStarted` and
//! `UtteranceEnd` carry it as an index array (`"channel": [0, 1]`), so it is
//! read as a raw value and only objects are searched for alternatives.

use crate::error::VoiceError;
use serde::Deserialize;

/// A typed event from the recognizer link.
#[derive(Debug, Clone, PartialEq)]
pub enum RecognizerEvent {
    /// A transcript hypothesis; `is_final` means it will not be revised
    Transcript { text: String, is_final: bool },

    /// Metadata, speech-started markers and the like
    Other { kind: String },
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    transcript: Option<String>,
    #[serde(default, rename = "final")]
    is_final_flat: Option<bool>,
    #[serde(default)]
    is_final: Option<bool>,
    #[serde(default)]
    channel: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RawChannel {
    #[serde(default)]
    alternatives: Vec<RawAlternative>,
}

#[derive(Deserialize)]
struct RawAlternative {
    #[serde(default)]
    transcript: String,
}

impl RecognizerEvent {
    pub fn parse(text: &str) -> Result<Self, VoiceError> {
        let raw: RawEvent = serde_json::from_str(text)
            .map_err(|e| VoiceError::upstream("speech recognizer", format!("bad event: {}", e)))?;

        // First alternative only; a channel that does not decode counts as absent
        let nested = raw
            .channel
            .filter(serde_json::Value::is_object)
            .and_then(|c| serde_json::from_value::<RawChannel>(c).ok())
            .and_then(|c| c.alternatives.into_iter().next())
            .map(|a| a.transcript);

        // The flat field wins when both shapes are present
        match raw.transcript.or(nested) {
            Some(text) => Ok(RecognizerEvent::Transcript {
                text,
                // A hypothesis without any finality flag is interim
                is_final: raw.is_final_flat.or(raw.is_final).unwrap_or(false),
            }),
            None => Ok(RecognizerEvent::Other {
                kind: raw.kind.unwrap_or_else(|| "unknown".to_string()),
            }),
        }
    }
}
