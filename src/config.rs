//! # Configuration Management
//!
//! Loads the bridge configuration from layered sources:
//! - Built-in defaults (the `Default` impl below)
//! - An optional `config.toml` in the working directory
//! - Environment variables with the `APP_` prefix (nested keys joined by `__`,
//!   e.g. `APP_RECOGNIZER__API_KEY`)
//! - Deployment shortcuts: `HOST`, `PORT` and `DEEPGRAM_API_KEY`
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment shortcuts
//! 2. `APP_` environment variables
//! 3. `config.toml`
//! 4. Defaults

use crate::services::AgentConfig;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

/// Top-level configuration for the voice bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioSettings,
    pub recognizer: RecognizerConfig,
    pub language_model: ServiceEndpoint,
    pub synthesis: ServiceEndpoint,
    pub stores: StoresConfig,
    pub session: SessionConfig,

    /// Static agent table, consulted when `stores.agents_url` is empty.
    #[serde(default)]
    pub agents: HashMap<String, AgentConfig>,
}

/// HTTP/WebSocket listener settings.
///
/// ## Fields:
/// - `host`/`port`: bind address
/// - `heartbeat_interval_secs`: how often the server pings each client
/// - `client_timeout_secs`: silence after which a client transport is closed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

/// Fixed-format PCM framing used on both the client and recognizer sides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Recognizer encoding name (`linear16` = signed 16-bit little-endian PCM)
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u8,
    pub bit_depth: u8,
    /// Audio duration accumulated before a frame is forwarded upstream
    pub flush_interval_ms: u32,
}

/// Streaming speech recognizer link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerConfig {
    pub url: String,
    /// Empty means "not configured"; sessions then run without live transcription.
    pub api_key: String,
    pub model: String,
    pub interim_results: bool,
    pub keepalive_secs: u64,
    /// Used when the agent configuration carries no language.
    pub default_language: String,
    /// Reopen attempts after the link drops; reset whenever a link opens.
    /// Once exhausted the session continues without live transcription.
    pub max_reconnects: u32,
}

/// A request/response HTTP collaborator (language model, speech synthesis).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    pub url: String,
    pub timeout_secs: u64,
}

/// Base URLs of the data-management collaborators. An empty URL selects the
/// in-memory/static fallback for that store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoresConfig {
    pub agents_url: String,
    pub transcripts_url: String,
    pub directives_url: String,
    pub timeout_secs: u64,
    /// Ended transcripts the in-memory store keeps before evicting the oldest
    pub transcript_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Reply substituted whenever the language model fails or answers empty
    pub apology_text: String,
    pub max_concurrent_sessions: usize,
    /// Global directive used when no directive store URL is configured
    pub default_directive: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            audio: AudioSettings {
                encoding: "linear16".to_string(),
                sample_rate: 8000, // telephony narrowband
                channels: 1,
                bit_depth: 16,
                flush_interval_ms: 100,
            },
            recognizer: RecognizerConfig {
                url: "wss://api.deepgram.com/v1/listen".to_string(),
                api_key: String::new(),
                model: "nova-2".to_string(),
                interim_results: true,
                keepalive_secs: 8,
                default_language: "en-US".to_string(),
                max_reconnects: 3,
            },
            language_model: ServiceEndpoint {
                url: "http://127.0.0.1:8000/query".to_string(),
                timeout_secs: 30,
            },
            synthesis: ServiceEndpoint {
                url: "http://127.0.0.1:8000/tts".to_string(),
                timeout_secs: 30,
            },
            stores: StoresConfig {
                agents_url: String::new(),
                transcripts_url: String::new(),
                directives_url: String::new(),
                timeout_secs: 10,
                transcript_retention: 64,
            },
            session: SessionConfig {
                apology_text: "I'm sorry, I'm having trouble answering right now. Could you please repeat that?"
                    .to_string(),
                max_concurrent_sessions: 100,
                default_directive: String::new(),
            },
            agents: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`
    /// - `APP_RECOGNIZER__MODEL=nova-2-phonecall`
    /// - `APP_STORES__AGENTS_URL=http://agents.internal/api/agents`
    /// - `DEEPGRAM_API_KEY=...` (shortcut for `recognizer.api_key`)
    pub fn load() -> Result<Self> {
        // Later sources override earlier ones
        let mut settings = config::Config::builder()
            // Serializing the defaults means every key exists before overrides
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        // Platform-provided variables win over everything else
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("DEEPGRAM_API_KEY") {
            settings = settings.set_override("recognizer.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.audio.sample_rate == 0 || self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Audio sample rate and channel count must be greater than 0"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {}-bit",
                self.audio.bit_depth
            ));
        }

        if self.audio.flush_interval_ms == 0 {
            return Err(anyhow::anyhow!("Audio flush interval must be greater than 0"));
        }

        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.session.apology_text.trim().is_empty() {
            return Err(anyhow::anyhow!("Apology text cannot be empty"));
        }

        Ok(())
    }

    /// Whether a recognizer credential is present.
    pub fn recognizer_configured(&self) -> bool {
        !self.recognizer.api_key.trim().is_empty()
    }

    /// Copy of the configuration that is safe to expose over HTTP.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        // An empty key stays empty so the output still shows it is unset
        if copy.recognizer_configured() {
            copy.recognizer.api_key = "********".to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.audio.sample_rate, 8000);
        assert_eq!(config.audio.channels, 1);
        assert_eq!(config.audio.flush_interval_ms, 100);
        assert!(config.validate().is_ok());
        assert!(!config.recognizer_configured());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.bit_depth = 8;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.apology_text = "   ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let mut config = AppConfig::default();
        config.recognizer.api_key = "secret-token".to_string();

        let redacted = config.redacted();
        assert_eq!(redacted.recognizer.api_key, "********");
        assert_eq!(config.recognizer.api_key, "secret-token");
    }
}
