//! Health and metrics endpoints. Both are cheap enough for frequent polling:
//! they read atomics, the registry size and `/proc`.

use crate::config::AppConfig;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::process;

/// `GET /health` and `GET /api/v1/health`
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = &state.config;
    let active_sessions = state.registry.len().await;

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": "voice-bridge",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "collaborators": collaborator_status(config),
        "memory": get_memory_info(),
        "system": get_system_status(active_sessions, config.session.max_concurrent_sessions)
    }))
}

/// `GET /api/v1/metrics`: process-wide voice counters.
pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let active_sessions = state.registry.len().await;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "sessions": {
            "active": active_sessions,
            "started": metrics.sessions_started,
            "ended": metrics.sessions_ended,
            "start_failures": metrics.start_failures
        },
        "audio": {
            "frames_forwarded": metrics.frames_forwarded,
            "bytes_dropped": metrics.audio_bytes_dropped
        },
        "utterances": {
            "processed": metrics.utterances_processed,
            "dropped_while_busy": metrics.utterances_dropped,
            "llm_fallbacks": metrics.llm_fallbacks,
            "fallback_rate": metrics.fallback_rate(),
            "synthesis_failures": metrics.synthesis_failures
        },
        "protocol_errors": metrics.protocol_errors,
        "memory": get_memory_info(),
        "system": get_system_status(active_sessions, state.config.session.max_concurrent_sessions)
    }))
}

/// Which collaborators are real services and which run in-process.
fn collaborator_status(config: &AppConfig) -> serde_json::Value {
    let store = |url: &str| if url.is_empty() { "in_memory" } else { "http" };

    json!({
        "recognizer": {
            "configured": config.recognizer_configured(),
            "model": config.recognizer.model
        },
        "language_model": config.language_model.url,
        "synthesis": config.synthesis.url,
        "agent_store": store(&config.stores.agents_url),
        "transcript_store": store(&config.stores.transcripts_url),
        "directive_store": store(&config.stores.directives_url)
    })
}

fn get_memory_info() -> serde_json::Value {
    let pid = process::id();

    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            // Lines look like `VmRSS:     12345 kB`
            let field = |name: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(name))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .map(|kb| kb * 1024)
                    .unwrap_or(0)
            };

            return json!({
                "resident_memory_bytes": field("VmRSS:"),
                "virtual_memory_bytes": field("VmSize:"),
                "available": true
            });
        }
    }

    // Only read on Linux
    let _ = pid;
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

fn get_system_status(active_sessions: usize, max_sessions: usize) -> serde_json::Value {
    let session_usage = if max_sessions > 0 {
        active_sessions as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": active_sessions,
        "load_warnings": if session_usage > 0.8 {
            vec!["High session usage - consider increasing session.max_concurrent_sessions"]
        } else {
            vec![]
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_status_levels() {
        assert_eq!(get_system_status(1, 100)["status"], "normal");
        assert_eq!(get_system_status(80, 100)["status"], "moderate_load");
        assert_eq!(get_system_status(95, 100)["status"], "high_load");
        assert_eq!(get_system_status(0, 0)["session_usage_percent"], 0.0);
    }

    #[test]
    fn test_collaborator_status_reports_fallbacks() {
        let mut config = AppConfig::default();
        config.stores.agents_url = "http://agents.local".to_string();

        let status = collaborator_status(&config);
        assert_eq!(status["agent_store"], "http");
        assert_eq!(status["transcript_store"], "in_memory");
        assert_eq!(status["recognizer"]["configured"], false);
    }
}
