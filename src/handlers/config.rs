use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/config`: the effective configuration, secrets masked.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.config.redacted();
    let frame_bytes = crate::audio::AudioFormat::from(&config.audio)
        .bytes_for_duration(config.audio.flush_interval_ms);

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config,
        "derived": {
            "frame_bytes": frame_bytes,
            "recognizer_configured": state.config.recognizer_configured()
        }
    })))
}
