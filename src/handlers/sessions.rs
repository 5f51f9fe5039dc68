use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// `GET /api/v1/sessions`
pub async fn list_sessions(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let sessions = state.registry.snapshots().await;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "capacity": state.registry.capacity(),
        "sessions": sessions
    })))
}

/// `GET /api/v1/sessions/{id}`, by session id or connection id.
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let id = path.into_inner();
    let session = state
        .registry
        .find(&id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Session {} does not exist", id)))?;

    Ok(HttpResponse::Ok().json(session))
}
