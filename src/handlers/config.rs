use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "audio": {
                "frame_size": config.audio.frame_size,
                "frame_interval_ms": config.audio.frame_interval_ms,
                "header_len": config.audio.header_len
            },
            "backend": {
                "url": config.backend.url
            },
            "webhook": {
                "timeout_secs": config.webhook.timeout_secs
            },
            "performance": {
                "max_concurrent_calls": config.performance.max_concurrent_calls
            }
        }
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> AppResult<HttpResponse> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config.update_from_json(&json_str)?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": {
            "server": {
                "host": current_config.server.host,
                "port": current_config.server.port
            },
            "audio": {
                "frame_size": current_config.audio.frame_size,
                "frame_interval_ms": current_config.audio.frame_interval_ms,
                "header_len": current_config.audio.header_len
            },
            "backend": {
                "url": current_config.backend.url
            },
            "webhook": {
                "timeout_secs": current_config.webhook.timeout_secs
            },
            "performance": {
                "max_concurrent_calls": current_config.performance.max_concurrent_calls
            }
        }
    })))
}
