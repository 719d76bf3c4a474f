use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Public view of the configuration. The API key is reported, never echoed.
fn config_json(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "call": {
            "endpoint_url": config.call.endpoint_url,
            "api_key_configured": config.call.has_api_key(),
            "model": config.call.model,
            "voice": config.call.voice,
            "input_sample_rate": config.call.input_sample_rate,
            "output_sample_rate": config.call.output_sample_rate,
            "frame_size": config.call.frame_size,
            "outbound_queue_capacity": config.call.outbound_queue_capacity,
            "connect_timeout_ms": config.call.connect_timeout_ms
        },
        "rooms": {
            "max_messages_per_room": config.rooms.max_messages_per_room
        },
        "performance": {
            "max_concurrent_calls": config.performance.max_concurrent_calls
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config_json(&config)
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": config_json(&current_config)
    })))
}
