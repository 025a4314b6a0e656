use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Effective configuration after defaults, `config.toml` and environment
/// overrides have been merged. Read-only: the model is loaded once at startup,
/// so changing its parameters requires a restart.
pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = &state.config;

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "audio": serde_json::to_value(&config.audio)?,
            "features": {
                "n_fft": config.features.n_fft,
                "hop_length": config.features.hop_length,
                "n_mels": config.features.n_mels,
                "f_min": config.features.f_min,
                "f_max": state.pipeline.extractor().config().f_max,
                "log_scale": config.features.log_scale,
                "n_frames": state.pipeline.extractor().config().n_frames()
            },
            "model": serde_json::to_value(&config.model)?,
            "performance": {
                "max_concurrent_sessions": config.performance.max_concurrent_sessions
            }
        }
    })))
}
