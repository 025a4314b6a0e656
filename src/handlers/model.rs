//! # Model Introspection Handler
//!
//! ## Available Endpoints:
//! - `GET /api/v1/model` - Architecture, device, decision convention and
//!   hidden-state policy of the loaded classifier

use crate::{error::AppResult, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Describe the loaded classifier.
///
/// ## Response:
/// ```json
/// {
///   "model": { "checkpoint": "...", "device": "CPU", "spec": { ... }, "state_shape": [20, 1, 512] },
///   "decision": { "convention": "softmax", "threshold": 0.5, "labels": ["female", "male"] },
///   "hidden_state": { "policy": "shared", "shared_state_shape": [20, 1, 512] }
/// }
/// ```
pub async fn get_model_info(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let engines = &state.engines;
    let decision = state.pipeline.decision();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "event": state.pipeline.event_name(),
        "model": engines.model().summary(),
        "decision": {
            "convention": decision.convention(),
            "threshold": decision.threshold(),
            "labels": decision.labels()
        },
        "hidden_state": {
            "policy": engines.policy(),
            "shared_state_shape": engines.shared_handle().state_shape(),
            "handles_issued": engines.handles_issued()
        }
    })))
}
