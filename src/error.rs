//! # Error Handling
//!
//! This module defines the error types used across the service:
//!
//! - **AudioError**: failures in the streaming half of the pipeline
//!   (PCM decoding, session buffering, feature extraction)
//! - **ClassifierError**: failures in the model half of the pipeline
//!   (checkpoint loading, device placement, forward pass, decision)
//! - **AppError**: HTTP-facing errors converted to JSON responses
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of error
//! - **Data**: Variants carry the numbers needed to explain the failure
//!   (expected vs. actual sizes, chunk counts, file paths)
//!
//! ### Traits for Error Conversion
//! - **thiserror**: Derives `Display` and `std::error::Error` from `#[error]` attributes
//! - **From trait**: Automatically converts between error types with `?`
//! - **ResponseError trait**: Converts errors to HTTP responses
//!
//! ## Failure isolation:
//! Only `ClassifierError::ModelLoad` is process-fatal (at startup). Every other
//! pipeline error is scoped to one window of one session.

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while turning streamed bytes into feature tensors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AudioError {
    /// Window or tensor has the wrong size. Not retried, the window is skipped.
    #[error("Shape error: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    /// NaN or infinite values. Propagated, never clamped.
    #[error("Numeric error: {0}")]
    Numeric(String),

    /// The trigger count was reached but the buffered audio is shorter than one window.
    /// This is a "not ready yet" signal, not a failure.
    #[error("Insufficient audio: have {have} samples, need {need}")]
    InsufficientData { have: usize, need: usize },

    /// The session buffer is full and the overflow policy rejected the chunk.
    #[error("Session buffer overflow: {buffered} chunks buffered (limit {limit})")]
    Overflow { buffered: usize, limit: usize },

    /// Raw bytes could not be decoded as 16-bit PCM.
    #[error("Invalid audio chunk: {0}")]
    InvalidChunk(String),
}

/// Errors raised by the classifier: loading, inference and decision.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Checkpoint missing, unreadable, or incompatible with the declared architecture.
    /// Fatal at process start.
    #[error("Failed to load model from {path:?}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    /// Accelerator placement failed. Recoverable by retrying on the CPU.
    #[error("Device error: {0}")]
    Device(String),

    /// Feature tensor or score vector does not match the model's declared sizes.
    #[error("Shape error: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    /// Non-finite scores.
    #[error("Numeric error: {0}")]
    Numeric(String),

    /// Any tensor operation failure inside candle.
    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),
}

impl ClassifierError {
    /// Build a `ModelLoad` error for a checkpoint path.
    pub fn model_load(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        ClassifierError::ModelLoad {
            path: path.into(),
            message: message.to_string(),
        }
    }
}

/// Errors from one pass of the extraction → inference → decision pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Classifier(#[from] ClassifierError),
}

/// Custom error types for the HTTP surface of the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ServiceUnavailable**: Capacity exhausted (503 errors)
///
/// ## Usage Example:
/// ```rust,ignore
/// return Err(AppError::BadRequest("Invalid JSON".to_string()));
/// ```
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (model failures, poisoned locks, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Requested resource was not found
    NotFound(String),

    /// Capacity exhausted (e.g. the concurrent session limit)
    ServiceUnavailable(String),
}

/// Implementation of the Display trait for AppError.
///
/// ## Purpose:
/// This trait defines how errors are formatted as human-readable strings.
/// It's used when you print an error or convert it to a string.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

impl AppError {
    /// Machine-readable error type used in JSON bodies.
    fn error_type(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::ServiceUnavailable(_) => "service_unavailable",
        }
    }

    fn message(&self) -> &str {
        match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::ServiceUnavailable(msg) => msg,
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## HTTP Status Code Mapping:
/// - Internal → 500 (Internal Server Error)
/// - BadRequest → 400 (Bad Request)
/// - NotFound → 404 (Not Found)
/// - ServiceUnavailable → 503 (Service Unavailable)
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "service_unavailable",
///     "message": "Maximum of 64 concurrent sessions reached",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.error_type(),
                "message": self.message(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// JSON parsing errors are almost always due to the client sending malformed data,
/// so they result in a 400 (Bad Request) response.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// A session that cannot get an inference engine is a server-side failure.
impl From<ClassifierError> for AppError {
    fn from(err: ClassifierError) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust,ignore
/// fn get_model() -> AppResult<HttpResponse> {
///     // This is equivalent to: fn get_model() -> Result<HttpResponse, AppError>
/// }
/// ```
pub type AppResult<T> = Result<T, AppError>;

/// Result alias for the streaming half of the pipeline.
pub type AudioResult<T> = Result<T, AudioError>;

/// Result alias for the model half of the pipeline.
pub type ClassifierResult<T> = Result<T, ClassifierError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::BadRequest("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Internal("x".into()).status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            AppError::ServiceUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_audio_error_messages() {
        let err = AudioError::InsufficientData { have: 100, need: 48000 };
        assert_eq!(err.to_string(), "Insufficient audio: have 100 samples, need 48000");

        let err = AudioError::Overflow { buffered: 256, limit: 256 };
        assert!(err.to_string().contains("limit 256"));
    }

    #[test]
    fn test_classifier_error_converts_to_internal() {
        let err = ClassifierError::model_load("trained_model/model_gender-0.1.0.safetensors", "missing");
        let app: AppError = err.into();
        assert!(matches!(app, AppError::Internal(msg) if msg.contains("model_gender-")));
    }

    #[actix_web::test]
    async fn test_engine_failure_is_reported_as_json_500() {
        let app: AppError = ClassifierError::Device("CUDA context lost".to_string()).into();
        let response = app.error_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = actix_web::body::to_bytes(response.into_body()).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "internal_error");
        assert!(json["error"]["message"].as_str().unwrap().contains("CUDA context lost"));
    }
}
