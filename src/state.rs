//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor: the loaded
//! classifier, the stateless pipeline pieces, request metrics and pipeline counters.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Many handlers and sessions hold the same model and pipeline
//! - **Memory safety**: The model is freed when the last reference is dropped
//!
//! ### RwLock vs atomics
//! - **RwLock**: Request metrics, a map updated by every request
//! - **AtomicU64**: Pipeline counters, bumped from inference workers without locking
//!
//! ## What is NOT here:
//! Session buffers. Each buffer belongs to exactly one session orchestrator,
//! which lives inside its WebSocket actor, so no lock is ever needed for audio.
//!
//! Configuration is read once at startup and is immutable for the life of the
//! process; the model it describes is loaded exactly once.

use crate::audio::session::{ClassificationPipeline, SessionDeps, SessionStats, StatsSnapshot};
use crate::classifier::pool::EnginePool;
use crate::config::AppConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across all handlers and sessions.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning copies the `Arc` pointers, never the model
/// - **Arc<RwLock<T>>**: Thread-safe shared mutable data (metrics)
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration (fixed after startup)
    pub config: Arc<AppConfig>,

    /// HTTP request metrics, updated by middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Loaded classifier and the engine handles issued from it
    pub engines: Arc<EnginePool>,

    /// Feature extractor + decision function, shared by every session
    pub pipeline: Arc<ClassificationPipeline>,

    /// Process-wide pipeline counters (sum over all sessions, past and present)
    pub pipeline_totals: Arc<SessionStats>,

    /// When the server started
    pub start_time: Instant,
}

/// Request metrics collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Currently open audio sessions
    pub active_sessions: u32,

    /// Sessions refused because the concurrency limit was reached
    pub refused_sessions: u64,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,

    /// Cumulative processing time (milliseconds)
    pub total_duration_ms: u64,

    pub error_count: u64,
}

impl AppState {
    /// Assemble state from a validated config and an already-loaded engine pool.
    ///
    /// ## What this does:
    /// 1. Builds the mel extractor and decision function from configuration
    /// 2. Wraps everything in `Arc` for sharing
    /// 3. Records the server start time
    pub fn new(config: AppConfig, engines: EnginePool) -> Self {
        let mel_config = config.features.to_mel_config(config.audio.sample_rate);
        let pipeline = ClassificationPipeline::new(
            crate::audio::features::MelExtractor::new(mel_config),
            config.model.to_decision_function(),
            config.model.event_name.clone(),
        );

        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            engines: Arc::new(engines),
            pipeline: Arc::new(pipeline),
            pipeline_totals: Arc::new(SessionStats::default()),
            start_time: Instant::now(),
        }
    }

    /// Everything a new session orchestrator needs from the process.
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            buffer_config: self.config.audio.to_buffer_config(),
            max_pending_windows: self.config.audio.max_pending_windows,
            pipeline: self.pipeline.clone(),
            totals: self.pipeline_totals.clone(),
        }
    }

    /// Claim a session slot if the concurrency limit allows.
    ///
    /// ## Returns:
    /// - **true**: Slot claimed; the caller must call `release_session` on close
    /// - **false**: Limit reached; the refusal is counted
    pub fn try_open_session(&self) -> bool {
        let limit = self.config.performance.max_concurrent_sessions;
        let mut metrics = self.metrics_mut();
        if (metrics.active_sessions as usize) < limit {
            metrics.active_sessions += 1;
            true
        } else {
            metrics.refused_sessions += 1;
            false
        }
    }

    /// Release a slot claimed by `try_open_session`.
    ///
    /// Includes an underflow guard so a double release cannot wrap the counter.
    pub fn release_session(&self) {
        let mut metrics = self.metrics_mut();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    pub fn active_sessions(&self) -> u32 {
        self.metrics_ref().active_sessions
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        self.metrics_mut().request_count += 1;
    }

    /// Increment the total error counter (4xx and 5xx responses).
    pub fn increment_error_count(&self) {
        self.metrics_mut().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    ///
    /// ## HashMap operations:
    /// The first time an endpoint is seen a default entry is created with `.entry().or_default()`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the request metrics, taken without holding the lock
    /// while the response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics_ref().clone()
    }

    /// Pipeline counters summed over every session.
    pub fn pipeline_snapshot(&self) -> StatsSnapshot {
        self.pipeline_totals.snapshot()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Metrics are only ever updated field by field, so a lock poisoned by a
    /// panicking writer still holds usable counters.
    fn metrics_ref(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl EndpointMetric {
    /// Average = Total Duration ÷ Number of Requests
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error Rate = Number of Errors ÷ Total Requests (0.0 to 1.0)
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::classifier::model::tests::{small_spec, write_checkpoint};
    use crate::classifier::model::{CellType, ClassifierModel};
    use crate::classifier::pool::HiddenStatePolicy;
    use candle_core::Device;

    /// State around the small test checkpoint, with features sized to match it.
    pub fn test_state(max_sessions: usize) -> AppState {
        let spec = small_spec(CellType::Lstm, false);
        let stem = write_checkpoint(&spec);
        let model = ClassifierModel::load(spec, &stem, Device::Cpu).unwrap();
        let engines = EnginePool::new(Arc::new(model), HiddenStatePolicy::Shared).unwrap();

        let mut config = AppConfig::default();
        config.features.n_mels = 8;
        config.model.input_size = 8;
        config.model.hidden_size = 4;
        config.model.num_layers = 2;
        config.model.bidirectional = false;
        config.performance.max_concurrent_sessions = max_sessions;
        AppState::new(config, engines)
    }

    #[test]
    fn test_session_limit() {
        let state = test_state(2);
        assert!(state.try_open_session());
        assert!(state.try_open_session());
        assert!(!state.try_open_session());
        assert_eq!(state.get_metrics_snapshot().refused_sessions, 1);

        state.release_session();
        assert!(state.try_open_session());
        assert_eq!(state.active_sessions(), 2);
    }

    #[test]
    fn test_release_never_underflows() {
        let state = test_state(1);
        state.release_session();
        assert_eq!(state.active_sessions(), 0);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = test_state(1);
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_session_deps_follow_config() {
        let state = test_state(1);
        let deps = state.session_deps();
        assert_eq!(deps.buffer_config.trigger_count, 32);
        assert_eq!(deps.max_pending_windows, 4);
        assert_eq!(deps.pipeline.extractor().config().n_mels, 8);
    }
}
