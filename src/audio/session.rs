//! # Session Orchestration
//!
//! Binds one connection's audio stream to the classification pipeline. Each
//! session owns a buffer and a dedicated inference worker; completed windows
//! flow from the buffer to the worker over a bounded queue and predictions
//! flow back out through an [`EventSink`].
//!
//! ## Session Lifecycle:
//! 1. **Open**: Accepting chunks, accumulating toward the trigger count
//! 2. **Ready**: A window was just materialized and is being handed to the worker;
//!    the session returns to Open with an empty buffer
//! 3. **Closed**: Terminal. Buffered audio is discarded without a partial window;
//!    windows already queued still complete and are emitted
//!
//! ## Ordering:
//! One worker per session processes windows strictly in arrival order, so
//! predictions for a session are emitted in the order their windows were formed.
//! Extraction and inference run on Tokio's blocking pool; the async executor
//! only moves windows and results.

use crate::audio::buffer::{InferenceWindow, SessionBuffer, SessionBufferConfig};
use crate::audio::features::MelExtractor;
use crate::audio::pcm::AudioChunk;
use crate::classifier::decision::{Decision, DecisionFunction};
use crate::classifier::engine::{EngineHandle, InferenceEngine};
use crate::error::{AudioError, PipelineError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Where predictions go. Implemented by the WebSocket actor in production and
/// by channels in tests.
pub trait EventSink: Send + Sync + 'static {
    fn emit(&self, session_id: &str, event_name: &str, payload: PredictionPayload);
}

/// Body of one emitted prediction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionPayload {
    pub label: String,
    pub probability: f32,

    /// Window position within the session; not part of the wire payload
    #[serde(skip_serializing)]
    pub sequence: u64,
}

/// Current position in the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Open,
    Ready,
    Closed,
}

/// What happened to one incoming payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkOutcome {
    /// Empty payload, or the session is closed
    Ignored,
    /// Below the trigger count
    Buffered,
    /// A window was formed and queued for inference
    WindowQueued { sequence: u64 },
    /// A window was formed but the worker queue was full
    WindowDropped { sequence: u64 },
    /// Trigger reached with less than one second of audio; waiting for more
    Waiting,
    /// Buffer full under the reject policy
    Rejected,
    /// Payload could not be decoded as 16-bit PCM
    Invalid,
}

/// Stateless glue shared by every session: features → scores → decision.
pub struct ClassificationPipeline {
    extractor: MelExtractor,
    decision: DecisionFunction,
    event_name: String,
}

impl ClassificationPipeline {
    pub fn new(extractor: MelExtractor, decision: DecisionFunction, event_name: impl Into<String>) -> Self {
        Self {
            extractor,
            decision,
            event_name: event_name.into(),
        }
    }

    /// Blocking; call from a worker thread.
    pub fn classify(&self, engine: &InferenceEngine, window: &InferenceWindow) -> Result<Decision, PipelineError> {
        let features = self.extractor.extract(&window.samples)?;
        let scores = engine.infer(&features)?;
        Ok(self.decision.decide(&scores)?)
    }

    pub fn extractor(&self) -> &MelExtractor {
        &self.extractor
    }

    pub fn decision(&self) -> &DecisionFunction {
        &self.decision
    }

    pub fn event_name(&self) -> &str {
        &self.event_name
    }
}

/// Pipeline counters. One instance per session plus one process-wide total.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub chunks_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub invalid_chunks: AtomicU64,
    pub windows_produced: AtomicU64,
    pub windows_dropped: AtomicU64,
    pub predictions_emitted: AtomicU64,
    pub failures: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub chunks_received: u64,
    pub bytes_received: u64,
    pub invalid_chunks: u64,
    pub windows_produced: u64,
    pub windows_dropped: u64,
    pub predictions_emitted: u64,
    pub failures: u64,
}

impl SessionStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            invalid_chunks: self.invalid_chunks.load(Ordering::Relaxed),
            windows_produced: self.windows_produced.load(Ordering::Relaxed),
            windows_dropped: self.windows_dropped.load(Ordering::Relaxed),
            predictions_emitted: self.predictions_emitted.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Adds to a session's counters and the process-wide totals together.
#[derive(Clone)]
struct StatsRecorder {
    session: Arc<SessionStats>,
    totals: Arc<SessionStats>,
}

impl StatsRecorder {
    fn add(&self, counter: fn(&SessionStats) -> &AtomicU64, amount: u64) {
        counter(&self.session).fetch_add(amount, Ordering::Relaxed);
        counter(&self.totals).fetch_add(amount, Ordering::Relaxed);
    }
}

/// Everything a session needs from the process, bundled for `open`.
#[derive(Clone)]
pub struct SessionDeps {
    pub buffer_config: SessionBufferConfig,
    pub max_pending_windows: usize,
    pub pipeline: Arc<ClassificationPipeline>,
    pub totals: Arc<SessionStats>,
}

/// Per-connection state machine. Must be created inside a Tokio runtime.
pub struct SessionOrchestrator {
    session_id: String,
    state: SessionState,
    buffer: SessionBuffer,
    windows: Option<mpsc::Sender<InferenceWindow>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<SessionStats>,
    recorder: StatsRecorder,
}

impl SessionOrchestrator {
    /// Open a session and spawn its inference worker.
    pub fn open(
        session_id: impl Into<String>,
        deps: SessionDeps,
        engine: EngineHandle,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let session_id = session_id.into();
        let stats = Arc::new(SessionStats::default());
        let recorder = StatsRecorder {
            session: stats.clone(),
            totals: deps.totals,
        };

        let (tx, rx) = mpsc::channel(deps.max_pending_windows.max(1));
        let worker = tokio::spawn(run_worker(
            session_id.clone(),
            rx,
            deps.pipeline,
            engine,
            sink,
            recorder.clone(),
        ));

        info!("Session {} opened", session_id);

        Self {
            session_id,
            state: SessionState::Open,
            buffer: SessionBuffer::new(deps.buffer_config),
            windows: Some(tx),
            worker: Some(worker),
            stats,
            recorder,
        }
    }

    /// Feed one raw payload into the session.
    ///
    /// Never fails: every error is handled here (logged and counted) so that a
    /// bad chunk cannot end the session.
    pub fn on_chunk(&mut self, bytes: &[u8]) -> ChunkOutcome {
        if self.state == SessionState::Closed || bytes.is_empty() {
            return ChunkOutcome::Ignored;
        }

        let chunk = match AudioChunk::from_le_bytes(bytes) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("Session {}: {}", self.session_id, e);
                self.recorder.add(|s| &s.invalid_chunks, 1);
                return ChunkOutcome::Invalid;
            }
        };

        self.recorder.add(|s| &s.chunks_received, 1);
        self.recorder.add(|s| &s.bytes_received, bytes.len() as u64);

        match self.buffer.push(chunk) {
            Ok(None) => ChunkOutcome::Buffered,
            Ok(Some(window)) => {
                self.state = SessionState::Ready;
                let outcome = self.dispatch(window);
                self.state = SessionState::Open;
                outcome
            }
            Err(AudioError::InsufficientData { have, need }) => {
                debug!(
                    "Session {}: trigger reached with {} of {} samples, waiting for more audio",
                    self.session_id, have, need
                );
                ChunkOutcome::Waiting
            }
            Err(e) => {
                warn!("Session {}: chunk rejected: {}", self.session_id, e);
                ChunkOutcome::Rejected
            }
        }
    }

    fn dispatch(&mut self, window: InferenceWindow) -> ChunkOutcome {
        let sequence = window.sequence;
        self.recorder.add(|s| &s.windows_produced, 1);

        let Some(tx) = &self.windows else {
            return ChunkOutcome::Ignored;
        };

        match tx.try_send(window) {
            Ok(()) => ChunkOutcome::WindowQueued { sequence },
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Session {}: inference queue full, dropping window {}",
                    self.session_id, sequence
                );
                self.recorder.add(|s| &s.windows_dropped, 1);
                ChunkOutcome::WindowDropped { sequence }
            }
            Err(TrySendError::Closed(_)) => {
                error!("Session {}: inference worker has stopped", self.session_id);
                self.recorder.add(|s| &s.failures, 1);
                ChunkOutcome::WindowDropped { sequence }
            }
        }
    }

    /// Close the session. Buffered chunks are discarded; queued windows still
    /// complete. Returns the worker handle so callers can await the drain.
    pub fn close(&mut self) -> Option<JoinHandle<()>> {
        if self.state == SessionState::Closed {
            return None;
        }

        let discarded = self.buffer.len();
        self.buffer.reset();
        self.windows = None;
        self.state = SessionState::Closed;

        info!(
            "Session {} closed ({} buffered chunks discarded, {:?})",
            self.session_id,
            discarded,
            self.stats.snapshot()
        );

        self.worker.take()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn buffered_chunks(&self) -> usize {
        self.buffer.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Drains one session's window queue in order until the sender is dropped.
async fn run_worker(
    session_id: String,
    mut windows: mpsc::Receiver<InferenceWindow>,
    pipeline: Arc<ClassificationPipeline>,
    engine: EngineHandle,
    sink: Arc<dyn EventSink>,
    recorder: StatsRecorder,
) {
    while let Some(window) = windows.recv().await {
        let sequence = window.sequence;
        let task_pipeline = pipeline.clone();
        let task_engine = engine.clone();

        let result =
            tokio::task::spawn_blocking(move || task_pipeline.classify(&task_engine, &window)).await;

        match result {
            Ok(Ok(decision)) => {
                debug!(
                    "Session {}: window {} -> {} ({:.3})",
                    session_id, sequence, decision.label, decision.probability
                );
                sink.emit(
                    &session_id,
                    pipeline.event_name(),
                    PredictionPayload {
                        label: decision.label,
                        probability: decision.probability,
                        sequence,
                    },
                );
                recorder.add(|s| &s.predictions_emitted, 1);
            }
            Ok(Err(e)) => {
                warn!(
                    "Session {}: window {} failed, result withheld: {}",
                    session_id, sequence, e
                );
                recorder.add(|s| &s.failures, 1);
            }
            Err(e) => {
                error!("Session {}: inference task panicked: {}", session_id, e);
                recorder.add(|s| &s.failures, 1);
            }
        }
    }

    debug!("Session {}: inference worker finished", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::OverflowPolicy;
    use crate::audio::features::MelConfig;
    use crate::classifier::decision::OutputConvention;
    use crate::classifier::model::tests::{checkpoint_tensors, small_spec, write_checkpoint, write_tensors};
    use crate::classifier::model::{CellType, ClassifierModel};
    use crate::classifier::pool::{EnginePool, HiddenStatePolicy};
    use candle_core::Device;
    use tokio::sync::mpsc::UnboundedSender;

    struct ChannelSink {
        tx: UnboundedSender<(String, String, PredictionPayload)>,
    }

    impl EventSink for ChannelSink {
        fn emit(&self, session_id: &str, event_name: &str, payload: PredictionPayload) {
            let _ = self.tx.send((session_id.to_string(), event_name.to_string(), payload));
        }
    }

    fn pool(policy: HiddenStatePolicy) -> EnginePool {
        let spec = small_spec(CellType::Lstm, false);
        let stem = write_checkpoint(&spec);
        let model = ClassifierModel::load(spec, &stem, Device::Cpu).unwrap();
        EnginePool::new(Arc::new(model), policy).unwrap()
    }

    /// The small LSTM with its first-layer input weights scaled down, so
    /// dB-valued features stay inside the gates' linear range and different
    /// audio gives different probabilities.
    fn sensitive_pool() -> EnginePool {
        let spec = small_spec(CellType::Lstm, false);
        let mut tensors = checkpoint_tensors(&spec);
        let scaled = tensors["rnn.weight_ih_l0"].affine(0.01, 0.0).unwrap();
        tensors.insert("rnn.weight_ih_l0".to_string(), scaled);
        let model = ClassifierModel::load(spec, &write_tensors(&tensors), Device::Cpu).unwrap();
        EnginePool::new(Arc::new(model), HiddenStatePolicy::PerSession).unwrap()
    }

    fn deps(max_pending_windows: usize) -> SessionDeps {
        deps_with_mels(8, max_pending_windows)
    }

    fn deps_with_mels(n_mels: usize, max_pending_windows: usize) -> SessionDeps {
        let mel = MelConfig {
            n_mels,
            ..MelConfig::default()
        };
        let decision = DecisionFunction::new(
            OutputConvention::Softmax,
            0.5,
            vec!["female".to_string(), "male".to_string()],
        );
        SessionDeps {
            buffer_config: SessionBufferConfig {
                overflow_policy: OverflowPolicy::DropOldest,
                ..SessionBufferConfig::default()
            },
            max_pending_windows,
            pipeline: Arc::new(ClassificationPipeline::new(MelExtractor::new(mel), decision, "gender_model")),
            totals: Arc::new(SessionStats::default()),
        }
    }

    /// 1600 samples of a `freq` Hz tone starting at sample `offset`.
    fn tone_chunk(freq: f32, offset: usize) -> Vec<u8> {
        (offset..offset + 1600)
            .flat_map(|n| {
                let t = n as f32 / 48000.0;
                let sample = ((2.0 * std::f32::consts::PI * freq * t).sin() * 8000.0) as i16;
                sample.to_le_bytes()
            })
            .collect()
    }

    fn sink() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<(String, String, PredictionPayload)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ChannelSink { tx }), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<(String, String, PredictionPayload)>) -> Vec<(String, String, PredictionPayload)> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_one_second_of_chunks_emits_one_prediction() {
        let pool = pool(HiddenStatePolicy::Shared);
        let (sink, mut rx) = sink();
        let mut session = SessionOrchestrator::open("abc", deps(4), pool.handle_for_session().unwrap(), sink);

        for i in 0..31 {
            assert_eq!(session.on_chunk(&tone_chunk(220.0, i * 1600)), ChunkOutcome::Buffered);
        }
        assert_eq!(
            session.on_chunk(&tone_chunk(220.0, 31 * 1600)),
            ChunkOutcome::WindowQueued { sequence: 0 }
        );
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.buffered_chunks(), 0);

        session.close().unwrap().await.unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        let (session_id, event_name, payload) = &events[0];
        assert_eq!(session_id, "abc");
        assert_eq!(event_name, "gender_model");
        assert!(payload.label == "female" || payload.label == "male");
        assert!((0.0..=1.0).contains(&payload.probability));
        assert_eq!(session.stats().predictions_emitted, 1);
        assert_eq!(session.stats().bytes_received, 32 * 3200);
    }

    #[tokio::test]
    async fn test_close_before_trigger_emits_nothing() {
        let pool = pool(HiddenStatePolicy::Shared);
        let (sink, mut rx) = sink();
        let mut session = SessionOrchestrator::open("short", deps(4), pool.handle_for_session().unwrap(), sink);

        for i in 0..10 {
            session.on_chunk(&tone_chunk(220.0, i * 1600));
        }
        session.close().unwrap().await.unwrap();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.buffered_chunks(), 0);
        assert_eq!(session.on_chunk(&tone_chunk(220.0, 0)), ChunkOutcome::Ignored);
        assert!(session.close().is_none());
    }

    #[tokio::test]
    async fn test_queued_windows_complete_in_order_after_close() {
        let pool = pool(HiddenStatePolicy::PerSession);
        let (sink, mut rx) = sink();
        let mut session = SessionOrchestrator::open("ordered", deps(4), pool.handle_for_session().unwrap(), sink);

        for i in 0..96 {
            session.on_chunk(&tone_chunk(220.0, i * 1600));
        }
        // A partial fourth window is discarded on close
        for i in 96..100 {
            session.on_chunk(&tone_chunk(220.0, i * 1600));
        }
        session.close().unwrap().await.unwrap();

        let sequences: Vec<u64> = drain(&mut rx).into_iter().map(|(_, _, p)| p.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_window() {
        let pool = pool(HiddenStatePolicy::Shared);
        let (sink, mut rx) = sink();
        let mut session = SessionOrchestrator::open("busy", deps(1), pool.handle_for_session().unwrap(), sink);

        // The worker is not polled until this task yields, so the queue fills
        let mut outcomes = Vec::new();
        for i in 0..96 {
            let outcome = session.on_chunk(&tone_chunk(220.0, i * 1600));
            if outcome != ChunkOutcome::Buffered {
                outcomes.push(outcome);
            }
        }
        assert_eq!(
            outcomes,
            vec![
                ChunkOutcome::WindowQueued { sequence: 0 },
                ChunkOutcome::WindowDropped { sequence: 1 },
                ChunkOutcome::WindowDropped { sequence: 2 },
            ]
        );

        session.close().unwrap().await.unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
        assert_eq!(session.stats().windows_dropped, 2);
    }

    #[tokio::test]
    async fn test_invalid_and_empty_chunks_do_not_end_session() {
        let pool = pool(HiddenStatePolicy::Shared);
        let (sink, _rx) = sink();
        let mut session = SessionOrchestrator::open("odd", deps(4), pool.handle_for_session().unwrap(), sink);

        assert_eq!(session.on_chunk(&[]), ChunkOutcome::Ignored);
        assert_eq!(session.on_chunk(&[1, 2, 3]), ChunkOutcome::Invalid);
        assert_eq!(session.on_chunk(&tone_chunk(220.0, 0)), ChunkOutcome::Buffered);
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.stats().invalid_chunks, 1);
        assert_eq!(session.stats().chunks_received, 1);
    }

    fn probabilities(events: &[(String, String, PredictionPayload)], session_id: &str) -> Vec<f32> {
        events
            .iter()
            .filter(|(id, _, _)| id == session_id)
            .map(|(_, _, p)| p.probability)
            .collect()
    }

    /// Two windows of one tone through a session of its own.
    async fn run_alone(pool: &EnginePool, session_id: &str, freq: f32) -> Vec<f32> {
        let (sink, mut rx) = sink();
        let mut session = SessionOrchestrator::open(session_id, deps(4), pool.handle_for_session().unwrap(), sink);
        for i in 0..64 {
            session.on_chunk(&tone_chunk(freq, i * 1600));
        }
        session.close().unwrap().await.unwrap();
        probabilities(&drain(&mut rx), session_id)
    }

    #[tokio::test]
    async fn test_concurrent_sessions_see_only_their_own_audio() {
        let pool = sensitive_pool();

        let low_alone = run_alone(&pool, "low", 220.0).await;
        let high_alone = run_alone(&pool, "high", 3000.0).await;
        assert_eq!(low_alone.len(), 2);
        assert_eq!(high_alone.len(), 2);
        assert_ne!(low_alone, high_alone);

        let (sink, mut rx) = sink();
        let deps = deps(4);
        let mut low = SessionOrchestrator::open("low", deps.clone(), pool.handle_for_session().unwrap(), sink.clone());
        let mut high = SessionOrchestrator::open("high", deps.clone(), pool.handle_for_session().unwrap(), sink);

        for i in 0..64 {
            low.on_chunk(&tone_chunk(220.0, i * 1600));
            high.on_chunk(&tone_chunk(3000.0, i * 1600));
        }
        low.close().unwrap().await.unwrap();
        high.close().unwrap().await.unwrap();

        let events = drain(&mut rx);
        let bits = |probs: &[f32]| probs.iter().map(|p| p.to_bits()).collect::<Vec<_>>();
        assert_eq!(bits(&probabilities(&events, "low")), bits(&low_alone));
        assert_eq!(bits(&probabilities(&events, "high")), bits(&high_alone));
        assert_eq!(deps.totals.snapshot().predictions_emitted, 4);
    }

    #[tokio::test]
    async fn test_failed_window_is_withheld_and_session_continues() {
        let pool = pool(HiddenStatePolicy::Shared);
        let (sink, mut rx) = sink();
        // 7 mel bands against a model that takes 8 inputs
        let mut session =
            SessionOrchestrator::open("mismatch", deps_with_mels(7, 4), pool.handle_for_session().unwrap(), sink);

        for i in 0..31 {
            session.on_chunk(&tone_chunk(220.0, i * 1600));
        }
        assert_eq!(
            session.on_chunk(&tone_chunk(220.0, 31 * 1600)),
            ChunkOutcome::WindowQueued { sequence: 0 }
        );

        for _ in 0..200 {
            if session.stats().failures == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(session.stats().failures, 1);
        assert_eq!(session.stats().predictions_emitted, 0);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.state(), SessionState::Open);
        assert_eq!(session.on_chunk(&tone_chunk(220.0, 32 * 1600)), ChunkOutcome::Buffered);

        session.close().unwrap().await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }
}
