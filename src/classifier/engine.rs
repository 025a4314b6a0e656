//! # Inference Engine
//!
//! Stateful front end to a loaded classifier. Each engine owns one hidden
//! state that persists across windows, so the network sees a continuous
//! stream rather than independent one-second clips.
//!
//! ## Key Responsibilities:
//! - **Input validation**: Feature width must equal the model's input size
//! - **State carry-over**: The state produced by one call is the initial
//!   state of the next call on the same handle
//! - **Mutual exclusion**: One lock covers the forward pass and the state
//!   update, so concurrent callers never interleave half-updated state
//! - **Numeric guard**: Non-finite scores are reported and the state is not committed
//!
//! ## Thread Safety:
//! `infer` blocks for the length of a forward pass and is meant to run on a
//! blocking worker thread (`tokio::task::spawn_blocking`), never on the async
//! executor.

use crate::audio::features::FeatureTensor;
use crate::classifier::model::ClassifierModel;
use crate::classifier::recurrent::RecurrentState;
use crate::error::{ClassifierError, ClassifierResult};
use candle_core::Tensor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Shared handle to one engine (one hidden state).
pub type EngineHandle = Arc<InferenceEngine>;

pub struct InferenceEngine {
    model: Arc<ClassifierModel>,
    state: Mutex<RecurrentState>,
    inferences: AtomicU64,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("model", &self.model)
            .field("inferences", &self.inferences.load(Ordering::Relaxed))
            .finish()
    }
}

impl InferenceEngine {
    /// Create a handle with an all-zero hidden state.
    pub fn new(model: Arc<ClassifierModel>) -> ClassifierResult<EngineHandle> {
        let state = model.zero_state()?;
        Ok(Arc::new(Self {
            model,
            state: Mutex::new(state),
            inferences: AtomicU64::new(0),
        }))
    }

    /// Run one window of features through the classifier.
    ///
    /// ## Returns:
    /// - **Ok(scores)**: `output_size` raw scores; the hidden state has advanced
    /// - **Err(Shape)**: Feature width differs from the model's input size
    /// - **Err(Numeric)**: The network produced NaN or infinity; state unchanged
    pub fn infer(&self, features: &FeatureTensor) -> ClassifierResult<Vec<f32>> {
        let spec = self.model.spec();
        let (n_frames, n_mels) = features.shape();

        if n_mels != spec.input_size {
            return Err(ClassifierError::Shape {
                expected: format!("(frames, {})", spec.input_size),
                actual: format!("({}, {})", n_frames, n_mels),
            });
        }
        if n_frames == 0 {
            return Err(ClassifierError::Shape {
                expected: format!("at least one frame of width {}", spec.input_size),
                actual: "(0, _)".to_string(),
            });
        }

        let start_time = Instant::now();
        let input = Tensor::from_slice(features.data(), (1, n_frames, n_mels), self.model.device())?;

        let mut state = self.lock_state();
        let (scores, next_state) = self.model.forward(&input, &state)?;

        if scores.iter().any(|s| !s.is_finite()) {
            return Err(ClassifierError::Numeric(format!(
                "classifier produced non-finite scores {:?}",
                scores
            )));
        }

        *state = next_state;
        drop(state);

        self.inferences.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            "Inference over {} frames took {}ms",
            n_frames,
            start_time.elapsed().as_millis()
        );

        Ok(scores)
    }

    /// Zero the hidden (and cell) state.
    pub fn reset_state(&self) -> ClassifierResult<()> {
        let fresh = self.model.zero_state()?;
        *self.lock_state() = fresh;
        Ok(())
    }

    /// Copy of the current state. Tensors are reference-counted, so this is cheap.
    pub fn state_snapshot(&self) -> RecurrentState {
        self.lock_state().clone()
    }

    pub fn state_shape(&self) -> Vec<usize> {
        self.lock_state().shape()
    }

    pub fn inferences(&self) -> u64 {
        self.inferences.load(Ordering::Relaxed)
    }

    pub fn model(&self) -> &Arc<ClassifierModel> {
        &self.model
    }

    /// The state is only ever replaced whole, so a poisoned lock still holds a
    /// consistent state and can be recovered.
    fn lock_state(&self) -> MutexGuard<'_, RecurrentState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
