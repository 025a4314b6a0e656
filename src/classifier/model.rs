//! # Classifier Model
//!
//! Loads a trained recurrent classifier from disk and runs its forward pass.
//!
//! ## Architecture:
//! `features (1, frames, input_size)` → stacked LSTM/GRU → last time step
//! `(1, hidden * directions)` → linear head → `output_size` raw scores.
//!
//! ## Loading Process:
//! 1. Resolve `{stem}.safetensors`, then `{stem}.pt`, then `{stem}.pth`
//! 2. Map the weights onto the preferred device
//! 3. Validate with a zero-input forward pass
//! 4. If the preferred device is an accelerator and any step fails, log the
//!    device error and retry once on the CPU
//!
//! Weights are immutable after loading; the model is shared behind an `Arc`
//! by every inference engine handle.

use crate::classifier::recurrent::{RecurrentStack, RecurrentState};
use crate::device::DeviceManager;
use crate::error::{ClassifierError, ClassifierResult};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Recurrent cell family of the checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Lstm,
    Gru,
}

impl CellType {
    /// Gates stacked in each weight matrix.
    pub fn gate_count(&self) -> usize {
        match self {
            CellType::Lstm => 4,
            CellType::Gru => 3,
        }
    }
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CellType::Lstm => write!(f, "lstm"),
            CellType::Gru => write!(f, "gru"),
        }
    }
}

/// Architecture declared alongside a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSpec {
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    /// Training-time only; recorded for reporting
    pub dropout: f32,
    pub output_size: usize,
    pub bidirectional: bool,
    pub cell_type: CellType,
}

impl ModelSpec {
    pub fn num_directions(&self) -> usize {
        if self.bidirectional {
            2
        } else {
            1
        }
    }

    /// Shape of the hidden state: `(num_layers * directions, 1, hidden_size)`.
    pub fn state_shape(&self) -> [usize; 3] {
        [self.num_layers * self.num_directions(), 1, self.hidden_size]
    }
}

/// Reporting view of a loaded model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub checkpoint: String,
    pub device: String,
    pub spec: ModelSpec,
    pub state_shape: [usize; 3],
    pub load_time_ms: u64,
}

/// A loaded, immutable recurrent classifier.
pub struct ClassifierModel {
    spec: ModelSpec,
    stack: RecurrentStack,
    /// Linear head weight, transposed to `(hidden * directions, output_size)`
    head_w_t: Tensor,
    head_b: Tensor,
    device: Device,
    checkpoint: PathBuf,
    load_time_ms: u64,
}

impl std::fmt::Debug for ClassifierModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierModel")
            .field("spec", &self.spec)
            .field("device", &DeviceManager::get_device_info(&self.device))
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}

impl ClassifierModel {
    /// Load the checkpoint at `{stem}.{safetensors|pt|pth}` onto `device`.
    ///
    /// ## Returns:
    /// - **Ok(ClassifierModel)**: Weights loaded and validated
    /// - **Err(ModelLoad)**: No checkpoint found, unreadable file, or weights
    ///   that do not match `spec`
    pub fn load(spec: ModelSpec, stem: &Path, device: Device) -> ClassifierResult<Self> {
        let path = resolve_checkpoint(stem)?;
        tracing::info!(
            "Loading {} classifier from {} ({} layers, hidden {}, bidirectional {})",
            spec.cell_type,
            path.display(),
            spec.num_layers,
            spec.hidden_size,
            spec.bidirectional
        );

        if device.is_cpu() {
            return Self::load_on(spec, &path, device);
        }

        let device_info = DeviceManager::get_device_info(&device);
        match Self::load_on(spec.clone(), &path, device) {
            Ok(model) => Ok(model),
            Err(e) => {
                let device_error = ClassifierError::Device(format!("{}: {}", device_info, e));
                tracing::warn!("{}, retrying on CPU", device_error);
                Self::load_on(spec, &path, Device::Cpu)
            }
        }
    }

    fn load_on(spec: ModelSpec, path: &Path, device: Device) -> ClassifierResult<Self> {
        let start_time = Instant::now();

        let weights = if path.extension().map_or(false, |ext| ext == "safetensors") {
            // Safety: the checkpoint is not modified while the process runs
            unsafe { VarBuilder::from_mmaped_safetensors(&[path], DType::F32, &device) }
        } else {
            VarBuilder::from_pth(path, DType::F32, &device)
        };
        let vb = weights.map_err(|e| ClassifierError::model_load(path, e))?;

        let mut model = Self::from_var_builder(spec, vb, device, path.to_path_buf())
            .map_err(|e| ClassifierError::model_load(path, e))?;
        model.load_time_ms = start_time.elapsed().as_millis() as u64;
        tracing::info!(
            "Classifier loaded on {} in {}ms",
            DeviceManager::get_device_info(&model.device),
            model.load_time_ms
        );
        Ok(model)
    }

    /// Build the model from an already-opened weight source and validate it.
    pub fn from_var_builder(
        spec: ModelSpec,
        vb: VarBuilder,
        device: Device,
        checkpoint: PathBuf,
    ) -> ClassifierResult<Self> {
        let stack = RecurrentStack::load(
            vb.pp("rnn"),
            spec.cell_type,
            spec.input_size,
            spec.hidden_size,
            spec.num_layers,
            spec.bidirectional,
        )?;

        let head_vb = vb.pp("linear");
        let head_w = head_vb.get((spec.output_size, stack.output_size()), "weight")?;
        let head_b = head_vb.get(spec.output_size, "bias")?;

        let model = Self {
            spec,
            stack,
            head_w_t: head_w.t()?.contiguous()?,
            head_b,
            device,
            checkpoint,
            load_time_ms: 0,
        };
        model.validate()?;
        Ok(model)
    }

    /// One zero-input step to confirm the weights run on the chosen device.
    fn validate(&self) -> ClassifierResult<()> {
        let input = Tensor::zeros((1, 1, self.spec.input_size), DType::F32, &self.device)?;
        let state = self.zero_state()?;
        let (scores, _) = self.forward(&input, &state)?;
        tracing::debug!("Model validation successful, zero-input scores {:?}", scores);
        Ok(())
    }

    /// Fresh all-zero hidden (and cell) state on the model's device.
    pub fn zero_state(&self) -> ClassifierResult<RecurrentState> {
        Ok(self.stack.zero_state(1, &self.device)?)
    }

    /// Run the network over `input` of shape `(1, frames, input_size)`.
    ///
    /// Returns the raw scores of the last time step and the state to carry
    /// forward; the caller decides whether to commit that state.
    pub fn forward(
        &self,
        input: &Tensor,
        state: &RecurrentState,
    ) -> ClassifierResult<(Vec<f32>, RecurrentState)> {
        let (sequence, next_state) = self.stack.forward(input, state)?;
        let frames = sequence.dim(1)?;
        let last = sequence.narrow(1, frames - 1, 1)?.squeeze(1)?;

        let scores = last
            .matmul(&self.head_w_t)?
            .broadcast_add(&self.head_b)?
            .squeeze(0)?
            .to_vec1::<f32>()?;

        Ok((scores, next_state))
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn checkpoint(&self) -> &Path {
        &self.checkpoint
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            checkpoint: self.checkpoint.display().to_string(),
            device: DeviceManager::get_device_info(&self.device),
            spec: self.spec.clone(),
            state_shape: self.spec.state_shape(),
            load_time_ms: self.load_time_ms,
        }
    }
}

/// Find the first existing checkpoint file for `stem`.
fn resolve_checkpoint(stem: &Path) -> ClassifierResult<PathBuf> {
    let file_name = stem
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    for extension in ["safetensors", "pt", "pth"] {
        let candidate = stem.with_file_name(format!("{}.{}", file_name, extension));
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    Err(ClassifierError::model_load(
        stem,
        "no checkpoint found (tried .safetensors, .pt, .pth)",
    ))
}
