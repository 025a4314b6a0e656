//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms)
//! 2. Environment variables (`APP_AUDIO__SAMPLE_RATE`, `APP_MODEL__CELL_TYPE`, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Recognized pipeline options:
//! | Option | Key |
//! |---|---|
//! | `SAMPLE_RATE` | `audio.sample_rate` |
//! | `CHUNK_TRIGGER_COUNT` | `audio.chunk_trigger_count` |
//! | `INPUT_SIZE` | `model.input_size` |
//! | `HIDDEN_SIZE` | `model.hidden_size` |
//! | `NUM_LAYERS` | `model.num_layers` |
//! | `DROPOUT` | `model.dropout` |
//! | `OUTPUT_SIZE` | `model.output_size` |
//! | `BIDIRECTIONAL` | `model.bidirectional` |
//! | `CELL_TYPE` | `model.cell_type` |
//! | `DECISION_THRESHOLD` | `model.decision_threshold` |

use crate::audio::buffer::{OverflowPolicy, SessionBufferConfig};
use crate::audio::features::MelConfig;
use crate::classifier::decision::{DecisionFunction, OutputConvention};
use crate::classifier::model::{CellType, ModelSpec};
use crate::classifier::pool::HiddenStatePolicy;
use anyhow::{anyhow, Result};         // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                         // For reading environment variables
use std::path::PathBuf;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, audio, features, model,
/// performance) mirrors the pipeline stages and keeps each stage's knobs together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub features: FeatureConfig,
    pub model: ModelConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Streaming and buffering settings.
///
/// ## Fields:
/// - `sample_rate`: Fixed capture rate for every chunk in the system (Hz)
/// - `chunk_trigger_count`: Number of buffered chunks that triggers one inference window
/// - `max_buffered_chunks`: Hard bound on buffered chunks per session
/// - `overflow_policy`: What to do when the bound is hit (`drop_oldest` or `reject`)
/// - `max_pending_windows`: Windows allowed to queue behind a busy inference worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub chunk_trigger_count: usize,
    pub max_buffered_chunks: usize,
    pub overflow_policy: OverflowPolicy,
    pub max_pending_windows: usize,
}

/// Mel-spectrogram extraction parameters.
///
/// `f_max = 0.0` means "up to the Nyquist frequency".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub n_fft: usize,
    pub hop_length: usize,
    pub n_mels: usize,
    pub f_min: f32,
    pub f_max: f32,
    pub log_scale: bool,
}

/// Classifier architecture, checkpoint location and decision convention.
///
/// ## Checkpoint naming:
/// The checkpoint file is `{checkpoint_dir}/{name}{version}.safetensors`
/// (a `.pt`/`.pth` file with the same stem is accepted as a fallback). The file
/// itself is untyped weight data, so the architecture must be declared here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub version: String,
    pub checkpoint_dir: String,
    /// Event name used when emitting predictions to clients
    pub event_name: String,
    pub input_size: usize,
    pub hidden_size: usize,
    pub num_layers: usize,
    pub dropout: f32,
    pub output_size: usize,
    pub bidirectional: bool,
    pub cell_type: CellType,
    pub output_convention: OutputConvention,
    /// Class names, low-side class first
    pub labels: Vec<String>,
    pub decision_threshold: f32,
    pub hidden_state: HiddenStatePolicy,
    /// Device preference: "auto", "cpu", "cuda" or "metal"
    pub device: String,
}

/// Performance tuning configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values: 48 kHz browser
/// capture, 32 chunks per window, and the gender model's trained hyperparameters.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,
            },
            audio: AudioConfig {
                sample_rate: 48000,
                chunk_trigger_count: 32,
                max_buffered_chunks: 256,
                overflow_policy: OverflowPolicy::DropOldest,
                max_pending_windows: 4,
            },
            features: FeatureConfig {
                n_fft: 2048,
                hop_length: 512,
                n_mels: 128,
                f_min: 0.0,
                f_max: 0.0,
                log_scale: true,
            },
            model: ModelConfig {
                name: "model_gender-".to_string(),
                version: "0.1.0".to_string(),
                checkpoint_dir: "trained_model".to_string(),
                event_name: "gender_model".to_string(),
                input_size: 128,
                hidden_size: 512,
                num_layers: 10,
                dropout: 0.30,
                output_size: 2,
                bidirectional: true,
                cell_type: CellType::Lstm,
                output_convention: OutputConvention::Softmax,
                labels: vec!["female".to_string(), "male".to_string()],
                decision_threshold: 0.5,
                hidden_state: HiddenStatePolicy::Shared,
                device: "auto".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 64,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__HOST=0.0.0.0`: Override server host
    /// - `APP_AUDIO__CHUNK_TRIGGER_COUNT=16`: Fire inference every 16 chunks
    /// - `APP_MODEL__CELL_TYPE=gru`: Load a GRU checkpoint
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    ///
    /// A double underscore separates sections from keys because keys themselves
    /// contain single underscores.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP_ prefix
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server and performance limits are non-zero
    /// - The buffer bound can hold at least one trigger's worth of chunks
    /// - Extraction parameters fit inside a one-second window
    /// - The mel band count equals the classifier's declared input size
    /// - The output convention agrees with the declared output size
    ///
    /// ## Why validate:
    /// A mismatch between the extractor and the model would otherwise surface as a
    /// `ShapeError` on every single window, long after startup.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow!("Max concurrent sessions must be greater than 0"));
        }

        let audio = &self.audio;
        if audio.sample_rate == 0 {
            return Err(anyhow!("Sample rate must be greater than 0"));
        }
        if audio.chunk_trigger_count == 0 {
            return Err(anyhow!("Chunk trigger count must be greater than 0"));
        }
        if audio.max_buffered_chunks < audio.chunk_trigger_count {
            return Err(anyhow!(
                "max_buffered_chunks ({}) must be at least chunk_trigger_count ({})",
                audio.max_buffered_chunks,
                audio.chunk_trigger_count
            ));
        }
        if audio.max_pending_windows == 0 {
            return Err(anyhow!("max_pending_windows must be greater than 0"));
        }

        let features = &self.features;
        if features.n_fft == 0 || features.hop_length == 0 || features.n_mels == 0 {
            return Err(anyhow!("n_fft, hop_length and n_mels must be greater than 0"));
        }
        if features.n_fft > audio.sample_rate as usize {
            return Err(anyhow!(
                "n_fft ({}) cannot exceed one window of {} samples",
                features.n_fft,
                audio.sample_rate
            ));
        }
        let nyquist = audio.sample_rate as f32 / 2.0;
        if features.f_max > nyquist {
            return Err(anyhow!("f_max ({}) exceeds Nyquist frequency ({})", features.f_max, nyquist));
        }
        let f_max = if features.f_max > 0.0 { features.f_max } else { nyquist };
        if features.f_min < 0.0 || features.f_min >= f_max {
            return Err(anyhow!("f_min ({}) must be in [0, {})", features.f_min, f_max));
        }

        let model = &self.model;
        if model.hidden_size == 0 || model.num_layers == 0 {
            return Err(anyhow!("hidden_size and num_layers must be greater than 0"));
        }
        if !(0.0..1.0).contains(&model.dropout) {
            return Err(anyhow!("dropout must be in [0, 1), got {}", model.dropout));
        }
        if features.n_mels != model.input_size {
            return Err(anyhow!(
                "Feature extractor produces {} mel bands but the model expects input_size {}",
                features.n_mels,
                model.input_size
            ));
        }
        if model.output_size != model.output_convention.expected_output_size() {
            return Err(anyhow!(
                "Output convention {:?} requires output_size {}, got {}",
                model.output_convention,
                model.output_convention.expected_output_size(),
                model.output_size
            ));
        }
        if model.labels.len() != 2 {
            return Err(anyhow!("Exactly two labels are required, got {}", model.labels.len()));
        }
        if !(model.decision_threshold > 0.0 && model.decision_threshold < 1.0) {
            return Err(anyhow!(
                "decision_threshold must be in (0, 1), got {}",
                model.decision_threshold
            ));
        }
        // Softmax decides by comparing the two class scores
        if model.output_convention == OutputConvention::Softmax && model.decision_threshold != 0.5 {
            return Err(anyhow!(
                "decision_threshold {} has no effect with the softmax convention; use 0.5 or switch to sigmoid",
                model.decision_threshold
            ));
        }

        Ok(())
    }
}

impl AudioConfig {
    /// Buffer settings for a new session.
    pub fn to_buffer_config(&self) -> SessionBufferConfig {
        SessionBufferConfig {
            sample_rate: self.sample_rate,
            trigger_count: self.chunk_trigger_count,
            max_buffered_chunks: self.max_buffered_chunks,
            overflow_policy: self.overflow_policy,
        }
    }
}

impl FeatureConfig {
    /// Extractor parameters for windows of `sample_rate` samples.
    pub fn to_mel_config(&self, sample_rate: u32) -> MelConfig {
        MelConfig {
            sample_rate,
            n_fft: self.n_fft,
            hop_length: self.hop_length,
            n_mels: self.n_mels,
            f_min: self.f_min,
            f_max: if self.f_max > 0.0 { self.f_max } else { sample_rate as f32 / 2.0 },
            log_scale: self.log_scale,
        }
    }
}

impl ModelConfig {
    /// Architecture declared for the checkpoint.
    pub fn to_model_spec(&self) -> ModelSpec {
        ModelSpec {
            input_size: self.input_size,
            hidden_size: self.hidden_size,
            num_layers: self.num_layers,
            dropout: self.dropout,
            output_size: self.output_size,
            bidirectional: self.bidirectional,
            cell_type: self.cell_type,
        }
    }

    /// Decision function tagged with this classifier's output convention.
    pub fn to_decision_function(&self) -> DecisionFunction {
        DecisionFunction::new(self.output_convention, self.decision_threshold, self.labels.clone())
    }

    /// Checkpoint stem: model name + version suffix, without extension.
    pub fn checkpoint_stem(&self) -> PathBuf {
        PathBuf::from(&self.checkpoint_dir).join(format!("{}{}", self.name, self.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.chunk_trigger_count, 32);
        assert_eq!(config.model.decision_threshold, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_trigger_must_fit_buffer_bound() {
        let mut config = AppConfig::default();
        config.audio.max_buffered_chunks = config.audio.chunk_trigger_count - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mel_bands_must_match_input_size() {
        let mut config = AppConfig::default();
        config.features.n_mels = 64;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("input_size"));
    }

    #[test]
    fn test_convention_must_match_output_size() {
        let mut config = AppConfig::default();
        config.model.output_convention = OutputConvention::Sigmoid;
        assert!(config.validate().is_err());

        config.model.output_size = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_softmax_rejects_custom_threshold() {
        let mut config = AppConfig::default();
        config.model.decision_threshold = 0.7;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("softmax"));

        config.model.output_convention = OutputConvention::Sigmoid;
        config.model.output_size = 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_nyquist_default_for_f_max() {
        let config = AppConfig::default();
        let mel = config.features.to_mel_config(config.audio.sample_rate);
        assert_eq!(mel.f_max, 24000.0);
    }

    #[test]
    fn test_checkpoint_stem() {
        let config = AppConfig::default();
        assert_eq!(
            config.model.checkpoint_stem(),
            PathBuf::from("trained_model").join("model_gender-0.1.0")
        );
    }
}
