//! # Audio Processing Module
//!
//! Turns a stream of raw PCM chunks into classification-ready windows and features.
//!
//! ## Key Components:
//! - **PCM decoding**: Little-endian 16-bit payloads into immutable chunks
//! - **Session Buffer**: Chunk accumulation until the trigger count, one-second windows
//! - **Feature Extractor**: Log-mel spectrograms with librosa-compatible defaults
//! - **Session Orchestrator**: Per-connection state machine and inference worker
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: Fixed by configuration (48 kHz by default)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

// WebSocket handler is in src/websocket.rs at the root level
pub mod buffer;
pub mod features;
pub mod pcm;
pub mod session;
