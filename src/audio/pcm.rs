//! # PCM Decoding
//!
//! Turns raw WebSocket payloads into immutable audio chunks and converts
//! buffered samples to the floating-point range the feature extractor expects.
//!
//! ## Wire format:
//! - **Encoding**: Little-endian signed 16-bit integers
//! - **Channels**: Mono
//! - **Sample rate**: Not carried per chunk; fixed system-wide by configuration

use crate::error::{AudioError, AudioResult};
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;
use std::sync::Arc;

/// One network-delivered unit of PCM audio.
///
/// Samples are stored behind an `Arc` so a chunk can be cloned into the buffer
/// and inspected by tests without copying the payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    samples: Arc<[i16]>,
}

impl AudioChunk {
    /// Decode a little-endian 16-bit PCM payload.
    ///
    /// ## Errors:
    /// - Empty payload
    /// - Odd number of bytes (a trailing half sample)
    pub fn from_le_bytes(data: &[u8]) -> AudioResult<Self> {
        if data.is_empty() {
            return Err(AudioError::InvalidChunk("No audio data provided".to_string()));
        }
        if data.len() % 2 != 0 {
            return Err(AudioError::InvalidChunk(format!(
                "Audio data length must be even for 16-bit samples, got {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }

        Ok(Self { samples: samples.into() })
    }

    pub fn from_samples(samples: Vec<i16>) -> Self {
        Self { samples: samples.into() }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Convert 16-bit PCM samples to 32-bit floats in [-1.0, 1.0).
///
/// Scales from the integer range [-32768, 32767] by 1/32768, the format
/// expected by most machine learning audio models.
pub fn pcm_to_float(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&sample| sample as f32 / 32768.0).collect()
}
