//! # Session Buffer
//!
//! Per-session accumulator of incoming audio chunks. Decides when enough audio
//! has arrived to form an inference window and resets itself after the window
//! has been taken.
//!
//! ## Key Features:
//! - **Trigger count**: A window is materialized once `trigger_count` chunks are buffered
//! - **Fixed window**: Always exactly `sample_rate` samples (one second), the trailing
//!   slice of the concatenated chunks; excess audio is discarded from the front
//! - **Bounded growth**: At most `max_buffered_chunks` chunks, with a configurable
//!   overflow policy for a session whose windows cannot be formed
//! - **Single owner**: The buffer belongs to one session's orchestrator and is never
//!   shared, so it needs no locking

use crate::audio::pcm::{pcm_to_float, AudioChunk};
use crate::error::{AudioError, AudioResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::warn;

/// What happens when a chunk arrives and the buffer already holds `max_buffered_chunks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered chunk and accept the new one
    DropOldest,
    /// Refuse the new chunk with `AudioError::Overflow`
    Reject,
}

/// Configuration for one session buffer.
#[derive(Debug, Clone)]
pub struct SessionBufferConfig {
    /// Samples per second; also the exact length of every window
    pub sample_rate: u32,

    /// Number of buffered chunks that triggers window materialization
    pub trigger_count: usize,

    /// Upper bound on buffered chunks
    pub max_buffered_chunks: usize,

    pub overflow_policy: OverflowPolicy,
}

impl Default for SessionBufferConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            trigger_count: 32,
            max_buffered_chunks: 256,
            overflow_policy: OverflowPolicy::DropOldest,
        }
    }
}

/// Exactly one second of normalized audio ready for feature extraction.
#[derive(Debug, Clone)]
pub struct InferenceWindow {
    /// `sample_rate` samples in [-1.0, 1.0)
    pub samples: Vec<f32>,

    /// Position of this window in the session's window sequence (starting at 0)
    pub sequence: u64,
}

/// Ordered chunk accumulator for one session.
#[derive(Debug)]
pub struct SessionBuffer {
    config: SessionBufferConfig,
    chunks: VecDeque<AudioChunk>,
    buffered_samples: usize,
    windows_produced: u64,
    dropped_chunks: u64,
}

impl SessionBuffer {
    pub fn new(config: SessionBufferConfig) -> Self {
        Self {
            chunks: VecDeque::with_capacity(config.trigger_count),
            config,
            buffered_samples: 0,
            windows_produced: 0,
            dropped_chunks: 0,
        }
    }

    /// Append a chunk and, once the trigger count is reached, materialize a window.
    ///
    /// ## Returns:
    /// - **Ok(None)**: Below the trigger; nothing to infer yet, buffered content preserved
    /// - **Ok(Some(window))**: Trigger reached; the buffer is now empty
    /// - **Err(InsufficientData)**: Trigger reached but less than one second of audio is
    ///   buffered; the buffer is kept so the caller can wait for more chunks
    /// - **Err(Overflow)**: Buffer full under the `Reject` policy; the chunk was not appended
    pub fn push(&mut self, chunk: AudioChunk) -> AudioResult<Option<InferenceWindow>> {
        if self.chunks.len() >= self.config.max_buffered_chunks {
            match self.config.overflow_policy {
                OverflowPolicy::DropOldest => {
                    if let Some(dropped) = self.chunks.pop_front() {
                        self.buffered_samples -= dropped.len();
                        self.dropped_chunks += 1;
                        warn!(
                            limit = self.config.max_buffered_chunks,
                            dropped_samples = dropped.len(),
                            "Session buffer full, dropped oldest chunk"
                        );
                    }
                }
                OverflowPolicy::Reject => {
                    return Err(AudioError::Overflow {
                        buffered: self.chunks.len(),
                        limit: self.config.max_buffered_chunks,
                    });
                }
            }
        }

        self.buffered_samples += chunk.len();
        self.chunks.push_back(chunk);

        if self.chunks.len() < self.config.trigger_count {
            return Ok(None);
        }

        self.take_window().map(Some)
    }

    /// Concatenate the buffered chunks, keep the trailing `sample_rate` samples and clear.
    ///
    /// Fails with `InsufficientData` (leaving the buffer untouched) rather than
    /// returning a short or zero-padded window.
    pub fn take_window(&mut self) -> AudioResult<InferenceWindow> {
        let need = self.config.sample_rate as usize;
        if self.buffered_samples < need {
            return Err(AudioError::InsufficientData {
                have: self.buffered_samples,
                need,
            });
        }

        let mut samples = Vec::with_capacity(need);
        let mut skip = self.buffered_samples - need;
        for chunk in &self.chunks {
            let chunk_samples = chunk.samples();
            if skip >= chunk_samples.len() {
                skip -= chunk_samples.len();
                continue;
            }
            samples.extend(pcm_to_float(&chunk_samples[skip..]));
            skip = 0;
        }

        let window = InferenceWindow {
            samples,
            sequence: self.windows_produced,
        };
        self.windows_produced += 1;
        self.reset();

        Ok(window)
    }

    /// Discard everything buffered. Counters survive.
    pub fn reset(&mut self) {
        self.chunks.clear();
        self.buffered_samples = 0;
    }

    /// Number of buffered chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total samples across buffered chunks.
    pub fn buffered_samples(&self) -> usize {
        self.buffered_samples
    }

    /// Buffered chunks in arrival order.
    pub fn chunks(&self) -> impl Iterator<Item = &AudioChunk> {
        self.chunks.iter()
    }

    pub fn windows_produced(&self) -> u64 {
        self.windows_produced
    }

    pub fn dropped_chunks(&self) -> u64 {
        self.dropped_chunks
    }

    pub fn config(&self) -> &SessionBufferConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(len: usize, value: i16) -> AudioChunk {
        AudioChunk::from_samples(vec![value; len])
    }

    /// Chunk whose samples count up from `start`, so positions can be traced.
    fn ramp(start: usize, len: usize) -> AudioChunk {
        AudioChunk::from_samples((start..start + len).map(|v| (v % 32768) as i16).collect())
    }

    #[test]
    fn test_below_trigger_returns_nothing_and_preserves_order() {
        let mut buffer = SessionBuffer::new(SessionBufferConfig::default());
        for i in 0..31 {
            assert!(buffer.push(chunk_of(1600, i as i16)).unwrap().is_none());
        }

        assert_eq!(buffer.len(), 31);
        let firsts: Vec<i16> = buffer.chunks().map(|c| c.samples()[0]).collect();
        assert_eq!(firsts, (0..31).collect::<Vec<i16>>());
    }

    #[test]
    fn test_trigger_produces_trailing_one_second_window() {
        let mut buffer = SessionBuffer::new(SessionBufferConfig::default());

        let mut window = None;
        for i in 0..32 {
            window = buffer.push(ramp(i * 1600, 1600)).unwrap();
            if i < 31 {
                assert!(window.is_none());
            }
        }

        let window = window.expect("32nd chunk must produce a window");
        assert_eq!(window.samples.len(), 48000);
        assert_eq!(window.sequence, 0);
        // 51200 samples buffered, the first 3200 are discarded
        assert_eq!(window.samples[0], 3200.0 / 32768.0);
        assert_eq!(window.samples[47999], (51199 % 32768) as i16 as f32 / 32768.0);
        assert!(buffer.is_empty());
        assert_eq!(buffer.buffered_samples(), 0);
    }

    #[test]
    fn test_next_chunk_starts_fresh_accumulation() {
        let mut buffer = SessionBuffer::new(SessionBufferConfig::default());
        for _ in 0..32 {
            buffer.push(chunk_of(1600, 1)).unwrap();
        }
        assert!(buffer.push(chunk_of(1600, 2)).unwrap().is_none());
        assert_eq!(buffer.len(), 1);

        for _ in 0..31 {
            buffer.push(chunk_of(1600, 3)).unwrap();
        }
        assert_eq!(buffer.windows_produced(), 2);
    }

    #[test]
    fn test_insufficient_data_keeps_buffer_until_enough_audio() {
        let config = SessionBufferConfig {
            trigger_count: 4,
            ..SessionBufferConfig::default()
        };
        let mut buffer = SessionBuffer::new(config);

        for _ in 0..3 {
            assert!(buffer.push(chunk_of(10000, 1)).unwrap().is_none());
        }
        let err = buffer.push(chunk_of(10000, 1)).unwrap_err();
        assert_eq!(err, AudioError::InsufficientData { have: 40000, need: 48000 });
        assert_eq!(buffer.len(), 4);

        let window = buffer.push(chunk_of(10000, 1)).unwrap().unwrap();
        assert_eq!(window.samples.len(), 48000);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_take_window_never_pads() {
        let mut buffer = SessionBuffer::new(SessionBufferConfig::default());
        buffer.push(chunk_of(100, 1)).unwrap();
        assert!(matches!(
            buffer.take_window(),
            Err(AudioError::InsufficientData { have: 100, need: 48000 })
        ));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_overflow_drop_oldest() {
        let config = SessionBufferConfig {
            trigger_count: 3,
            max_buffered_chunks: 3,
            overflow_policy: OverflowPolicy::DropOldest,
            ..SessionBufferConfig::default()
        };
        let mut buffer = SessionBuffer::new(config);

        for value in 0..3 {
            let _ = buffer.push(chunk_of(10, value));
        }
        let result = buffer.push(chunk_of(10, 3));
        assert!(matches!(result, Err(AudioError::InsufficientData { .. })));

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.dropped_chunks(), 1);
        let firsts: Vec<i16> = buffer.chunks().map(|c| c.samples()[0]).collect();
        assert_eq!(firsts, vec![1, 2, 3]);
        assert_eq!(buffer.buffered_samples(), 30);
    }

    #[test]
    fn test_overflow_reject() {
        let config = SessionBufferConfig {
            trigger_count: 2,
            max_buffered_chunks: 2,
            overflow_policy: OverflowPolicy::Reject,
            ..SessionBufferConfig::default()
        };
        let mut buffer = SessionBuffer::new(config);

        let _ = buffer.push(chunk_of(10, 0));
        let _ = buffer.push(chunk_of(10, 1));
        let err = buffer.push(chunk_of(10, 2)).unwrap_err();

        assert_eq!(err, AudioError::Overflow { buffered: 2, limit: 2 });
        let firsts: Vec<i16> = buffer.chunks().map(|c| c.samples()[0]).collect();
        assert_eq!(firsts, vec![0, 1]);
    }

    #[test]
    fn test_reset_discards_everything() {
        let mut buffer = SessionBuffer::new(SessionBufferConfig::default());
        for _ in 0..10 {
            buffer.push(chunk_of(1600, 1)).unwrap();
        }
        buffer.reset();
        assert!(buffer.is_empty());
        assert_eq!(buffer.buffered_samples(), 0);
    }
}
