//! # Classifier Module
//!
//! Recurrent voice classifier: loading trained weights, stateful inference
//! over feature windows, and mapping raw scores to labelled predictions.
//!
//! ## Key Components:
//! - **Recurrent layers**: PyTorch-compatible LSTM/GRU stacks on candle tensors
//! - **Model**: Checkpoint loading with CPU fallback and the forward pass
//! - **Engine**: One hidden state behind a lock, carried across windows
//! - **Pool**: Shared or per-session engine handles over the same weights
//! - **Decision**: Sigmoid or softmax calibration and thresholding

pub mod decision;
pub mod engine;
pub mod model;
pub mod pool;
pub mod recurrent;
