//! # Engine Pool
//!
//! Hands out inference engine handles to sessions according to the configured
//! hidden-state policy. All handles share one set of immutable weights.
//!
//! ## Policies:
//! - **shared**: Every session gets the same handle. Windows from different
//!   sessions advance one common hidden state and are serialized by its lock,
//!   which caps throughput at one forward pass at a time.
//! - **per_session**: Each session gets its own handle with a fresh zero state,
//!   so speakers never bleed into each other's context.

use crate::classifier::engine::{EngineHandle, InferenceEngine};
use crate::classifier::model::ClassifierModel;
use crate::error::ClassifierResult;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Scope of a hidden state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenStatePolicy {
    Shared,
    PerSession,
}

pub struct EnginePool {
    model: Arc<ClassifierModel>,
    policy: HiddenStatePolicy,
    shared: EngineHandle,
    handles_issued: AtomicU64,
}

impl EnginePool {
    pub fn new(model: Arc<ClassifierModel>, policy: HiddenStatePolicy) -> ClassifierResult<Self> {
        let shared = InferenceEngine::new(model.clone())?;
        Ok(Self {
            model,
            policy,
            shared,
            handles_issued: AtomicU64::new(0),
        })
    }

    /// Engine handle for a newly opened session.
    pub fn handle_for_session(&self) -> ClassifierResult<EngineHandle> {
        self.handles_issued.fetch_add(1, Ordering::Relaxed);
        match self.policy {
            HiddenStatePolicy::Shared => Ok(self.shared.clone()),
            HiddenStatePolicy::PerSession => InferenceEngine::new(self.model.clone()),
        }
    }

    /// The process-wide handle, used by every session under the shared policy.
    pub fn shared_handle(&self) -> &EngineHandle {
        &self.shared
    }

    pub fn policy(&self) -> HiddenStatePolicy {
        self.policy
    }

    pub fn model(&self) -> &Arc<ClassifierModel> {
        &self.model
    }

    pub fn handles_issued(&self) -> u64 {
        self.handles_issued.load(Ordering::Relaxed)
    }
}
