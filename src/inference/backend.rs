//! Native backend interface
//!
//! The engine worker drives any [`InferenceBackend`]; llama.cpp is the
//! production implementation (see [`crate::inference::llama`]).

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::AtomicBool;

use crate::inference::engine::EngineError;
use crate::inference::streaming::FinishReason;
use crate::storage::settings::AppSettings;
use crate::types::{ModelConfig, ModelInfo, Turn};

/// Sampling parameters, from user settings
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingParams {
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            seed: 0,
        }
    }
}

impl From<&AppSettings> for SamplingParams {
    fn from(settings: &AppSettings) -> Self {
        Self {
            temperature: settings.temperature,
            top_k: settings.top_k,
            top_p: settings.top_p,
            seed: settings.seed,
        }
    }
}

/// Everything the backend needs for one reply
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system_prompt: String,
    /// Trimmed history ending with the pending user turn
    pub turns: Vec<Turn>,
    pub max_tokens: u32,
    pub sampling: SamplingParams,
}

/// A native inference engine
///
/// Implementations live on the engine's worker thread and are never shared,
/// so they need not be `Send`.
pub trait InferenceBackend {
    /// Load model weights. Any previously loaded model is released first.
    fn load(&mut self, path: &Path, config: &ModelConfig) -> Result<ModelInfo, EngineError>;

    /// Produce fragments for `request`, handing each to `emit`
    ///
    /// `stop` is checked at every decoding step, whether or not that step
    /// produced a fragment. Once it is set, or `emit` returns `Break`, the
    /// backend returns `FinishReason::Cancelled` without emitting anything
    /// further.
    fn generate(
        &mut self,
        request: &GenerationRequest,
        stop: &AtomicBool,
        emit: &mut dyn FnMut(String) -> ControlFlow<()>,
    ) -> Result<FinishReason, EngineError>;

    /// Release model weights. No-op when nothing is loaded.
    fn unload(&mut self);
}
