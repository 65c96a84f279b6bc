//! Scripted backend for exercising the engine without model weights

use std::ops::ControlFlow;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::inference::backend::{GenerationRequest, InferenceBackend};
use crate::inference::engine::EngineError;
use crate::inference::streaming::FinishReason;
use crate::types::{ModelConfig, ModelInfo, Turn};

/// What the scripted backend observed, shared with the test
#[derive(Default)]
pub(crate) struct BackendStats {
    loads: AtomicUsize,
    unloads: AtomicUsize,
    generations: AtomicUsize,
    generating: AtomicBool,
    released_while_generating: AtomicBool,
    last_turns: Mutex<Vec<Turn>>,
}

impl BackendStats {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    pub(crate) fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }

    pub(crate) fn released_while_generating(&self) -> bool {
        self.released_while_generating.load(Ordering::SeqCst)
    }

    pub(crate) fn last_turns(&self) -> Vec<Turn> {
        self.last_turns.lock().unwrap().clone()
    }
}

/// Emits a fixed list of fragments per generation
pub(crate) struct ScriptedBackend {
    script: Vec<String>,
    endless: bool,
    silent: bool,
    step_delay: Duration,
    load_delay: Duration,
    fail_load: Option<EngineError>,
    fail_at: Option<(usize, EngineError)>,
    stats: Arc<BackendStats>,
    loaded: bool,
}

impl ScriptedBackend {
    pub(crate) fn new(script: &[&str], stats: Arc<BackendStats>) -> Self {
        Self {
            script: script.iter().map(|s| s.to_string()).collect(),
            endless: false,
            silent: false,
            step_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_load: None,
            fail_at: None,
            stats,
            loaded: false,
        }
    }

    pub(crate) fn factory(
        script: &[&str],
        stats: Arc<BackendStats>,
    ) -> impl FnOnce() -> Result<ScriptedBackend, EngineError> + Send + 'static {
        Self::new(script, stats).into_factory()
    }

    pub(crate) fn into_factory(
        self,
    ) -> impl FnOnce() -> Result<ScriptedBackend, EngineError> + Send + 'static {
        move || Ok(self)
    }

    /// Cycle the script until the token budget runs out
    pub(crate) fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    /// Decode steps that never complete a fragment, like bytes still
    /// waiting for the rest of a UTF-8 sequence
    pub(crate) fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub(crate) fn step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub(crate) fn load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub(crate) fn fail_load(mut self, error: EngineError) -> Self {
        self.fail_load = Some(error);
        self
    }

    pub(crate) fn fail_at(mut self, step: usize, error: EngineError) -> Self {
        self.fail_at = Some((step, error));
        self
    }

    fn run(
        &self,
        request: &GenerationRequest,
        stop: &AtomicBool,
        emit: &mut dyn FnMut(String) -> ControlFlow<()>,
    ) -> Result<FinishReason, EngineError> {
        for step in 0..request.max_tokens as usize {
            if stop.load(Ordering::SeqCst) {
                return Ok(FinishReason::Cancelled);
            }

            let fragment = if self.endless && !self.script.is_empty() {
                self.script[step % self.script.len()].clone()
            } else {
                match self.script.get(step) {
                    Some(fragment) => fragment.clone(),
                    None => return Ok(FinishReason::EndOfSequence),
                }
            };

            if !self.step_delay.is_zero() {
                std::thread::sleep(self.step_delay);
            }
            if let Some((fail_step, error)) = &self.fail_at {
                if *fail_step == step {
                    return Err(error.clone());
                }
            }
            if self.silent {
                continue;
            }
            if emit(fragment).is_break() {
                return Ok(FinishReason::Cancelled);
            }
        }
        Ok(FinishReason::MaxTokens)
    }
}

impl InferenceBackend for ScriptedBackend {
    fn load(&mut self, path: &Path, config: &ModelConfig) -> Result<ModelInfo, EngineError> {
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = &self.fail_load {
            return Err(error.clone());
        }
        self.loaded = true;
        Ok(ModelInfo {
            path: path.to_string_lossy().to_string(),
            size_bytes: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            vocab_size: 32000,
            context_length: config.context_size,
            parameters: Some(1_000_000),
        })
    }

    fn generate(
        &mut self,
        request: &GenerationRequest,
        stop: &AtomicBool,
        emit: &mut dyn FnMut(String) -> ControlFlow<()>,
    ) -> Result<FinishReason, EngineError> {
        if !self.loaded {
            return Err(EngineError::NoModelLoaded);
        }
        self.stats.generations.fetch_add(1, Ordering::SeqCst);
        *self.stats.last_turns.lock().unwrap() = request.turns.clone();

        self.stats.generating.store(true, Ordering::SeqCst);
        let result = self.run(request, stop, emit);
        self.stats.generating.store(false, Ordering::SeqCst);
        result
    }

    fn unload(&mut self) {
        if self.stats.generating.load(Ordering::SeqCst) {
            self.stats
                .released_while_generating
                .store(true, Ordering::SeqCst);
        }
        if self.loaded {
            self.loaded = false;
            self.stats.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }
}
