//! Inference session controller
//!
//! Owns the process's single [`NativeEngine`] and walks it through
//! `Unloaded → Loading → Ready ⇄ Generating`. Load and unload are serialized
//! by a transition lock; concurrent `load` calls for the same configuration
//! share one in-flight load. Generation events are relayed by a task that
//! settles the controller state before forwarding the terminal event, so a
//! caller that has seen `Finished` can start the next generation right away.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::inference::backend::{GenerationRequest, SamplingParams};
use crate::inference::context::ConversationContext;
use crate::inference::engine::{EngineError, NativeEngine};
use crate::inference::model::{validate_gguf, ModelError};
use crate::inference::streaming::{
    FinishReason, GenerationError, GenerationEvent, GenerationOutcome, GenerationStream,
    StreamToken,
};
use crate::types::{ModelConfig, ModelInfo, Turn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unloaded,
    Loading,
    Ready,
    Generating,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Unloaded => "unloaded",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("Model file not found: {0:?}")]
    AssetMissing(PathBuf),

    #[error("Model file is not usable: {0}")]
    InvalidAsset(String),

    #[error("Native engine failed to load the model: {0}")]
    Native(EngineError),

    #[error("A model is already loaded with a different configuration")]
    ConfigLocked,

    #[error("Model load interrupted: {0}")]
    Interrupted(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("A generation is already running")]
    Busy,

    #[error("Model is not ready (currently {0})")]
    NotReady(SessionState),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

type LoadFuture = Shared<BoxFuture<'static, Result<ModelInfo, LoadError>>>;

struct PendingLoad {
    config: ModelConfig,
    result: LoadFuture,
}

struct ActiveGeneration {
    id: u64,
    stop_signal: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

struct Inner {
    state: SessionState,
    loaded: Option<(ModelConfig, ModelInfo)>,
    pending: Option<PendingLoad>,
    active: Option<ActiveGeneration>,
    unloading: bool,
    next_generation: u64,
}

type SharedInner = Arc<Mutex<Inner>>;

/// Drives model load, generation and release
pub struct InferenceSessionController {
    engine: Arc<NativeEngine>,
    inner: SharedInner,
    transition: Arc<tokio::sync::Mutex<()>>,
    sampling: SamplingParams,
}

impl InferenceSessionController {
    pub fn new(engine: NativeEngine, sampling: SamplingParams) -> Self {
        Self {
            engine: Arc::new(engine),
            inner: Arc::new(Mutex::new(Inner {
                state: SessionState::Unloaded,
                loaded: None,
                pending: None,
                active: None,
                unloading: false,
                next_generation: 1,
            })),
            transition: Arc::new(tokio::sync::Mutex::new(())),
            sampling,
        }
    }

    pub fn state(&self) -> SessionState {
        lock_inner(&self.inner).state
    }

    pub fn loaded_config(&self) -> Option<ModelConfig> {
        lock_inner(&self.inner).loaded.as_ref().map(|(config, _)| config.clone())
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        lock_inner(&self.inner).loaded.as_ref().map(|(_, info)| info.clone())
    }

    /// Load the model at `asset_path` with `config`
    ///
    /// Returns the existing [`ModelInfo`] when the same configuration is
    /// already loaded, and joins a load already in flight for it. A
    /// different configuration is refused until the model is unloaded.
    pub async fn load(&self, config: &ModelConfig, asset_path: &Path) -> Result<ModelInfo, LoadError> {
        let result = {
            let mut inner = lock_inner(&self.inner);

            if let Some((loaded_config, info)) = &inner.loaded {
                if !inner.unloading {
                    if loaded_config == config {
                        tracing::debug!("Model already loaded with this configuration");
                        return Ok(info.clone());
                    }
                    return Err(LoadError::ConfigLocked);
                }
            }

            if let Some(pending) = &inner.pending {
                if pending.config != *config {
                    return Err(LoadError::ConfigLocked);
                }
                tracing::debug!("Joining in-flight model load");
                pending.result.clone()
            } else {
                let result = self.start_load(config.clone(), asset_path.to_path_buf());
                inner.pending = Some(PendingLoad {
                    config: config.clone(),
                    result: result.clone(),
                });
                if inner.state == SessionState::Unloaded {
                    inner.state = SessionState::Loading;
                }
                result
            }
        };

        result.await
    }

    fn start_load(&self, config: ModelConfig, path: PathBuf) -> LoadFuture {
        let handle = tokio::spawn(run_load(
            config,
            path,
            Arc::clone(&self.engine),
            Arc::clone(&self.inner),
            Arc::clone(&self.transition),
        ));

        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(LoadError::Interrupted(e.to_string())),
            }
        }
        .boxed()
        .shared()
    }

    /// Start a reply to `user_turn`
    ///
    /// The turn is appended to `context`, which is then trimmed to the
    /// loaded tier's history limit. Fails with `Busy` while another
    /// generation runs; nothing is started in that case.
    pub fn generate(
        &self,
        context: &mut ConversationContext,
        user_turn: Turn,
    ) -> Result<GenerationStream, GenerateError> {
        let mut inner = lock_inner(&self.inner);

        match inner.state {
            SessionState::Generating => return Err(GenerateError::Busy),
            SessionState::Ready if !inner.unloading => {}
            SessionState::Ready => return Err(GenerateError::NotReady(SessionState::Unloaded)),
            other => return Err(GenerateError::NotReady(other)),
        }
        let config = match &inner.loaded {
            Some((config, _)) => config.clone(),
            None => return Err(GenerateError::NotReady(SessionState::Unloaded)),
        };

        context.push(user_turn);
        let removed = context.trim_history(config.history_limit);
        if removed > 0 {
            tracing::debug!("Trimmed {} turns from conversation history", removed);
        }

        let request = GenerationRequest {
            system_prompt: config.system_prompt.clone(),
            turns: context.turns().to_vec(),
            max_tokens: config.max_tokens,
            sampling: self.sampling.clone(),
        };

        let stop_signal = Arc::new(AtomicBool::new(false));
        let tokens = match self.engine.generate(request, Arc::clone(&stop_signal)) {
            Ok(tokens) => tokens,
            Err(e) => {
                context.discard_pending();
                return Err(GenerateError::Engine(e));
            }
        };

        let id = inner.next_generation;
        inner.next_generation += 1;
        let (done_tx, done_rx) = watch::channel(false);
        inner.active = Some(ActiveGeneration {
            id,
            stop_signal: Arc::clone(&stop_signal),
            done: done_rx,
        });
        inner.state = SessionState::Generating;
        drop(inner);

        tracing::info!("Generation {} started ({} turns in context)", id, context.len());

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(relay_generation(
            id,
            tokens,
            event_tx,
            done_tx,
            Arc::clone(&self.inner),
            Arc::clone(&self.engine),
        ));

        Ok(GenerationStream::new(event_rx, stop_signal))
    }

    /// Ask the running generation to stop. Returns false when none is running.
    pub fn cancel(&self) -> bool {
        match lock_inner(&self.inner).active.as_ref() {
            Some(active) => {
                tracing::info!("Cancelling generation {}", active.id);
                active.stop_signal.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Release the model
    ///
    /// A load in flight is allowed to finish first, then released. A running
    /// generation is cancelled and its terminal event awaited before the
    /// worker is told to free the weights.
    pub async fn unload(&self) -> Result<(), EngineError> {
        loop {
            let pending = lock_inner(&self.inner)
                .pending
                .as_ref()
                .map(|pending| pending.result.clone());
            match pending {
                Some(result) => {
                    tracing::debug!("Waiting for the in-flight load before unloading");
                    let _ = result.await;
                }
                None => break,
            }
        }

        let _transition = self.transition.lock().await;

        let running = {
            let mut inner = lock_inner(&self.inner);
            if inner.state == SessionState::Unloaded && inner.loaded.is_none() {
                tracing::debug!("Unload requested with no model loaded");
                return Ok(());
            }
            inner.unloading = true;
            inner.active.as_ref().map(|active| {
                active.stop_signal.store(true, Ordering::SeqCst);
                active.done.clone()
            })
        };

        if let Some(mut done) = running {
            tracing::info!("Waiting for the running generation to stop before unloading");
            let _ = done.wait_for(|finished| *finished).await;
        }

        let result = self.engine.unload().await;

        {
            let mut inner = lock_inner(&self.inner);
            inner.state = SessionState::Unloaded;
            inner.loaded = None;
            inner.unloading = false;
        }

        match &result {
            Ok(()) => tracing::info!("Model unloaded"),
            Err(e) => tracing::error!("Model unload failed: {}", e),
        }
        result
    }
}

async fn run_load(
    config: ModelConfig,
    path: PathBuf,
    engine: Arc<NativeEngine>,
    inner: SharedInner,
    transition: Arc<tokio::sync::Mutex<()>>,
) -> Result<ModelInfo, LoadError> {
    let _transition = transition.lock().await;
    lock_inner(&inner).state = SessionState::Loading;
    tracing::info!("Loading model {:?} ({} tier)", path, config.tier);

    let result = load_validated(&engine, &config, &path).await;

    let mut inner = lock_inner(&inner);
    inner.pending = None;
    match &result {
        Ok(info) => {
            inner.state = SessionState::Ready;
            inner.loaded = Some((config, info.clone()));
            tracing::info!("Model ready: {} ({} bytes)", info.path, info.size_bytes);
        }
        Err(e) => {
            inner.state = SessionState::Unloaded;
            inner.loaded = None;
            tracing::error!("Model load failed: {}", e);
        }
    }
    result
}

async fn load_validated(
    engine: &NativeEngine,
    config: &ModelConfig,
    path: &Path,
) -> Result<ModelInfo, LoadError> {
    let header_path = path.to_path_buf();
    let header = tokio::task::spawn_blocking(move || validate_gguf(&header_path))
        .await
        .map_err(|e| LoadError::Interrupted(e.to_string()))?;

    match header {
        Ok(meta) => tracing::debug!(
            "GGUF v{} header: {} tensors, {} metadata entries",
            meta.version,
            meta.tensor_count,
            meta.metadata_kv_count
        ),
        Err(ModelError::NotFound(_)) => return Err(LoadError::AssetMissing(path.to_path_buf())),
        Err(e) => return Err(LoadError::InvalidAsset(e.to_string())),
    }

    engine.load(path, config).await.map_err(LoadError::Native)
}

async fn relay_generation(
    id: u64,
    mut tokens: mpsc::UnboundedReceiver<StreamToken>,
    events: mpsc::UnboundedSender<GenerationEvent>,
    done: watch::Sender<bool>,
    inner: SharedInner,
    engine: Arc<NativeEngine>,
) {
    let mut fragments = 0usize;
    let outcome = loop {
        match tokens.recv().await {
            Some(StreamToken::Token(fragment)) => {
                fragments += 1;
                // Receiver gone means the stream was dropped; its Drop already cancelled
                let _ = events.send(GenerationEvent::Fragment(fragment));
            }
            Some(StreamToken::Done(FinishReason::Cancelled)) => {
                break GenerationOutcome::Cancelled { fragments };
            }
            Some(StreamToken::Done(reason)) => {
                break GenerationOutcome::Completed { reason, fragments };
            }
            Some(StreamToken::Error(e)) => break GenerationOutcome::Failed(e.into()),
            None => break GenerationOutcome::Failed(GenerationError::WorkerGone),
        }
    };

    let unrecoverable = matches!(&outcome, GenerationOutcome::Failed(e) if e.is_unrecoverable());
    if unrecoverable {
        tracing::error!("Generation {} left the engine unusable, releasing the model", id);
        if let Err(e) = engine.unload().await {
            tracing::error!("Forced unload failed: {}", e);
        }
    }

    {
        let mut inner = lock_inner(&inner);
        if inner.active.as_ref().map(|a| a.id) == Some(id) {
            inner.active = None;
        }
        if unrecoverable {
            inner.state = SessionState::Unloaded;
            inner.loaded = None;
        } else if inner.state == SessionState::Generating {
            inner.state = SessionState::Ready;
        }
    }

    match &outcome {
        GenerationOutcome::Completed { reason, fragments } => {
            tracing::info!("Generation {} finished ({:?}, {} fragments)", id, reason, fragments)
        }
        GenerationOutcome::Cancelled { fragments } => {
            tracing::info!("Generation {} cancelled after {} fragments", id, fragments)
        }
        GenerationOutcome::Failed(e) => tracing::warn!("Generation {} failed: {}", id, e),
    }

    let _ = done.send(true);
    let _ = events.send(GenerationEvent::Finished(outcome));
}

fn lock_inner(inner: &SharedInner) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
