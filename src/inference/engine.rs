//! Inference engine worker
//!
//! Native engine handles contain raw pointers that are not `Send`, so the
//! backend is created on, and never leaves, a dedicated worker thread. The
//! rest of the process talks to it through a command channel.
//!
//! Commands run strictly in order on that one thread: a release queued
//! behind a generation cannot start until the generation has returned.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tokio::sync::{mpsc as tokio_mpsc, oneshot};

use crate::inference::backend::{GenerationRequest, InferenceBackend};
use crate::inference::model::ModelError;
use crate::inference::streaming::{FinishReason, StreamToken};
use crate::types::{ModelConfig, ModelInfo};

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("No model loaded")]
    NoModelLoaded,

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Failed to create context: {0}")]
    ContextCreate(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Prompt of {prompt_tokens} tokens does not fit the {window}-token context")]
    ContextOverflow { prompt_tokens: usize, window: u32 },

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Engine state corrupted: {0}")]
    Corrupted(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadModel {
        path: PathBuf,
        config: ModelConfig,
        response_tx: oneshot::Sender<Result<ModelInfo, EngineError>>,
    },
    UnloadModel {
        response_tx: oneshot::Sender<()>,
    },
    Generate {
        request: GenerationRequest,
        token_tx: tokio_mpsc::UnboundedSender<StreamToken>,
        stop_signal: Arc<AtomicBool>,
    },
    Shutdown,
}

/// Handle to the single native engine of the process
pub struct NativeEngine {
    /// Channel to send commands to the worker thread
    command_tx: Sender<WorkerCommand>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
}

impl NativeEngine {
    /// Start the worker thread and build the backend on it
    ///
    /// Blocks until the backend reports whether it initialized.
    pub fn spawn<F, B>(make_backend: F) -> Result<Self, EngineError>
    where
        F: FnOnce() -> Result<B, EngineError> + Send + 'static,
        B: InferenceBackend + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (init_tx, init_rx) = mpsc::channel::<Result<(), EngineError>>();

        let handle = thread::Builder::new()
            .name("inference-worker".to_string())
            .spawn(move || match make_backend() {
                Ok(backend) => {
                    let _ = init_tx.send(Ok(()));
                    worker_thread_main(backend, command_rx);
                }
                Err(e) => {
                    tracing::error!("Failed to init backend: {}", e);
                    let _ = init_tx.send(Err(e));
                }
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        init_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        tracing::info!("Inference worker thread started");
        Ok(Self {
            command_tx,
            worker_handle: Some(handle),
        })
    }

    /// Load a model on the worker thread
    pub async fn load(&self, path: &Path, config: &ModelConfig) -> Result<ModelInfo, EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WorkerCommand::LoadModel {
            path: path.to_path_buf(),
            config: config.clone(),
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }

    /// Release the model; resolves once the worker has freed it
    pub async fn unload(&self) -> Result<(), EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(WorkerCommand::UnloadModel { response_tx })?;
        response_rx
            .await
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }

    /// Queue a generation. Tokens arrive on the returned receiver, ending
    /// with exactly one `Done` or `Error`.
    pub fn generate(
        &self,
        request: GenerationRequest,
        stop_signal: Arc<AtomicBool>,
    ) -> Result<tokio_mpsc::UnboundedReceiver<StreamToken>, EngineError> {
        let (token_tx, token_rx) = tokio_mpsc::unbounded_channel();
        self.send(WorkerCommand::Generate {
            request,
            token_tx,
            stop_signal,
        })?;
        Ok(token_rx)
    }

    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.command_tx
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        // Send shutdown command
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the backend and processes commands from the rest of the process.
fn worker_thread_main<B: InferenceBackend>(mut backend: B, command_rx: Receiver<WorkerCommand>) {
    let mut loaded = false;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::LoadModel {
                path,
                config,
                response_tx,
            }) => {
                if loaded {
                    backend.unload();
                }
                let result = backend.load(&path, &config);
                loaded = result.is_ok();
                match &result {
                    Ok(info) => tracing::info!("Model loaded: {}", info.path),
                    Err(e) => tracing::error!("Model load failed: {}", e),
                }
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::UnloadModel { response_tx }) => {
                if loaded {
                    backend.unload();
                    loaded = false;
                    tracing::info!("Model unloaded in worker thread");
                }
                let _ = response_tx.send(());
            }
            Ok(WorkerCommand::Generate {
                request,
                token_tx,
                stop_signal,
            }) => {
                let token = if !loaded {
                    StreamToken::Error(EngineError::NoModelLoaded)
                } else {
                    run_generation(&mut backend, &request, &token_tx, &stop_signal)
                };
                let _ = token_tx.send(token);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }

    if loaded {
        backend.unload();
    }
}

/// Run one generation and return its terminal token
fn run_generation<B: InferenceBackend>(
    backend: &mut B,
    request: &GenerationRequest,
    token_tx: &tokio_mpsc::UnboundedSender<StreamToken>,
    stop_signal: &AtomicBool,
) -> StreamToken {
    if stop_signal.load(Ordering::SeqCst) {
        tracing::debug!("Generation cancelled before start");
        return StreamToken::Done(FinishReason::Cancelled);
    }

    let mut emit = |fragment: String| {
        if token_tx.send(StreamToken::Token(fragment)).is_err() {
            // Receiver dropped, stop generation
            tracing::debug!("Receiver dropped, stopping generation");
            return ControlFlow::Break(());
        }
        if stop_signal.load(Ordering::SeqCst) {
            tracing::debug!("Generation stopped by user");
            return ControlFlow::Break(());
        }
        ControlFlow::Continue(())
    };

    match backend.generate(request, stop_signal, &mut emit) {
        Ok(reason) => StreamToken::Done(reason),
        Err(e) => {
            tracing::warn!("Generation failed: {}", e);
            StreamToken::Error(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{BackendStats, ScriptedBackend};
    use crate::types::{Tier, Turn};

    fn request() -> GenerationRequest {
        GenerationRequest {
            system_prompt: "be brief".to_string(),
            turns: vec![Turn::user("hi")],
            max_tokens: 16,
            sampling: Default::default(),
        }
    }

    async fn drain(mut rx: tokio_mpsc::UnboundedReceiver<StreamToken>) -> (Vec<String>, StreamToken) {
        let mut tokens = Vec::new();
        while let Some(token) = rx.recv().await {
            match token {
                StreamToken::Token(t) => tokens.push(t),
                terminal => return (tokens, terminal),
            }
        }
        panic!("stream closed without a terminal token");
    }

    #[tokio::test]
    async fn test_generate_without_model() {
        let stats = BackendStats::new();
        let engine = NativeEngine::spawn(ScriptedBackend::factory(&["a"], Arc::clone(&stats))).unwrap();

        let rx = engine.generate(request(), Arc::new(AtomicBool::new(false))).unwrap();
        let (tokens, terminal) = drain(rx).await;
        assert!(tokens.is_empty());
        assert!(matches!(terminal, StreamToken::Error(EngineError::NoModelLoaded)));
    }

    #[tokio::test]
    async fn test_load_generate_unload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.gguf");
        let stats = BackendStats::new();
        let engine =
            NativeEngine::spawn(ScriptedBackend::factory(&["Hel", "lo"], Arc::clone(&stats))).unwrap();

        let config = ModelConfig::preset(Tier::Low);
        engine.load(&path, &config).await.unwrap();

        let rx = engine.generate(request(), Arc::new(AtomicBool::new(false))).unwrap();
        let (tokens, terminal) = drain(rx).await;
        assert_eq!(tokens, ["Hel", "lo"]);
        assert!(matches!(terminal, StreamToken::Done(FinishReason::EndOfSequence)));

        engine.unload().await.unwrap();
        engine.unload().await.unwrap();
        assert_eq!(stats.loads(), 1);
        assert_eq!(stats.unloads(), 1);
    }

    #[tokio::test]
    async fn test_pre_cancelled_generation_never_runs() {
        let dir = tempfile::tempdir().unwrap();
        let stats = BackendStats::new();
        let engine = NativeEngine::spawn(ScriptedBackend::factory(&["x"], Arc::clone(&stats))).unwrap();
        engine
            .load(&dir.path().join("m.gguf"), &ModelConfig::default())
            .await
            .unwrap();

        let rx = engine.generate(request(), Arc::new(AtomicBool::new(true))).unwrap();
        let (tokens, terminal) = drain(rx).await;
        assert!(tokens.is_empty());
        assert!(matches!(terminal, StreamToken::Done(FinishReason::Cancelled)));
        assert_eq!(stats.generations(), 0);
    }

    #[tokio::test]
    async fn test_stop_observed_on_steps_without_output() {
        let dir = tempfile::tempdir().unwrap();
        let stats = BackendStats::new();
        let backend = ScriptedBackend::new(&["\u{fffd}"], Arc::clone(&stats))
            .endless()
            .silent()
            .step_delay(std::time::Duration::from_millis(2));
        let engine = NativeEngine::spawn(backend.into_factory()).unwrap();
        engine
            .load(&dir.path().join("m.gguf"), &ModelConfig::default())
            .await
            .unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let mut long = request();
        long.max_tokens = 100_000;
        let rx = engine.generate(long, Arc::clone(&stop)).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop.store(true, Ordering::SeqCst);

        let (tokens, terminal) = tokio::time::timeout(std::time::Duration::from_secs(5), drain(rx))
            .await
            .expect("generation ignored the stop flag");
        assert!(tokens.is_empty());
        assert!(matches!(terminal, StreamToken::Done(FinishReason::Cancelled)));
    }

    #[test]
    fn test_backend_init_failure() {
        let result = NativeEngine::spawn(|| -> Result<ScriptedBackend, EngineError> {
            Err(EngineError::BackendInit("no cpu".to_string()))
        });
        assert!(matches!(result, Err(EngineError::BackendInit(_))));
    }
}
