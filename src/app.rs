//! Application core
//!
//! Wires settings, device profiling, the model asset, the session controller
//! and conversation storage into one handle that a front end drives.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::inference::{
    spawn_llama_engine, EngineError, InferenceSessionController, LoadError, NativeEngine,
    SamplingParams,
};
use crate::lifecycle::{LifecycleAction, LifecycleCoordinator, LifecycleSignal};
use crate::storage::conversations::ConversationStore;
use crate::storage::download::{AssetError, AssetSource, HttpSource};
use crate::storage::models::{ModelAsset, ModelAssetManager};
use crate::storage::prefs::Preferences;
use crate::storage::settings::{load_settings_from, save_settings_to, AppSettings, SETTINGS_FILE};
use crate::storage::{get_data_dir, StorageError};
use crate::system::CapabilityProfiler;
use crate::types::{ModelConfig, ModelInfo};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Everything a front end needs, built once per process
pub struct AssistantCore {
    data_dir: PathBuf,
    settings: AppSettings,
    profiler: CapabilityProfiler,
    assets: Arc<ModelAssetManager>,
    controller: Arc<InferenceSessionController>,
    lifecycle: LifecycleCoordinator,
    conversations: ConversationStore,
}

impl AssistantCore {
    /// Build the core for this device: platform data directory, HTTPS
    /// transport and the llama.cpp engine
    pub fn init() -> Result<Self, AppError> {
        let data_dir = get_data_dir()?;
        let settings_path = data_dir.join(SETTINGS_FILE);
        let settings = load_settings_from(&settings_path);
        if !settings_path.exists() {
            // Give the user a file to edit
            if let Err(e) = save_settings_to(&settings, &settings_path) {
                tracing::warn!("Could not write default settings: {}", e);
            }
        }
        let source = Arc::new(HttpSource::new()?);
        let engine = spawn_llama_engine(settings.gpu_layers)?;
        Self::with_parts(data_dir, settings, CapabilityProfiler::system(), source, engine)
    }

    pub fn with_parts(
        data_dir: PathBuf,
        settings: AppSettings,
        profiler: CapabilityProfiler,
        source: Arc<dyn AssetSource>,
        engine: NativeEngine,
    ) -> Result<Self, AppError> {
        std::fs::create_dir_all(&data_dir).map_err(StorageError::from)?;
        tracing::info!("Data directory: {:?}", data_dir);

        let prefs = Arc::new(Preferences::open(data_dir.join("prefs.json")));
        let asset = ModelAsset::new(settings.model_url.clone(), &data_dir, &settings.model_filename);
        let assets = Arc::new(ModelAssetManager::new(asset, prefs, source));
        if let Err(e) = assets.remove_stale_partials() {
            tracing::warn!("Could not remove stale partial download: {}", e);
        }

        let controller = Arc::new(InferenceSessionController::new(
            engine,
            SamplingParams::from(&settings),
        ));
        let lifecycle = LifecycleCoordinator::new(Arc::clone(&controller));
        let conversations = ConversationStore::in_data_dir(&data_dir);

        Ok(Self {
            data_dir,
            settings,
            profiler,
            assets,
            controller,
            lifecycle,
            conversations,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &AppSettings {
        &self.settings
    }

    pub fn assets(&self) -> &Arc<ModelAssetManager> {
        &self.assets
    }

    pub fn controller(&self) -> &Arc<InferenceSessionController> {
        &self.controller
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    /// Profile the device, then apply the user's thread override
    pub fn operating_config(&self) -> ModelConfig {
        let config = self.profiler.profile();
        match self.settings.thread_override {
            Some(threads) => {
                tracing::info!("Thread count overridden: {} -> {}", config.threads, threads);
                config.with_threads(threads)
            }
            None => config,
        }
    }

    /// Make sure the model file is present, then load it
    pub async fn prepare_model<F>(&self, on_progress: F) -> Result<ModelInfo, AppError>
    where
        F: FnMut(u64, Option<u64>),
    {
        let path = self.assets.acquire(on_progress).await?;
        let config = self.operating_config();
        Ok(self.controller.load(&config, &path).await?)
    }

    pub async fn handle_lifecycle(&self, signal: LifecycleSignal) -> LifecycleAction {
        self.lifecycle.handle(signal).await
    }

    /// Release the model before the process exits
    pub async fn shutdown(&self) {
        self.assets.cancel();
        self.lifecycle.handle(LifecycleSignal::Terminating).await;
    }
}
