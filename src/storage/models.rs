//! Model asset management
//!
//! Keeps the model file present and valid under app-private storage.
//!
//! The persisted ready flag is only a hint: [`ModelAssetManager::is_ready`]
//! re-checks the file on every call, so a flag left behind by a crash in the
//! middle of a download never makes a truncated file look usable. At most one
//! download runs at a time; concurrent [`ModelAssetManager::acquire`] calls
//! attach to it and observe its progress and result.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::storage::download::{format_size, AssetError, AssetSource};
use crate::storage::prefs::Preferences;

/// Smallest file accepted as a complete model (10 MiB)
pub const MIN_MODEL_BYTES: u64 = 10 * 1024 * 1024;

/// Preferences key of the ready flag; bump the suffix when the asset changes
pub const MODEL_READY_KEY: &str = "model_ready_v1";

const PARTIAL_SUFFIX: &str = ".part";

/// The model file: where it comes from and where it lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelAsset {
    pub url: String,
    pub path: PathBuf,
    pub min_bytes: u64,
}

impl ModelAsset {
    /// Asset stored as `<data_dir>/models/<filename>`
    pub fn new(url: impl Into<String>, data_dir: &Path, filename: &str) -> Self {
        Self {
            url: url.into(),
            path: data_dir.join("models").join(filename),
            min_bytes: MIN_MODEL_BYTES,
        }
    }

    fn partial_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(PARTIAL_SUFFIX);
        PathBuf::from(name)
    }
}

/// Bytes received so far, and the expected total if known
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadProgress {
    pub received: u64,
    pub total: Option<u64>,
}

type AcquireFuture = Shared<BoxFuture<'static, Result<PathBuf, AssetError>>>;

struct InFlight {
    id: u64,
    result: AcquireFuture,
    progress: watch::Receiver<DownloadProgress>,
    cancel: CancellationToken,
}

type InFlightSlot = Arc<Mutex<Option<InFlight>>>;

/// Downloads, validates and tracks the model file
pub struct ModelAssetManager {
    asset: ModelAsset,
    prefs: Arc<Preferences>,
    source: Arc<dyn AssetSource>,
    in_flight: InFlightSlot,
    next_id: AtomicU64,
}

impl ModelAssetManager {
    pub fn new(asset: ModelAsset, prefs: Arc<Preferences>, source: Arc<dyn AssetSource>) -> Self {
        Self {
            asset,
            prefs,
            source,
            in_flight: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(1),
        }
    }

    /// Local path of the model file. Does not check that it exists.
    pub fn locate(&self) -> &Path {
        &self.asset.path
    }

    pub fn asset(&self) -> &ModelAsset {
        &self.asset
    }

    /// Ready flag set AND file present AND at least the minimum size
    pub fn is_ready(&self) -> bool {
        if !self.prefs.get_bool(MODEL_READY_KEY) {
            return false;
        }
        match fs::metadata(&self.asset.path) {
            Ok(meta) if meta.is_file() && meta.len() >= self.asset.min_bytes => true,
            Ok(meta) => {
                tracing::warn!(
                    "Ready flag set but model file is {} bytes, treating as not ready",
                    meta.len()
                );
                false
            }
            Err(_) => {
                tracing::warn!("Ready flag set but model file is missing: {:?}", self.asset.path);
                false
            }
        }
    }

    pub fn is_acquiring(&self) -> bool {
        lock_slot(&self.in_flight).is_some()
    }

    /// Make the model file available, downloading it if needed
    ///
    /// `on_progress(received, total)` is called as bytes arrive. When a
    /// download is already running, this call attaches to it instead of
    /// starting another one. Must be called from within a tokio runtime.
    pub async fn acquire<F>(&self, mut on_progress: F) -> Result<PathBuf, AssetError>
    where
        F: FnMut(u64, Option<u64>),
    {
        if self.is_ready() {
            tracing::debug!("Model already present: {:?}", self.asset.path);
            return Ok(self.asset.path.clone());
        }

        let (mut result, mut progress) = self.join_or_start();

        loop {
            // Progress first, so the final update is delivered before the result
            tokio::select! {
                biased;
                changed = progress.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let p = *progress.borrow_and_update();
                    on_progress(p.received, p.total);
                }
                outcome = &mut result => return outcome,
            }
        }

        // Transfer task is gone; its result is ready
        result.await
    }

    /// Abort the running download. Returns false when nothing was running.
    pub fn cancel(&self) -> bool {
        match lock_slot(&self.in_flight).as_ref() {
            Some(in_flight) => {
                tracing::info!("Cancelling model download");
                in_flight.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Delete the model file and reset the ready flag
    pub fn clear(&self) -> Result<(), AssetError> {
        self.cancel();
        self.prefs.set_bool(MODEL_READY_KEY, false)?;
        remove_if_exists(&self.asset.path)?;
        remove_if_exists(&self.asset.partial_path())?;
        tracing::info!("Model asset cleared: {:?}", self.asset.path);
        Ok(())
    }

    /// Remove a partial file left by an interrupted download
    ///
    /// Skipped while a download is running. Returns true when a file was removed.
    pub fn remove_stale_partials(&self) -> Result<bool, AssetError> {
        let slot = lock_slot(&self.in_flight);
        if slot.is_some() {
            return Ok(false);
        }
        let removed = remove_if_exists(&self.asset.partial_path())?;
        if removed {
            tracing::info!("Removed stale partial download");
        }
        Ok(removed)
    }

    fn join_or_start(&self) -> (AcquireFuture, watch::Receiver<DownloadProgress>) {
        let mut slot = lock_slot(&self.in_flight);

        if let Some(in_flight) = slot.as_ref() {
            tracing::debug!("Joining in-flight model download");
            return (in_flight.result.clone(), in_flight.progress.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(DownloadProgress::default());

        let handle = tokio::spawn(run_download(
            id,
            self.asset.clone(),
            Arc::clone(&self.prefs),
            Arc::clone(&self.source),
            cancel.clone(),
            progress_tx,
            Arc::clone(&self.in_flight),
        ));

        let result: AcquireFuture = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(AssetError::Interrupted(e.to_string())),
            }
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            id,
            result: result.clone(),
            progress: progress_rx.clone(),
            cancel,
        });

        (result, progress_rx)
    }
}

async fn run_download(
    id: u64,
    asset: ModelAsset,
    prefs: Arc<Preferences>,
    source: Arc<dyn AssetSource>,
    cancel: CancellationToken,
    progress: watch::Sender<DownloadProgress>,
    slot: InFlightSlot,
) -> Result<PathBuf, AssetError> {
    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AssetError::Cancelled),
        result = transfer(&asset, &prefs, source.as_ref(), &progress, &cancel) => result,
    };

    {
        let mut slot = lock_slot(&slot);
        if slot.as_ref().map(|f| f.id) == Some(id) {
            *slot = None;
        }
    }

    match &result {
        Ok(path) => tracing::info!("Download complete: {:?}", path),
        Err(e) => tracing::warn!("Model download failed: {}", e),
    }
    result
}

async fn transfer(
    asset: &ModelAsset,
    prefs: &Preferences,
    source: &dyn AssetSource,
    progress: &watch::Sender<DownloadProgress>,
    cancel: &CancellationToken,
) -> Result<PathBuf, AssetError> {
    // Never leave the flag claiming readiness while the file is being replaced
    prefs.set_bool(MODEL_READY_KEY, false)?;

    if let Some(parent) = asset.path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut stream = source.open(&asset.url).await?;
    let total = stream.total_bytes;
    let temp_path = asset.partial_path();
    let mut temp_file = tokio::fs::File::create(&temp_path).await?;

    let mut received: u64 = 0;
    while let Some(chunk) = stream.chunks.next().await {
        let chunk = chunk?;
        temp_file.write_all(&chunk).await?;
        received += chunk.len() as u64;
        progress.send_replace(DownloadProgress { received, total });
    }
    temp_file.flush().await?;
    drop(temp_file);

    if let Some(expected) = total {
        if received != expected {
            return Err(AssetError::Incomplete { received, expected });
        }
    }

    if cancel.is_cancelled() {
        return Err(AssetError::Cancelled);
    }
    tokio::fs::rename(&temp_path, &asset.path).await?;

    let actual = tokio::fs::metadata(&asset.path).await?.len();
    if actual < asset.min_bytes {
        tokio::fs::remove_file(&asset.path).await?;
        return Err(AssetError::Undersized {
            actual,
            minimum: asset.min_bytes,
        });
    }

    if cancel.is_cancelled() {
        return Err(AssetError::Cancelled);
    }
    prefs.set_bool(MODEL_READY_KEY, true)?;
    tracing::info!("Model validated: {}", format_size(actual));
    Ok(asset.path.clone())
}

fn lock_slot(slot: &InFlightSlot) -> MutexGuard<'_, Option<InFlight>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove_if_exists(path: &Path) -> Result<bool, AssetError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
