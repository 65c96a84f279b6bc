//! Model download transport
//!
//! Streams the model file over HTTP. The transport sits behind [`AssetSource`]
//! so acquisition logic does not depend on a live network.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use thiserror::Error;

use crate::storage::StorageError;

/// Failures while acquiring the model asset
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("Download failed: {0}")]
    Network(String),

    #[error("Download failed with status: {0}")]
    Http(u16),

    #[error("Download incomplete: got {received} bytes, expected {expected}")]
    Incomplete { received: u64, expected: u64 },

    #[error("Downloaded file too small: {actual} bytes (minimum {minimum})")]
    Undersized { actual: u64, minimum: u64 },

    #[error("Download cancelled")]
    Cancelled,

    #[error("Download task stopped unexpectedly: {0}")]
    Interrupted(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<std::io::Error> for AssetError {
    fn from(e: std::io::Error) -> Self {
        AssetError::Storage(e.to_string())
    }
}

impl From<StorageError> for AssetError {
    fn from(e: StorageError) -> Self {
        AssetError::Storage(e.to_string())
    }
}

/// An open transfer
pub struct AssetStream {
    /// Advertised length, if the server sent one
    pub total_bytes: Option<u64>,
    pub chunks: BoxStream<'static, Result<Vec<u8>, AssetError>>,
}

/// Where model bytes come from
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<AssetStream, AssetError>;
}

/// HTTPS transport backed by reqwest
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Result<Self, AssetError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(3600)) // 1 hour timeout for large models
            .user_agent(concat!("offline-assistant/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| AssetError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetSource for HttpSource {
    async fn open(&self, url: &str) -> Result<AssetStream, AssetError> {
        tracing::info!("Downloading from: {}", url);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AssetError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AssetError::Http(response.status().as_u16()));
        }

        let total_bytes = response.content_length();
        if let Some(total) = total_bytes {
            tracing::info!("File size: {} bytes ({})", total, format_size(total));
        }

        let chunks = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| AssetError::Network(e.to_string()))
            })
            .boxed();

        Ok(AssetStream {
            total_bytes,
            chunks,
        })
    }
}

/// Turn an arbitrary name into a safe single-component file name
pub fn sanitize_local_filename(filename: &str) -> Result<String, String> {
    let trimmed = filename.trim();
    if trimmed.is_empty() {
        return Err("Invalid model filename".to_string());
    }

    let no_query = trimmed.split('?').next().unwrap_or(trimmed);
    let no_fragment = no_query.split('#').next().unwrap_or(no_query);
    let no_leading = no_fragment.trim_start_matches('/');

    let flattened = no_leading.replace('\\', "/").replace('/', "__");

    let mut sanitized = String::with_capacity(flattened.len());
    for ch in flattened.chars() {
        let invalid = matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*');
        if invalid || ch.is_control() {
            sanitized.push('_');
        } else {
            sanitized.push(ch);
        }
    }

    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err("Invalid model filename".to_string());
    }

    Ok(sanitized)
}

/// Get a human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}
