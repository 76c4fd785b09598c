//! Image fetching.
//!
//! The updater streams image bytes into the inactive slot while computing a
//! running digest, so verification never requires a second pass over the
//! file. The trait seam keeps the state machine testable without a network.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::errors::FleetError;

/// Result of a completed fetch
#[derive(Debug, Clone)]
pub struct FetchedImage {
    pub bytes_written: u64,
    /// Hex sha256 of the streamed bytes
    pub digest: String,
}

/// Source of update image bytes
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Stream the image at `url` into `dest`, returning size and digest
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedImage, FleetError>;
}

/// HTTP(S) fetcher with an optional host allow-list. Broker-delivered URLs
/// are untrusted input; the allow-list is the SSRF guard.
pub struct HttpImageFetcher {
    client: reqwest::Client,
    allowed_hosts: Option<Vec<String>>,
}

impl HttpImageFetcher {
    pub fn new(allowed_hosts: Option<Vec<String>>) -> Self {
        Self {
            client: reqwest::Client::new(),
            allowed_hosts,
        }
    }

    fn validate_url(&self, raw: &str) -> Result<Url, FleetError> {
        let url = Url::parse(raw)
            .map_err(|e| FleetError::ValidationError(format!("invalid image URL '{raw}': {e}")))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(FleetError::ValidationError(format!(
                "image URL scheme '{}' not allowed",
                url.scheme()
            )));
        }

        if let Some(allowed) = &self.allowed_hosts {
            let host = url.host_str().unwrap_or_default();
            if !allowed.iter().any(|a| a == host) {
                return Err(FleetError::ValidationError(format!(
                    "image host '{}' not in allowed hosts",
                    host
                )));
            }
        }

        Ok(url)
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedImage, FleetError> {
        let url = self.validate_url(url)?;

        info!(%url, "downloading update image");
        let mut response = self.client.get(url.clone()).send().await?.error_for_status()?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;

        let mut hasher = Sha256::new();
        let mut bytes_written = 0u64;

        while let Some(chunk) = response.chunk().await? {
            hasher.update(&chunk);
            bytes_written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;

        let digest = hex::encode(hasher.finalize());
        info!(bytes = bytes_written, "download complete");
        Ok(FetchedImage {
            bytes_written,
            digest,
        })
    }
}

/// In-memory fetcher for simulation and tests: a map of URL to image bytes.
/// Unknown URLs behave like a transport failure.
#[derive(Default)]
pub struct MemoryImageFetcher {
    images: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryImageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        if let Ok(mut images) = self.images.write() {
            images.insert(url.into(), bytes);
        }
    }
}

#[async_trait]
impl ImageFetcher for MemoryImageFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchedImage, FleetError> {
        let bytes = self
            .images
            .read()
            .ok()
            .and_then(|images| images.get(url).cloned())
            .ok_or_else(|| FleetError::Download(format!("unreachable source: {url}")))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;

        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        file.write_all(&bytes).await?;
        file.sync_all().await?;

        debug!(url, bytes = bytes.len(), "served image from memory");
        Ok(FetchedImage {
            bytes_written: bytes.len() as u64,
            digest: hex::encode(hasher.finalize()),
        })
    }
}
