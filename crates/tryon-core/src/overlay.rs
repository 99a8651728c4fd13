//! Overlay (product) image loading.

use async_trait::async_trait;
use image::RgbaImage;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::task::JoinHandle;

/// Shown when a product has no image of its own; relative to the asset root.
pub const PLACEHOLDER_IMAGE: &str = "/pictures/image.png";

#[derive(Error, Debug)]
pub enum OverlayError {
    #[error("overlay reference is empty")]
    EmptyReference,
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode failed: {0}")]
    Decode(#[from] image::ImageError),
}

/// Where a storefront keeps its product images.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Storefront {
    /// Backend serving uploaded product images under `/api/uploads/`.
    pub backend_url: String,
    /// Root of the storefront's public assets (URL or directory).
    pub asset_root: String,
}

impl Storefront {
    /// Overlay reference for a product image stored by the backend, or the
    /// placeholder under the asset root when the product has none.
    pub fn product_image_url(&self, image_path: Option<&str>) -> String {
        match image_path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(path) => format!(
                "{}/api/uploads/{}",
                self.backend_url.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            None => format!("{}{}", self.asset_root.trim_end_matches('/'), PLACEHOLDER_IMAGE),
        }
    }
}

/// Fetches and decodes an overlay image by reference.
#[async_trait]
pub trait OverlayLoader: Send + Sync {
    async fn load(&self, url: &str) -> Result<RgbaImage, OverlayError>;
}

/// Loads `http(s)://` URLs over the network and anything else from disk.
#[derive(Clone, Default)]
pub struct UrlOverlayLoader {
    client: reqwest::Client,
}

impl UrlOverlayLoader {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OverlayLoader for UrlOverlayLoader {
    async fn load(&self, url: &str) -> Result<RgbaImage, OverlayError> {
        let bytes = if url.starts_with("http://") || url.starts_with("https://") {
            let response = self.client.get(url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(OverlayError::Status {
                    url: url.to_string(),
                    status: status.as_u16(),
                });
            }
            response.bytes().await?.to_vec()
        } else {
            let path = PathBuf::from(url.strip_prefix("file://").unwrap_or(url));
            tokio::fs::read(path).await?
        };

        let image = image::load_from_memory(&bytes)?.to_rgba8();
        tracing::debug!(url, width = image.width(), height = image.height(), "overlay image decoded");
        Ok(image)
    }
}

/// Read side of an overlay image that may still be loading.
#[derive(Clone, Default)]
pub struct OverlayHandle {
    slot: Arc<OnceLock<RgbaImage>>,
}

impl OverlayHandle {
    /// The decoded image, once loading has finished.
    pub fn get(&self) -> Option<&RgbaImage> {
        self.slot.get()
    }

    pub fn is_ready(&self) -> bool {
        self.slot.get().is_some()
    }

    /// A handle whose image is already available.
    pub fn ready(image: RgbaImage) -> Self {
        let handle = Self::default();
        let _ = handle.slot.set(image);
        handle
    }
}

/// One activation's overlay image, loaded in the background.
pub struct OverlayImage {
    url: String,
    handle: OverlayHandle,
    task: Option<JoinHandle<()>>,
}

impl OverlayImage {
    /// Start loading `url`; returns immediately.
    pub fn load(url: &str, loader: Arc<dyn OverlayLoader>) -> Self {
        let handle = OverlayHandle::default();
        let slot = Arc::clone(&handle.slot);
        let task_url = url.to_string();

        let task = tokio::spawn(async move {
            match loader.load(&task_url).await {
                Ok(image) => {
                    let _ = slot.set(image);
                    tracing::info!(url = %task_url, "overlay image ready");
                }
                Err(e) => {
                    tracing::warn!(url = %task_url, error = %e, "overlay image failed to load; showing video only");
                }
            }
        });

        Self {
            url: url.to_string(),
            handle,
            task: Some(task),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn handle(&self) -> OverlayHandle {
        self.handle.clone()
    }

    /// Abort a load still in flight. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for OverlayImage {
    fn drop(&mut self) {
        self.cancel();
    }
}
