use crate::preview::LatestFrame;
use std::path::Path;
use std::sync::Arc;
use tryon_core::{Storefront, TryOnController};
use zbus::interface;

pub const BUS_NAME: &str = "org.tryon.TryOn1";
pub const OBJECT_PATH: &str = "/org/tryon/TryOn1";

/// D-Bus interface for the try-on daemon.
///
/// Bus name: org.tryon.TryOn1
/// Object path: /org/tryon/TryOn1
pub struct TryOnService {
    controller: Arc<TryOnController>,
    preview: Arc<LatestFrame>,
    storefront: Storefront,
}

impl TryOnService {
    pub fn new(controller: Arc<TryOnController>, preview: Arc<LatestFrame>, storefront: Storefront) -> Self {
        Self {
            controller,
            preview,
            storefront,
        }
    }
}

#[interface(name = "org.tryon.TryOn1")]
impl TryOnService {
    /// Start the try-on with the overlay image at `url`.
    async fn activate(&self, url: &str) -> zbus::fdo::Result<()> {
        tracing::info!(url, "activate requested");
        self.controller
            .activate(url)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Start the try-on with a product image stored by the backend.
    async fn activate_product(&self, image_path: &str) -> zbus::fdo::Result<()> {
        let url = self.storefront.product_image_url(Some(image_path));
        tracing::info!(image_path, %url, "activate_product requested");
        self.controller
            .activate(&url)
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Stop the try-on. Always succeeds.
    async fn deactivate(&self) {
        tracing::info!("deactivate requested");
        self.controller.deactivate().await;
    }

    /// Return session state and render statistics as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let state = self.controller.state();
        let stats = self.controller.stats().await;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "loading": state.loading,
            "error": state.error,
            "active": state.active,
            "overlay_url": state.overlay_url,
            "stats": stats,
        })
        .to_string())
    }

    /// Save the latest composited frame as PNG. Returns false if no frame
    /// has been painted yet.
    async fn snapshot(&self, path: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(path, "snapshot requested");
        self.preview
            .save(Path::new(path))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(format!("snapshot failed: {e}")))
    }
}
