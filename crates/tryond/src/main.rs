use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tryon_core::{FaceMeshLoader, TryOnController, UrlOverlayLoader};
use tryon_hw::V4lCameraSource;

mod config;
mod dbus_interface;
mod preview;

use config::Config;
use dbus_interface::{TryOnService, BUS_NAME, OBJECT_PATH};
use preview::LatestFrame;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::load()?;
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        camera = config.camera_device.as_deref().unwrap_or("auto"),
        model_dir = %config.model_dir.display(),
        width = config.canvas_width,
        height = config.canvas_height,
        "tryond starting"
    );

    let camera = V4lCameraSource::new(
        config.camera_device.clone(),
        config.canvas_width,
        config.canvas_height,
    );
    let preview = Arc::new(LatestFrame::default());
    let controller = Arc::new(TryOnController::new(
        Arc::new(FaceMeshLoader),
        config.provider_options(),
        Arc::new(camera),
        Arc::new(UrlOverlayLoader::new()),
        preview.clone(),
        config.session_config(),
    ));

    let service = TryOnService::new(controller.clone(), preview, config.storefront());
    let _conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "tryond ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("tryond shutting down");
    controller.deactivate().await;

    Ok(())
}
