//! Keeps the most recent composited canvas for snapshots.

use image::RgbaImage;
use std::path::Path;
use std::sync::Mutex;
use tryon_core::FrameSink;

#[derive(Default)]
pub struct LatestFrame {
    frame: Mutex<Option<RgbaImage>>,
}

impl LatestFrame {
    pub fn latest(&self) -> Option<RgbaImage> {
        self.frame.lock().ok().and_then(|f| f.clone())
    }

    /// Write the latest canvas to `path`. Returns `false` if nothing has been
    /// painted yet.
    pub async fn save(&self, path: &Path) -> anyhow::Result<bool> {
        let Some(frame) = self.latest() else {
            return Ok(false);
        };
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || frame.save(&path)).await??;
        Ok(true)
    }
}

impl FrameSink for LatestFrame {
    fn present(&self, canvas: &RgbaImage) {
        if let Ok(mut frame) = self.frame.lock() {
            match frame.as_mut() {
                Some(existing) if existing.dimensions() == canvas.dimensions() => {
                    existing.copy_from_slice(canvas.as_raw());
                }
                _ => *frame = Some(canvas.clone()),
            }
        }
    }
}
