//! Landmark provider capability and its bounded-retry resolution.
//!
//! The controller only ever sees `dyn LandmarkProvider`; the ONNX face mesh
//! in [`crate::face_mesh`] is one implementation, test doubles are another.

use crate::types::{LandmarkSet, VideoFrame};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("landmark model not found: {0}")]
    ModelNotFound(String),
    #[error("provider initialization failed: {0}")]
    InitFailed(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Resolves an auxiliary asset name (model file) to a local path.
pub type LocateFn = Arc<dyn Fn(&str) -> PathBuf + Send + Sync>;

/// Detection options handed to the provider at construction.
#[derive(Clone)]
pub struct ProviderOptions {
    pub max_faces: usize,
    pub refine_landmarks: bool,
    pub min_detection_confidence: f32,
    pub min_tracking_confidence: f32,
    pub locate: LocateFn,
}

impl ProviderOptions {
    /// Single-face options with assets resolved under `model_dir`.
    pub fn with_model_dir(model_dir: impl Into<PathBuf>) -> Self {
        let model_dir = model_dir.into();
        Self {
            locate: Arc::new(move |file: &str| model_dir.join(file)),
            ..Self::default()
        }
    }
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            max_faces: 1,
            refine_landmarks: true,
            min_detection_confidence: 0.6,
            min_tracking_confidence: 0.6,
            locate: Arc::new(|file: &str| PathBuf::from(file)),
        }
    }
}

impl std::fmt::Debug for ProviderOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderOptions")
            .field("max_faces", &self.max_faces)
            .field("refine_landmarks", &self.refine_landmarks)
            .field("min_detection_confidence", &self.min_detection_confidence)
            .field("min_tracking_confidence", &self.min_tracking_confidence)
            .finish_non_exhaustive()
    }
}

/// Per-frame landmark detection.
///
/// `Ok(None)` means no face in this frame, which is not an error.
#[async_trait]
pub trait LandmarkProvider: Send + Sync {
    async fn detect(&self, frame: &VideoFrame) -> Result<Option<LandmarkSet>, ProviderError>;
}

/// Loads (constructs) a landmark provider.
#[async_trait]
pub trait ProviderLoader: Send + Sync {
    async fn load(&self, options: &ProviderOptions)
        -> Result<Arc<dyn LandmarkProvider>, ProviderError>;
}

/// Fixed-count, fixed-delay retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(200),
        }
    }
}

/// Load the provider, retrying up to `policy.attempts` times.
///
/// Returns the last load error once attempts are exhausted. Zero attempts is
/// treated as one.
pub async fn resolve_provider(
    loader: &dyn ProviderLoader,
    options: &ProviderOptions,
    policy: RetryPolicy,
) -> Result<Arc<dyn LandmarkProvider>, ProviderError> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match loader.load(options).await {
            Ok(provider) => {
                tracing::info!(attempt, "landmark provider ready");
                return Ok(provider);
            }
            Err(e) if attempt < attempts => {
                tracing::debug!(attempt, error = %e, "landmark provider not ready, retrying");
                tokio::time::sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::warn!(attempts, error = %e, "landmark provider unavailable");
                return Err(e);
            }
        }
    }
}
