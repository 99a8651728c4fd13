use crate::media::CameraError;
use crate::overlay::OverlayError;
use crate::provider::ProviderError;
use thiserror::Error;

/// Terminal failure of one activation attempt.
///
/// The display string is what the presentation shell shows.
#[derive(Error, Debug)]
pub enum TryOnError {
    #[error("face tracking unavailable: {0}")]
    ProviderUnavailable(#[from] ProviderError),
    #[error("camera unavailable: {0}")]
    CameraUnavailable(#[from] CameraError),
    #[error("overlay image unavailable: {0}")]
    Overlay(#[from] OverlayError),
    #[error("activation cancelled")]
    Cancelled,
}

impl TryOnError {
    /// Short machine-readable kind, stable across message changes.
    pub fn kind(&self) -> &'static str {
        match self {
            TryOnError::ProviderUnavailable(_) => "ProviderUnavailable",
            TryOnError::CameraUnavailable(_) => "CameraUnavailable",
            TryOnError::Overlay(_) => "Overlay",
            TryOnError::Cancelled => "Cancelled",
        }
    }
}
