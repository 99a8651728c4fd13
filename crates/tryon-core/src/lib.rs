//! tryon-core: virtual try-on overlay engine.
//!
//! Tracks one face per frame with a face-mesh landmark provider, computes
//! where a glasses image belongs, and composites it over the live camera
//! feed. The lifecycle controller owns camera, provider, overlay image and
//! render loop for the duration of one activation.

pub mod compositor;
pub mod controller;
pub mod error;
pub mod face_detect;
pub mod face_mesh;
pub mod geometry;
pub mod media;
pub mod overlay;
pub mod provider;
pub mod render_loop;
pub mod types;

#[cfg(test)]
mod testing;

pub use controller::{SessionConfig, TryOnController, TryOnState};
pub use error::TryOnError;
pub use face_detect::{FaceBox, FaceDetector};
pub use face_mesh::{FaceMeshLoader, FaceMeshProvider};
pub use geometry::{compute_transform, GeometryParams};
pub use media::{CameraError, CameraSource, MediaConstraints, MediaStream, MediaTrack};
pub use overlay::{OverlayLoader, Storefront, UrlOverlayLoader};
pub use provider::{LandmarkProvider, ProviderError, ProviderLoader, ProviderOptions, RetryPolicy};
pub use render_loop::{FrameSink, RenderStatsSnapshot};
pub use types::{LandmarkPoint, LandmarkSet, OverlayTransform, VideoFrame};
