//! Camera capability, camera sessions and the video surface they feed.
//!
//! A [`CameraSource`] opens a [`MediaStream`]: a set of independently
//! stoppable tracks plus a latest-frame channel. The [`CameraManager`] wraps
//! the stream in a [`CameraSession`] that releases it exactly once.

use crate::types::VideoFrame;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("unsupported constraint: {0}")]
    Unsupported(String),
    #[error("timed out waiting for camera")]
    Timeout,
    #[error("video source ended")]
    SourceEnded,
}

/// Which way the requested camera faces. Only the user-facing camera is
/// ever requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacingMode {
    User,
}

/// Capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<FacingMode>,
    pub audio: bool,
}

impl MediaConstraints {
    /// Front-facing video, no audio.
    pub fn user_video() -> Self {
        Self {
            video: Some(FacingMode::User),
            audio: false,
        }
    }
}

/// One hardware track of a stream.
///
/// `stop` must be idempotent and must not fail; implementations log
/// release problems instead of returning them.
pub trait MediaTrack: Send + Sync {
    fn label(&self) -> &str;
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// Sender half of a stream's latest-frame channel.
pub type FrameSender = watch::Sender<Option<VideoFrame>>;

/// A live capture stream.
pub struct MediaStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
    frames: watch::Receiver<Option<VideoFrame>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>, frames: watch::Receiver<Option<VideoFrame>>) -> Self {
        Self { tracks, frames }
    }

    /// Create the latest-frame channel a backend publishes into.
    pub fn frame_channel() -> (FrameSender, watch::Receiver<Option<VideoFrame>>) {
        watch::channel(None)
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    fn stop_all(&self) {
        for track in &self.tracks {
            if track.is_live() {
                tracing::debug!(label = track.label(), "stopping track");
            }
            track.stop();
        }
    }
}

/// Opens capture streams.
#[async_trait]
pub trait CameraSource: Send + Sync {
    async fn open(&self, constraints: &MediaConstraints) -> Result<MediaStream, CameraError>;
}

/// Exclusive owner of one activation's stream.
pub struct CameraSession {
    stream: Option<MediaStream>,
}

impl CameraSession {
    pub fn new(stream: MediaStream) -> Self {
        Self { stream: Some(stream) }
    }

    pub fn stream(&self) -> Option<&MediaStream> {
        self.stream.as_ref()
    }

    pub fn is_released(&self) -> bool {
        self.stream.is_none()
    }

    /// Stop every track. Later calls are no-ops.
    pub fn release(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop_all();
            tracing::info!("camera session released");
        }
    }
}

impl Drop for CameraSession {
    fn drop(&mut self) {
        self.release();
    }
}

/// Acquires and releases camera sessions.
pub struct CameraManager {
    source: Arc<dyn CameraSource>,
    timeout: Duration,
}

impl CameraManager {
    pub fn new(source: Arc<dyn CameraSource>, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Request a front-facing, video-only stream.
    ///
    /// Every failure, including an unanswered request past the timeout,
    /// surfaces as a [`CameraError`].
    pub async fn acquire(&self) -> Result<CameraSession, CameraError> {
        let constraints = MediaConstraints::user_video();
        let stream = tokio::time::timeout(self.timeout, self.source.open(&constraints))
            .await
            .map_err(|_| CameraError::Timeout)??;
        tracing::info!(tracks = stream.tracks().len(), "camera session acquired");
        Ok(CameraSession::new(stream))
    }

    /// Release a session if there is one.
    pub fn release(&self, session: Option<CameraSession>) {
        if let Some(mut session) = session {
            session.release();
        }
    }
}

/// Readiness of a video surface, coarsely following media element states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing,
    HaveCurrentData,
}

/// The drawable end of a stream.
pub struct VideoSurface {
    frames: watch::Receiver<Option<VideoFrame>>,
}

impl VideoSurface {
    /// Bind to a stream's live output.
    pub fn bind(stream: &MediaStream) -> Self {
        Self {
            frames: stream.frames.clone(),
        }
    }

    pub fn ready_state(&self) -> ReadyState {
        if self.frames.borrow().is_some() {
            ReadyState::HaveCurrentData
        } else {
            ReadyState::HaveNothing
        }
    }

    pub fn is_playable(&self) -> bool {
        self.ready_state() >= ReadyState::HaveCurrentData
    }

    /// Latest frame, marking it as seen.
    pub fn current_frame(&mut self) -> Option<VideoFrame> {
        self.frames.borrow_and_update().clone()
    }

    /// Wait until the first frame has arrived.
    pub async fn wait_playable(&mut self) -> Result<(), CameraError> {
        self.frames
            .wait_for(|frame| frame.is_some())
            .await
            .map(|_| ())
            .map_err(|_| CameraError::CaptureFailed("stream ended before first frame".into()))
    }

    /// Wait for the next frame the source paints.
    ///
    /// Returns `false` once the source has ended.
    pub async fn next_paint(&mut self) -> bool {
        self.frames.changed().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{solid_frame, MockCamera};

    #[tokio::test]
    async fn test_acquire_and_release_stops_tracks() {
        let camera = Arc::new(MockCamera::new());
        let manager = CameraManager::new(camera.clone(), Duration::from_secs(1));

        let mut session = manager.acquire().await.unwrap();
        assert_eq!(camera.live_tracks(), 1);
        assert_eq!(camera.requests()[0], MediaConstraints::user_video());

        session.release();
        assert_eq!(camera.live_tracks(), 0);
        assert!(session.is_released());

        // Second release is a no-op.
        session.release();
        manager.release(None);
        assert_eq!(camera.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_session() {
        let camera = Arc::new(MockCamera::new());
        let manager = CameraManager::new(camera.clone(), Duration::from_secs(1));
        let session = manager.acquire().await.unwrap();
        drop(session);
        assert_eq!(camera.live_tracks(), 0);
    }

    #[tokio::test]
    async fn test_denied_camera() {
        let camera = Arc::new(MockCamera::denied());
        let manager = CameraManager::new(camera, Duration::from_secs(1));
        assert!(matches!(manager.acquire().await, Err(CameraError::PermissionDenied)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_request_times_out() {
        let camera = Arc::new(MockCamera::hanging());
        let manager = CameraManager::new(camera, Duration::from_secs(10));
        assert!(matches!(manager.acquire().await, Err(CameraError::Timeout)));
    }

    #[tokio::test]
    async fn test_surface_becomes_playable_on_first_frame() {
        let camera = Arc::new(MockCamera::new());
        let manager = CameraManager::new(camera.clone(), Duration::from_secs(1));
        let session = manager.acquire().await.unwrap();

        let mut surface = VideoSurface::bind(session.stream().unwrap());
        assert_eq!(surface.ready_state(), ReadyState::HaveNothing);
        assert!(surface.current_frame().is_none());

        camera.push_frame(solid_frame(4, 4, 1));
        surface.wait_playable().await.unwrap();
        assert!(surface.is_playable());
        assert_eq!(surface.current_frame().unwrap().sequence, 1);
    }

    #[tokio::test]
    async fn test_next_paint_reports_ended_source() {
        let (tx, rx) = MediaStream::frame_channel();
        let stream = MediaStream::new(Vec::new(), rx);
        let mut surface = VideoSurface::bind(&stream);
        drop(tx);
        assert!(!surface.next_paint().await);
        assert!(surface.wait_playable().await.is_err());
    }
}
