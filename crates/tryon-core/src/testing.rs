//! Test doubles for the provider, camera, overlay loader and frame sink.

use crate::geometry::{CHIN_TIP, LEFT_CHEEK_EDGE, LEFT_EYE_OUTER, RIGHT_CHEEK_EDGE, RIGHT_EYE_OUTER};
use crate::media::{CameraError, CameraSource, FrameSender, MediaConstraints, MediaStream, MediaTrack};
use crate::overlay::{OverlayError, OverlayLoader};
use crate::provider::{LandmarkProvider, ProviderError, ProviderLoader, ProviderOptions};
use crate::render_loop::FrameSink;
use crate::types::{LandmarkPoint, LandmarkSet, VideoFrame};
use async_trait::async_trait;
use image::{Rgb, RgbImage, Rgba, RgbaImage};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn solid_frame(width: u32, height: u32, sequence: u32) -> VideoFrame {
    VideoFrame::new(RgbImage::from_pixel(width, height, Rgb([0, 0, 0])), sequence)
}

/// A level, frontal face: eyes at y=0.45, chin at y=0.8.
pub fn level_face() -> LandmarkSet {
    let mut points = vec![LandmarkPoint::new(0.5, 0.5); 468];
    points[LEFT_EYE_OUTER] = LandmarkPoint::new(0.4, 0.45);
    points[RIGHT_EYE_OUTER] = LandmarkPoint::new(0.6, 0.45);
    points[CHIN_TIP] = LandmarkPoint::new(0.5, 0.8);
    points[LEFT_CHEEK_EDGE] = LandmarkPoint::new(0.3, 0.5);
    points[RIGHT_CHEEK_EDGE] = LandmarkPoint::new(0.7, 0.5);
    LandmarkSet::new(points)
}

/// Poll `condition` on the real clock; panics after five seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not reached in time");
}

enum Response {
    Face(LandmarkSet),
    NoFace,
    Error,
}

pub struct ScriptedProvider {
    response: Response,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedProvider {
    fn with_response(response: Response) -> Self {
        Self {
            response,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn always_face(landmarks: LandmarkSet) -> Self {
        Self::with_response(Response::Face(landmarks))
    }

    pub fn always_none() -> Self {
        Self::with_response(Response::NoFace)
    }

    pub fn always_error() -> Self {
        Self::with_response(Response::Error)
    }

    /// Answer each call only after `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LandmarkProvider for ScriptedProvider {
    async fn detect(&self, _frame: &VideoFrame) -> Result<Option<LandmarkSet>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &self.response {
            Response::Face(landmarks) => Ok(Some(landmarks.clone())),
            Response::NoFace => Ok(None),
            Response::Error => Err(ProviderError::InferenceFailed("scripted failure".into())),
        }
    }
}

/// Fails the first `fail_count` loads, then hands out `provider`.
pub struct FlakyLoader {
    fail_count: u32,
    calls: AtomicU32,
    provider: Arc<ScriptedProvider>,
}

impl FlakyLoader {
    pub fn new(fail_count: u32, provider: ScriptedProvider) -> Self {
        Self {
            fail_count,
            calls: AtomicU32::new(0),
            provider: Arc::new(provider),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn provider(&self) -> Arc<ScriptedProvider> {
        Arc::clone(&self.provider)
    }
}

#[async_trait]
impl ProviderLoader for FlakyLoader {
    async fn load(&self, _options: &ProviderOptions) -> Result<Arc<dyn LandmarkProvider>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_count {
            return Err(ProviderError::ModelNotFound("face_landmark.onnx".into()));
        }
        Ok(self.provider.clone())
    }
}

type StopHook = Arc<dyn Fn() + Send + Sync>;

struct MockTrack {
    live: AtomicBool,
    on_stop: Option<StopHook>,
}

impl MediaTrack for MockTrack {
    fn label(&self) -> &str {
        "mock camera"
    }

    fn stop(&self) {
        if let Some(hook) = &self.on_stop {
            if self.is_live() {
                hook();
            }
        }
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CameraMode {
    Working,
    Denied,
    Hanging,
}

pub struct MockCamera {
    mode: CameraMode,
    initial_frame: bool,
    on_stop: Mutex<Option<StopHook>>,
    frames: Mutex<Option<FrameSender>>,
    tracks: Mutex<Vec<Arc<MockTrack>>>,
    requests: Mutex<Vec<MediaConstraints>>,
}

impl MockCamera {
    fn with_mode(mode: CameraMode) -> Self {
        Self {
            mode,
            initial_frame: false,
            on_stop: Mutex::new(None),
            frames: Mutex::new(None),
            tracks: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Self {
        Self::with_mode(CameraMode::Working)
    }

    /// Every open fails with `PermissionDenied`.
    pub fn denied() -> Self {
        Self::with_mode(CameraMode::Denied)
    }

    /// Every open waits forever, like an unanswered permission prompt.
    pub fn hanging() -> Self {
        Self::with_mode(CameraMode::Hanging)
    }

    /// Publish a 64×48 frame as soon as a stream opens.
    pub fn with_initial_frame(mut self) -> Self {
        self.initial_frame = true;
        self
    }

    /// Run `hook` when a live track of a later-opened stream is stopped.
    pub fn on_stop(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_stop.lock().unwrap() = Some(Arc::new(hook));
    }

    /// Route `push_frame` into an externally created channel.
    pub fn attach(&self, frames: FrameSender) {
        *self.frames.lock().unwrap() = Some(frames);
    }

    /// Drop the frame sender, ending the stream.
    pub fn detach(&self) {
        self.frames.lock().unwrap().take();
    }

    pub fn push_frame(&self, frame: VideoFrame) {
        if let Some(frames) = self.frames.lock().unwrap().as_ref() {
            frames.send_replace(Some(frame));
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.lock().unwrap().iter().filter(|t| t.is_live()).count()
    }

    pub fn opened(&self) -> usize {
        self.tracks.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CameraSource for MockCamera {
    async fn open(&self, constraints: &MediaConstraints) -> Result<MediaStream, CameraError> {
        self.requests.lock().unwrap().push(*constraints);
        match self.mode {
            CameraMode::Denied => return Err(CameraError::PermissionDenied),
            CameraMode::Hanging => std::future::pending::<()>().await,
            CameraMode::Working => {}
        }

        let (tx, rx) = MediaStream::frame_channel();
        if self.initial_frame {
            tx.send_replace(Some(solid_frame(64, 48, 0)));
        }
        self.attach(tx);

        let track = Arc::new(MockTrack {
            live: AtomicBool::new(true),
            on_stop: self.on_stop.lock().unwrap().clone(),
        });
        self.tracks.lock().unwrap().push(Arc::clone(&track));
        Ok(MediaStream::new(vec![track as Arc<dyn MediaTrack>], rx))
    }
}

/// Answers every load with an opaque red 8×4 image after `delay`.
pub struct MockOverlayLoader {
    delay: Duration,
    requested: Mutex<Vec<String>>,
}

impl MockOverlayLoader {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl OverlayLoader for MockOverlayLoader {
    async fn load(&self, url: &str) -> Result<RgbaImage, OverlayError> {
        self.requested.lock().unwrap().push(url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(RgbaImage::from_pixel(8, 4, Rgba([255, 0, 0, 255])))
    }
}

#[derive(Default)]
pub struct RecordingSink {
    presented: AtomicUsize,
    last: Mutex<Option<RgbaImage>>,
}

impl RecordingSink {
    pub fn presented(&self) -> usize {
        self.presented.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<RgbaImage> {
        self.last.lock().unwrap().clone()
    }
}

impl FrameSink for RecordingSink {
    fn present(&self, canvas: &RgbaImage) {
        *self.last.lock().unwrap() = Some(canvas.clone());
        self.presented.fetch_add(1, Ordering::SeqCst);
    }
}
