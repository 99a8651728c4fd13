//! V4L2 camera capture via the `v4l` crate.
//!
//! Each opened stream owns one capture thread. The thread opens the device,
//! negotiates a format, then publishes the latest RGB frame until its track
//! is stopped. Dequeues are bounded by a timeout so the thread notices a stop
//! request even when the device delivers nothing.

use crate::frame::{rgb24_to_rgb, yuyv_to_rgb, FrameError};
use async_trait::async_trait;
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tryon_core::media::{CameraError, CameraSource, FrameSender, MediaConstraints, MediaStream, MediaTrack};
use tryon_core::VideoFrame;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Longest a single dequeue may block before the stop flag is re-checked.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(250);
/// Consecutive failed dequeues after which the stream is abandoned.
const MAX_DEQUEUE_FAILURES: u32 = 30;
/// How long `stop` waits for the capture thread before detaching it.
const STOP_TIMEOUT: Duration = Duration::from_secs(1);

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed RGB24 (3 bytes/pixel).
    Rgb3,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(Self::Rgb3)
        } else {
            None
        }
    }

    fn to_rgb(self, buf: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
        match self {
            Self::Yuyv => yuyv_to_rgb(buf, width, height),
            Self::Rgb3 => rgb24_to_rgb(buf, width, height),
        }
    }
}

#[derive(Debug, Clone)]
struct Negotiated {
    card: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

/// Camera capability backed by V4L2 devices.
///
/// V4L2 does not report which way a camera faces, so every capture device is
/// treated as user-facing.
#[derive(Debug, Clone)]
pub struct V4lCameraSource {
    device: Option<String>,
    width: u32,
    height: u32,
}

impl V4lCameraSource {
    /// `device` pins a path such as "/dev/video2"; `None` picks the first
    /// capture device at open time. `width`×`height` is the requested size.
    pub fn new(device: Option<String>, width: u32, height: u32) -> Self {
        Self { device, width, height }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }

    async fn resolve_device(&self) -> Result<String, CameraError> {
        if let Some(path) = &self.device {
            return Ok(path.clone());
        }
        let devices = tokio::task::spawn_blocking(Self::list_devices)
            .await
            .map_err(|e| CameraError::CaptureFailed(format!("device scan task: {e}")))?;
        devices
            .into_iter()
            .next()
            .map(|d| d.path)
            .ok_or_else(|| CameraError::DeviceNotFound("no V4L2 capture device".into()))
    }
}

#[async_trait]
impl CameraSource for V4lCameraSource {
    async fn open(&self, constraints: &MediaConstraints) -> Result<MediaStream, CameraError> {
        if constraints.audio {
            return Err(CameraError::Unsupported("audio capture".into()));
        }
        if constraints.video.is_none() {
            return Err(CameraError::Unsupported("stream without video".into()));
        }

        let path = self.resolve_device().await?;
        let (frames_tx, frames_rx) = MediaStream::frame_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let running = Arc::new(AtomicBool::new(true));

        // The thread drops `done_tx` on exit, which is what `stop` waits for.
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let worker = {
            let path = path.clone();
            let running = Arc::clone(&running);
            let (width, height) = (self.width, self.height);
            std::thread::Builder::new()
                .name("tryon-capture".into())
                .spawn(move || {
                    let _done = done_tx;
                    capture_thread(&path, width, height, running, frames_tx, ready_tx)
                })
                .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?
        };

        let negotiated = ready_rx
            .await
            .map_err(|_| CameraError::CaptureFailed("capture thread exited during setup".into()))??;

        tracing::info!(
            device = %path,
            card = %negotiated.card,
            width = negotiated.width,
            height = negotiated.height,
            format = ?negotiated.format,
            "camera streaming"
        );

        let track: Arc<dyn MediaTrack> = Arc::new(V4lTrack {
            label: format!("{} ({path})", negotiated.card),
            running,
            worker: Mutex::new(Some(CaptureWorker {
                handle: worker,
                done: done_rx,
            })),
        });
        Ok(MediaStream::new(vec![track], frames_rx))
    }
}

struct CaptureWorker {
    handle: JoinHandle<()>,
    /// Disconnects when the thread exits.
    done: mpsc::Receiver<()>,
}

/// The single video track of a V4L2 stream.
struct V4lTrack {
    label: String,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<CaptureWorker>>,
}

impl MediaTrack for V4lTrack {
    fn label(&self) -> &str {
        &self.label
    }

    /// Signal the capture thread and wait, at most `STOP_TIMEOUT`, for it to
    /// close the device. A thread that does not exit in time is detached.
    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let worker = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(worker) = worker else {
            return;
        };

        match worker.done.recv_timeout(STOP_TIMEOUT) {
            Err(mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(label = %self.label, timeout = ?STOP_TIMEOUT, "capture thread did not stop; detaching");
            }
            _ => {
                if worker.handle.join().is_err() {
                    tracing::warn!(label = %self.label, "capture thread panicked");
                } else {
                    tracing::debug!(label = %self.label, "capture thread joined");
                }
            }
        }
    }

    fn is_live(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl Drop for V4lTrack {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_thread(
    path: &str,
    width: u32,
    height: u32,
    running: Arc<AtomicBool>,
    frames: FrameSender,
    ready: oneshot::Sender<Result<Negotiated, CameraError>>,
) {
    let (device, negotiated) = match open_device(path, width, height) {
        Ok(opened) => opened,
        Err(e) => {
            running.store(false, Ordering::Release);
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, 4) {
        Ok(stream) => stream,
        Err(e) => {
            running.store(false, Ordering::Release);
            let _ = ready.send(Err(CameraError::CaptureFailed(format!(
                "failed to create mmap stream: {e}"
            ))));
            return;
        }
    };

    stream.set_timeout(DEQUEUE_TIMEOUT);

    if ready.send(Ok(negotiated.clone())).is_err() {
        // Opener gave up (timed out) before the device came up.
        running.store(false, Ordering::Release);
        return;
    }

    let mut failures = DequeueFailures::default();
    while running.load(Ordering::Acquire) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                tracing::trace!(device = path, "no buffer within dequeue timeout");
                continue;
            }
            Err(e) => {
                if failures.record() {
                    tracing::warn!(
                        device = path,
                        error = %e,
                        failures = failures.consecutive,
                        "repeated dequeue failures; stopping capture"
                    );
                    break;
                }
                tracing::debug!(device = path, error = %e, "failed to dequeue buffer");
                continue;
            }
        };
        failures.reset();

        match negotiated.format.to_rgb(buf, negotiated.width, negotiated.height) {
            Ok(image) => {
                frames.send_replace(Some(VideoFrame::new(image, meta.sequence)));
            }
            Err(e) => tracing::debug!(seq = meta.sequence, error = %e, "dropping malformed frame"),
        }
    }

    running.store(false, Ordering::Release);
    tracing::info!(device = path, "capture stopped");
}

/// Counts consecutive dequeue failures; one good buffer resets the count.
#[derive(Debug, Default)]
struct DequeueFailures {
    consecutive: u32,
}

impl DequeueFailures {
    /// Record a failure. Returns `true` once the stream should be abandoned.
    fn record(&mut self) -> bool {
        self.consecutive += 1;
        self.consecutive >= MAX_DEQUEUE_FAILURES
    }

    fn reset(&mut self) {
        self.consecutive = 0;
    }
}

fn open_device(path: &str, width: u32, height: u32) -> Result<(Device, Negotiated), CameraError> {
    if !Path::new(path).exists() {
        return Err(CameraError::DeviceNotFound(path.to_string()));
    }

    let device = Device::with_path(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            CameraError::PermissionDenied
        } else if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
            CameraError::DeviceBusy
        } else {
            CameraError::DeviceNotFound(format!("{path}: {e}"))
        }
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::Unsupported(format!("{path} is not a capture device")));
    }

    let mut fmt = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
    fmt.fourcc = FourCC::new(b"YUYV");
    fmt.width = width;
    fmt.height = height;

    let negotiated = device.set_format(&fmt).map_err(|e| {
        if e.to_string().contains("busy") {
            CameraError::DeviceBusy
        } else {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        }
    })?;

    let format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "unsupported pixel format: {:?} (need YUYV or RGB3)",
            negotiated.fourcc
        ))
    })?;

    Ok((
        device,
        Negotiated {
            card: caps.card,
            width: negotiated.width,
            height: negotiated.height,
            format,
        },
    ))
}
