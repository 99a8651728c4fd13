//! Frame render loop.
//!
//! One tick per frame the video source paints. Ticks never overlap: the
//! provider call is awaited inside the tick, so at most one detection is in
//! flight. Cancellation is cooperative; a tick already awaiting the provider
//! finishes its paint, and no tick starts after that. A source that ends on
//! its own stops the loop and is reported through [`RenderLoopHandle::ended`].

use crate::compositor::Canvas;
use crate::geometry::{compute_transform_with, GeometryParams};
use crate::media::VideoSurface;
use crate::overlay::OverlayHandle;
use crate::provider::LandmarkProvider;
use image::RgbaImage;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Receives each finished canvas.
pub trait FrameSink: Send + Sync {
    fn present(&self, canvas: &RgbaImage);
}

/// What one tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Video not playable yet; nothing drawn, provider not called.
    NotReady,
    /// Video drawn, no usable face.
    NoFace,
    /// Video drawn, face found, overlay image still loading.
    OverlayPending,
    /// Video and overlay drawn.
    Overlay,
    /// Video drawn, provider failed for this frame.
    ProviderFailed,
}

/// Counters shared between the loop and observers.
#[derive(Debug, Default)]
pub struct RenderStats {
    frames_painted: AtomicU64,
    overlays_drawn: AtomicU64,
    faces_missed: AtomicU64,
    provider_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RenderStatsSnapshot {
    pub frames_painted: u64,
    pub overlays_drawn: u64,
    pub faces_missed: u64,
    pub provider_errors: u64,
}

impl RenderStats {
    pub fn snapshot(&self) -> RenderStatsSnapshot {
        RenderStatsSnapshot {
            frames_painted: self.frames_painted.load(Ordering::Relaxed),
            overlays_drawn: self.overlays_drawn.load(Ordering::Relaxed),
            faces_missed: self.faces_missed.load(Ordering::Relaxed),
            provider_errors: self.provider_errors.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: TickOutcome) {
        let counter = match outcome {
            TickOutcome::NotReady => return,
            TickOutcome::NoFace | TickOutcome::OverlayPending => &self.faces_missed,
            TickOutcome::Overlay => &self.overlays_drawn,
            TickOutcome::ProviderFailed => &self.provider_errors,
        };
        self.frames_painted.fetch_add(1, Ordering::Relaxed);
        if outcome != TickOutcome::OverlayPending {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Everything one activation's loop owns.
pub struct RenderLoop {
    surface: VideoSurface,
    provider: Arc<dyn LandmarkProvider>,
    overlay: OverlayHandle,
    canvas: Canvas,
    sink: Arc<dyn FrameSink>,
    geometry: GeometryParams,
    stats: Arc<RenderStats>,
}

impl RenderLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        surface: VideoSurface,
        provider: Arc<dyn LandmarkProvider>,
        overlay: OverlayHandle,
        canvas: Canvas,
        sink: Arc<dyn FrameSink>,
        geometry: GeometryParams,
        stats: Arc<RenderStats>,
    ) -> Self {
        Self {
            surface,
            provider,
            overlay,
            canvas,
            sink,
            geometry,
            stats,
        }
    }

    /// Spawn the loop; the returned handle is the only way to stop it.
    pub fn start(self) -> RenderLoopHandle {
        let (alive_tx, alive_rx) = watch::channel(true);
        let (ended_tx, ended_rx) = watch::channel(false);
        let task = tokio::spawn(self.run(alive_rx, ended_tx));
        RenderLoopHandle {
            alive: alive_tx,
            ended: ended_rx,
            task: Some(task),
        }
    }

    async fn run(mut self, mut alive: watch::Receiver<bool>, ended: watch::Sender<bool>) {
        tracing::info!(
            width = self.canvas.width(),
            height = self.canvas.height(),
            "render loop started"
        );
        let mut ticks = 0u64;

        loop {
            if !*alive.borrow() {
                break;
            }

            let outcome = self.tick().await;
            ticks += 1;
            tracing::trace!(tick = ticks, ?outcome, "tick");

            if !*alive.borrow() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut alive) => break,
                more = self.surface.next_paint() => {
                    if !more {
                        tracing::warn!("video source ended; render loop stopping");
                        ended.send_replace(true);
                        break;
                    }
                }
            }
        }

        tracing::info!(ticks, "render loop stopped");
    }

    /// Paint one frame.
    pub async fn tick(&mut self) -> TickOutcome {
        if !self.surface.is_playable() {
            return TickOutcome::NotReady;
        }
        let Some(frame) = self.surface.current_frame() else {
            return TickOutcome::NotReady;
        };

        self.canvas.clear();
        self.canvas.draw_video(&frame);

        let outcome = match self.provider.detect(&frame).await {
            Ok(Some(landmarks)) => {
                match compute_transform_with(
                    &landmarks,
                    self.canvas.width(),
                    self.canvas.height(),
                    &self.geometry,
                ) {
                    Some(transform) => match self.overlay.get() {
                        Some(image) => {
                            self.canvas.draw_overlay(image, &transform);
                            TickOutcome::Overlay
                        }
                        None => TickOutcome::OverlayPending,
                    },
                    None => TickOutcome::NoFace,
                }
            }
            Ok(None) => TickOutcome::NoFace,
            Err(e) => {
                tracing::debug!(seq = frame.sequence, error = %e, "landmark detection failed for frame");
                TickOutcome::ProviderFailed
            }
        };

        self.stats.record(outcome);
        self.sink.present(self.canvas.pixels());
        outcome
    }
}

async fn cancelled(alive: &mut watch::Receiver<bool>) {
    // A dropped handle counts as cancellation.
    let _ = alive.wait_for(|alive| !*alive).await;
}

/// Cancellation token for a running loop.
pub struct RenderLoopHandle {
    alive: watch::Sender<bool>,
    ended: watch::Receiver<bool>,
    task: Option<JoinHandle<()>>,
}

impl RenderLoopHandle {
    /// Stop scheduling ticks. Idempotent.
    pub fn cancel(&self) {
        self.alive.send_replace(false);
    }

    /// Flips to `true` when the video source ended under the loop. Never set
    /// for a cancelled loop; the sender is dropped instead.
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.ended.clone()
    }

    /// Cancel, then wait up to `grace` for an in-flight tick to finish.
    /// Aborts the task if it does not.
    pub async fn shutdown(mut self, grace: Duration) {
        self.cancel();
        let Some(mut task) = self.task.take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(error = %e, "render loop task failed"),
            Err(_) => {
                tracing::warn!(?grace, "render loop did not stop in time; aborting");
                task.abort();
            }
        }
    }
}

impl Drop for RenderLoopHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
