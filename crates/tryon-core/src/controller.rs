//! Lifecycle controller: owns one try-on activation from open to close.
//!
//! Activation brings resources up in a fixed order (provider, overlay image,
//! camera, video surface, render loop) and rolls back everything allocated so
//! far when a step fails or the activation is cancelled. Teardown is
//! infallible and idempotent. It cancels the loop and stops the camera tracks
//! before the cleared state is published.

use crate::compositor::Canvas;
use crate::error::TryOnError;
use crate::geometry::GeometryParams;
use crate::media::{CameraError, CameraManager, CameraSession, CameraSource, VideoSurface};
use crate::overlay::{OverlayError, OverlayImage, OverlayLoader};
use crate::provider::{resolve_provider, ProviderLoader, ProviderOptions, RetryPolicy};
use crate::render_loop::{FrameSink, RenderLoop, RenderLoopHandle, RenderStats, RenderStatsSnapshot};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};

/// State observable by the presentation shell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TryOnState {
    pub loading: bool,
    /// Display string of the last failed activation, or of the failure that
    /// ended an active session.
    pub error: Option<String>,
    pub active: bool,
    pub overlay_url: Option<String>,
}

/// Per-activation tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub canvas_width: u32,
    pub canvas_height: u32,
    pub retry: RetryPolicy,
    pub geometry: GeometryParams,
    /// Bounds camera acquisition and, separately, the wait for a playable surface.
    pub camera_timeout: Duration,
    /// How long deactivate waits for an in-flight tick before aborting it.
    pub teardown_grace: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            canvas_width: 640,
            canvas_height: 480,
            retry: RetryPolicy::default(),
            geometry: GeometryParams::default(),
            camera_timeout: Duration::from_secs(10),
            teardown_grace: Duration::from_millis(500),
        }
    }
}

struct ActiveSession {
    url: String,
    render: RenderLoopHandle,
    camera: CameraSession,
    overlay: OverlayImage,
    stats: Arc<RenderStats>,
}

/// Resources held by an activation that has not committed yet.
struct Pending {
    overlay: OverlayImage,
    camera: CameraSession,
}

impl Pending {
    async fn rollback(self, err: TryOnError) -> TryOnError {
        log_rollback(&err);
        let Pending { mut overlay, camera } = self;
        overlay.cancel();
        release_camera(camera).await;
        err
    }
}

fn log_rollback(err: &TryOnError) {
    match err {
        TryOnError::Cancelled => tracing::info!("activation cancelled; rolling back"),
        e => tracing::warn!(error = %e, "activation failed; rolling back"),
    }
}

/// Stop the camera tracks on the blocking pool. Backends may join capture
/// threads while stopping.
async fn release_camera(mut camera: CameraSession) {
    if let Err(e) = tokio::task::spawn_blocking(move || camera.release()).await {
        tracing::warn!(error = %e, "camera release task failed");
    }
}

/// Session slot and observable state, shared with each session's source watcher.
struct Lifecycle {
    state: watch::Sender<TryOnState>,
    session: Mutex<Option<ActiveSession>>,
    /// Held for a whole teardown, and while an activation settles the previous
    /// session and publishes `loading`.
    closing: Mutex<()>,
    /// Bumped by every teardown; an activation whose epoch is stale is cancelled.
    epoch: AtomicU64,
    teardown_grace: Duration,
}

impl Lifecycle {
    /// Tear down the current session, if any, then publish `outcome`.
    /// The caller holds `closing`.
    async fn close(&self, outcome: TryOnState) {
        let session = {
            let mut slot = self.session.lock().await;
            self.epoch.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };

        match session {
            Some(session) => {
                tracing::info!(url = %session.url, "closing try-on session");
                teardown(session, self.teardown_grace).await;
            }
            None => tracing::debug!("no active session to close"),
        }

        self.state.send_if_modified(|state| {
            if *state == outcome {
                return false;
            }
            *state = outcome;
            true
        });
    }
}

/// Close the session started at `epoch` if its video source ends on its own.
async fn watch_source(lifecycle: Arc<Lifecycle>, mut ended: watch::Receiver<bool>, epoch: u64) {
    if ended.wait_for(|ended| *ended).await.is_err() {
        // Loop cancelled by a teardown.
        return;
    }
    let _closing = lifecycle.closing.lock().await;
    if lifecycle.epoch.load(Ordering::SeqCst) != epoch {
        return;
    }

    let err = TryOnError::from(CameraError::SourceEnded);
    tracing::warn!(error = %err, "closing try-on after source loss");
    lifecycle
        .close(TryOnState {
            error: Some(err.to_string()),
            ..TryOnState::default()
        })
        .await;
}

pub struct TryOnController {
    loader: Arc<dyn ProviderLoader>,
    options: ProviderOptions,
    camera: CameraManager,
    overlays: Arc<dyn OverlayLoader>,
    sink: Arc<dyn FrameSink>,
    config: SessionConfig,
    lifecycle: Arc<Lifecycle>,
    /// Serializes activations.
    activating: Mutex<()>,
}

impl TryOnController {
    pub fn new(
        loader: Arc<dyn ProviderLoader>,
        options: ProviderOptions,
        camera: Arc<dyn CameraSource>,
        overlays: Arc<dyn OverlayLoader>,
        sink: Arc<dyn FrameSink>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(TryOnState::default());
        let lifecycle = Arc::new(Lifecycle {
            state,
            session: Mutex::new(None),
            closing: Mutex::new(()),
            epoch: AtomicU64::new(0),
            teardown_grace: config.teardown_grace,
        });
        Self {
            loader,
            options,
            camera: CameraManager::new(camera, config.camera_timeout),
            overlays,
            sink,
            config,
            lifecycle,
            activating: Mutex::new(()),
        }
    }

    pub fn state(&self) -> TryOnState {
        self.lifecycle.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TryOnState> {
        self.lifecycle.state.subscribe()
    }

    /// Counters of the current activation's render loop.
    pub async fn stats(&self) -> Option<RenderStatsSnapshot> {
        self.lifecycle
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.stats.snapshot())
    }

    /// Open the try-on with `url` as the overlay image.
    ///
    /// A no-op while the same URL is already active; a concurrent call for
    /// the same URL waits for the activation in progress. A different URL
    /// tears the current activation down first.
    pub async fn activate(&self, url: &str) -> Result<(), TryOnError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(OverlayError::EmptyReference.into());
        }

        // Cancel a slow activation for another overlay instead of queueing behind it.
        let other = {
            let state = self.lifecycle.state.borrow();
            (state.active || state.loading) && state.overlay_url.as_deref() != Some(url)
        };
        if other {
            tracing::info!(url, "overlay changed; restarting try-on");
            self.deactivate().await;
        }

        let _activating = self.activating.lock().await;
        let epoch = {
            let _closing = self.lifecycle.closing.lock().await;
            let (active, loading, same_url) = {
                let state = self.lifecycle.state.borrow();
                (state.active, state.loading, state.overlay_url.as_deref() == Some(url))
            };
            if active && same_url {
                tracing::debug!(url, "already active with this overlay");
                return Ok(());
            }
            if active || loading {
                // No activation runs while we hold the lock, so a lingering
                // `loading` belongs to an abandoned call.
                self.lifecycle.close(TryOnState::default()).await;
            }

            let epoch = self.lifecycle.epoch.load(Ordering::SeqCst);
            self.lifecycle.state.send_replace(TryOnState {
                loading: true,
                error: None,
                active: false,
                overlay_url: Some(url.to_string()),
            });
            epoch
        };
        tracing::info!(url, "activating try-on");

        let result = self.bring_up(url, epoch).await;

        let mut slot = self.lifecycle.session.lock().await;
        let stale = self.lifecycle.epoch.load(Ordering::SeqCst) != epoch;
        match result {
            Ok(session) if stale => {
                // Deactivated between the last checkpoint and commit.
                drop(slot);
                teardown(session, self.config.teardown_grace).await;
                Err(TryOnError::Cancelled)
            }
            Ok(session) => {
                let ended = session.render.ended();
                *slot = Some(session);
                self.lifecycle.state.send_modify(|s| {
                    s.loading = false;
                    s.active = true;
                });
                tokio::spawn(watch_source(Arc::clone(&self.lifecycle), ended, epoch));
                tracing::info!(url, "try-on active");
                Ok(())
            }
            Err(e) if stale => {
                tracing::debug!(error = %e, "activation failed after cancellation");
                Err(TryOnError::Cancelled)
            }
            Err(e) => {
                self.lifecycle.state.send_replace(TryOnState {
                    error: Some(e.to_string()),
                    ..TryOnState::default()
                });
                Err(e)
            }
        }
    }

    async fn bring_up(&self, url: &str, epoch: u64) -> Result<ActiveSession, TryOnError> {
        let provider = resolve_provider(self.loader.as_ref(), &self.options, self.config.retry).await?;
        self.checkpoint(epoch)?;

        let mut overlay = OverlayImage::load(url, Arc::clone(&self.overlays));

        let camera = match self.camera.acquire().await {
            Ok(camera) => camera,
            Err(e) => {
                let err = TryOnError::from(e);
                log_rollback(&err);
                overlay.cancel();
                return Err(err);
            }
        };
        let pending = Pending { overlay, camera };
        if let Err(e) = self.checkpoint(epoch) {
            return Err(pending.rollback(e).await);
        }

        let Some(mut surface) = pending.camera.stream().map(VideoSurface::bind) else {
            let err = CameraError::CaptureFailed("stream already released".into());
            return Err(pending.rollback(err.into()).await);
        };
        let playable = tokio::time::timeout(self.config.camera_timeout, surface.wait_playable())
            .await
            .unwrap_or(Err(CameraError::Timeout));
        if let Err(e) = playable {
            return Err(pending.rollback(e.into()).await);
        }
        if let Err(e) = self.checkpoint(epoch) {
            return Err(pending.rollback(e).await);
        }

        let stats = Arc::new(RenderStats::default());
        let render = RenderLoop::new(
            surface,
            provider,
            pending.overlay.handle(),
            Canvas::new(self.config.canvas_width, self.config.canvas_height),
            Arc::clone(&self.sink),
            self.config.geometry,
            Arc::clone(&stats),
        )
        .start();

        let Pending { overlay, camera } = pending;
        Ok(ActiveSession {
            url: url.to_string(),
            render,
            camera,
            overlay,
            stats,
        })
    }

    fn checkpoint(&self, epoch: u64) -> Result<(), TryOnError> {
        if self.lifecycle.epoch.load(Ordering::SeqCst) == epoch {
            Ok(())
        } else {
            Err(TryOnError::Cancelled)
        }
    }

    /// Close the try-on. Safe to call any number of times, in any state.
    ///
    /// Cancels the render loop, releases the camera, then clears observable
    /// state; an activation still in progress is cancelled at its next step.
    pub async fn deactivate(&self) {
        let _closing = self.lifecycle.closing.lock().await;
        self.lifecycle.close(TryOnState::default()).await;
    }
}

async fn teardown(session: ActiveSession, grace: Duration) {
    let ActiveSession {
        render,
        camera,
        mut overlay,
        stats,
        ..
    } = session;

    render.cancel();
    release_camera(camera).await;
    overlay.cancel();

    render.shutdown(grace).await;
    let stats = stats.snapshot();
    tracing::info!(
        frames = stats.frames_painted,
        overlays = stats.overlays_drawn,
        missed = stats.faces_missed,
        "try-on session closed"
    );
}
