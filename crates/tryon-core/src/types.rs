use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// A single facial landmark in frame-normalized coordinates (0..1).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LandmarkPoint {
    pub x: f32,
    pub y: f32,
    /// Relative depth, when the provider emits one.
    pub z: Option<f32>,
}

impl LandmarkPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y, z: None }
    }

    /// Map the normalized point into pixel space for a `width × height` surface.
    pub fn to_pixels(&self, width: f32, height: f32) -> (f32, f32) {
        (self.x * width, self.y * height)
    }
}

/// Landmarks for exactly one face in exactly one frame.
///
/// Ordered by the provider's mesh topology; indices are only meaningful
/// against that topology (468/478-point face mesh).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LandmarkSet {
    points: Vec<LandmarkPoint>,
}

impl LandmarkSet {
    pub fn new(points: Vec<LandmarkPoint>) -> Self {
        Self { points }
    }

    pub fn get(&self, index: usize) -> Option<&LandmarkPoint> {
        self.points.get(index)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[LandmarkPoint] {
        &self.points
    }
}

/// Per-frame draw transform for the overlay image, in canvas pixels.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayTransform {
    pub anchor_x: f32,
    pub anchor_y: f32,
    pub rotation_radians: f32,
    pub width: f32,
    pub height: f32,
}

/// One decoded RGB video frame.
///
/// Cheap to clone: pixel data is shared.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub image: Arc<RgbImage>,
    pub sequence: u32,
    pub captured_at: Instant,
}

impl VideoFrame {
    pub fn new(image: RgbImage, sequence: u32) -> Self {
        Self {
            image: Arc::new(image),
            sequence,
            captured_at: Instant::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
