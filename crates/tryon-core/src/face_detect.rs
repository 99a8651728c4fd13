//! BlazeFace short-range face detector via ONNX Runtime.
//!
//! Finds the face the landmark model should look at. The model takes a
//! 128×128 letterboxed frame and scores 896 fixed SSD anchors; only the best
//! scoring box is kept since the provider tracks a single face.

use crate::provider::ProviderError;
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const BLAZEFACE_INPUT_SIZE: usize = 128;
/// Layer strides of the short-range model; equal consecutive strides share a grid.
const BLAZEFACE_STRIDES: [usize; 4] = [8, 16, 16, 16];
/// Anchors per grid cell contributed by each layer.
const BLAZEFACE_ANCHORS_PER_LAYER: usize = 2;
const BLAZEFACE_NUM_ANCHORS: usize = 896;
/// Box and keypoint values per anchor: 4 box terms plus 6 (x, y) keypoints.
const BLAZEFACE_REGRESSION_SIZE: usize = 16;
const BLAZEFACE_SCORE_CLIP: f32 = 100.0;

/// Metadata for coordinate de-mapping after letterbox resize.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LetterboxInfo {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl LetterboxInfo {
    pub fn for_frame(width: u32, height: u32, size: usize) -> Self {
        let size = size as f32;
        let scale = (size / width as f32).min(size / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: (size - new_w) / 2.0,
            pad_y: (size - new_h) / 2.0,
        }
    }

    /// Map a point in model-input pixels back to frame pixels.
    pub fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// A detected face in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

/// Anchor center in normalized input coordinates. The short-range model uses
/// fixed-size anchors, so width and height are always 1.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Anchor {
    cx: f32,
    cy: f32,
}

pub struct FaceDetector {
    session: Session,
    anchors: Vec<Anchor>,
}

impl FaceDetector {
    /// Load the BlazeFace ONNX model (NCHW float input) from the given path.
    pub fn load(model_path: &Path) -> Result<Self, ProviderError> {
        if !model_path.exists() {
            return Err(ProviderError::ModelNotFound(model_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();
        tracing::info!(path = %model_path.display(), outputs = ?output_names, "loaded face detection model");

        if output_names.len() < 2 {
            return Err(ProviderError::InitFailed(format!(
                "face detection model needs box and score outputs, got {}",
                output_names.len()
            )));
        }

        Ok(Self {
            session,
            anchors: generate_anchors(),
        })
    }

    /// Best face above `threshold`, if any.
    pub fn detect(&mut self, image: &RgbImage, threshold: f32) -> Result<Option<FaceBox>, ProviderError> {
        let (input, letterbox) = preprocess(image);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        // Outputs are told apart by size: regressors carry 16 values per anchor.
        let mut regressors = None;
        let mut scores = None;
        for idx in 0..2 {
            let (_, values) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ProviderError::InferenceFailed(format!("detection output {idx}: {e}")))?;
            if values.len() == BLAZEFACE_NUM_ANCHORS * BLAZEFACE_REGRESSION_SIZE {
                regressors = Some(values.to_vec());
            } else if values.len() == BLAZEFACE_NUM_ANCHORS {
                scores = Some(values.to_vec());
            }
        }
        let (Some(regressors), Some(scores)) = (regressors, scores) else {
            return Err(ProviderError::InferenceFailed(
                "face detection outputs do not match 896 anchors".into(),
            ));
        };

        Ok(decode_best(&regressors, &scores, &self.anchors, threshold, &letterbox))
    }
}

/// SSD anchors for the short-range model, in output order.
fn generate_anchors() -> Vec<Anchor> {
    let mut anchors = Vec::with_capacity(BLAZEFACE_NUM_ANCHORS);
    let mut layer = 0;
    while layer < BLAZEFACE_STRIDES.len() {
        let stride = BLAZEFACE_STRIDES[layer];
        let mut per_cell = 0;
        while layer < BLAZEFACE_STRIDES.len() && BLAZEFACE_STRIDES[layer] == stride {
            per_cell += BLAZEFACE_ANCHORS_PER_LAYER;
            layer += 1;
        }

        let grid = BLAZEFACE_INPUT_SIZE.div_ceil(stride);
        for y in 0..grid {
            for x in 0..grid {
                let anchor = Anchor {
                    cx: (x as f32 + 0.5) / grid as f32,
                    cy: (y as f32 + 0.5) / grid as f32,
                };
                for _ in 0..per_cell {
                    anchors.push(anchor);
                }
            }
        }
    }
    anchors
}

/// Letterbox an RGB frame into a NCHW tensor normalized to [-1, 1].
fn preprocess(image: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
    let size = BLAZEFACE_INPUT_SIZE;
    let letterbox = LetterboxInfo::for_frame(image.width(), image.height(), size);
    let new_w = ((image.width() as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((image.height() as f32 * letterbox.scale).round() as u32).max(1);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let pad_x = letterbox.pad_x.floor() as usize;
    let pad_y = letterbox.pad_y.floor() as usize;

    // Padding is black, which normalizes to -1.
    let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), -1.0);
    for (x, y, pixel) in resized.enumerate_pixels() {
        let tx = x as usize + pad_x;
        let ty = y as usize + pad_y;
        if tx >= size || ty >= size {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = pixel[c] as f32 / 127.5 - 1.0;
        }
    }

    (tensor, letterbox)
}

fn sigmoid(logit: f32) -> f32 {
    let logit = logit.clamp(-BLAZEFACE_SCORE_CLIP, BLAZEFACE_SCORE_CLIP);
    1.0 / (1.0 + (-logit).exp())
}

/// Decode the highest scoring anchor into a frame-pixel box.
fn decode_best(
    regressors: &[f32],
    scores: &[f32],
    anchors: &[Anchor],
    threshold: f32,
    letterbox: &LetterboxInfo,
) -> Option<FaceBox> {
    let (best, logit) = scores
        .iter()
        .take(anchors.len())
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))?;

    let score = sigmoid(logit);
    if score < threshold {
        tracing::trace!(score, threshold, "no face above detection threshold");
        return None;
    }

    let size = BLAZEFACE_INPUT_SIZE as f32;
    let anchor = anchors[best];
    let raw = regressors.get(best * BLAZEFACE_REGRESSION_SIZE..best * BLAZEFACE_REGRESSION_SIZE + 4)?;

    // Offsets are in input pixels relative to the anchor center.
    let cx = anchor.cx * size + raw[0];
    let cy = anchor.cy * size + raw[1];
    let w = raw[2];
    let h = raw[3];

    let (x1, y1) = letterbox.to_frame(cx - w / 2.0, cy - h / 2.0);
    let (x2, y2) = letterbox.to_frame(cx + w / 2.0, cy + h / 2.0);

    Some(FaceBox {
        x: x1,
        y: y1,
        width: x2 - x1,
        height: y2 - y1,
        score,
    })
}
