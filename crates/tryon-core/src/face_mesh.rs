//! Face mesh landmark provider via ONNX Runtime.
//!
//! Two stages: the BlazeFace detector proposes a face box, the box is widened
//! into a square region of interest, and the landmark model runs on that
//! region cropped to its 192×192 input. While a face stays in view the next
//! region comes from the previous frame's landmarks, so the detector only
//! runs to acquire a face. Acquisition is gated by `min_detection_confidence`
//! and tracked frames by `min_tracking_confidence`.

use crate::face_detect::{FaceBox, FaceDetector};
use crate::provider::{LandmarkProvider, ProviderError, ProviderLoader, ProviderOptions};
use crate::types::{LandmarkPoint, LandmarkSet, VideoFrame};
use async_trait::async_trait;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::{Arc, Mutex};

const FACE_MESH_INPUT_SIZE: usize = 192;
const FACE_MESH_POINTS: usize = 468;
const FACE_MESH_MODEL: &str = "face_landmark.onnx";
const FACE_MESH_ATTENTION_MODEL: &str = "face_landmark_with_attention.onnx";
const FACE_DETECTION_MODEL: &str = "face_detection_short_range.onnx";
/// Side of the region of interest relative to the face extent.
const ROI_SCALE: f32 = 1.5;

/// Square region of interest in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Roi {
    cx: f32,
    cy: f32,
    size: f32,
}

impl Roi {
    fn from_box(face: &FaceBox) -> Self {
        Self {
            cx: face.x + face.width / 2.0,
            cy: face.y + face.height / 2.0,
            size: face.width.max(face.height) * ROI_SCALE,
        }
    }

    /// Region around a frame's landmarks, for use on the next frame.
    fn from_landmarks(landmarks: &LandmarkSet, width: u32, height: u32) -> Option<Self> {
        let (mut min_x, mut min_y) = (f32::MAX, f32::MAX);
        let (mut max_x, mut max_y) = (f32::MIN, f32::MIN);
        for point in landmarks.points() {
            let (x, y) = point.to_pixels(width as f32, height as f32);
            min_x = min_x.min(x);
            min_y = min_y.min(y);
            max_x = max_x.max(x);
            max_y = max_y.max(y);
        }

        let extent = (max_x - min_x).max(max_y - min_y);
        if !extent.is_finite() || extent <= 0.0 {
            return None;
        }
        Some(Self {
            cx: (min_x + max_x) / 2.0,
            cy: (min_y + max_y) / 2.0,
            size: extent * ROI_SCALE,
        })
    }

    fn left(&self) -> f32 {
        self.cx - self.size / 2.0
    }

    fn top(&self) -> f32 {
        self.cy - self.size / 2.0
    }

    /// Frame pixels per model-input pixel.
    fn step(&self) -> f32 {
        self.size / FACE_MESH_INPUT_SIZE as f32
    }

    /// Map a point in model-input pixels back to frame-normalized coordinates.
    fn to_frame_normalized(&self, x: f32, y: f32, width: u32, height: u32) -> (f32, f32) {
        (
            (self.left() + x * self.step()) / width as f32,
            (self.top() + y * self.step()) / height as f32,
        )
    }
}

/// Output tensor indices: (landmarks, face presence score).
type OutputIndices = (usize, Option<usize>);

/// Loads [`FaceMeshProvider`] from the assets named by the options.
pub struct FaceMeshLoader;

#[async_trait]
impl ProviderLoader for FaceMeshLoader {
    async fn load(
        &self,
        options: &ProviderOptions,
    ) -> Result<Arc<dyn LandmarkProvider>, ProviderError> {
        let mesh_file = if options.refine_landmarks {
            FACE_MESH_ATTENTION_MODEL
        } else {
            FACE_MESH_MODEL
        };
        let detector_path = (options.locate)(FACE_DETECTION_MODEL);
        let mesh_path = (options.locate)(mesh_file);
        let options = options.clone();

        let provider =
            tokio::task::spawn_blocking(move || FaceMeshProvider::load(&detector_path, &mesh_path, options))
                .await
                .map_err(|e| ProviderError::InitFailed(format!("loader task: {e}")))??;

        Ok(Arc::new(provider))
    }
}

struct Models {
    detector: Mutex<FaceDetector>,
    mesh: Mutex<Session>,
    outputs: OutputIndices,
}

/// Mesh model output for one region.
struct MeshOutput {
    raw: Vec<f32>,
    score: Option<f32>,
    roi: Roi,
    tracked: bool,
}

/// Single-face mesh provider.
pub struct FaceMeshProvider {
    models: Arc<Models>,
    options: ProviderOptions,
    /// Region derived from the previous frame's landmarks.
    tracked: Mutex<Option<Roi>>,
}

impl FaceMeshProvider {
    /// Load the face detection and face mesh ONNX models.
    pub fn load(detector_path: &Path, mesh_path: &Path, options: ProviderOptions) -> Result<Self, ProviderError> {
        let detector = FaceDetector::load(detector_path)?;

        if !mesh_path.exists() {
            return Err(ProviderError::ModelNotFound(mesh_path.display().to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(mesh_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = %mesh_path.display(),
            outputs = ?output_names,
            refine = options.refine_landmarks,
            "loaded face mesh model"
        );

        if output_names.is_empty() {
            return Err(ProviderError::InitFailed("face mesh model has no outputs".into()));
        }

        let outputs = discover_output_indices(&output_names);
        tracing::debug!(?outputs, "face mesh output tensor mapping");

        Ok(Self {
            models: Arc::new(Models {
                detector: Mutex::new(detector),
                mesh: Mutex::new(session),
                outputs,
            }),
            options,
            tracked: Mutex::new(None),
        })
    }

    fn tracked_roi(&self) -> Option<Roi> {
        match self.tracked.lock() {
            Ok(roi) => *roi,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_tracked_roi(&self, roi: Option<Roi>) {
        match self.tracked.lock() {
            Ok(mut slot) => *slot = roi,
            Err(poisoned) => *poisoned.into_inner() = roi,
        }
    }
}

#[async_trait]
impl LandmarkProvider for FaceMeshProvider {
    async fn detect(&self, frame: &VideoFrame) -> Result<Option<LandmarkSet>, ProviderError> {
        let image = Arc::clone(&frame.image);
        let models = Arc::clone(&self.models);
        let tracked = self.tracked_roi();
        let min_detection = self.options.min_detection_confidence;

        let output = tokio::task::spawn_blocking(move || run_inference(&models, &image, tracked, min_detection))
            .await
            .map_err(|e| ProviderError::InferenceFailed(format!("inference task: {e}")))??;

        let Some(output) = output else {
            self.set_tracked_roi(None);
            return Ok(None);
        };

        let threshold = if output.tracked {
            self.options.min_tracking_confidence
        } else {
            self.options.min_detection_confidence
        };
        let (width, height) = (frame.width(), frame.height());
        let result = decode_landmarks(&output.raw, output.score, threshold, &output.roi, width, height);
        if result.is_none() && output.tracked {
            tracing::debug!("lost tracked face; detecting again");
        }
        self.set_tracked_roi(result.as_ref().and_then(|set| Roi::from_landmarks(set, width, height)));
        Ok(result)
    }
}

/// Pick the region (tracked, or freshly detected) and run the mesh model on it.
/// `None` when no face was detected.
fn run_inference(
    models: &Models,
    image: &RgbImage,
    tracked: Option<Roi>,
    min_detection: f32,
) -> Result<Option<MeshOutput>, ProviderError> {
    let (roi, is_tracked) = match tracked {
        Some(roi) => (roi, true),
        None => {
            let mut detector = models
                .detector
                .lock()
                .map_err(|_| ProviderError::InferenceFailed("detector lock poisoned".into()))?;
            match detector.detect(image, min_detection)? {
                Some(face) => {
                    tracing::debug!(?face, "face acquired");
                    (Roi::from_box(&face), false)
                }
                None => return Ok(None),
            }
        }
    };

    let input = crop_to_input(image, &roi);
    let (landmarks_idx, score_idx) = models.outputs;

    let mut session = models
        .mesh
        .lock()
        .map_err(|_| ProviderError::InferenceFailed("session lock poisoned".into()))?;
    let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

    let (_, landmarks) = outputs[landmarks_idx]
        .try_extract_tensor::<f32>()
        .map_err(|e| ProviderError::InferenceFailed(format!("landmarks: {e}")))?;
    let raw = landmarks.to_vec();

    let score = match score_idx {
        Some(idx) => {
            let (_, s) = outputs[idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| ProviderError::InferenceFailed(format!("face score: {e}")))?;
            s.first().copied()
        }
        None => None,
    };

    Ok(Some(MeshOutput {
        raw,
        score,
        roi,
        tracked: is_tracked,
    }))
}

/// Crop `roi` out of the frame into a NCHW tensor normalized to [0, 1].
///
/// Nearest-neighbour sampling; parts of the region outside the frame stay black.
fn crop_to_input(image: &RgbImage, roi: &Roi) -> Array4<f32> {
    let size = FACE_MESH_INPUT_SIZE;
    let (left, top, step) = (roi.left(), roi.top(), roi.step());
    let (width, height) = (image.width() as f32, image.height() as f32);

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for ty in 0..size {
        let sy = (top + (ty as f32 + 0.5) * step).floor();
        if sy < 0.0 || sy >= height {
            continue;
        }
        for tx in 0..size {
            let sx = (left + (tx as f32 + 0.5) * step).floor();
            if sx < 0.0 || sx >= width {
                continue;
            }
            let pixel = image.get_pixel(sx as u32, sy as u32);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = pixel[c] as f32 / 255.0;
            }
        }
    }

    tensor
}

/// Turn raw model output into a landmark set, or `None` below threshold.
fn decode_landmarks(
    raw: &[f32],
    score: Option<f32>,
    threshold: f32,
    roi: &Roi,
    width: u32,
    height: u32,
) -> Option<LandmarkSet> {
    // Face presence is emitted as a logit.
    if let Some(logit) = score {
        let presence = 1.0 / (1.0 + (-logit).exp());
        if presence < threshold {
            tracing::trace!(presence, threshold, "face presence below threshold");
            return None;
        }
    }

    let count = raw.len() / 3;
    if count < FACE_MESH_POINTS {
        tracing::debug!(count, "face mesh output too short");
        return None;
    }

    let depth_scale = roi.step() / width as f32;
    let points = raw
        .chunks_exact(3)
        .map(|p| {
            let (x, y) = roi.to_frame_normalized(p[0], p[1], width, height);
            LandmarkPoint {
                x,
                y,
                z: Some(p[2] * depth_scale),
            }
        })
        .collect();

    Some(LandmarkSet::new(points))
}

/// Discover the landmark and face-score outputs by name.
///
/// Falls back to positional ordering (landmarks first, score second) when the
/// names are not recognized.
fn discover_output_indices(names: &[String]) -> OutputIndices {
    let find = |needles: &[&str]| -> Option<usize> {
        names.iter().position(|n| {
            let n = n.to_ascii_lowercase();
            needles.iter().any(|needle| n.contains(needle))
        })
    };

    let landmarks = find(&["landmark", "conv2d_21"]);
    let score = find(&["score", "flag", "conv2d_31"]);

    match (landmarks, score) {
        (Some(l), s) => (l, s.filter(|&s| s != l)),
        (None, _) => {
            tracing::info!(?names, "face mesh output names not recognized, using positional mapping");
            (0, (names.len() > 1).then_some(1))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::level_face;
    use image::Rgb;

    fn mesh_output(count: usize, x: f32, y: f32) -> Vec<f32> {
        (0..count).flat_map(|_| [x, y, 0.0]).collect()
    }

    /// A 192 px region centered on a 640×480 frame: one input pixel per frame pixel.
    fn centered_roi() -> Roi {
        Roi {
            cx: 320.0,
            cy: 240.0,
            size: 192.0,
        }
    }

    #[test]
    fn test_roi_from_detected_box() {
        let face = FaceBox {
            x: 280.0,
            y: 120.0,
            width: 160.0,
            height: 120.0,
            score: 0.9,
        };
        let roi = Roi::from_box(&face);
        assert_eq!(roi, Roi { cx: 360.0, cy: 180.0, size: 240.0 });
    }

    #[test]
    fn test_roi_from_landmarks_spans_the_face() {
        // Level face: x spans 0.3..0.7, y spans 0.45..0.8 of a 640×480 frame.
        let roi = Roi::from_landmarks(&level_face(), 640, 480).unwrap();
        assert!((roi.cx - 320.0).abs() < 1e-3);
        assert!((roi.cy - 300.0).abs() < 1e-3);
        assert!((roi.size - 256.0 * ROI_SCALE).abs() < 1e-3);

        assert!(Roi::from_landmarks(&LandmarkSet::default(), 640, 480).is_none());
    }

    #[test]
    fn test_decode_maps_points_through_roi() {
        let roi = centered_roi();
        let mut raw = mesh_output(FACE_MESH_POINTS, 96.0, 96.0);
        raw[0] = 0.0;
        raw[1] = 0.0;
        let set = decode_landmarks(&raw, None, 0.6, &roi, 640, 480).unwrap();

        let corner = set.get(0).unwrap();
        assert!((corner.x - 224.0 / 640.0).abs() < 1e-5, "x = {}", corner.x);
        assert!((corner.y - 144.0 / 480.0).abs() < 1e-5, "y = {}", corner.y);
        let center = set.get(1).unwrap();
        assert!((center.x - 0.5).abs() < 1e-5 && (center.y - 0.5).abs() < 1e-5);
    }

    #[test]
    fn test_decode_scales_with_roi_size() {
        // Twice the region: input pixels cover two frame pixels.
        let roi = Roi { size: 384.0, ..centered_roi() };
        let raw = mesh_output(FACE_MESH_POINTS, 0.0, 0.0);
        let set = decode_landmarks(&raw, None, 0.6, &roi, 640, 480).unwrap();
        let corner = set.get(0).unwrap();
        assert!((corner.x - 128.0 / 640.0).abs() < 1e-5);
        assert!((corner.y - 48.0 / 480.0).abs() < 1e-5);
    }

    #[test]
    fn test_decode_below_threshold_is_no_face() {
        let raw = mesh_output(FACE_MESH_POINTS, 96.0, 96.0);
        // logit -2 → presence ≈ 0.12
        assert!(decode_landmarks(&raw, Some(-2.0), 0.6, &centered_roi(), 640, 480).is_none());
    }

    #[test]
    fn test_decode_above_threshold() {
        let raw = mesh_output(FACE_MESH_POINTS, 96.0, 96.0);
        // logit 3 → presence ≈ 0.95
        let set = decode_landmarks(&raw, Some(3.0), 0.6, &centered_roi(), 640, 480).unwrap();
        assert_eq!(set.len(), FACE_MESH_POINTS);
    }

    #[test]
    fn test_decode_refined_mesh_keeps_iris_points() {
        let raw = mesh_output(478, 10.0, 30.0);
        let set = decode_landmarks(&raw, None, 0.6, &centered_roi(), 640, 480).unwrap();
        assert_eq!(set.len(), 478);
    }

    #[test]
    fn test_decode_short_output_is_no_face() {
        let raw = mesh_output(100, 96.0, 96.0);
        assert!(decode_landmarks(&raw, None, 0.6, &centered_roi(), 640, 480).is_none());
    }

    fn split_image() -> RgbImage {
        // Left half red, right half blue.
        RgbImage::from_fn(64, 48, |x, _| if x < 32 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) })
    }

    #[test]
    fn test_crop_samples_the_region() {
        let roi = Roi { cx: 32.0, cy: 24.0, size: 48.0 };
        let tensor = crop_to_input(&split_image(), &roi);
        assert_eq!(tensor.shape(), &[1, 3, FACE_MESH_INPUT_SIZE, FACE_MESH_INPUT_SIZE]);
        assert_eq!(tensor[[0, 0, 0, 0]], 1.0);
        assert_eq!(tensor[[0, 2, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 0, 0, 191]], 0.0);
        assert_eq!(tensor[[0, 2, 0, 191]], 1.0);
    }

    #[test]
    fn test_crop_outside_frame_is_black() {
        // Region centered on the top-left corner.
        let roi = Roi { cx: 0.0, cy: 0.0, size: 48.0 };
        let tensor = crop_to_input(&split_image(), &roi);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        assert_eq!(tensor[[0, 0, 191, 0]], 0.0);
        assert_eq!(tensor[[0, 0, 191, 191]], 1.0);
    }

    #[test]
    fn test_discover_outputs_by_name() {
        let names: Vec<String> = ["conv2d_31", "conv2d_21"].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_output_indices(&names), (1, Some(0)));

        let names: Vec<String> = ["output_landmarks", "output_score"].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_output_indices(&names), (0, Some(1)));
    }

    #[test]
    fn test_discover_outputs_positional_fallback() {
        let names: Vec<String> = ["617", "618"].iter().map(|s| s.to_string()).collect();
        assert_eq!(discover_output_indices(&names), (0, Some(1)));

        let names = vec!["617".to_string()];
        assert_eq!(discover_output_indices(&names), (0, None));
    }

    #[test]
    fn test_load_missing_models() {
        let result = FaceMeshProvider::load(
            Path::new("/nonexistent/face_detection_short_range.onnx"),
            Path::new("/nonexistent/face_landmark.onnx"),
            ProviderOptions::default(),
        );
        assert!(matches!(result, Err(ProviderError::ModelNotFound(_))));
    }
}
