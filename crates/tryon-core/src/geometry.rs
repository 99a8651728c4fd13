//! Overlay geometry: turns one face's landmarks into an anchor, rotation and size.
//!
//! Indices follow the 468-point face mesh topology. Substituting a provider
//! with a different topology silently breaks the geometry, so the indices are
//! fixed here rather than configurable.

use crate::types::{LandmarkPoint, LandmarkSet, OverlayTransform};
use serde::Deserialize;

/// Outer corner of the subject's left eye (image right when mirrored).
pub const LEFT_EYE_OUTER: usize = 33;
/// Outer corner of the subject's right eye.
pub const RIGHT_EYE_OUTER: usize = 263;
/// Chin tip.
pub const CHIN_TIP: usize = 152;
/// Left cheek edge (face silhouette).
pub const LEFT_CHEEK_EDGE: usize = 234;
/// Right cheek edge (face silhouette).
pub const RIGHT_CHEEK_EDGE: usize = 454;

/// Smallest landmark count that covers every index above.
pub const REQUIRED_LANDMARKS: usize = RIGHT_CHEEK_EDGE + 1;

const EYE_DISTANCE_EPSILON: f32 = 1e-3;

/// Empirically tuned ratios for a glasses-frame overlay.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct GeometryParams {
    /// Frame width as a multiple of the outer-eye-corner distance.
    pub eye_width_ratio: f32,
    /// Cap on frame width as a multiple of the cheek-to-cheek width.
    pub face_width_cap: f32,
    /// Frame height as a multiple of the eye-line-to-chin distance.
    pub height_ratio: f32,
    /// Lower bound on width and height, in pixels.
    pub min_extent: f32,
}

impl Default for GeometryParams {
    fn default() -> Self {
        Self {
            eye_width_ratio: 2.2,
            face_width_cap: 1.05,
            height_ratio: 0.55,
            min_extent: 1.0,
        }
    }
}

/// Compute the overlay transform with the default ratios.
///
/// Returns `None` when the set is too short for the required indices or the
/// geometry is degenerate; callers treat that exactly like "no face".
pub fn compute_transform(
    landmarks: &LandmarkSet,
    canvas_width: u32,
    canvas_height: u32,
) -> Option<OverlayTransform> {
    compute_transform_with(landmarks, canvas_width, canvas_height, &GeometryParams::default())
}

/// Compute the overlay transform with explicit ratios.
pub fn compute_transform_with(
    landmarks: &LandmarkSet,
    canvas_width: u32,
    canvas_height: u32,
    params: &GeometryParams,
) -> Option<OverlayTransform> {
    let w = canvas_width as f32;
    let h = canvas_height as f32;

    let px = |index: usize| -> Option<(f32, f32)> {
        let point: &LandmarkPoint = landmarks.get(index)?;
        let (x, y) = point.to_pixels(w, h);
        (x.is_finite() && y.is_finite()).then_some((x, y))
    };

    let left_eye = px(LEFT_EYE_OUTER)?;
    let right_eye = px(RIGHT_EYE_OUTER)?;
    let chin = px(CHIN_TIP)?;
    let left_cheek = px(LEFT_CHEEK_EDGE)?;
    let right_cheek = px(RIGHT_CHEEK_EDGE)?;

    let anchor_x = (left_eye.0 + right_eye.0) / 2.0;
    let anchor_y = (left_eye.1 + right_eye.1) / 2.0;

    let dx = right_eye.0 - left_eye.0;
    let dy = right_eye.1 - left_eye.1;
    let eye_distance = (dx * dx + dy * dy).sqrt();
    if eye_distance < EYE_DISTANCE_EPSILON {
        tracing::trace!(eye_distance, "degenerate eye geometry, skipping overlay");
        return None;
    }

    let rotation_radians = dy.atan2(dx);

    let face_height = (chin.1 - anchor_y).abs();
    let face_width = (right_cheek.0 - left_cheek.0).abs();

    let width = (eye_distance * params.eye_width_ratio).min(face_width * params.face_width_cap);
    let height = face_height * params.height_ratio;

    Some(OverlayTransform {
        anchor_x,
        anchor_y,
        rotation_radians,
        width: width.max(params.min_extent),
        height: height.max(params.min_extent),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(
        left_eye: (f32, f32),
        right_eye: (f32, f32),
        chin: (f32, f32),
        left_cheek: (f32, f32),
        right_cheek: (f32, f32),
    ) -> LandmarkSet {
        let mut points = vec![LandmarkPoint::new(0.5, 0.5); 468];
        points[LEFT_EYE_OUTER] = LandmarkPoint::new(left_eye.0, left_eye.1);
        points[RIGHT_EYE_OUTER] = LandmarkPoint::new(right_eye.0, right_eye.1);
        points[CHIN_TIP] = LandmarkPoint::new(chin.0, chin.1);
        points[LEFT_CHEEK_EDGE] = LandmarkPoint::new(left_cheek.0, left_cheek.1);
        points[RIGHT_CHEEK_EDGE] = LandmarkPoint::new(right_cheek.0, right_cheek.1);
        LandmarkSet::new(points)
    }

    fn level_face() -> LandmarkSet {
        face((0.40, 0.45), (0.60, 0.45), (0.50, 0.85), (0.30, 0.50), (0.70, 0.50))
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-3
    }

    #[test]
    fn test_level_face_on_640x480() {
        let t = compute_transform(&level_face(), 640, 480).unwrap();

        assert!(close(t.anchor_x, 320.0), "anchor_x = {}", t.anchor_x);
        assert!(close(t.anchor_y, 216.0), "anchor_y = {}", t.anchor_y);
        assert!(t.rotation_radians.abs() < 1e-6, "rotation = {}", t.rotation_radians);
        // eye distance 128 * 2.2 = 281.6, capped by cheeks 256 * 1.05 = 268.8
        assert!(close(t.width, 268.8), "width = {}", t.width);
        // eye line to chin 192 * 0.55
        assert!(close(t.height, 105.6), "height = {}", t.height);
    }

    #[test]
    fn test_eye_distance_wins_when_cheeks_are_wide() {
        let set = face((0.45, 0.45), (0.55, 0.45), (0.50, 0.85), (0.20, 0.50), (0.80, 0.50));
        let t = compute_transform(&set, 640, 480).unwrap();
        // 64 * 2.2 = 140.8 < 384 * 1.05
        assert!(close(t.width, 140.8), "width = {}", t.width);
    }

    #[test]
    fn test_tilted_head_rotation() {
        // Right eye 64px lower than the left over a 64px run: 45 degrees.
        let set = face((0.45, 0.40), (0.55, 0.5333333), (0.50, 0.90), (0.30, 0.50), (0.70, 0.50));
        let t = compute_transform(&set, 640, 480).unwrap();
        assert!(
            (t.rotation_radians - std::f32::consts::FRAC_PI_4).abs() < 1e-3,
            "rotation = {}",
            t.rotation_radians
        );
    }

    #[test]
    fn test_deterministic() {
        let set = face((0.41, 0.44), (0.61, 0.47), (0.52, 0.86), (0.29, 0.51), (0.71, 0.49));
        let a = compute_transform(&set, 1280, 720).unwrap();
        let b = compute_transform(&set, 1280, 720).unwrap();
        assert_eq!(a.anchor_x.to_bits(), b.anchor_x.to_bits());
        assert_eq!(a.anchor_y.to_bits(), b.anchor_y.to_bits());
        assert_eq!(a.rotation_radians.to_bits(), b.rotation_radians.to_bits());
        assert_eq!(a.width.to_bits(), b.width.to_bits());
        assert_eq!(a.height.to_bits(), b.height.to_bits());
    }

    #[test]
    fn test_short_landmark_set_yields_none() {
        let set = LandmarkSet::new(vec![LandmarkPoint::new(0.5, 0.5); REQUIRED_LANDMARKS - 1]);
        assert!(compute_transform(&set, 640, 480).is_none());
        assert!(compute_transform(&LandmarkSet::default(), 640, 480).is_none());
    }

    #[test]
    fn test_coincident_points_yield_none() {
        let set = LandmarkSet::new(vec![LandmarkPoint::new(0.5, 0.5); 468]);
        assert!(compute_transform(&set, 640, 480).is_none());
    }

    #[test]
    fn test_non_finite_landmark_yields_none() {
        let set = face((f32::NAN, 0.45), (0.60, 0.45), (0.50, 0.85), (0.30, 0.50), (0.70, 0.50));
        assert!(compute_transform(&set, 640, 480).is_none());
    }

    #[test]
    fn test_flat_face_is_clamped_to_min_extent() {
        // Chin on the eye line and cheeks coincident: width and height collapse.
        let set = face((0.40, 0.45), (0.60, 0.45), (0.50, 0.45), (0.50, 0.50), (0.50, 0.50));
        let t = compute_transform(&set, 640, 480).unwrap();
        assert_eq!(t.width, 1.0);
        assert_eq!(t.height, 1.0);
    }

    #[test]
    fn test_custom_params() {
        let params = GeometryParams {
            eye_width_ratio: 1.0,
            face_width_cap: 10.0,
            height_ratio: 1.0,
            min_extent: 1.0,
        };
        let t = compute_transform_with(&level_face(), 640, 480, &params).unwrap();
        assert!(close(t.width, 128.0), "width = {}", t.width);
        assert!(close(t.height, 192.0), "height = {}", t.height);
    }
}
