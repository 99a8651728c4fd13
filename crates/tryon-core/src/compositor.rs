//! Pixel surface the render loop paints: video underneath, overlay on top.

use crate::types::{OverlayTransform, VideoFrame};
use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};

/// The canvas. Every paint starts from a full video draw, so nothing from a
/// previous frame survives into the next one.
pub struct Canvas {
    pixels: RgbaImage,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            pixels: RgbaImage::new(width, height),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Reset every pixel to transparent black.
    pub fn clear(&mut self) {
        for p in self.pixels.pixels_mut() {
            *p = Rgba([0, 0, 0, 0]);
        }
    }

    /// Draw a video frame stretched to fill the canvas.
    pub fn draw_video(&mut self, frame: &VideoFrame) {
        let (w, h) = self.pixels.dimensions();
        let scaled;
        let source = if frame.image.dimensions() == (w, h) {
            frame.image.as_ref()
        } else {
            scaled = imageops::resize(frame.image.as_ref(), w, h, FilterType::Triangle);
            &scaled
        };

        for (dst, src) in self.pixels.pixels_mut().zip(source.pixels()) {
            *dst = Rgba([src[0], src[1], src[2], 255]);
        }
    }

    /// Draw `overlay` centered on the anchor, rotated, scaled to the
    /// transform's width and height, and alpha-blended over the canvas.
    ///
    /// Each canvas pixel is mapped back into overlay space through the
    /// inverse of translate(anchor)·rotate(θ), then bilinear-sampled.
    pub fn draw_overlay(&mut self, overlay: &RgbaImage, transform: &OverlayTransform) {
        let (ow, oh) = overlay.dimensions();
        if ow == 0 || oh == 0 || transform.width <= 0.0 || transform.height <= 0.0 {
            return;
        }

        let half_w = transform.width / 2.0;
        let half_h = transform.height / 2.0;
        let (sin, cos) = transform.rotation_radians.sin_cos();

        // Bounding circle of the rotated box limits the pixels visited.
        let radius = (half_w * half_w + half_h * half_h).sqrt();
        let (cw, ch) = self.pixels.dimensions();
        let x0 = (transform.anchor_x - radius).floor().max(0.0) as u32;
        let y0 = (transform.anchor_y - radius).floor().max(0.0) as u32;
        let x1 = ((transform.anchor_x + radius).ceil().max(0.0) as u32).min(cw);
        let y1 = ((transform.anchor_y + radius).ceil().max(0.0) as u32).min(ch);

        let scale_x = ow as f32 / transform.width;
        let scale_y = oh as f32 / transform.height;

        for py in y0..y1 {
            for px in x0..x1 {
                let dx = px as f32 + 0.5 - transform.anchor_x;
                let dy = py as f32 + 0.5 - transform.anchor_y;

                // Undo the rotation.
                let lx = cos * dx + sin * dy;
                let ly = -sin * dx + cos * dy;
                if lx.abs() > half_w || ly.abs() > half_h {
                    continue;
                }

                let u = (lx + half_w) * scale_x - 0.5;
                let v = (ly + half_h) * scale_y - 0.5;
                let src = sample_bilinear(overlay, u, v);

                let dst = self.pixels.get_pixel_mut(px, py);
                blend(dst, src);
            }
        }
    }
}

fn sample_bilinear(image: &RgbaImage, u: f32, v: f32) -> [f32; 4] {
    let (w, h) = image.dimensions();
    let max_x = (w - 1) as f32;
    let max_y = (h - 1) as f32;
    let u = u.clamp(0.0, max_x);
    let v = v.clamp(0.0, max_y);

    let x0 = u.floor() as u32;
    let y0 = v.floor() as u32;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = u - x0 as f32;
    let fy = v - y0 as f32;

    let tl = image.get_pixel(x0, y0);
    let tr = image.get_pixel(x1, y0);
    let bl = image.get_pixel(x0, y1);
    let br = image.get_pixel(x1, y1);

    std::array::from_fn(|c| {
        tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + tr[c] as f32 * fx * (1.0 - fy)
            + bl[c] as f32 * (1.0 - fx) * fy
            + br[c] as f32 * fx * fy
    })
}

fn blend(dst: &mut Rgba<u8>, src: [f32; 4]) {
    let alpha = (src[3] / 255.0).clamp(0.0, 1.0);
    if alpha <= 0.0 {
        return;
    }
    for c in 0..3 {
        let value = src[c] * alpha + dst[c] as f32 * (1.0 - alpha);
        dst[c] = value.round().clamp(0.0, 255.0) as u8;
    }
    let out_alpha = alpha * 255.0 + dst[3] as f32 * (1.0 - alpha);
    dst[3] = out_alpha.round().clamp(0.0, 255.0) as u8;
}
