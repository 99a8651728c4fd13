//! tryon-hw: V4L2 camera backend for the try-on engine.
//!
//! Implements the camera capability from `tryon-core` with one capture
//! thread per stream and YUYV/RGB24 to RGB conversion.

pub mod camera;
pub mod frame;

pub use camera::{DeviceInfo, PixelFormat, V4lCameraSource};
pub use frame::FrameError;
