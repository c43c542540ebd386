//! clinic-hw — Webcam capture for the check-in kiosk.
//!
//! V4L2 capture with MJPG/YUYV/GREY negotiation, converted to RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat};
pub use frame::Frame;
