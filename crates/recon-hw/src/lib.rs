//! recon-hw: Hardware abstraction for color camera capture.
//!
//! Provides V4L2-based camera access and conversion of YUYV, MJPEG and RGB3
//! buffers into the RGB frames the recognition core consumes.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureConfig, DeviceInfo, FrameSource};
pub use frame::PixelFormat;
