//! facewatch-hw — V4L2 camera capture as an RGB frame source.
//!
//! Implements the core crate's `CameraProvider`/`FrameSource` seam for
//! `/dev/video*` devices, converting YUYV, MJPG, RGB3 and GREY buffers to RGB.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, V4l2Cameras};
pub use frame::ConversionError;
