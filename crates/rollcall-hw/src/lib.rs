//! rollcall-hw: V4L2 camera capture for live attendance sessions.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, FrameStream, PixelFormat};
pub use frame::Frame;
