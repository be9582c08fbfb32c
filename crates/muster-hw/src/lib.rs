//! muster-hw: Camera capture and RGB frame handling.
//!
//! Provides V4L2-based streaming capture behind the [`FrameSource`] trait and
//! the pixel-format conversions it needs.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameSource, PixelFormat};
pub use frame::{Frame, FrameError};
