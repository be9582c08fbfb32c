//! V4L2 camera capture via the `v4l` crate.
//!
//! The device is owned by a dedicated capture thread that keeps streaming and
//! hands frames over through a one-slot mailbox, so readers never wait on the
//! driver.

use crate::frame::{self, Frame};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const REQUESTED_WIDTH: u32 = 640;
const REQUESTED_HEIGHT: u32 = 480;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("no frame available yet")]
    NoFrame,
    #[error("camera closed")]
    Closed,
}

/// Anything that yields frames on demand.
///
/// `Err(CameraError::NoFrame)` means "try again later"; callers skip the poll.
pub trait FrameSource {
    fn read_frame(&mut self) -> Result<Frame, CameraError>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        (**self).read_frame()
    }
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// Packed 24-bit RGB.
    Rgb3,
    /// Motion JPEG, one JPEG image per buffer.
    Mjpeg,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"RGB3") {
            Some(Self::Rgb3)
        } else if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpeg)
        } else {
            None
        }
    }
}

/// Convert one raw driver buffer to RGB.
fn buf_to_rgb(format: PixelFormat, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
    match format {
        PixelFormat::Rgb3 => {
            let expected = (width * height * 3) as usize;
            if buf.len() < expected {
                return Err(CameraError::CaptureFailed(format!(
                    "RGB3 buffer too short: expected {expected}, got {}",
                    buf.len()
                )));
            }
            Ok(buf[..expected].to_vec())
        }
        PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        PixelFormat::Mjpeg => {
            let img = frame::mjpeg_to_rgb(buf).map_err(|e| CameraError::CaptureFailed(e.to_string()))?;
            if img.dimensions() != (width, height) {
                return Err(CameraError::CaptureFailed(format!(
                    "MJPG frame is {:?}, negotiated {width}x{height}",
                    img.dimensions()
                )));
            }
            Ok(img.into_raw())
        }
    }
}

/// V4L2 camera streaming on a background thread.
pub struct Camera {
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub pixel_format: PixelFormat,
    frames: Receiver<Frame>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Camera {
    /// Open a V4L2 camera (e.g. "/dev/video0") and start streaming.
    pub fn open(device_path: &str) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.to_string().contains("busy") || e.to_string().contains("EBUSY") {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::info!(device = device_path, driver = %caps.driver, card = %caps.card, "opened camera");

        let mut fmt = device
            .format()
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = REQUESTED_WIDTH;
        fmt.height = REQUESTED_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| CameraError::FormatNegotiationFailed(format!("failed to set format: {e}")))?;

        let pixel_format = PixelFormat::from_fourcc(negotiated.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {:?} (need YUYV, RGB3, or MJPG)",
                negotiated.fourcc
            ))
        })?;

        tracing::info!(
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?negotiated.fourcc,
            "negotiated format"
        );

        let (width, height) = (negotiated.width, negotiated.height);
        // Frames arriving while an unread frame is waiting are dropped.
        let (tx, rx) = mpsc::sync_channel::<Frame>(1);
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let running = Arc::clone(&running);
            let path = device_path.to_string();
            std::thread::Builder::new()
                .name("muster-capture".into())
                .spawn(move || capture_loop(device, pixel_format, width, height, tx, running, path))
                .map_err(|e| CameraError::CaptureFailed(format!("failed to spawn capture thread: {e}")))?
        };

        Ok(Self {
            width,
            height,
            device_path: device_path.to_string(),
            pixel_format,
            frames: rx,
            running,
            worker: Some(worker),
        })
    }

    /// Stop streaming and release the device.
    pub fn release(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::warn!(device = %self.device_path, "capture thread panicked");
            }
            tracing::info!(device = %self.device_path, "camera released");
        }
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();

        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
                bus: caps.bus.clone(),
            });
        }

        devices
    }
}

impl FrameSource for Camera {
    fn read_frame(&mut self) -> Result<Frame, CameraError> {
        match self.frames.try_recv() {
            Ok(frame) => Ok(frame),
            Err(TryRecvError::Empty) => Err(CameraError::NoFrame),
            Err(TryRecvError::Disconnected) => Err(CameraError::Closed),
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.release();
    }
}

fn capture_loop(
    device: Device,
    pixel_format: PixelFormat,
    width: u32,
    height: u32,
    tx: SyncSender<Frame>,
    running: Arc<AtomicBool>,
    path: String,
) {
    let mut stream = match MmapStream::with_buffers(&device, BufType::VideoCapture, 4) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(device = %path, error = %e, "failed to create mmap stream");
            return;
        }
    };

    while running.load(Ordering::SeqCst) {
        let (buf, meta) = match stream.next() {
            Ok(next) => next,
            Err(e) => {
                tracing::warn!(device = %path, error = %e, "failed to dequeue buffer");
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
        };

        let rgb = match buf_to_rgb(pixel_format, buf, width, height) {
            Ok(rgb) => rgb,
            Err(e) => {
                tracing::debug!(seq = meta.sequence, error = %e, "dropping undecodable frame");
                continue;
            }
        };

        let frame = Frame {
            data: rgb,
            width,
            height,
            timestamp: std::time::Instant::now(),
            sequence: meta.sequence,
        };

        match tx.try_send(frame) {
            Ok(()) | Err(mpsc::TrySendError::Full(_)) => {}
            Err(mpsc::TrySendError::Disconnected(_)) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_device() {
        assert!(matches!(
            Camera::open("/dev/video-does-not-exist"),
            Err(CameraError::DeviceNotFound(_))
        ));
    }

    #[test]
    fn test_pixel_format_from_fourcc() {
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"YUYV")), Some(PixelFormat::Yuyv));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"MJPG")), Some(PixelFormat::Mjpeg));
        assert_eq!(PixelFormat::from_fourcc(FourCC::new(b"GREY")), None);
    }

    #[test]
    fn test_rgb3_buffer_too_short() {
        let err = buf_to_rgb(PixelFormat::Rgb3, &[0; 5], 2, 1).unwrap_err();
        assert!(matches!(err, CameraError::CaptureFailed(_)));
    }

    #[test]
    fn test_rgb3_passthrough_truncates_padding() {
        let rgb = buf_to_rgb(PixelFormat::Rgb3, &[1, 2, 3, 4, 5, 6, 9, 9], 2, 1).unwrap();
        assert_eq!(rgb, vec![1, 2, 3, 4, 5, 6]);
    }
}
