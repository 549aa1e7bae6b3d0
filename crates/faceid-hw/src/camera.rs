//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::{SourceError, SourceOpener, VideoSource};
use std::path::Path;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const CAPTURE_WIDTH: u32 = 640;
const CAPTURE_HEIGHT: u32 = 480;

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale.
    Grey,
}

/// V4L2 camera device handle. Dropping the device closes it.
pub struct Camera {
    device: Option<Device>,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str) -> Result<Self, SourceError> {
        if !Path::new(device_path).exists() {
            return Err(SourceError::Unavailable(format!("device not found: {device_path}")));
        }

        let device = Device::with_path(device_path)
            .map_err(|e| SourceError::Unavailable(format!("{device_path}: {e}")))?;

        let caps = device
            .query_caps()
            .map_err(|e| SourceError::Unavailable(format!("failed to query capabilities: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(SourceError::Unavailable(format!(
                "{device_path}: video capture not supported"
            )));
        }

        let mut fmt = device
            .format()
            .map_err(|e| SourceError::Unavailable(format!("failed to get format: {e}")))?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = CAPTURE_WIDTH;
        fmt.height = CAPTURE_HEIGHT;

        let negotiated = device
            .set_format(&fmt)
            .map_err(|e| SourceError::Unavailable(format!("failed to set format: {e}")))?;

        let pixel_format = if negotiated.fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if negotiated.fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else {
            return Err(SourceError::Unavailable(format!(
                "unsupported pixel format: {:?} (need YUYV or GREY)",
                negotiated.fourcc
            )));
        };

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device: Some(device),
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    fn to_grayscale(&self, buf: &[u8]) -> Result<Vec<u8>, SourceError> {
        let pixels = (self.width * self.height) as usize;
        match self.pixel_format {
            PixelFormat::Grey => {
                if buf.len() < pixels {
                    return Err(SourceError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    )));
                }
                Ok(buf[..pixels].to_vec())
            }
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, self.width, self.height)
                .map_err(|e| SourceError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        }
    }
}

impl VideoSource for Camera {
    fn current_frame(&mut self) -> Result<Frame, SourceError> {
        let device = self.device.as_ref().ok_or(SourceError::Released)?;
        let mut stream = MmapStream::with_buffers(device, BufType::VideoCapture, 4)
            .map_err(|e| SourceError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        let (buf, meta) = stream
            .next()
            .map_err(|e| SourceError::CaptureFailed(format!("failed to dequeue buffer: {e}")))?;

        let gray = self.to_grayscale(buf)?;
        Ok(Frame::from_gray(gray, self.width, self.height, meta.sequence))
    }

    fn release(&mut self) {
        if self.device.take().is_some() {
            tracing::info!(device = %self.device_path, "camera released");
        }
    }

    fn describe(&self) -> String {
        format!("v4l2:{}", self.device_path)
    }
}

/// Opens the configured V4L2 device per session.
pub struct CameraOpener {
    pub device_path: String,
}

impl SourceOpener for CameraOpener {
    fn open(&self) -> Result<Box<dyn VideoSource>, SourceError> {
        Ok(Box::new(Camera::open(&self.device_path)?))
    }
}
