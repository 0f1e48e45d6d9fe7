//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, PixelFormat};
use recon_core::Frame;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::{CaptureStream, Stream};
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("no frame within {0:?}")]
    Timeout(Duration),
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
}

/// Where and how to capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Bounded wait for each frame before reporting [`CameraError::Timeout`].
    pub timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".into(),
            width: 1280,
            height: 720,
            timeout: Duration::from_secs(2),
        }
    }
}

/// A producer of RGB frames the acquisition thread can drive and recover.
pub trait FrameSource: Send {
    /// Block for the next frame, at most for the configured timeout.
    fn next_frame(&mut self) -> Result<Frame, CameraError>;
    /// Close and reopen the underlying device after a failure.
    fn reopen(&mut self) -> Result<(), CameraError>;
    /// Renegotiate the capture resolution.
    fn reconfigure(&mut self, width: u32, height: u32) -> Result<(), CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// An open device and its mmap stream.
struct Session {
    // Declared before `_device` so the stream is torn down first.
    stream: MmapStream<'static>,
    _device: Device,
}

/// Open V4L2 device with a running mmap stream.
pub struct Camera {
    config: CaptureConfig,
    /// `None` after a failed restart until the next successful one.
    session: Option<Session>,
    pub width: u32,
    pub height: u32,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open the configured device and negotiate an RGB-convertible format.
    pub fn open(config: &CaptureConfig) -> Result<Self, CameraError> {
        let (session, negotiated, pixel_format) = open_session(config)?;
        Ok(Self {
            config: config.clone(),
            session: Some(session),
            width: negotiated.width,
            height: negotiated.height,
            fourcc: negotiated.fourcc,
            pixel_format,
        })
    }

    pub fn device_path(&self) -> &str {
        &self.config.device
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Capture one frame and convert it to RGB.
    pub fn capture_frame(&mut self) -> Result<Frame, CameraError> {
        let Some(session) = self.session.as_mut() else {
            return Err(CameraError::CaptureFailed("camera is not open".into()));
        };
        let (buf, meta) = session.stream.next().map_err(|e| {
            if e.kind() == std::io::ErrorKind::TimedOut {
                CameraError::Timeout(self.config.timeout)
            } else {
                CameraError::CaptureFailed(format!("failed to dequeue buffer: {e}"))
            }
        })?;

        let used = (meta.bytesused as usize).min(buf.len());
        let used = if used == 0 { buf.len() } else { used };

        frame::decode(self.pixel_format, &buf[..used], self.width, self.height, meta.sequence)
            .map_err(|e| CameraError::CaptureFailed(e.to_string()))
    }

    /// Release the device and its buffers, then open it afresh with `config`.
    fn restart(&mut self, config: &CaptureConfig) -> Result<(), CameraError> {
        let mut negotiated = None;
        replace_session(&mut self.session, || {
            let (session, format, pixel_format) = open_session(config)?;
            negotiated = Some((format, pixel_format));
            Ok(session)
        })?;
        if let Some((format, pixel_format)) = negotiated {
            self.width = format.width;
            self.height = format.height;
            self.fourcc = format.fourcc;
            self.pixel_format = pixel_format;
        }
        self.config = config.clone();
        Ok(())
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

/// Drop the current session before opening its replacement.
///
/// Mapped buffers are only released when the stream is dropped; until then
/// the driver rejects S_FMT and REQBUFS on a new handle with EBUSY.
fn replace_session<S, E>(
    slot: &mut Option<S>,
    open: impl FnOnce() -> Result<S, E>,
) -> Result<(), E> {
    drop(slot.take());
    *slot = Some(open()?);
    Ok(())
}

fn open_session(
    config: &CaptureConfig,
) -> Result<(Session, v4l::Format, PixelFormat), CameraError> {
    let device_path = config.device.as_str();
    if !Path::new(device_path).exists() {
        return Err(CameraError::DeviceNotFound(device_path.to_string()));
    }

    let device = Device::with_path(device_path).map_err(|e| {
        if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
            CameraError::DeviceBusy
        } else {
            CameraError::DeviceNotFound(format!("{device_path}: {e}"))
        }
    })?;

    let caps = device
        .query_caps()
        .map_err(|e| CameraError::CaptureFailed(format!("failed to query capabilities: {e}")))?;

    tracing::info!(
        device = device_path,
        driver = %caps.driver,
        card = %caps.card,
        "opened camera"
    );

    if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
        return Err(CameraError::StreamingNotSupported);
    }

    let (negotiated, pixel_format) = negotiate(&device, config.width, config.height)?;

    tracing::info!(
        width = negotiated.width,
        height = negotiated.height,
        fourcc = ?negotiated.fourcc,
        requested_width = config.width,
        requested_height = config.height,
        "negotiated format"
    );

    let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
        .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
    stream.set_timeout(config.timeout);

    Ok((Session { stream, _device: device }, negotiated, pixel_format))
}

/// Try each preferred pixel format at the requested size; the driver may
/// substitute its own format or adjust the resolution.
fn negotiate(
    device: &Device,
    width: u32,
    height: u32,
) -> Result<(v4l::Format, PixelFormat), CameraError> {
    let mut fmt = device.format().map_err(|e| {
        CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
    })?;

    let mut offered = Vec::new();
    for wanted in PixelFormat::PREFERRED {
        fmt.fourcc = FourCC::new(&wanted.fourcc());
        fmt.width = width;
        fmt.height = height;

        let negotiated = match device.set_format(&fmt) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                tracing::debug!(fourcc = ?fmt.fourcc, error = %e, "format rejected");
                continue;
            }
        };

        if let Some(format) = PixelFormat::from_fourcc(&negotiated.fourcc.repr) {
            return Ok((negotiated, format));
        }
        offered.push(format!("{:?}", negotiated.fourcc));
    }

    Err(CameraError::FormatNegotiationFailed(format!(
        "driver offered only unsupported formats {offered:?} (need YUYV, MJPG or RGB3)"
    )))
}

impl FrameSource for Camera {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        self.capture_frame()
    }

    fn reopen(&mut self) -> Result<(), CameraError> {
        let config = self.config.clone();
        tracing::info!(device = %config.device, "reopening camera");
        self.restart(&config)
    }

    fn reconfigure(&mut self, width: u32, height: u32) -> Result<(), CameraError> {
        let config = CaptureConfig {
            width,
            height,
            ..self.config.clone()
        };
        tracing::info!(width, height, "reconfiguring camera");
        self.restart(&config)
    }
}
