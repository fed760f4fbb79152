//! Device session: format negotiation and streaming state

use std::path::Path;
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::device::{CaptureDevice, FormatRequest, Readiness};
use super::frame::{fourcc_str, FrameInterval, NegotiatedFormat, PixelFormat};
use super::pool::BufferPool;
use super::v4l2::V4l2Device;
use crate::error::{CaptureError, FormatError, Result};

/// Lifecycle of a [`DeviceSession`]
///
/// `Closed → Opened → Configured → Streaming → Configured → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Opened,
    Configured,
    Streaming,
}

/// Owns the device handle and what was negotiated with it
pub struct DeviceSession<D> {
    device: Option<D>,
    state: SessionState,
    format: Option<NegotiatedFormat>,
    interval: Option<FrameInterval>,
}

impl DeviceSession<V4l2Device> {
    /// Open a V4L2 capture node
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let device = V4l2Device::open(path).map_err(|source| CaptureError::DeviceOpen {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_device(device))
    }
}

impl<D: CaptureDevice> DeviceSession<D> {
    /// Wrap an already opened device
    pub fn from_device(device: D) -> Self {
        Self {
            device: Some(device),
            state: SessionState::Opened,
            format: None,
            interval: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_streaming(&self) -> bool {
        self.state == SessionState::Streaming
    }

    /// Format the device accepted, once configured
    pub fn format(&self) -> Option<&NegotiatedFormat> {
        self.format.as_ref()
    }

    pub fn frame_interval(&self) -> Option<FrameInterval> {
        self.interval
    }

    /// Borrow the device if the session is in one of `allowed`
    pub(crate) fn device_for(
        &mut self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<&mut D> {
        let state = self.state;
        match self.device.as_mut() {
            Some(device) if allowed.contains(&state) => Ok(device),
            _ => Err(CaptureError::InvalidState { operation, state }),
        }
    }

    /// Request a capture format and store what the device accepted.
    ///
    /// The device may substitute a size or pixel format it supports. Size
    /// changes are accepted; a pixel format change is an error unless
    /// `allow_fallback` is set.
    #[instrument(skip(self))]
    pub fn configure(
        &mut self,
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        allow_fallback: bool,
    ) -> Result<&NegotiatedFormat> {
        if width == 0 || height == 0 {
            return Err(FormatError::InvalidSize { width, height }.into());
        }

        let request = FormatRequest {
            width,
            height,
            pixel_format,
        };
        let device = self.device_for(
            "configure format",
            &[SessionState::Opened, SessionState::Configured],
        )?;
        let accepted = device
            .set_format(&request)
            .map_err(FormatError::Rejected)?;

        if accepted.fourcc != pixel_format.fourcc() {
            if !allow_fallback {
                return Err(FormatError::PixelFormatMismatch {
                    requested: pixel_format.to_string(),
                    actual: fourcc_str(accepted.fourcc),
                }
                .into());
            }
            warn!(
                "Device substituted pixel format {} for {}",
                fourcc_str(accepted.fourcc),
                pixel_format
            );
        }
        if accepted.width != width || accepted.height != height {
            info!(
                "Device adjusted size {}x{} -> {}x{}",
                width, height, accepted.width, accepted.height
            );
        }

        self.state = SessionState::Configured;
        Ok(self.format.insert(accepted))
    }

    /// Request a frame interval.
    ///
    /// Failure leaves the device on its default rate; callers are expected
    /// to log it and carry on.
    #[instrument(skip(self))]
    pub fn set_frame_interval(&mut self, interval: FrameInterval) -> Result<FrameInterval> {
        if !interval.is_valid() {
            return Err(CaptureError::FrameRate(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid frame interval {}/{}", interval.numerator, interval.denominator),
            )));
        }
        let device = self.device_for(
            "set frame interval",
            &[SessionState::Opened, SessionState::Configured],
        )?;
        let accepted = device
            .set_frame_interval(interval)
            .map_err(CaptureError::FrameRate)?;
        self.interval = Some(accepted);
        Ok(accepted)
    }

    /// Re-read the interval the device is currently using
    pub fn refresh_frame_interval(&mut self) -> Result<FrameInterval> {
        let device = self.device_for(
            "read frame interval",
            &[SessionState::Opened, SessionState::Configured],
        )?;
        let current = device.frame_interval().map_err(CaptureError::FrameRate)?;
        self.interval = Some(current);
        Ok(current)
    }

    /// Log the negotiated setup as read back from the device
    pub fn log_setup(&self) {
        let Some(device) = self.device.as_ref() else {
            return;
        };
        match device.format() {
            Ok(format) => info!(
                width = format.width,
                height = format.height,
                pixel_format = %fourcc_str(format.fourcc),
                field = %format.field,
                "Format"
            ),
            Err(e) => warn!("Failed to read format: {}", e),
        }
        match device.frame_interval() {
            Ok(interval) => info!("FPS: {}", interval),
            Err(e) => warn!("Failed to read streaming parameters: {}", e),
        }
    }

    /// Start capture. Every pool buffer must already be queued.
    pub fn start_streaming(&mut self, pool: &BufferPool<D::Region>) -> Result<()> {
        if pool.is_empty() || !pool.all_driver_owned() {
            return Err(CaptureError::StreamControl {
                action: "start",
                reason: "not every buffer is queued with the driver".into(),
                source: None,
            });
        }
        let device = self.device_for("start streaming", &[SessionState::Configured])?;
        device
            .stream_on()
            .map_err(|source| CaptureError::StreamControl {
                action: "start",
                reason: source.to_string(),
                source: Some(source),
            })?;
        self.state = SessionState::Streaming;
        info!("Capture stream started with {} buffers", pool.len());
        Ok(())
    }

    /// Stop capture; a no-op unless streaming.
    ///
    /// The driver drops its queue on stream-off, so every queued buffer goes
    /// back to the application.
    pub fn stop_streaming(&mut self, pool: &mut BufferPool<D::Region>) -> Result<bool> {
        if self.state != SessionState::Streaming {
            return Ok(false);
        }
        let result = match self.device.as_mut() {
            Some(device) => device.stream_off(),
            None => Ok(()),
        };
        self.state = SessionState::Configured;
        pool.reclaim_all();

        result.map_err(|source| CaptureError::StreamControl {
            action: "stop",
            reason: source.to_string(),
            source: Some(source),
        })?;
        info!("Capture stream stopped");
        Ok(true)
    }

    /// Bounded wait for the next filled buffer
    pub fn wait_ready(&mut self, timeout: Duration) -> Result<Readiness> {
        let device = self.device_for("wait for a frame", &[SessionState::Streaming])?;
        device.wait_ready(timeout).map_err(CaptureError::ReadinessWait)
    }

    /// Release the device handle. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.device.take().is_some() {
            info!("Capture device closed");
        }
        self.state = SessionState::Closed;
        self.format = None;
        self.interval = None;
    }
}
