//! Owns a session and its buffer pool and tears both down on every exit path

use tracing::{info, instrument, warn};

use super::device::CaptureDevice;
use super::pool::BufferPool;
use super::session::DeviceSession;
use super::sink::FrameSink;
use super::stream::{CaptureLoop, CaptureStats};
use super::v4l2::V4l2Device;
use crate::error::{CaptureError, Result};
use crate::CaptureConfig;

/// A configured capture device with its mapped buffers.
///
/// Dropping it runs [`Capture::shutdown`], so an early return anywhere
/// during setup or capture still stops the stream, unmaps the buffers and
/// closes the device.
pub struct Capture<D: CaptureDevice> {
    // Declared first so the mappings go before the device handle.
    pool: Option<BufferPool<D::Region>>,
    session: DeviceSession<D>,
}

impl Capture<V4l2Device> {
    /// Open the configured device and prepare it for streaming
    pub fn open(settings: &CaptureConfig) -> Result<Self> {
        info!("Initializing V4L2 capture: {}", settings.device.display());
        let session = DeviceSession::open(&settings.device)?;
        Self::prepare(session, settings)
    }
}

impl<D: CaptureDevice> Capture<D> {
    /// Negotiate format and rate, then request, map and queue the buffers
    #[instrument(skip_all)]
    pub fn prepare(session: DeviceSession<D>, settings: &CaptureConfig) -> Result<Self> {
        let mut capture = Self {
            pool: None,
            session,
        };

        let format = capture.session.configure(
            settings.width,
            settings.height,
            settings.format,
            settings.allow_format_fallback,
        )?;
        info!("Negotiated format: {}", format);

        match capture.session.set_frame_interval(settings.frame_interval) {
            Ok(interval) => info!("Negotiated frame interval: {}", interval),
            Err(e) => {
                warn!("{}; continuing with the device default", e);
                if let Err(e) = capture.session.refresh_frame_interval() {
                    warn!("Failed to read the default frame interval: {}", e);
                }
            }
        }

        let pool = BufferPool::request(&mut capture.session, settings.buffer_count)?;
        let pool = capture.pool.insert(pool);
        pool.map_all(&mut capture.session)?;
        pool.enqueue_all(&mut capture.session)?;

        Ok(capture)
    }

    pub fn session(&self) -> &DeviceSession<D> {
        &self.session
    }

    pub fn pool(&self) -> Option<&BufferPool<D::Region>> {
        self.pool.as_ref()
    }

    /// Start streaming; every buffer is already queued
    pub fn start(&mut self) -> Result<()> {
        let pool = self.pool.as_ref().ok_or(CaptureError::InvalidState {
            operation: "start streaming without buffers",
            state: self.session.state(),
        })?;
        self.session.start_streaming(pool)
    }

    /// Run the capture loop against this device
    pub fn run<S: FrameSink>(&mut self, capture_loop: &CaptureLoop, sink: S) -> Result<CaptureStats> {
        let pool = self.pool.as_mut().ok_or(CaptureError::InvalidState {
            operation: "capture without buffers",
            state: self.session.state(),
        })?;
        capture_loop.run(&mut self.session, pool, sink)
    }

    /// Stop streaming, unmap and free the buffers, close the device.
    ///
    /// Every step checks whether it applies, so this is safe after a partial
    /// setup and safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            if let Err(e) = self.session.stop_streaming(pool) {
                warn!("{}", e);
            }
            pool.release(&mut self.session);
        }
        self.pool = None;
        self.session.close();
    }
}

impl<D: CaptureDevice> Drop for Capture<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
