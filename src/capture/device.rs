//! Control surface of a capture device
//!
//! [`CaptureDevice`] is the seam between the capture core and the kernel
//! driver. The session, buffer pool and capture loop only talk to the device
//! through it, which keeps the ownership bookkeeping independent of V4L2.

use std::io;
use std::ops::Deref;
use std::time::Duration;

use super::frame::{FrameInterval, NegotiatedFormat, PixelFormat};

/// A capture format request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatRequest {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// Where a driver buffer lives and how big it is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    pub index: u32,
    pub length: usize,
    pub offset: u32,
}

/// A buffer handed back by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DequeuedBuffer {
    pub index: u32,
    pub bytes_used: usize,
    pub sequence: u32,
    pub timestamp: Duration,
}

/// Outcome of a bounded readiness wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A filled buffer can be dequeued without blocking
    Ready,
    /// Nothing arrived before the timeout
    TimedOut,
    /// A signal interrupted the wait
    Interrupted,
}

pub trait CaptureDevice {
    /// A mapping of driver memory; unmapped when dropped
    type Region: Deref<Target = [u8]>;

    /// Apply a format and return what the driver accepted
    fn set_format(&mut self, request: &FormatRequest) -> io::Result<NegotiatedFormat>;

    fn format(&self) -> io::Result<NegotiatedFormat>;

    /// Apply a frame interval and return what the driver accepted
    fn set_frame_interval(&mut self, interval: FrameInterval) -> io::Result<FrameInterval>;

    fn frame_interval(&self) -> io::Result<FrameInterval>;

    /// Ask for `count` memory-mapped buffers; returns the granted count.
    /// A count of zero frees the driver's buffers.
    fn request_buffers(&mut self, count: u32) -> io::Result<u32>;

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferLayout>;

    fn map_buffer(&mut self, layout: &BufferLayout) -> io::Result<Self::Region>;

    fn queue_buffer(&mut self, index: u32) -> io::Result<()>;

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer>;

    fn stream_on(&mut self) -> io::Result<()>;

    fn stream_off(&mut self) -> io::Result<()>;

    /// Block until a buffer is ready or `timeout` elapses
    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness>;
}
