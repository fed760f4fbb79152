//! Error types for the capture core

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::capture::session::SessionState;

/// Every failure the capture core can report.
///
/// Frame timeouts are not errors: they surface as
/// [`Readiness::TimedOut`](crate::capture::device::Readiness) and are counted
/// in the capture statistics.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to open capture device {}: {source}", path.display())]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("format negotiation failed: {0}")]
    Format(#[from] FormatError),

    #[error("frame interval negotiation failed: {0}")]
    FrameRate(#[source] io::Error),

    #[error("buffer allocation failed: {reason}")]
    Allocation {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("failed to map buffer {index}: {source}")]
    Map {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("failed to queue buffer {index}: {source}")]
    Queue {
        index: u32,
        #[source]
        source: io::Error,
    },

    #[error("stream {action} failed: {reason}")]
    StreamControl {
        action: &'static str,
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("waiting for device readiness failed: {0}")]
    ReadinessWait(#[source] io::Error),

    #[error("dequeue failed: {reason}")]
    Dequeue {
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("requeue of buffer {index} failed: {reason}")]
    Requeue {
        index: u32,
        reason: String,
        #[source]
        source: Option<io::Error>,
    },

    #[error("frame sink failed: {0}")]
    Sink(#[source] io::Error),

    #[error("cannot {operation} while the session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("failed to load configuration: {0}")]
    ConfigLoad(#[from] config::ConfigError),
}

/// Ways the device can refuse or alter the requested capture format.
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("requested size {width}x{height} is invalid")]
    InvalidSize { width: u32, height: u32 },

    #[error("device rejected the format: {0}")]
    Rejected(#[source] io::Error),

    #[error("device substituted pixel format {actual} for requested {requested}")]
    PixelFormatMismatch { requested: String, actual: String },
}

pub type Result<T> = std::result::Result<T, CaptureError>;
