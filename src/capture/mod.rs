pub mod device;
pub mod frame;
pub mod lifecycle;
pub mod pool;
pub mod session;
pub mod sink;
pub mod stream;
pub mod v4l2;

pub use device::{CaptureDevice, Readiness};
pub use frame::{FrameInterval, FrameRecord, NegotiatedFormat, PixelFormat};
pub use lifecycle::Capture;
pub use pool::{BufferPool, BufferState, MappedBuffer, DEFAULT_BUFFERS, MAX_BUFFERS};
pub use session::{DeviceSession, SessionState};
pub use sink::{DiagnosticSink, FrameSink, WriterSink};
pub use stream::{CaptureLoop, CaptureStats, TimeoutPolicy};
pub use v4l2::V4l2Device;
