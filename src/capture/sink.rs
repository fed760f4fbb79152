//! Frame sinks
//!
//! A sink sees each payload exactly once, as a borrowed view that is only
//! valid for the duration of [`FrameSink::deliver`]. The buffer goes back to
//! the driver right after the call returns.

use std::io::{self, Write};

use tracing::{debug, warn};

use super::frame::FrameRecord;

pub trait FrameSink {
    /// Consume one frame payload
    fn deliver(&mut self, payload: &[u8], frame: &FrameRecord) -> io::Result<()>;

    /// Called once after the last frame
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: FrameSink + ?Sized> FrameSink for &mut S {
    fn deliver(&mut self, payload: &[u8], frame: &FrameRecord) -> io::Result<()> {
        (**self).deliver(payload, frame)
    }

    fn finish(&mut self) -> io::Result<()> {
        (**self).finish()
    }
}

/// Streams raw payloads back to back into a writer (stdout in the binary)
pub struct WriterSink<W: Write> {
    writer: W,
    frames: u64,
    bytes: u64,
}

impl<W: Write> WriterSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> FrameSink for WriterSink<W> {
    fn deliver(&mut self, payload: &[u8], _frame: &FrameRecord) -> io::Result<()> {
        self.writer.write_all(payload)?;
        self.frames += 1;
        self.bytes += payload.len() as u64;
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// Logs per-frame metadata and writes no payload.
///
/// Also watches the driver sequence counter, which skips when the driver had
/// no free buffer for a frame.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    frames: u64,
    last_sequence: Option<u32>,
    driver_drops: u64,
}

impl DiagnosticSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Frames the driver dropped between deliveries
    pub fn driver_drops(&self) -> u64 {
        self.driver_drops
    }
}

impl FrameSink for DiagnosticSink {
    fn deliver(&mut self, payload: &[u8], frame: &FrameRecord) -> io::Result<()> {
        if let Some(last) = self.last_sequence {
            let gap = frame.sequence.wrapping_sub(last).saturating_sub(1);
            if gap > 0 {
                debug!(sequence = frame.sequence, gap, "Driver dropped frames");
                self.driver_drops += gap as u64;
            }
        }
        self.last_sequence = Some(frame.sequence);
        self.frames += 1;

        debug!(
            slot = frame.slot,
            buffer = frame.index,
            bytes = payload.len(),
            sequence = frame.sequence,
            timestamp = ?frame.device_timestamp,
            "Frame"
        );
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.driver_drops > 0 {
            warn!("Driver dropped {} frames", self.driver_drops);
        }
        Ok(())
    }
}
