//! Fixed pool of memory-mapped driver buffers
//!
//! Buffers are addressed by their driver index. Each carries an ownership
//! tag, and the tag alone decides who may touch the memory: the driver may
//! write into a `DriverOwned` buffer at any time, so only an
//! `ApplicationOwned` buffer can be read.

use std::ops::Deref;

use tracing::{debug, info, instrument, warn};

use super::device::{BufferLayout, CaptureDevice};
use super::frame::FrameRecord;
use super::session::{DeviceSession, SessionState};
use crate::error::{CaptureError, Result};

/// Default number of buffers to request
pub const DEFAULT_BUFFERS: u32 = 8;

/// Hard ceiling on the pool size, checked before any driver call
pub const MAX_BUFFERS: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Queued with the driver; may be filled by hardware at any time
    DriverOwned,
    /// Dequeued (or never queued); safe for the application to read
    ApplicationOwned,
    /// Memory released; terminal
    Unmapped,
}

/// One driver buffer and its mapping
#[derive(Debug)]
pub struct MappedBuffer<R> {
    layout: BufferLayout,
    region: Option<R>,
    state: BufferState,
}

impl<R> MappedBuffer<R> {
    pub fn index(&self) -> u32 {
        self.layout.index
    }

    /// Mapped capacity in bytes
    pub fn length(&self) -> usize {
        self.layout.length
    }

    pub fn offset(&self) -> u32 {
        self.layout.offset
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    pub fn is_mapped(&self) -> bool {
        self.region.is_some()
    }

    fn unmap(&mut self) -> bool {
        self.state = BufferState::Unmapped;
        // Dropping the region releases the mapping
        self.region.take().is_some()
    }
}

/// The pool of buffers granted by the driver
pub struct BufferPool<R> {
    buffers: Vec<MappedBuffer<R>>,
    granted: u32,
    released: bool,
}

impl<R: Deref<Target = [u8]>> BufferPool<R> {
    /// Ask the device for `count` buffers.
    ///
    /// The driver may grant fewer; everything afterwards uses the granted
    /// count.
    #[instrument(skip(session))]
    pub fn request<D>(session: &mut DeviceSession<D>, count: u32) -> Result<Self>
    where
        D: CaptureDevice<Region = R>,
    {
        if count == 0 || count > MAX_BUFFERS {
            return Err(CaptureError::Allocation {
                reason: format!("requested {count} buffers, allowed range is 1..={MAX_BUFFERS}"),
                source: None,
            });
        }

        let device = session.device_for("request buffers", &[SessionState::Configured])?;
        let granted = device
            .request_buffers(count)
            .map_err(|source| CaptureError::Allocation {
                reason: source.to_string(),
                source: Some(source),
            })?;

        if granted == 0 {
            return Err(CaptureError::Allocation {
                reason: "device granted no buffers".into(),
                source: None,
            });
        }
        if granted > MAX_BUFFERS {
            // Nothing is mapped yet; hand the buffers straight back.
            if let Err(e) = device.request_buffers(0) {
                warn!("Failed to free driver buffers: {}", e);
            }
            return Err(CaptureError::Allocation {
                reason: format!("device granted {granted} buffers, more than {MAX_BUFFERS}"),
                source: None,
            });
        }
        if granted < count {
            warn!("Device granted {} of {} requested buffers", granted, count);
        }

        Ok(Self {
            buffers: Vec::with_capacity(granted as usize),
            granted,
            released: false,
        })
    }

    /// Query and map every granted buffer.
    ///
    /// On any failure the buffers mapped so far are unmapped before the
    /// error is returned.
    pub fn map_all<D>(&mut self, session: &mut DeviceSession<D>) -> Result<()>
    where
        D: CaptureDevice<Region = R>,
    {
        if let Err(e) = self.try_map_all(session) {
            self.unmap_all();
            return Err(e);
        }
        debug!("Mapped {} buffers", self.buffers.len());
        Ok(())
    }

    fn try_map_all<D>(&mut self, session: &mut DeviceSession<D>) -> Result<()>
    where
        D: CaptureDevice<Region = R>,
    {
        if !self.buffers.is_empty() || self.released {
            return Err(CaptureError::Map {
                index: 0,
                source: std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "pool is already mapped",
                ),
            });
        }
        let device = session.device_for("map buffers", &[SessionState::Configured])?;
        for index in 0..self.granted {
            let layout = device
                .query_buffer(index)
                .map_err(|source| CaptureError::Map { index, source })?;
            let region = device
                .map_buffer(&layout)
                .map_err(|source| CaptureError::Map { index, source })?;
            self.buffers.push(MappedBuffer {
                layout,
                region: Some(region),
                state: BufferState::ApplicationOwned,
            });
        }
        Ok(())
    }

    /// Hand every buffer to the driver. Must happen before streaming starts.
    pub fn enqueue_all<D>(&mut self, session: &mut DeviceSession<D>) -> Result<()>
    where
        D: CaptureDevice<Region = R>,
    {
        let device = session.device_for("queue buffers", &[SessionState::Configured])?;
        for buffer in &mut self.buffers {
            match buffer.state {
                BufferState::DriverOwned => continue,
                BufferState::Unmapped => {
                    return Err(CaptureError::Queue {
                        index: buffer.index(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::InvalidInput,
                            "buffer is unmapped",
                        ),
                    })
                }
                BufferState::ApplicationOwned => {}
            }
            device
                .queue_buffer(buffer.index())
                .map_err(|source| CaptureError::Queue {
                    index: buffer.index(),
                    source,
                })?;
            buffer.state = BufferState::DriverOwned;
        }
        debug!("Queued {} buffers", self.buffers.len());
        Ok(())
    }

    /// Take the next filled buffer from the driver
    pub fn dequeue<D>(&mut self, session: &mut DeviceSession<D>, slot: u32) -> Result<FrameRecord>
    where
        D: CaptureDevice<Region = R>,
    {
        let device = session.device_for("dequeue a buffer", &[SessionState::Streaming])?;
        let dequeued = device
            .dequeue_buffer()
            .map_err(|source| CaptureError::Dequeue {
                reason: source.to_string(),
                source: Some(source),
            })?;

        let buffer = self
            .buffers
            .get_mut(dequeued.index as usize)
            .ok_or_else(|| CaptureError::Dequeue {
                reason: format!(
                    "driver returned buffer {} outside the pool of {}",
                    dequeued.index, self.granted
                ),
                source: None,
            })?;
        if buffer.state != BufferState::DriverOwned {
            return Err(CaptureError::Dequeue {
                reason: format!(
                    "driver returned buffer {} which was {:?}",
                    dequeued.index, buffer.state
                ),
                source: None,
            });
        }
        buffer.state = BufferState::ApplicationOwned;

        if dequeued.bytes_used > buffer.length() {
            return Err(CaptureError::Dequeue {
                reason: format!(
                    "buffer {} reports {} bytes used but holds {}",
                    dequeued.index,
                    dequeued.bytes_used,
                    buffer.length()
                ),
                source: None,
            });
        }

        Ok(FrameRecord {
            slot,
            index: dequeued.index,
            bytes_used: dequeued.bytes_used,
            sequence: dequeued.sequence,
            device_timestamp: dequeued.timestamp,
            received_at: std::time::Instant::now(),
        })
    }

    /// Read-only view of a dequeued frame's payload
    pub fn payload(&self, frame: &FrameRecord) -> Result<&[u8]> {
        let buffer = self
            .buffers
            .get(frame.index as usize)
            .filter(|b| b.state == BufferState::ApplicationOwned)
            .ok_or_else(|| CaptureError::Dequeue {
                reason: format!("buffer {} is not held by the application", frame.index),
                source: None,
            })?;
        let region = buffer.region.as_ref().ok_or_else(|| CaptureError::Dequeue {
            reason: format!("buffer {} is unmapped", frame.index),
            source: None,
        })?;
        let data: &[u8] = region;
        Ok(&data[..frame.bytes_used.min(data.len())])
    }

    /// Give a dequeued buffer back to the driver
    pub fn requeue<D>(&mut self, session: &mut DeviceSession<D>, index: u32) -> Result<()>
    where
        D: CaptureDevice<Region = R>,
    {
        let buffer = self
            .buffers
            .get_mut(index as usize)
            .ok_or_else(|| CaptureError::Requeue {
                index,
                reason: "index is outside the pool".into(),
                source: None,
            })?;
        if buffer.state != BufferState::ApplicationOwned {
            return Err(CaptureError::Requeue {
                index,
                reason: format!("buffer is {:?}", buffer.state),
                source: None,
            });
        }

        let device = session.device_for("requeue a buffer", &[SessionState::Streaming])?;
        device
            .queue_buffer(index)
            .map_err(|source| CaptureError::Requeue {
                index,
                reason: source.to_string(),
                source: Some(source),
            })?;
        buffer.state = BufferState::DriverOwned;
        Ok(())
    }

    /// Unmap every buffer still mapped, whatever its state. Idempotent.
    pub fn unmap_all(&mut self) -> usize {
        let unmapped = self
            .buffers
            .iter_mut()
            .map(MappedBuffer::unmap)
            .filter(|&was_mapped| was_mapped)
            .count();
        if unmapped > 0 {
            info!("Unmapped {} buffers", unmapped);
        }
        unmapped
    }

    /// Unmap everything and ask the driver to free its buffers.
    ///
    /// Freeing is best effort; a failure is logged.
    pub fn release<D>(&mut self, session: &mut DeviceSession<D>)
    where
        D: CaptureDevice<Region = R>,
    {
        self.unmap_all();
        if self.released {
            return;
        }
        match session.device_for("free buffers", &[SessionState::Configured]) {
            Ok(device) => {
                if let Err(e) = device.request_buffers(0) {
                    warn!("Failed to free driver buffers: {}", e);
                }
                self.released = true;
            }
            Err(e) => debug!("Skipping driver buffer release: {}", e),
        }
    }
}

impl<R> BufferPool<R> {
    /// Number of buffers the driver granted
    pub fn len(&self) -> usize {
        self.granted as usize
    }

    pub fn is_empty(&self) -> bool {
        self.granted == 0
    }

    pub fn buffer(&self, index: u32) -> Option<&MappedBuffer<R>> {
        self.buffers.get(index as usize)
    }

    pub fn buffers(&self) -> impl Iterator<Item = &MappedBuffer<R>> {
        self.buffers.iter()
    }

    pub fn state(&self, index: u32) -> Option<BufferState> {
        self.buffer(index).map(MappedBuffer::state)
    }

    /// True once every granted buffer is mapped and queued
    pub fn all_driver_owned(&self) -> bool {
        self.buffers.len() == self.granted as usize
            && self.buffers.iter().all(|b| b.state == BufferState::DriverOwned)
    }

    /// Mark every queued buffer as returned to the application
    pub(crate) fn reclaim_all(&mut self) {
        for buffer in &mut self.buffers {
            if buffer.state == BufferState::DriverOwned {
                buffer.state = BufferState::ApplicationOwned;
            }
        }
    }
}
