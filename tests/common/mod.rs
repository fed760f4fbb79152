//! In-memory capture device for driving the capture core without hardware
//!
//! The fake behaves like a V4L2 driver with a FIFO of queued buffers and
//! records every resource event in a shared [`Probe`] so tests can inspect
//! what happened after the device has been moved into a session.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use capstream::capture::device::{
    BufferLayout, CaptureDevice, DequeuedBuffer, FormatRequest, Readiness,
};
use capstream::capture::{FrameInterval, NegotiatedFormat};
use capstream::CaptureConfig;

/// Counters shared between a [`FakeDevice`] and the test
#[derive(Debug, Default)]
pub struct Probe {
    pub maps: AtomicUsize,
    pub unmaps: AtomicUsize,
    pub closes: AtomicUsize,
    pub waits: AtomicUsize,
    pub queues: AtomicUsize,
    pub dequeues: AtomicUsize,
    pub stream_ons: AtomicUsize,
    pub stream_offs: AtomicUsize,
    pub releases: AtomicUsize,
}

impl Probe {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// How the fake device answers readiness waits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// A frame is ready on every wait
    Always,
    /// Nothing ever arrives; waits sleep for their timeout
    Never,
    /// Every other wait times out, starting with a delivery
    Alternate,
}

#[derive(Debug, Clone)]
pub struct FakeBehavior {
    pub grant: u32,
    pub buffer_len: usize,
    pub payload_len: usize,
    pub fail_map_at: Option<u32>,
    pub delivery: Delivery,
    /// Time a ready wait takes, standing in for the frame period
    pub frame_period: Option<Duration>,
    /// Fourcc the device substitutes for any request
    pub substitute_fourcc: Option<[u8; 4]>,
    /// Size the device substitutes for any request
    pub substitute_size: Option<(u32, u32)>,
    pub reject_frame_interval: bool,
    /// Report this index on the next dequeue instead of the queue head
    pub bogus_dequeue_index: Option<u32>,
    /// Zero-based wait that fails with a device error
    pub fail_wait_at: Option<usize>,
    /// Zero-based wait that is cut short by a signal
    pub interrupt_at: Option<usize>,
    /// Zero-based dequeue that the driver refuses
    pub fail_dequeue_at: Option<usize>,
    /// Zero-based queue call made while streaming that the driver refuses
    pub fail_requeue_at: Option<usize>,
}

impl Default for FakeBehavior {
    fn default() -> Self {
        Self {
            grant: 8,
            buffer_len: 4096,
            payload_len: 1500,
            fail_map_at: None,
            delivery: Delivery::Always,
            frame_period: None,
            substitute_fourcc: None,
            substitute_size: None,
            reject_frame_interval: false,
            bogus_dequeue_index: None,
            fail_wait_at: None,
            interrupt_at: None,
            fail_dequeue_at: None,
            fail_requeue_at: None,
        }
    }
}

/// Mapped memory of the fake; counts its own unmapping
pub struct FakeRegion {
    data: Vec<u8>,
    probe: Arc<Probe>,
}

impl Deref for FakeRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for FakeRegion {
    fn drop(&mut self) {
        self.probe.unmaps.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeDevice {
    behavior: FakeBehavior,
    probe: Arc<Probe>,
    format: NegotiatedFormat,
    interval: FrameInterval,
    granted: u32,
    queued: VecDeque<u32>,
    streaming: bool,
    sequence: u32,
    waits: usize,
    dequeue_calls: usize,
    requeue_calls: usize,
}

impl FakeDevice {
    pub fn new(behavior: FakeBehavior) -> (Self, Arc<Probe>) {
        let probe = Arc::new(Probe::default());
        let device = Self {
            behavior,
            probe: probe.clone(),
            format: NegotiatedFormat {
                width: 640,
                height: 480,
                fourcc: *b"YUYV",
                field: "Progressive".into(),
                bytes_per_line: 1280,
                size_image: 614_400,
            },
            interval: FrameInterval::from_fps(30),
            granted: 0,
            queued: VecDeque::new(),
            streaming: false,
            sequence: 0,
            waits: 0,
            dequeue_calls: 0,
            requeue_calls: 0,
        };
        (device, probe)
    }

    fn einval(msg: &str) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.probe.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl CaptureDevice for FakeDevice {
    type Region = FakeRegion;

    fn set_format(&mut self, request: &FormatRequest) -> io::Result<NegotiatedFormat> {
        let (width, height) = self
            .behavior
            .substitute_size
            .unwrap_or((request.width, request.height));
        self.format = NegotiatedFormat {
            width,
            height,
            fourcc: self
                .behavior
                .substitute_fourcc
                .unwrap_or(request.pixel_format.fourcc()),
            field: "Progressive".into(),
            bytes_per_line: 0,
            size_image: self.behavior.buffer_len as u32,
        };
        Ok(self.format.clone())
    }

    fn format(&self) -> io::Result<NegotiatedFormat> {
        Ok(self.format.clone())
    }

    fn set_frame_interval(&mut self, interval: FrameInterval) -> io::Result<FrameInterval> {
        if self.behavior.reject_frame_interval {
            return Err(Self::einval("VIDIOC_S_PARM not supported"));
        }
        self.interval = interval;
        Ok(interval)
    }

    fn frame_interval(&self) -> io::Result<FrameInterval> {
        Ok(self.interval)
    }

    fn request_buffers(&mut self, count: u32) -> io::Result<u32> {
        if self.streaming {
            return Err(io::Error::new(io::ErrorKind::Other, "device busy while streaming"));
        }
        if count == 0 {
            self.probe.releases.fetch_add(1, Ordering::SeqCst);
            self.granted = 0;
            self.queued.clear();
            return Ok(0);
        }
        self.granted = count.min(self.behavior.grant);
        Ok(self.granted)
    }

    fn query_buffer(&mut self, index: u32) -> io::Result<BufferLayout> {
        if index >= self.granted {
            return Err(Self::einval("index out of range"));
        }
        Ok(BufferLayout {
            index,
            length: self.behavior.buffer_len,
            offset: index * self.behavior.buffer_len as u32,
        })
    }

    fn map_buffer(&mut self, layout: &BufferLayout) -> io::Result<FakeRegion> {
        if self.behavior.fail_map_at == Some(layout.index) {
            return Err(io::Error::new(io::ErrorKind::OutOfMemory, "mmap failed"));
        }
        self.probe.maps.fetch_add(1, Ordering::SeqCst);
        Ok(FakeRegion {
            data: vec![layout.index as u8; layout.length],
            probe: self.probe.clone(),
        })
    }

    fn queue_buffer(&mut self, index: u32) -> io::Result<()> {
        if index >= self.granted {
            return Err(Self::einval("index out of range"));
        }
        if self.queued.contains(&index) {
            return Err(Self::einval("buffer already queued"));
        }
        if self.streaming {
            let call = self.requeue_calls;
            self.requeue_calls += 1;
            if self.behavior.fail_requeue_at == Some(call) {
                return Err(io::Error::new(io::ErrorKind::Other, "VIDIOC_QBUF failed"));
            }
        }
        self.probe.queues.fetch_add(1, Ordering::SeqCst);
        self.queued.push_back(index);
        Ok(())
    }

    fn dequeue_buffer(&mut self) -> io::Result<DequeuedBuffer> {
        if !self.streaming {
            return Err(Self::einval("not streaming"));
        }
        let call = self.dequeue_calls;
        self.dequeue_calls += 1;
        if self.behavior.fail_dequeue_at == Some(call) {
            return Err(io::Error::new(io::ErrorKind::Other, "VIDIOC_DQBUF failed"));
        }
        let index = self
            .queued
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::WouldBlock))?;
        let index = self.behavior.bogus_dequeue_index.take().unwrap_or(index);
        self.probe.dequeues.fetch_add(1, Ordering::SeqCst);
        self.sequence += 1;
        Ok(DequeuedBuffer {
            index,
            bytes_used: self.behavior.payload_len,
            sequence: self.sequence,
            timestamp: Duration::from_millis(self.sequence as u64 * 33),
        })
    }

    fn stream_on(&mut self) -> io::Result<()> {
        if self.queued.len() != self.granted as usize {
            return Err(Self::einval("stream on with unqueued buffers"));
        }
        self.probe.stream_ons.fetch_add(1, Ordering::SeqCst);
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self) -> io::Result<()> {
        self.probe.stream_offs.fetch_add(1, Ordering::SeqCst);
        self.streaming = false;
        self.queued.clear();
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        if !self.streaming {
            return Err(Self::einval("not streaming"));
        }
        self.probe.waits.fetch_add(1, Ordering::SeqCst);
        let wait = self.waits;
        self.waits += 1;

        if self.behavior.fail_wait_at == Some(wait) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device reported POLLERR"));
        }
        if self.behavior.interrupt_at == Some(wait) {
            return Ok(Readiness::Interrupted);
        }

        let ready = match self.behavior.delivery {
            Delivery::Always => true,
            Delivery::Never => false,
            Delivery::Alternate => wait % 2 == 0,
        };
        if ready && !self.queued.is_empty() {
            if let Some(period) = self.behavior.frame_period {
                thread::sleep(period);
            }
            Ok(Readiness::Ready)
        } else {
            thread::sleep(timeout);
            Ok(Readiness::TimedOut)
        }
    }
}

/// Capture settings suited to the fake device
pub fn settings() -> CaptureConfig {
    let mut config = capstream::Config::default().capture;
    config.timeout_ms = 1;
    config
}
