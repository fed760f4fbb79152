//! Bounded-wait capture loop

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{debug, info, instrument};

use super::device::{CaptureDevice, Readiness};
use super::pool::BufferPool;
use super::session::DeviceSession;
use super::sink::FrameSink;
use crate::error::{CaptureError, Result};

/// How long a single frame slot waits for the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutPolicy {
    per_frame: Duration,
}

impl TimeoutPolicy {
    /// Slowest frame rate the default timeout covers
    pub const DEFAULT_FLOOR_FPS: u32 = 15;

    pub const fn new(per_frame: Duration) -> Self {
        Self { per_frame }
    }

    /// One frame period at `fps`, in whole milliseconds (66 ms at 15 fps)
    pub fn for_floor_fps(fps: u32) -> Self {
        Self::new(Duration::from_millis(1000 / u64::from(fps.max(1))))
    }

    pub fn per_frame(&self) -> Duration {
        self.per_frame
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self::for_floor_fps(Self::DEFAULT_FLOOR_FPS)
    }
}

/// Counters for one capture run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureStats {
    /// Frame slots budgeted for the run
    pub frames_requested: u32,
    pub frames_delivered: u32,
    pub frames_timed_out: u32,
    pub bytes_delivered: u64,
    pub elapsed: Duration,
    /// The run stopped early on a cancellation request
    pub cancelled: bool,
}

impl CaptureStats {
    /// Frame slots actually consumed
    pub fn slots_used(&self) -> u32 {
        self.frames_delivered + self.frames_timed_out
    }

    /// Delivered frames per second of wall time; timed-out slots excluded
    pub fn fps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.frames_delivered as f64 / secs
        } else {
            0.0
        }
    }
}

/// Waits, dequeues, delivers and requeues, one frame slot at a time
#[derive(Debug, Clone)]
pub struct CaptureLoop {
    frame_budget: u32,
    timeout: TimeoutPolicy,
    cancel: Option<Arc<AtomicBool>>,
}

impl CaptureLoop {
    pub fn new(frame_budget: u32, timeout: TimeoutPolicy) -> Self {
        Self {
            frame_budget,
            timeout,
            cancel: None,
        }
    }

    /// Stop between slots once `flag` becomes true
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn frame_budget(&self) -> u32 {
        self.frame_budget
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Run up to `frame_budget` slots.
    ///
    /// A timeout uses up its slot and is counted, not reported as an error.
    /// Wait, dequeue, requeue and sink failures end the run.
    #[instrument(skip_all, fields(budget = self.frame_budget))]
    pub fn run<D, S>(
        &self,
        session: &mut DeviceSession<D>,
        pool: &mut BufferPool<D::Region>,
        mut sink: S,
    ) -> Result<CaptureStats>
    where
        D: CaptureDevice,
        S: FrameSink,
    {
        let mut stats = CaptureStats {
            frames_requested: self.frame_budget,
            ..Default::default()
        };
        let start = Instant::now();

        let outcome = self.run_slots(session, pool, &mut sink, &mut stats);
        stats.elapsed = start.elapsed();
        outcome?;

        sink.finish().map_err(CaptureError::Sink)?;

        info!(
            "Captured {} frames ({} timed out) in {:.3} seconds ({:.2} fps)",
            stats.frames_delivered,
            stats.frames_timed_out,
            stats.elapsed.as_secs_f64(),
            stats.fps()
        );
        Ok(stats)
    }

    fn run_slots<D, S>(
        &self,
        session: &mut DeviceSession<D>,
        pool: &mut BufferPool<D::Region>,
        sink: &mut S,
        stats: &mut CaptureStats,
    ) -> Result<()>
    where
        D: CaptureDevice,
        S: FrameSink,
    {
        for slot in 0..self.frame_budget {
            if self.cancelled() {
                info!("Capture cancelled at frame {}", slot);
                stats.cancelled = true;
                break;
            }

            match session.wait_ready(self.timeout.per_frame())? {
                Readiness::Ready => {}
                Readiness::TimedOut => {
                    debug!("Timeout waiting for frame {}", slot);
                    stats.frames_timed_out += 1;
                    counter!("capstream_frames_timed_out_total").increment(1);
                    continue;
                }
                Readiness::Interrupted => {
                    debug!("Wait for frame {} interrupted", slot);
                    stats.frames_timed_out += 1;
                    counter!("capstream_frames_timed_out_total").increment(1);
                    continue;
                }
            }

            let frame = pool.dequeue(session, slot)?;
            let delivered = {
                let payload = pool.payload(&frame)?;
                let len = payload.len();
                sink.deliver(payload, &frame).map(|()| len)
            };

            // The buffer goes back to the driver even if the sink failed
            pool.requeue(session, frame.index)?;
            let len = delivered.map_err(CaptureError::Sink)?;

            stats.frames_delivered += 1;
            stats.bytes_delivered += len as u64;
            counter!("capstream_frames_delivered_total").increment(1);
            counter!("capstream_bytes_delivered_total").increment(len as u64);
        }
        Ok(())
    }
}
