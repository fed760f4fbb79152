use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Metadata for one delivered frame.
///
/// Produced on every successful dequeue and handed to the sink next to the
/// payload view. It never outlives the requeue of its buffer, so it carries
/// no reference to the mapped memory itself.
#[derive(Debug, Clone)]
pub struct FrameRecord {
    /// Frame slot this frame was captured in (contiguous, timeouts included)
    pub slot: u32,

    /// Driver index of the buffer holding the payload
    pub index: u32,

    /// Bytes of the buffer actually filled by the device
    pub bytes_used: usize,

    /// Driver frame sequence counter
    pub sequence: u32,

    /// Hardware timestamp reported with the buffer
    pub device_timestamp: Duration,

    /// When the application dequeued the buffer
    pub received_at: Instant,
}

/// Pixel formats we know how to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Mjpeg,
    Yuyv,
    H264,
    Rgb24,
    Nv12,
}

impl PixelFormat {
    pub const fn fourcc(self) -> [u8; 4] {
        match self {
            PixelFormat::Mjpeg => *b"MJPG",
            PixelFormat::Yuyv => *b"YUYV",
            PixelFormat::H264 => *b"H264",
            PixelFormat::Rgb24 => *b"RGB3",
            PixelFormat::Nv12 => *b"NV12",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        match &code {
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"H264" => Some(PixelFormat::H264),
            b"RGB3" => Some(PixelFormat::Rgb24),
            b"NV12" => Some(PixelFormat::Nv12),
            _ => None,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&fourcc_str(self.fourcc()))
    }
}

/// Printable form of a FourCC, non-printable bytes shown as '.'
pub fn fourcc_str(code: [u8; 4]) -> String {
    code.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}

/// Time between two frames as a rational number of seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInterval {
    pub numerator: u32,
    pub denominator: u32,
}

impl FrameInterval {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Interval for a whole number of frames per second
    pub const fn from_fps(fps: u32) -> Self {
        Self::new(1, fps)
    }

    pub fn is_valid(&self) -> bool {
        self.numerator != 0 && self.denominator != 0
    }

    pub fn fps(&self) -> f64 {
        if self.numerator == 0 {
            return 0.0;
        }
        self.denominator as f64 / self.numerator as f64
    }

    /// Frame period, `None` for a degenerate interval
    pub fn period(&self) -> Option<Duration> {
        if !self.is_valid() {
            return None;
        }
        let nanos = self.numerator as u128 * 1_000_000_000 / self.denominator as u128;
        Some(Duration::from_nanos(nanos as u64))
    }
}

impl fmt::Display for FrameInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} ({:.2} fps)",
            self.numerator,
            self.denominator,
            self.fps()
        )
    }
}

/// What the device actually accepted for a format request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub fourcc: [u8; 4],
    pub field: String,
    pub bytes_per_line: u32,
    pub size_image: u32,
}

impl NegotiatedFormat {
    pub fn pixel_format(&self) -> Option<PixelFormat> {
        PixelFormat::from_fourcc(self.fourcc)
    }
}

impl fmt::Display for NegotiatedFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} (field {}, {} bytes/line, {} bytes/image)",
            self.width,
            self.height,
            fourcc_str(self.fourcc),
            self.field,
            self.bytes_per_line,
            self.size_image
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_codes_map_both_ways() {
        for format in [
            PixelFormat::Mjpeg,
            PixelFormat::Yuyv,
            PixelFormat::H264,
            PixelFormat::Rgb24,
            PixelFormat::Nv12,
        ] {
            assert_eq!(PixelFormat::from_fourcc(format.fourcc()), Some(format));
        }
        assert_eq!(PixelFormat::from_fourcc(*b"GREY"), None);
    }

    #[test]
    fn fourcc_str_masks_unprintable_bytes() {
        assert_eq!(fourcc_str(*b"MJPG"), "MJPG");
        assert_eq!(fourcc_str([b'A', 0, b'B', 0xff]), "A.B.");
    }

    #[test]
    fn interval_fps_and_period() {
        let interval = FrameInterval::from_fps(30);
        assert!((interval.fps() - 30.0).abs() < f64::EPSILON);
        assert_eq!(interval.period(), Some(Duration::from_nanos(33_333_333)));
        assert_eq!(interval.to_string(), "1/30 (30.00 fps)");
    }

    #[test]
    fn degenerate_interval_has_no_period() {
        let interval = FrameInterval::new(0, 30);
        assert!(!interval.is_valid());
        assert_eq!(interval.period(), None);
        assert_eq!(interval.fps(), 0.0);
    }
}
