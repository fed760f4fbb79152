pub mod capture;
pub mod error;

use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::frame::{FrameInterval, PixelFormat};
use capture::pool::{DEFAULT_BUFFERS, MAX_BUFFERS};
use capture::stream::TimeoutPolicy;
use serde::{Deserialize, Serialize};

pub use capture::{Capture, CaptureLoop, CaptureStats, DeviceSession, FrameRecord, FrameSink};
pub use error::{CaptureError, FormatError, Result};

/// Prefix for environment overrides, e.g. `CAPSTREAM__CAPTURE__WIDTH=1280`
pub const ENV_PREFIX: &str = "CAPSTREAM";

/// System configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub frame_interval: FrameInterval,
    pub buffer_count: u32,
    /// Frame slots per run; timed-out slots count against it
    pub frame_budget: u32,
    /// Per-frame readiness timeout
    pub timeout_ms: u64,
    /// Proceed when the device substitutes another pixel format
    pub allow_format_fallback: bool,
}

/// What happens to captured frames. The two modes are exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// Raw payloads to stdout
    Stream,
    /// Setup report and per-frame diagnostics, no payload output
    Diagnostics,
}

impl OutputMode {
    /// Log filter used when `RUST_LOG` is not set. Diagnostics output is
    /// logged at debug level, so that mode needs the wider filter.
    pub fn default_log_filter(self) -> &'static str {
        match self {
            OutputMode::Stream => "capstream=info",
            OutputMode::Diagnostics => "capstream=debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub mode: OutputMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig {
                device: PathBuf::from("/dev/video0"),
                width: 640,
                height: 480,
                format: PixelFormat::Mjpeg,
                frame_interval: FrameInterval::from_fps(30),
                buffer_count: DEFAULT_BUFFERS,
                frame_budget: 100,
                timeout_ms: TimeoutPolicy::default().per_frame().as_millis() as u64,
                allow_format_fallback: false,
            },
            output: OutputConfig {
                mode: OutputMode::Stream,
            },
        }
    }
}

impl Config {
    /// Layer defaults, an optional file and `CAPSTREAM__*` environment
    /// variables, then validate the result.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&Config::default())?);
        if let Some(file) = file {
            builder = builder.add_source(config::File::from(file));
        }
        let config: Config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.width == 0 || capture.height == 0 {
            return Err(CaptureError::InvalidConfig(format!(
                "frame size {}x{} must be non-zero",
                capture.width, capture.height
            )));
        }
        if !capture.frame_interval.is_valid() {
            return Err(CaptureError::InvalidConfig(format!(
                "frame interval {}/{} must have non-zero terms",
                capture.frame_interval.numerator, capture.frame_interval.denominator
            )));
        }
        if capture.buffer_count == 0 || capture.buffer_count > MAX_BUFFERS {
            return Err(CaptureError::InvalidConfig(format!(
                "buffer count {} is outside 1..={}",
                capture.buffer_count, MAX_BUFFERS
            )));
        }
        if capture.timeout_ms == 0 {
            return Err(CaptureError::InvalidConfig(
                "per-frame timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

impl CaptureConfig {
    pub fn timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy::new(Duration::from_millis(self.timeout_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference_capture() {
        let config = Config::default();
        assert_eq!(config.capture.device, PathBuf::from("/dev/video0"));
        assert_eq!((config.capture.width, config.capture.height), (640, 480));
        assert_eq!(config.capture.format, PixelFormat::Mjpeg);
        assert_eq!(config.capture.frame_interval, FrameInterval::new(1, 30));
        assert_eq!(config.capture.buffer_count, 8);
        assert_eq!(config.capture.frame_budget, 100);
        assert_eq!(config.capture.timeout_ms, 66);
        assert_eq!(config.output.mode, OutputMode::Stream);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[capture]
device = "/dev/video2"
width = 1280
height = 720
buffer_count = 4

[capture.frame_interval]
numerator = 1
denominator = 15

[output]
mode = "Diagnostics"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.capture.device, PathBuf::from("/dev/video2"));
        assert_eq!((config.capture.width, config.capture.height), (1280, 720));
        assert_eq!(config.capture.buffer_count, 4);
        assert_eq!(config.capture.frame_interval, FrameInterval::from_fps(15));
        assert_eq!(config.output.mode, OutputMode::Diagnostics);
        assert_eq!(config.output.mode.default_log_filter(), "capstream=debug");
        // Untouched keys keep their defaults
        assert_eq!(config.capture.frame_budget, 100);
    }

    #[test]
    fn log_filter_follows_output_mode() {
        assert_eq!(OutputMode::Stream.default_log_filter(), "capstream=info");
        assert_eq!(
            OutputMode::Diagnostics.default_log_filter(),
            "capstream=debug"
        );
    }

    #[test]
    fn oversized_buffer_count_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[capture]\nbuffer_count = 17").unwrap();

        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, CaptureError::InvalidConfig(_)), "{err}");
    }

    #[test]
    fn zero_interval_is_rejected() {
        let mut config = Config::default();
        config.capture.frame_interval = FrameInterval::new(1, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = Config::default();
        config.capture.timeout_ms = 0;
        assert!(config.validate().is_err());
    }
}
