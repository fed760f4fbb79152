//! capstream: stream compressed frames from a V4L2 device to stdout

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use capstream::capture::{Capture, CaptureLoop, DiagnosticSink, FrameInterval, WriterSink};
use capstream::{Config, OutputMode};
use clap::Parser;
use color_eyre::{eyre::WrapErr, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Capture frames from a V4L2 device and write the raw payloads to stdout
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Print setup and per-frame diagnostics instead of streaming payloads
    #[arg(short, long)]
    verbose: bool,

    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Capture device path
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Number of frame slots to run
    #[arg(short = 'n', long)]
    frames: Option<u32>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Requested frame rate
    #[arg(long)]
    fps: Option<u32>,

    /// Number of driver buffers to request
    #[arg(long)]
    buffers: Option<u32>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        let capture = &mut config.capture;
        if let Some(device) = &self.device {
            capture.device = device.clone();
        }
        if let Some(frames) = self.frames {
            capture.frame_budget = frames;
        }
        if let Some(width) = self.width {
            capture.width = width;
        }
        if let Some(height) = self.height {
            capture.height = height;
        }
        if let Some(fps) = self.fps {
            capture.frame_interval = FrameInterval::from_fps(fps);
        }
        if let Some(buffers) = self.buffers {
            capture.buffer_count = buffers;
        }
        if self.verbose {
            config.output.mode = OutputMode::Diagnostics;
        }
    }
}

fn init_logging(mode: OutputMode) {
    let default_filter = mode.default_log_filter();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .with_writer(io::stderr)
        .init();
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    // Load configuration first; the output mode decides the log level
    let mut config = Config::load(cli.config.as_deref()).wrap_err("loading configuration")?;
    cli.apply(&mut config);
    config.validate().wrap_err("validating configuration")?;

    init_logging(config.output.mode);

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = cancel.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .wrap_err("installing signal handler")?;

    let mut capture = Capture::open(&config.capture).wrap_err("capture setup failed")?;
    if config.output.mode == OutputMode::Diagnostics {
        capture.session().log_setup();
    }
    capture.start().wrap_err("starting the stream")?;

    let capture_loop = CaptureLoop::new(
        config.capture.frame_budget,
        config.capture.timeout_policy(),
    )
    .with_cancel(cancel);

    let stats = match config.output.mode {
        OutputMode::Stream => capture.run(&capture_loop, WriterSink::new(io::stdout().lock())),
        OutputMode::Diagnostics => capture.run(&capture_loop, DiagnosticSink::new()),
    };
    capture.shutdown();
    let stats = stats.wrap_err("capture failed")?;

    if stats.cancelled {
        info!("Interrupted after {} frames", stats.frames_delivered);
    }
    info!("capstream shutting down");
    Ok(())
}
