//! wincast — CLI entrypoint.
//!
//! Captures a window selected by name at a fixed frame rate and writes it
//! to a media container (or a raw RGBA dump).
//!
//! ```bash
//! wincast -w Firefox -o capture.mp4 --fps 30 --duration 10
//! wincast -w Firefox -o capture.raw --buffer gpu-mapped --duration 5
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;

use wincast::capture::x11::X11Backend;
use wincast::capture::{SessionConfig, SystemClock, TargetSelector};
use wincast::core::buffers::{BufferStrategy, DEFAULT_SLAB_SLICES};
use wincast::core::slot_pool::DEFAULT_POOL_SLOTS;
use wincast::core::types::Geometry;
use wincast::engine::{record, RecorderConfig, WriterParts};
use wincast::error::{CastError, Result};
use wincast::io::ffmpeg::{ContainerSink, Mpeg4Encoder, SwsScaler};
use wincast::io::raw::{PassthroughScaler, RawEncoder, RawFileSink};

// ─── CLI argument definition ─────────────────────────────────────────────────

/// wincast — paced window capture to a media file.
///
/// Grabs a composite-redirected window through a GPU texture at a fixed
/// rate and encodes it on a second thread, decoupled by a lock-free frame
/// slot pool.
#[derive(Parser, Debug)]
#[command(name = "wincast", version, about)]
struct Cli {
    /// Capture target: the first window whose name contains this string.
    #[arg(short = 'w', long = "window")]
    window: String,

    /// Output file.  `.raw`/`.rgb` dumps uncompressed RGBA frames; any
    /// other extension selects a container format via FFmpeg.
    #[arg(short = 'o', long = "output")]
    output: PathBuf,

    /// Capture rate in frames per second.
    #[arg(long = "fps", default_value_t = 30)]
    fps: u32,

    /// Recording length in seconds.
    #[arg(short = 'd', long = "duration", default_value_t = 10.0)]
    duration: f64,

    /// Buffer strategy: heap, slab or gpu-mapped.
    #[arg(short = 'b', long = "buffer", default_value = "heap")]
    buffer: String,

    /// Frame slot pool capacity.
    #[arg(long = "pool-slots", default_value_t = DEFAULT_POOL_SLOTS)]
    pool_slots: usize,

    /// Slice count for the slab / gpu-mapped strategies.
    #[arg(long = "slices", default_value_t = DEFAULT_SLAB_SLICES)]
    slices: usize,

    /// Encoder bitrate in kbps (container output only).
    #[arg(long = "bitrate", default_value_t = 40_000)]
    bitrate: u32,

    /// Output width (container output; defaults to the source width).
    #[arg(long = "width")]
    width: Option<u32>,

    /// Output height (container output; defaults to the source height).
    #[arg(long = "height")]
    height: Option<u32>,
}

/// Extensions written as raw RGBA frame dumps rather than containers.
const RAW_EXTENSIONS: &[&str] = &["raw", "rgb"];

fn is_raw_output(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| RAW_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

// ─── Main ────────────────────────────────────────────────────────────────────

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    tracing::info!(
        window = %cli.window,
        output = %cli.output.display(),
        fps = cli.fps,
        duration_s = cli.duration,
        buffer = %cli.buffer,
        "wincast starting"
    );

    match run_session(cli) {
        Ok(()) => {
            tracing::info!("Capture completed successfully");
            std::process::exit(0);
        }
        Err(e) => {
            tracing::error!(error = %e, code = e.error_code(), "Capture failed");
            std::process::exit(e.error_code() as i32);
        }
    }
}

fn run_session(cli: Cli) -> Result<()> {
    if cli.duration <= 0.0 {
        return Err(CastError::Pipeline("duration must be positive".into()));
    }
    if cli.fps == 0 {
        return Err(CastError::Pipeline("fps must be at least 1".into()));
    }
    if cli.pool_slots == 0 || cli.slices == 0 {
        return Err(CastError::Pipeline(
            "pool-slots and slices must be at least 1".into(),
        ));
    }
    let strategy = BufferStrategy::parse(&cli.buffer)?;

    let session = SessionConfig {
        target: TargetSelector::new(cli.window.clone()),
        strategy,
        transfer_slices: cli.slices,
    };
    let config = RecorderConfig {
        fps: cli.fps,
        duration_us: (cli.duration * 1_000_000.0) as i64,
        pool_slots: cli.pool_slots,
    };

    let output = cli.output.clone();
    let (fps, bitrate) = (cli.fps, cli.bitrate as i64 * 1000);
    let (width, height) = (cli.width, cli.height);

    let report = record(
        X11Backend::default(),
        session,
        config,
        Arc::new(SystemClock::new()),
        move |geometry| build_writer(&output, geometry, fps, bitrate, width, height),
    )?;

    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| CastError::Pipeline(format!("serializing session report: {e}")))?;
    println!("{json}");
    Ok(())
}

/// Assemble the writer-side collaborators once the source geometry is
/// known.  Raw output bypasses conversion and compression entirely.
fn build_writer(
    output: &Path,
    geometry: Geometry,
    fps: u32,
    bitrate: i64,
    width: Option<u32>,
    height: Option<u32>,
) -> Result<WriterParts> {
    if is_raw_output(output) {
        return Ok(WriterParts {
            scaler: Box::new(PassthroughScaler),
            encoder: Box::new(RawEncoder::new(fps)),
            sink: Box::new(RawFileSink::new(output.to_path_buf(), fps)?),
        });
    }

    // MPEG-4 needs even dimensions.
    let dst_width = width.unwrap_or(geometry.width) & !1;
    let dst_height = height.unwrap_or(geometry.height) & !1;

    let scaler = SwsScaler::new(geometry, dst_width, dst_height)?;
    let encoder = Mpeg4Encoder::new(dst_width, dst_height, fps, bitrate)?;
    let sink = ContainerSink::new(output, dst_width, dst_height, fps, &encoder.extradata())?;
    Ok(WriterParts {
        scaler: Box::new(scaler),
        encoder: Box::new(encoder),
        sink: Box::new(sink),
    })
}
