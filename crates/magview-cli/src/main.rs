use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use image::imageops::{self, FilterType};
use magview_core::{
    BlindPixelCalibrator, BlindPixelMask, CaptureOutcome, CaptureProgress, Compositor,
    FfmpegBackend, Palette, RenderSettings,
};
use magview_hw::{CalibrationInfo, DeviceParameters, DeviceSnapshot, FrameSample, Mag160Core, ThermalDevice};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{spawn_engine, FfcMode};

/// Deferred captures give up after this long without a completed FFC.
const CAPTURE_WAIT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "magview", about = "MAG-160 Core thermal camera tool")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print device parameters and calibration info as JSON
    Info,
    /// Stream frames through the correction pipeline
    Stream(StreamArgs),
    /// Run a forced flat-field correction
    Ffc,
    /// Download the sensor calibration blob
    Calibration {
        /// Output file (relative paths resolve against MAGVIEW_OUTPUT_DIR)
        #[arg(short, long, default_value = "calibration.bin")]
        output: PathBuf,
    },
    /// Detect blind pixels from two captures of different scenes
    BlindPixels {
        /// Seconds to wait between the two captures
        #[arg(long, default_value_t = 10)]
        delay_secs: u64,
        /// Detection tolerance in [0, 1] (default: MAGVIEW_BLIND_PIXEL_TOLERANCE)
        #[arg(long)]
        tolerance: Option<f32>,
        /// Mask PNG to write
        #[arg(short, long, default_value = "blind_pixels.png")]
        output: PathBuf,
    },
    /// Render the palette legend strip
    Ruler {
        #[arg(long)]
        palette: Option<Palette>,
        #[arg(long)]
        invert: bool,
        #[arg(short, long, default_value = "ruler.png")]
        output: PathBuf,
    },
}

#[derive(Args)]
struct StreamArgs {
    /// Stop after this many frames (0 = until Ctrl-C)
    #[arg(short = 'n', long, default_value_t = 0)]
    frames: u64,
    #[arg(long)]
    palette: Option<Palette>,
    /// Record the stream to this file through ffmpeg
    #[arg(long)]
    record: Option<PathBuf>,
    /// Save a still when the stream ends
    #[arg(long)]
    capture: Option<PathBuf>,
    /// Run an FFC before saving the still
    #[arg(long)]
    post_capture_ffc: bool,
    /// Blind-pixel mask PNG (default: built-in defect set)
    #[arg(long)]
    mask: Option<PathBuf>,
}

#[derive(Serialize)]
struct DeviceInfo {
    device: String,
    parameters: DeviceParameters,
    calibration: CalibrationInfo,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Info => {
            let info = with_device(|device| {
                Ok(DeviceInfo {
                    device: device.name().to_string(),
                    parameters: device.parameters().clone(),
                    calibration: device.calibration_info()?,
                })
            })
            .await?;
            println!("{}", serde_json::to_string_pretty(&info)?);
        }
        Commands::Stream(args) => stream(&config, args).await?,
        Commands::Ffc => {
            let mean = with_device(|device| {
                device.run_ffc(true)?;
                Ok(device.ffc_reference().mean())
            })
            .await?;
            println!("FFC complete, reference mean {mean:.1}");
        }
        Commands::Calibration { output } => {
            let path = config.output_path(output);
            let blob = with_device(|device| Ok(device.download_calibration()?)).await?;
            std::fs::write(&path, &blob)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote {} bytes to {}", blob.len(), path.display());
        }
        Commands::BlindPixels {
            delay_secs,
            tolerance,
            output,
        } => {
            let tolerance = tolerance.unwrap_or(config.blind_pixel_tolerance);
            let path = config.output_path(output);
            let dir = config.output_dir.clone();
            let delay = Duration::from_secs(delay_secs);
            let defects = with_device(move |device| {
                detect_blind_pixels(device, delay, tolerance, &path, &dir)
            })
            .await?;
            println!("Detected {defects} blind pixels");
        }
        Commands::Ruler {
            palette,
            invert,
            output,
        } => {
            let mut settings = config.render_settings()?;
            if let Some(palette) = palette {
                settings.palette = palette;
            }
            settings.invert |= invert;
            let ruler = Compositor::palette_ruler(&settings);
            let legend = imageops::resize(&ruler, 256, 16, FilterType::Nearest);
            let path = config.output_path(output);
            legend.save(&path)?;
            println!("Wrote {} legend to {}", settings.palette, path.display());
        }
    }

    Ok(())
}

/// Connect, run `f` and close the device, all off the async runtime.
async fn with_device<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Mag160Core) -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut device = <Mag160Core>::connect().context("failed to connect to sensor")?;
        let result = f(&mut device);
        device.close();
        result
    })
    .await?
}

fn read_frame_retrying(device: &mut Mag160Core) -> Result<Arc<FrameSample>> {
    let mut last_error = None;
    for _ in 0..10 {
        match device.read_frame() {
            Ok(frame) => return Ok(frame),
            Err(e) => last_error = Some(e),
        }
    }
    match last_error {
        Some(e) => Err(e).context("no frame from sensor"),
        None => anyhow::bail!("no frame from sensor"),
    }
}

fn detect_blind_pixels(
    device: &mut Mag160Core,
    delay: Duration,
    tolerance: f32,
    output: &std::path::Path,
    export_dir: &std::path::Path,
) -> Result<usize> {
    let params = device.parameters().clone();
    let mut calibrator = BlindPixelCalibrator::new(params.width as usize, params.height as usize);

    device.run_ffc(true)?;
    let frame = read_frame_retrying(device)?;
    calibrator.capture_step(&frame, device.ffc_reference())?;
    println!(
        "First capture stored. Change the scene; second capture in {}s",
        delay.as_secs()
    );

    // Keep draining frames so the sensor does not stall while waiting.
    let until = Instant::now() + delay;
    while Instant::now() < until {
        if let Err(e) = device.read_frame() {
            tracing::debug!(error = %e, "frame read while waiting failed");
        }
    }

    let frame = read_frame_retrying(device)?;
    let defects = match calibrator.capture_step(&frame, device.ffc_reference())? {
        CaptureProgress::MaskReady { defects } => defects,
        CaptureProgress::FirstCaptured => 0,
    };
    if (tolerance - calibrator.tolerance()).abs() > f32::EPSILON {
        calibrator.set_tolerance(tolerance)?;
    }

    calibrator.mask().save_png(output)?;
    for path in calibrator.export_captures(export_dir, "blind-pixel-capture")? {
        tracing::info!(path = %path.display(), "exported capture");
    }
    tracing::debug!(initial_defects = defects, tolerance, "blind-pixel detection done");
    Ok(calibrator.mask().defect_count())
}

/// Wait for the next published snapshot. `None` on Ctrl-C or engine exit.
async fn next_snapshot(snapshots: &mut watch::Receiver<DeviceSnapshot>) -> Option<DeviceSnapshot> {
    let changed = tokio::select! {
        result = snapshots.changed() => result.is_ok(),
        _ = tokio::signal::ctrl_c() => false,
    };
    if !changed {
        return None;
    }
    Some(snapshots.borrow_and_update().clone())
}

async fn stream(config: &Config, args: StreamArgs) -> Result<()> {
    let mut settings = config.render_settings()?;
    if let Some(palette) = args.palette {
        settings.palette = palette;
    }
    settings.post_capture_ffc |= args.post_capture_ffc;

    let device = tokio::task::spawn_blocking(<Mag160Core>::connect)
        .await?
        .context("failed to connect to sensor")?;
    let (width, height) = {
        let p = device.parameters();
        (p.width as usize, p.height as usize)
    };
    let mask = match &args.mask {
        Some(path) => BlindPixelMask::load_png(&config.output_path(path))?,
        None => BlindPixelMask::factory_default(width, height),
    };

    let mut handle = spawn_engine(device, config.engine_options())?;
    match handle.calibration_info().await {
        Ok(info) => tracing::debug!(size = info.size, timestamp = ?info.timestamp, "calibration info"),
        Err(e) => tracing::warn!(error = %e, "calibration info unavailable"),
    }
    if config.ffc_mode == FfcMode::Manual {
        // Without automatic FFC the reference would stay all-zero until asked.
        if let Err(e) = handle.trigger_ffc(true).await {
            tracing::warn!(error = %e, "initial FFC failed");
        }
    }

    let fps = handle.parameters().fps;
    let record_path = args.record.as_ref().map(|p| config.output_path(p));
    let backend = FfmpegBackend::new(
        record_path
            .clone()
            .unwrap_or_else(|| config.output_path("recording.mp4")),
    );
    let mut compositor = Compositor::new(Box::new(backend));
    let mut snapshots = handle.snapshots();
    let mut want_recording = record_path.is_some();
    let mut rendered = 0u64;
    let report_every = u64::from(fps.max(1)) * 5;

    while let Some(snapshot) = next_snapshot(&mut snapshots).await {
        compositor.render(&snapshot, &mask, &settings);
        if snapshot.frame.is_none() {
            continue;
        }
        if want_recording && !compositor.is_recording() {
            if let Err(e) = compositor.start_recording(fps, &settings) {
                tracing::warn!(error = %e, "recording disabled");
                want_recording = false;
            }
        }
        rendered += 1;
        if rendered % report_every == 0 {
            let stats = compositor.stats();
            tracing::info!(
                frames = rendered,
                span_min = stats.min,
                span_max = stats.max,
                performing_ffc = snapshot.performing_ffc,
                "streaming"
            );
        }
        if args.frames > 0 && rendered >= args.frames {
            break;
        }
    }

    let capture = match &args.capture {
        Some(path) => {
            capture_still(
                config.output_path(path),
                &mut compositor,
                &mut handle,
                &mut snapshots,
                &mask,
                &settings,
            )
            .await
        }
        None => Ok(()),
    };

    if let Err(e) = compositor.stop_recording() {
        tracing::warn!(error = %e, "failed to finalize recording");
    }
    handle.shutdown().await;
    println!("Rendered {rendered} frames");
    capture
}

async fn capture_still(
    path: PathBuf,
    compositor: &mut Compositor,
    handle: &mut engine::EngineHandle,
    snapshots: &mut watch::Receiver<DeviceSnapshot>,
    mask: &BlindPixelMask,
    settings: &RenderSettings,
) -> Result<()> {
    match compositor.capture_frame(&path, settings, handle)? {
        CaptureOutcome::Saved(path) => {
            println!("Saved {}", path.display());
            return Ok(());
        }
        CaptureOutcome::Deferred => {}
    }

    let wait = async {
        while let Some(snapshot) = next_snapshot(snapshots).await {
            compositor.render(&snapshot, mask, settings);
            if let Some(saved) = compositor.take_completed_capture() {
                return Some(saved);
            }
        }
        None
    };
    match tokio::time::timeout(CAPTURE_WAIT, wait).await {
        Ok(Some(saved)) => {
            println!("Saved {} after FFC", saved.display());
            Ok(())
        }
        Ok(None) | Err(_) => anyhow::bail!("FFC did not complete; {} not saved", path.display()),
    }
}
