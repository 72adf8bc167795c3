//! Frame correction and compositing.
//!
//! [`Compositor::render`] turns a driver snapshot into an RGB image:
//! FFC subtraction, blind-pixel inpainting, span normalization,
//! rotation/flip, then invert and palette lookup. The result can be
//! forwarded to a recording sink and saved as a still.

use crate::calibrator::BlindPixelMask;
use crate::inpaint::{inpaint_telea, DEFAULT_RADIUS};
use crate::settings::RenderSettings;
use crate::sink::{RecordingBackend, RecordingSink};
use crate::transform::orient;
use image::imageops::{self, FilterType};
use image::RgbImage;
use magview_hw::{Clock, DeviceSnapshot, FfcReference, Mag160Core, ThermalDevice, UsbTransport};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Size of the output shown before the first frame arrives.
pub const IDLE_WIDTH: u32 = 640;
pub const IDLE_HEIGHT: u32 = 480;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("recording sink write failed: {0}")]
    SinkWriteFailed(String),
    #[error("recording sink could not be opened: {0}")]
    SinkOpenFailed(String),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no frame has been rendered yet")]
    NoOutputYet,
    #[error("FFC request failed: {0}")]
    FfcRequest(String),
}

/// Span used for the last rendered frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FrameDisplayStats {
    pub min: f32,
    pub max: f32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    Saved(PathBuf),
    /// Saved on the first render after the requested FFC completes.
    Deferred,
}

/// Whatever can run an FFC on behalf of the compositor.
pub trait FfcController {
    /// Register a callback for the next "FFC reference ready" notification.
    fn on_next_ffc(
        &mut self,
        callback: Box<dyn FnOnce(&FfcReference) + Send>,
    ) -> Result<(), PipelineError>;

    /// Start a forced FFC.
    fn request_ffc(&mut self) -> Result<(), PipelineError>;
}

impl<T: UsbTransport, C: Clock> FfcController for Mag160Core<T, C> {
    fn on_next_ffc(
        &mut self,
        callback: Box<dyn FnOnce(&FfcReference) + Send>,
    ) -> Result<(), PipelineError> {
        self.ffc_observers().subscribe_once(callback);
        Ok(())
    }

    fn request_ffc(&mut self) -> Result<(), PipelineError> {
        self.trigger_ffc(true)
            .map(|_| ())
            .map_err(|e| PipelineError::FfcRequest(e.to_string()))
    }
}

struct PendingCapture {
    path: PathBuf,
    ffc_seen: Arc<AtomicBool>,
}

pub struct Compositor {
    output: Arc<RgbImage>,
    rendered: bool,
    stats: FrameDisplayStats,
    backend: Box<dyn RecordingBackend>,
    sink: Option<Box<dyn RecordingSink>>,
    pending: Option<PendingCapture>,
    completed: Option<PathBuf>,
}

impl Compositor {
    pub fn new(backend: Box<dyn RecordingBackend>) -> Self {
        Self {
            output: Arc::new(RgbImage::new(IDLE_WIDTH, IDLE_HEIGHT)),
            rendered: false,
            stats: FrameDisplayStats::default(),
            backend,
            sink: None,
            pending: None,
            completed: None,
        }
    }

    /// Last output frame.
    pub fn output(&self) -> Arc<RgbImage> {
        self.output.clone()
    }

    pub fn stats(&self) -> FrameDisplayStats {
        self.stats
    }

    /// Render the snapshot. Returns the previous output unchanged when there
    /// is no frame yet, or when an FFC is running and `freeze_on_ffc` is set.
    pub fn render(
        &mut self,
        snapshot: &DeviceSnapshot,
        mask: &BlindPixelMask,
        settings: &RenderSettings,
    ) -> Arc<RgbImage> {
        let frozen = snapshot.performing_ffc && settings.freeze_on_ffc;
        if let (Some(frame), false) = (&snapshot.frame, frozen) {
            let image = self.composite(&frame.image, &snapshot.reference.image, mask, settings);
            self.output = Arc::new(image);
            self.rendered = true;
            self.record();
        }
        self.finish_pending_capture(snapshot.performing_ffc);
        self.output.clone()
    }

    fn composite(
        &mut self,
        raw: &Array2<f32>,
        reference: &Array2<f32>,
        mask: &BlindPixelMask,
        settings: &RenderSettings,
    ) -> RgbImage {
        let corrected = if reference.dim() == raw.dim() {
            let mean = reference.mean().unwrap_or(0.0);
            raw - reference + mean
        } else {
            tracing::debug!(frame = ?raw.dim(), reference = ?reference.dim(), "FFC reference shape mismatch, skipping subtraction");
            raw.clone()
        };

        let repaired = if mask.dim() == corrected.dim() && !mask.is_empty() {
            inpaint_telea(&corrected, mask.as_array(), DEFAULT_RADIUS)
        } else {
            corrected
        };

        let (lo, hi) = if settings.manual_span {
            settings.span_range
        } else {
            min_max(&repaired)
        };
        self.stats = FrameDisplayStats { min: lo, max: hi };

        let scaled = normalize(&repaired, lo, hi);
        let oriented = orient(scaled.view(), settings.rotation, settings.flip);
        colorize(&oriented, settings)
    }

    fn record(&mut self) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let (width, height) = sink.size();
        let result = if self.output.dimensions() == (width, height) {
            sink.write_frame(&self.output)
        } else {
            let resized = imageops::resize(&*self.output, width, height, FilterType::CatmullRom);
            sink.write_frame(&resized)
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "recording frame dropped");
        }
    }

    /// 256×1 gradient through the invert and palette steps, for legends.
    pub fn palette_ruler(settings: &RenderSettings) -> RgbImage {
        let gradient = Array2::from_shape_fn((1, 256), |(_, c)| c as u8);
        colorize(&gradient, settings)
    }

    /// Save the current output as PNG, or defer until after a forced FFC
    /// when `post_capture_ffc` is set.
    pub fn capture_frame(
        &mut self,
        path: impl Into<PathBuf>,
        settings: &RenderSettings,
        ffc: &mut dyn FfcController,
    ) -> Result<CaptureOutcome, PipelineError> {
        let path = path.into();
        if !settings.post_capture_ffc {
            self.save_output(&path)?;
            return Ok(CaptureOutcome::Saved(path));
        }

        let ffc_seen = Arc::new(AtomicBool::new(false));
        let flag = ffc_seen.clone();
        ffc.on_next_ffc(Box::new(move |_| flag.store(true, Ordering::SeqCst)))?;
        ffc.request_ffc()?;
        tracing::info!(path = %path.display(), "capture deferred until FFC completes");
        self.pending = Some(PendingCapture { path, ffc_seen });
        Ok(CaptureOutcome::Deferred)
    }

    pub fn capture_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Path of a deferred capture that has since been written.
    pub fn take_completed_capture(&mut self) -> Option<PathBuf> {
        self.completed.take()
    }

    fn finish_pending_capture(&mut self, performing_ffc: bool) {
        let ready = self
            .pending
            .as_ref()
            .is_some_and(|p| p.ffc_seen.load(Ordering::SeqCst) && !performing_ffc);
        if !ready {
            return;
        }
        if let Some(pending) = self.pending.take() {
            match self.save_output(&pending.path) {
                Ok(()) => self.completed = Some(pending.path),
                Err(e) => tracing::warn!(path = %pending.path.display(), error = %e, "deferred capture failed"),
            }
        }
    }

    fn save_output(&self, path: &Path) -> Result<(), PipelineError> {
        if !self.rendered {
            return Err(PipelineError::NoOutputYet);
        }
        self.output.save(path)?;
        tracing::info!(path = %path.display(), "frame captured");
        Ok(())
    }

    /// Open a sink sized to the current output × `recording_scale`.
    /// Does nothing while already recording.
    pub fn start_recording(&mut self, fps: u32, settings: &RenderSettings) -> Result<(), PipelineError> {
        if self.sink.is_some() {
            return Ok(());
        }
        let scale = settings.recording_scale.max(1);
        let (width, height) = self.output.dimensions();
        self.sink = Some(self.backend.open(width * scale, height * scale, fps)?);
        Ok(())
    }

    /// Finalize the active recording. Does nothing when idle.
    pub fn stop_recording(&mut self) -> Result<(), PipelineError> {
        match self.sink.take() {
            Some(sink) => sink.finish(),
            None => Ok(()),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.sink.is_some()
    }
}

fn min_max(image: &Array2<f32>) -> (f32, f32) {
    let min = image.iter().copied().fold(f32::INFINITY, f32::min);
    let max = image.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if min.is_finite() && max.is_finite() {
        (min, max)
    } else {
        (0.0, 0.0)
    }
}

/// Clip to `[lo, hi]` and rescale to `[0, 255]`. A degenerate span maps to 0.
fn normalize(image: &Array2<f32>, lo: f32, hi: f32) -> Array2<u8> {
    if !(hi > lo) {
        return Array2::zeros(image.dim());
    }
    let scale = 255.0 / (hi - lo);
    image.mapv(|v| ((v.clamp(lo, hi) - lo) * scale).round() as u8)
}

fn colorize(gray: &Array2<u8>, settings: &RenderSettings) -> RgbImage {
    let (height, width) = gray.dim();
    let lut = settings.palette.lut();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let mut v = gray[(y as usize, x as usize)];
        if settings.invert {
            v = 255 - v;
        }
        image::Rgb(lut[v as usize])
    })
}
