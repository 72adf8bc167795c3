//! magview-core — frame correction and compositing for thermal sensors.
//!
//! Turns raw radiometric frames into display images: FFC subtraction,
//! blind-pixel inpainting (Telea), span normalization, rotation/flip and
//! palette colorization. Also builds blind-pixel masks from two captures.

pub mod calibrator;
pub mod inpaint;
pub mod palette;
pub mod pipeline;
pub mod settings;
pub mod sink;
pub mod transform;

pub use calibrator::{BlindPixelCalibrator, BlindPixelMask, CalibrationError, CaptureProgress};
pub use palette::Palette;
pub use pipeline::{CaptureOutcome, Compositor, FfcController, FrameDisplayStats, PipelineError};
pub use settings::{Flip, RenderSettings, SettingsError};
pub use sink::{FfmpegBackend, MemoryBackend, RecordingBackend, RecordingSink};
