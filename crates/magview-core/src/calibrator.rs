//! Blind-pixel detection from two FFC-corrected captures.
//!
//! A healthy pixel follows the scene between two captures taken at different
//! scene temperatures; a dead or stuck pixel barely changes. The mask marks
//! pixels whose normalized absolute difference falls below the tolerance.

use image::{GrayImage, ImageBuffer, Luma};
use magview_hw::{FfcReference, FrameSample};
use ndarray::{Array2, Zip};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_TOLERANCE: f32 = 0.05;
pub const DEFECT: u8 = 255;

/// Hand-picked defects applied until a detection run replaces them.
const DEFAULT_DEFECTS: [(usize, usize); 3] = [(12, 37), (88, 101), (140, 5)];

#[derive(Error, Debug)]
pub enum CalibrationError {
    #[error("no capture has been made yet")]
    NoCaptureYet,
    #[error("both captures already taken; reset before capturing again")]
    SequenceComplete,
    #[error("frame shape {got:?} does not match {expected:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("image file error: {0}")]
    Image(#[from] image::ImageError),
}

/// `(height, width)` defect matrix; every element is 0 or 255.
#[derive(Debug, Clone, PartialEq)]
pub struct BlindPixelMask {
    data: Array2<u8>,
}

impl BlindPixelMask {
    /// Mask with no defects.
    pub fn empty(width: usize, height: usize) -> Self {
        Self {
            data: Array2::zeros((height, width)),
        }
    }

    /// Static defect set, clipped to the frame.
    pub fn factory_default(width: usize, height: usize) -> Self {
        let mut mask = Self::empty(width, height);
        for (col, row) in DEFAULT_DEFECTS {
            if row < height && col < width {
                mask.data[(row, col)] = DEFECT;
            }
        }
        mask
    }

    /// Build from an arbitrary matrix; any nonzero element becomes a defect.
    pub fn from_array(data: Array2<u8>) -> Self {
        Self {
            data: data.mapv(|v| if v != 0 { DEFECT } else { 0 }),
        }
    }

    pub fn as_array(&self) -> &Array2<u8> {
        &self.data
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn defect_count(&self) -> usize {
        self.data.iter().filter(|&&v| v == DEFECT).count()
    }

    pub fn is_empty(&self) -> bool {
        self.defect_count() == 0
    }

    pub fn to_image(&self) -> GrayImage {
        let (height, width) = self.data.dim();
        GrayImage::from_fn(width as u32, height as u32, |x, y| {
            Luma([self.data[(y as usize, x as usize)]])
        })
    }

    pub fn save_png(&self, path: &Path) -> Result<(), CalibrationError> {
        self.to_image().save(path)?;
        tracing::info!(path = %path.display(), defects = self.defect_count(), "saved blind-pixel mask");
        Ok(())
    }

    /// Load a mask previously written by [`save_png`](Self::save_png).
    pub fn load_png(path: &Path) -> Result<Self, CalibrationError> {
        let gray = image::open(path)?.to_luma8();
        let (width, height) = gray.dimensions();
        let data = Array2::from_shape_fn((height as usize, width as usize), |(r, c)| {
            gray.get_pixel(c as u32, r as u32).0[0]
        });
        Ok(Self::from_array(data))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureProgress {
    /// One capture stored; another is needed.
    FirstCaptured,
    /// Both captures stored and the mask recomputed.
    MaskReady { defects: usize },
}

pub struct BlindPixelCalibrator {
    width: usize,
    height: usize,
    captures: Vec<Array2<f32>>,
    normalized: Option<Array2<f32>>,
    tolerance: f32,
    mask: BlindPixelMask,
}

impl BlindPixelCalibrator {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            captures: Vec::with_capacity(2),
            normalized: None,
            tolerance: DEFAULT_TOLERANCE,
            mask: BlindPixelMask::factory_default(width, height),
        }
    }

    pub fn mask(&self) -> &BlindPixelMask {
        &self.mask
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    /// FFC-corrected captures stored so far (at most two).
    pub fn captures(&self) -> &[Array2<f32>] {
        &self.captures
    }

    /// Store `frame - ffc`. The second call computes the mask.
    pub fn capture_step(
        &mut self,
        frame: &FrameSample,
        ffc: &FfcReference,
    ) -> Result<CaptureProgress, CalibrationError> {
        if self.captures.len() >= 2 {
            return Err(CalibrationError::SequenceComplete);
        }
        let expected = (self.height, self.width);
        for got in [frame.image.dim(), ffc.image.dim()] {
            if got != expected {
                return Err(CalibrationError::ShapeMismatch { expected, got });
            }
        }

        self.captures.push(&frame.image - &*ffc.image);
        tracing::info!(
            step = self.captures.len(),
            frame = frame.frame_index,
            "blind-pixel capture stored"
        );

        if self.captures.len() < 2 {
            return Ok(CaptureProgress::FirstCaptured);
        }
        self.normalized = Some(normalized_difference(&self.captures[0], &self.captures[1]));
        self.rebuild_mask();
        Ok(CaptureProgress::MaskReady {
            defects: self.mask.defect_count(),
        })
    }

    /// Recompute the mask from the stored difference. Clamped to [0, 1].
    pub fn set_tolerance(&mut self, tolerance: f32) -> Result<&BlindPixelMask, CalibrationError> {
        if self.normalized.is_none() {
            return Err(CalibrationError::NoCaptureYet);
        }
        self.tolerance = tolerance.clamp(0.0, 1.0);
        self.rebuild_mask();
        Ok(&self.mask)
    }

    /// Write each stored capture as a 16-bit grayscale PNG (`<stem>-<n>.png`).
    ///
    /// Values are clamped to the `u16` range.
    pub fn export_captures(&self, dir: &Path, stem: &str) -> Result<Vec<PathBuf>, CalibrationError> {
        if self.captures.is_empty() {
            return Err(CalibrationError::NoCaptureYet);
        }
        let mut written = Vec::with_capacity(self.captures.len());
        for (i, capture) in self.captures.iter().enumerate() {
            let (height, width) = capture.dim();
            let img: ImageBuffer<Luma<u16>, Vec<u16>> =
                ImageBuffer::from_fn(width as u32, height as u32, |x, y| {
                    Luma([capture[(y as usize, x as usize)].round().clamp(0.0, 65535.0) as u16])
                });
            let path = dir.join(format!("{stem}-{}.png", i + 1));
            img.save(&path)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Drop stored captures. The current mask and the difference it was
    /// computed from stay in effect, so the tolerance can still be adjusted.
    pub fn reset(&mut self) {
        self.captures.clear();
    }

    fn rebuild_mask(&mut self) {
        let Some(normalized) = &self.normalized else {
            return;
        };
        let tolerance = self.tolerance;
        self.mask = BlindPixelMask {
            data: normalized.mapv(|v| if v < tolerance { DEFECT } else { 0 }),
        };
        tracing::info!(
            tolerance,
            defects = self.mask.defect_count(),
            "blind-pixel mask updated"
        );
    }
}

/// `|b - a|` rescaled to [0, 1]. A flat difference maps to all ones.
fn normalized_difference(a: &Array2<f32>, b: &Array2<f32>) -> Array2<f32> {
    let mut diff = Array2::zeros(a.dim());
    Zip::from(&mut diff)
        .and(a)
        .and(b)
        .for_each(|d, &a, &b| *d = (b - a).abs());

    let min = diff.iter().copied().fold(f32::INFINITY, f32::min);
    let max = diff.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !(max > min) {
        return Array2::ones(a.dim());
    }
    let span = max - min;
    diff.mapv_into(|v| (v - min) / span)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: usize, height: usize, f: impl Fn(usize, usize) -> f32) -> FrameSample {
        FrameSample::synthetic(Array2::from_shape_fn((height, width), |(r, c)| f(r, c)))
    }

    fn zero_ffc(width: usize, height: usize) -> FfcReference {
        FfcReference::zeros(width, height)
    }

    #[test]
    fn test_two_captures_mark_stuck_pixel() {
        let mut cal = BlindPixelCalibrator::new(8, 6);
        let ffc = zero_ffc(8, 6);
        let cold = frame(8, 6, |_, _| 1000.0);
        let hot = frame(8, 6, |r, c| if (r, c) == (2, 5) { 1000.0 } else { 1500.0 + (r + c) as f32 });

        assert_eq!(cal.capture_step(&cold, &ffc).unwrap(), CaptureProgress::FirstCaptured);
        assert_eq!(
            cal.capture_step(&hot, &ffc).unwrap(),
            CaptureProgress::MaskReady { defects: 1 }
        );
        assert_eq!(cal.mask().as_array()[(2, 5)], DEFECT);
    }

    #[test]
    fn test_third_capture_rejected() {
        let mut cal = BlindPixelCalibrator::new(4, 4);
        let ffc = zero_ffc(4, 4);
        cal.capture_step(&frame(4, 4, |_, _| 1.0), &ffc).unwrap();
        cal.capture_step(&frame(4, 4, |r, _| r as f32), &ffc).unwrap();
        let before = cal.captures().to_vec();
        assert!(matches!(
            cal.capture_step(&frame(4, 4, |_, _| 9.0), &ffc),
            Err(CalibrationError::SequenceComplete)
        ));
        assert_eq!(cal.captures(), before.as_slice());

        cal.reset();
        assert!(cal.captures().is_empty());
        assert!(cal.capture_step(&frame(4, 4, |_, _| 9.0), &ffc).is_ok());
    }

    #[test]
    fn test_mask_values_binary_for_any_tolerance() {
        let mut cal = BlindPixelCalibrator::new(5, 5);
        let ffc = zero_ffc(5, 5);
        cal.capture_step(&frame(5, 5, |_, _| 0.0), &ffc).unwrap();
        cal.capture_step(&frame(5, 5, |r, c| (r * 5 + c) as f32), &ffc).unwrap();
        for t in [-1.0, 0.0, 0.05, 0.3, 0.5, 1.0, 2.0] {
            let mask = cal.set_tolerance(t).unwrap();
            assert!(mask.as_array().iter().all(|&v| v == 0 || v == DEFECT));
        }
        assert_eq!(cal.tolerance(), 1.0);
        // Every pixel but the largest difference is below tolerance 1.0.
        assert_eq!(cal.mask().defect_count(), 24);
    }

    #[test]
    fn test_flat_difference_means_no_defects() {
        let mut cal = BlindPixelCalibrator::new(3, 3);
        let ffc = zero_ffc(3, 3);
        cal.capture_step(&frame(3, 3, |_, _| 10.0), &ffc).unwrap();
        cal.capture_step(&frame(3, 3, |_, _| 20.0), &ffc).unwrap();
        assert!(cal.mask().is_empty());
        assert!(cal.set_tolerance(1.0).unwrap().is_empty());
    }

    #[test]
    fn test_tolerance_adjustable_after_reset() {
        let mut cal = BlindPixelCalibrator::new(5, 5);
        let ffc = zero_ffc(5, 5);
        cal.capture_step(&frame(5, 5, |_, _| 0.0), &ffc).unwrap();
        cal.capture_step(&frame(5, 5, |r, c| (r * 5 + c) as f32), &ffc).unwrap();
        cal.reset();
        assert!(cal.captures().is_empty());

        // diff ramps 0..=24, so normalized < 0.5 holds for diff 0..=11.
        assert_eq!(cal.set_tolerance(0.5).unwrap().defect_count(), 12);
        assert_eq!(cal.mask().defect_count(), 12);
    }

    #[test]
    fn test_tolerance_before_capture() {
        let mut cal = BlindPixelCalibrator::new(3, 3);
        assert!(matches!(cal.set_tolerance(0.1), Err(CalibrationError::NoCaptureYet)));
    }

    #[test]
    fn test_shape_mismatch() {
        let mut cal = BlindPixelCalibrator::new(4, 4);
        let result = cal.capture_step(&frame(3, 4, |_, _| 0.0), &zero_ffc(4, 4));
        assert!(matches!(result, Err(CalibrationError::ShapeMismatch { .. })));
        assert!(cal.captures().is_empty());
    }

    #[test]
    fn test_ffc_subtracted_before_storing() {
        let mut cal = BlindPixelCalibrator::new(2, 2);
        let ffc = FfcReference::from_frame(&frame(2, 2, |_, _| 800.0));
        cal.capture_step(&frame(2, 2, |_, _| 1000.0), &ffc).unwrap();
        assert!(cal.captures()[0].iter().all(|&v| v == 200.0));
    }

    #[test]
    fn test_mask_png_round_trip_and_export() {
        let dir = std::env::temp_dir().join(format!("magview-cal-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mask = BlindPixelMask::factory_default(160, 120);
        let path = dir.join("mask.png");
        mask.save_png(&path).unwrap();
        assert_eq!(BlindPixelMask::load_png(&path).unwrap(), mask);

        let mut cal = BlindPixelCalibrator::new(3, 2);
        assert!(matches!(cal.export_captures(&dir, "cap"), Err(CalibrationError::NoCaptureYet)));
        cal.capture_step(&frame(3, 2, |_, _| -5.0), &zero_ffc(3, 2)).unwrap();
        let written = cal.export_captures(&dir, "cap").unwrap();
        assert_eq!(written, vec![dir.join("cap-1.png")]);
        let img = image::open(&written[0]).unwrap().to_luma16();
        assert_eq!(img.get_pixel(0, 0).0, [0]);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_factory_default_clipped() {
        let mask = BlindPixelMask::factory_default(160, 120);
        assert_eq!(mask.defect_count(), 3);
        assert_eq!(mask.as_array()[(37, 12)], DEFECT);
        assert_eq!(BlindPixelMask::factory_default(20, 20).defect_count(), 0);
    }
}
