//! Render settings read by the compositor every frame.

use crate::palette::Palette;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid settings: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flip {
    #[default]
    None,
    /// Rows reversed.
    Vertical,
    /// Columns reversed.
    Horizontal,
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Hold the last output while an FFC is in progress.
    pub freeze_on_ffc: bool,
    /// Run an FFC after a still capture and save the first corrected frame.
    pub post_capture_ffc: bool,
    pub manual_span: bool,
    /// Span bounds used when `manual_span` is set.
    pub span_range: (f32, f32),
    pub palette: Palette,
    pub invert: bool,
    /// Quarter turns counter-clockwise, taken modulo 4.
    pub rotation: u8,
    pub flip: Flip,
    /// Integer upscale factor applied to recorded frames.
    pub recording_scale: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            freeze_on_ffc: false,
            post_capture_ffc: false,
            manual_span: false,
            span_range: (0.0, 65536.0),
            palette: Palette::None,
            invert: false,
            rotation: 0,
            flip: Flip::None,
            recording_scale: 1,
        }
    }
}

impl RenderSettings {
    pub fn from_toml_str(text: &str) -> Result<Self, SettingsError> {
        let settings: Self = toml::from_str(text)?;
        Ok(settings.normalized())
    }

    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), ?settings, "loaded render settings");
        Ok(settings)
    }

    /// Bring out-of-range values back into their valid domain.
    pub fn normalized(mut self) -> Self {
        self.rotation %= 4;
        self.recording_scale = self.recording_scale.max(1);
        self
    }
}
