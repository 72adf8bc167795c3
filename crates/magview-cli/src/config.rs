use crate::engine::{EngineOptions, FfcMode};
use magview_core::{calibrator::DEFAULT_TOLERANCE, RenderSettings, SettingsError};
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, loaded from environment variables.
pub struct Config {
    /// Automatic FFC policy (default: temperature).
    pub ffc_mode: FfcMode,
    /// Period for `FfcMode::Interval`, in seconds.
    pub ffc_interval_secs: u64,
    /// Optional TOML file with render settings.
    pub settings_path: Option<PathBuf>,
    /// Where captures, recordings and masks are written.
    pub output_dir: PathBuf,
    pub blind_pixel_tolerance: f32,
}

impl Config {
    /// Load configuration from `MAGVIEW_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let ffc_mode = match var("MAGVIEW_FFC_MODE") {
            Some(value) => value.parse().unwrap_or_else(|e: String| {
                tracing::warn!(error = %e, "ignoring MAGVIEW_FFC_MODE");
                FfcMode::Temperature
            }),
            None => FfcMode::Temperature,
        };

        Self {
            ffc_mode,
            ffc_interval_secs: parse_or(var("MAGVIEW_FFC_INTERVAL_SECS"), 60),
            settings_path: var("MAGVIEW_SETTINGS").map(PathBuf::from),
            output_dir: var("MAGVIEW_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            blind_pixel_tolerance: parse_or(var("MAGVIEW_BLIND_PIXEL_TOLERANCE"), DEFAULT_TOLERANCE),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            ffc_mode: self.ffc_mode,
            ffc_interval: Duration::from_secs(self.ffc_interval_secs.max(1)),
        }
    }

    /// Settings from `settings_path`, or defaults when unset.
    pub fn render_settings(&self) -> Result<RenderSettings, SettingsError> {
        match &self.settings_path {
            Some(path) => RenderSettings::load(path),
            None => Ok(RenderSettings::default()),
        }
    }

    /// Resolve a file name against `output_dir` unless it is already absolute.
    pub fn output_path(&self, name: impl Into<PathBuf>) -> PathBuf {
        let name = name.into();
        if name.is_absolute() {
            name
        } else {
            self.output_dir.join(name)
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config.ffc_mode, FfcMode::Temperature);
        assert_eq!(config.ffc_interval_secs, 60);
        assert!(config.settings_path.is_none());
        assert_eq!(config.output_dir, PathBuf::from("."));
        assert_eq!(config.blind_pixel_tolerance, 0.05);
        assert_eq!(config.render_settings().unwrap(), RenderSettings::default());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("MAGVIEW_FFC_MODE", "interval"),
            ("MAGVIEW_FFC_INTERVAL_SECS", "15"),
            ("MAGVIEW_OUTPUT_DIR", "/var/lib/magview"),
            ("MAGVIEW_BLIND_PIXEL_TOLERANCE", "0.2"),
        ]));
        assert_eq!(config.ffc_mode, FfcMode::Interval);
        assert_eq!(config.engine_options().ffc_interval, Duration::from_secs(15));
        assert_eq!(config.output_path("a.png"), PathBuf::from("/var/lib/magview/a.png"));
        assert_eq!(config.output_path("/tmp/b.png"), PathBuf::from("/tmp/b.png"));
        assert_eq!(config.blind_pixel_tolerance, 0.2);
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = Config::from_lookup(lookup(&[
            ("MAGVIEW_FFC_MODE", "often"),
            ("MAGVIEW_FFC_INTERVAL_SECS", "soon"),
        ]));
        assert_eq!(config.ffc_mode, FfcMode::Temperature);
        assert_eq!(config.ffc_interval_secs, 60);
    }
}
