//! # Persistence Module
//!
//! Host-side settings for the emulated peripherals and the savestate snapshot
//! of their guest-visible state.
//!
//! Settings live in `~/.config/eyemotion/peripherals.toml`. Every section and
//! field carries a default, so a missing or partial file degrades to defaults
//! instead of preventing startup. File IO reports through `color_eyre` with a
//! context message per step; semantic checks raise [`SettingsError`].

pub mod snapshot;

use crate::camera::backend::CameraHandler;
use crate::camera::types::CameraModel;
use crate::mapping::{MappingError, MappingSettings, PoseParams};
use crate::motion::backend::InputBackendKind;
use color_eyre::eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use snapshot::Snapshot;

pub const CONFIG_DIR: &str = ".config/eyemotion";
pub const SETTINGS_FILE: &str = "peripherals.toml";

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("update rate must be at least 1 Hz, got {0}")]
    UpdateRate(u32),

    #[error("gamepad deadzone {0} outside [0, 1)")]
    Deadzone(f32),

    #[error("tracking radius bounds {min}..{max} are empty")]
    RadiusBounds { min: f32, max: f32 },

    #[error("tracking threshold {name} = {value} outside its range")]
    Threshold { name: &'static str, value: f32 },

    #[error(transparent)]
    Mapping(#[from] MappingError),
}

/// `[camera]`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct CameraSettings {
    /// Model presented to the guest
    pub model: CameraModel,
    /// Host camera driver
    pub handler: CameraHandler,
    /// Host device path or name, empty for the handler's first device
    pub device: String,
}

/// `[motion]`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MotionSettings {
    pub backend: InputBackendKind,
    /// Minimum time a calibration stays in progress
    pub calibration_dwell_ms: u64,
    pub update_rate_hz: u32,
    pub gamepad_deadzone: f32,
    /// Connection polls the simulated tracked controller needs to confirm calibration
    pub real_calibration_polls: u32,
    pub pose: PoseParams,
}

impl Default for MotionSettings {
    fn default() -> Self {
        Self {
            backend: InputBackendKind::Null,
            calibration_dwell_ms: 500,
            update_rate_hz: 10,
            gamepad_deadzone: 0.1,
            real_calibration_polls: 3,
            pose: PoseParams::default(),
        }
    }
}

/// `[tracking]`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct TrackingSettings {
    /// Maximum angular distance from the target hue, in degrees
    pub hue_threshold_deg: f32,
    pub saturation_threshold: f32,
    /// Pixels darker than this are ignored
    pub value_threshold: f32,
    pub min_radius_px: f32,
    pub max_radius_px: f32,
    /// Share of all pixels above which a hue counts as crowded
    pub crowded_fraction: f32,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            hue_threshold_deg: 12.0,
            saturation_threshold: 0.4,
            value_threshold: 0.2,
            min_radius_px: 2.0,
            max_radius_px: 160.0,
            crowded_fraction: 0.02,
        }
    }
}

/// Everything in `peripherals.toml`
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default)]
#[serde(default)]
pub struct PeripheralSettings {
    pub camera: CameraSettings,
    pub motion: MotionSettings,
    pub tracking: TrackingSettings,
    pub mapping: MappingSettings,
}

impl PeripheralSettings {
    pub fn validate(&self) -> std::result::Result<(), SettingsError> {
        if self.motion.update_rate_hz == 0 {
            return Err(SettingsError::UpdateRate(0));
        }
        if !(0.0..1.0).contains(&self.motion.gamepad_deadzone) {
            return Err(SettingsError::Deadzone(self.motion.gamepad_deadzone));
        }
        let t = &self.tracking;
        if t.min_radius_px > t.max_radius_px {
            return Err(SettingsError::RadiusBounds {
                min: t.min_radius_px,
                max: t.max_radius_px,
            });
        }
        for (name, value, max) in [
            ("hue_threshold_deg", t.hue_threshold_deg, 180.0),
            ("saturation_threshold", t.saturation_threshold, 1.0),
            ("value_threshold", t.value_threshold, 1.0),
            ("crowded_fraction", t.crowded_fraction, 1.0),
        ] {
            if !(0.0..=max).contains(&value) {
                return Err(SettingsError::Threshold { name, value });
            }
        }
        self.mapping.validate()?;
        Ok(())
    }

    /// Default settings file location
    pub fn default_path() -> PathBuf {
        let mut path = get_home_dir();
        path.push(CONFIG_DIR);
        path.push(SETTINGS_FILE);
        path
    }

    /// Load from the default location
    pub async fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()).await
    }

    /// Load from `path`, falling back to defaults when the file is missing
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
        {
            warn!("Settings file {} does not exist, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read settings file: {}", e))?;
        let settings: Self =
            toml::from_str(&content).map_err(|e| eyre!("Failed to parse settings file: {}", e))?;
        settings
            .validate()
            .map_err(|e| eyre!("Invalid settings in {}: {}", path.display(), e))?;

        debug!("Settings loaded from {}", path.display());
        Ok(settings)
    }

    pub async fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path()).await
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize settings: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write settings file: {}", e))?;

        info!("Settings saved to {}", path.display());
        Ok(())
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

/// Write the default settings file if none exists yet
pub async fn ensure_default() -> Result<PathBuf> {
    let path = PeripheralSettings::default_path();
    ensure_default_at(&path).await?;
    Ok(path)
}

pub async fn ensure_default_at(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path)
        .await
        .map_err(|e| eyre!("Failed to check if settings file exists: {}", e))?
    {
        return Ok(());
    }
    info!("Creating default settings at {}", path.display());
    PeripheralSettings::default().save_to(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("eyemotion-{}-{}", name, std::process::id()));
        path.push(SETTINGS_FILE);
        path
    }

    #[test]
    fn defaults_validate() {
        assert_eq!(PeripheralSettings::default().validate(), Ok(()));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let text = r#"
            [motion]
            backend = "Pointer"
            calibration_dwell_ms = 100

            [tracking]
            hue_threshold_deg = 20.0
        "#;
        let settings: PeripheralSettings = toml::from_str(text).unwrap();
        assert_eq!(settings.motion.backend, InputBackendKind::Pointer);
        assert_eq!(settings.motion.calibration_dwell_ms, 100);
        assert_eq!(settings.motion.update_rate_hz, 10);
        assert_eq!(settings.tracking.hue_threshold_deg, 20.0);
        assert_eq!(settings.camera, CameraSettings::default());
        assert_eq!(settings.mapping, MappingSettings::default());
    }

    #[test]
    fn bad_values_are_rejected() {
        let mut settings = PeripheralSettings::default();
        settings.motion.update_rate_hz = 0;
        assert_eq!(settings.validate(), Err(SettingsError::UpdateRate(0)));

        let mut settings = PeripheralSettings::default();
        settings.tracking.min_radius_px = 50.0;
        settings.tracking.max_radius_px = 10.0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::RadiusBounds { .. })
        ));

        let mut settings = PeripheralSettings::default();
        settings.mapping.pointer.bindings.clear();
        assert!(matches!(settings.validate(), Err(SettingsError::Mapping(_))));
    }

    #[tokio::test]
    async fn save_then_load() {
        let path = temp_path("settings");
        let mut settings = PeripheralSettings::default();
        settings.camera.model = CameraModel::EyeToy;
        settings.motion.backend = InputBackendKind::Gamepad;
        settings.save_to(&path).await.unwrap();

        let loaded = PeripheralSettings::load_from(&path).await.unwrap();
        assert_eq!(loaded, settings);
        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }

    #[tokio::test]
    async fn missing_file_gives_defaults_and_ensure_writes_one() {
        let path = temp_path("ensure");
        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
        assert_eq!(
            PeripheralSettings::load_from(&path).await.unwrap(),
            PeripheralSettings::default()
        );
        ensure_default_at(&path).await.unwrap();
        assert!(path.exists());
        let _ = tokio::fs::remove_dir_all(path.parent().unwrap()).await;
    }
}
