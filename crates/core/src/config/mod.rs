use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{registry::MAX_PROBE, CatalogKey, NamePattern, Result, VoiceLayerError};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub obs: ObsConfig,
    pub audio: AudioConfig,
    pub overlay: OverlayConfig,
}

impl AppConfig {
    /// Reads a TOML configuration file. Missing sections fall back to their
    /// defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text).map_err(|err| match err {
            VoiceLayerError::Configuration(msg) => {
                VoiceLayerError::config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|err| VoiceLayerError::config(err.to_string()))
    }

    /// Projects the values the control loop needs and validates them.
    pub fn loop_config(&self) -> Result<LoopConfig> {
        if self.overlay.scene.trim().is_empty() || self.overlay.group.trim().is_empty() {
            return Err(VoiceLayerError::config(
                "scene and group names must both be set",
            ));
        }
        let device = self.audio.device.trim();
        if device.is_empty() {
            return Err(VoiceLayerError::config("no capture device selected"));
        }

        Ok(LoopConfig {
            device: device.to_string(),
            thresholds: self.audio.thresholds()?,
            key: CatalogKey::new(&self.overlay.scene, &self.overlay.group),
            range: SelectionRange::new(self.overlay.range_start, self.overlay.range_end)?,
            stop_policy: self.overlay.stop_policy,
            sustain_frames: self.overlay.sustain_frames,
        })
    }

    pub fn name_pattern(&self) -> Result<NamePattern> {
        NamePattern::new(&self.overlay.name_pattern)
    }
}

/// Connection settings for the remote composition tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObsConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 4455,
            password: String::new(),
        }
    }
}

/// Configuration specific to the audio subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture device name, or `"default"` for the host default input.
    pub device: String,
    pub threshold_min: f64,
    pub threshold_max: f64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            threshold_min: 50.0,
            threshold_max: 500.0,
        }
    }
}

impl AudioConfig {
    pub fn thresholds(&self) -> Result<ThresholdConfig> {
        ThresholdConfig::new(self.threshold_min, self.threshold_max)
    }
}

/// Which overlay container to drive and which of its sources to use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub scene: String,
    pub group: String,
    pub range_start: u32,
    pub range_end: u32,
    /// Candidate source name template, `{n}` is replaced by the probe number.
    pub name_pattern: String,
    pub stop_policy: StopPolicy,
    /// Consecutive identical classifications required before a switch.
    /// `0` and `1` both mean "switch immediately".
    pub sustain_frames: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            scene: String::new(),
            group: String::new(),
            range_start: 1,
            range_end: MAX_PROBE,
            name_pattern: NamePattern::DEFAULT.to_string(),
            stop_policy: StopPolicy::default(),
            sustain_frames: 0,
        }
    }
}

/// Calibration window mapping loudness onto the visual states.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    min: f64,
    max: f64,
}

impl ThresholdConfig {
    /// Validates `min < max`. This is the only place the ordering is checked.
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() {
            return Err(VoiceLayerError::config("thresholds must be finite numbers"));
        }
        if min >= max {
            return Err(VoiceLayerError::config(format!(
                "threshold minimum ({min}) must be below the maximum ({max})"
            )));
        }
        Ok(Self { min, max })
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}

/// Inclusive numeric bounds over the discovered source numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionRange {
    start: u32,
    end: u32,
}

impl SelectionRange {
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start > end {
            return Err(VoiceLayerError::config(format!(
                "selection start ({start}) must not exceed its end ({end})"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn contains(&self, number: u32) -> bool {
        (self.start..=self.end).contains(&number)
    }
}

/// What happens to the last shown source when the loop stops normally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopPolicy {
    /// Keep the last shown source visible after the loop exits.
    #[default]
    LeaveVisible,
    /// Hide the shown source before the session is torn down.
    HideAll,
}

/// Everything [`crate::ControlLoop::start`] needs for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopConfig {
    pub device: String,
    pub thresholds: ThresholdConfig,
    pub key: CatalogKey,
    pub range: SelectionRange,
    pub stop_policy: StopPolicy,
    pub sustain_frames: u32,
}
