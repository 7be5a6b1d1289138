use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::error::{FaceGateError, Result};
use crate::common::paths;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub models: ModelConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub recognizer: RecognizerConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CameraConfig {
    #[serde(default)]
    pub device_index: u32,
    #[serde(default = "default_camera_width")]
    pub width: u32,
    #[serde(default = "default_camera_height")]
    pub height: u32,
    #[serde(default = "default_warmup_frames")]
    pub warmup_frames: u32,
    #[serde(default = "default_warmup_delay")]
    pub warmup_delay_ms: u64,
}

fn default_camera_width() -> u32 { 640 }
fn default_camera_height() -> u32 { 480 }
fn default_warmup_frames() -> u32 { 3 }
fn default_warmup_delay() -> u64 { 50 }

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            width: default_camera_width(),
            height: default_camera_height(),
            warmup_frames: default_warmup_frames(),
            warmup_delay_ms: default_warmup_delay(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_detector_path")]
    pub detector_path: PathBuf,
    #[serde(default = "default_recognizer_path")]
    pub recognizer_path: PathBuf,
}

fn default_detector_path() -> PathBuf {
    paths::system_models_dir().join("face_detector.onnx")
}

fn default_recognizer_path() -> PathBuf {
    paths::system_models_dir().join("face_recognizer.onnx")
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            detector_path: default_detector_path(),
            recognizer_path: default_recognizer_path(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DetectorConfig {
    #[serde(default = "default_detector_input")]
    pub input_width: u32,
    #[serde(default = "default_detector_input")]
    pub input_height: u32,
    #[serde(default = "default_detection_confidence")]
    pub confidence: f32,
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
}

fn default_detector_input() -> u32 { 640 }
fn default_detection_confidence() -> f32 { 0.5 }
fn default_nms_iou() -> f32 { 0.45 }

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            input_width: default_detector_input(),
            input_height: default_detector_input(),
            confidence: default_detection_confidence(),
            nms_iou: default_nms_iou(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecognizerConfig {
    #[serde(default = "default_recognizer_input")]
    pub input_size: u32,
    #[serde(default = "default_normalization")]
    pub normalization_value: f32,
    #[serde(default = "default_true")]
    pub l2_normalize: bool,
}

fn default_recognizer_input() -> u32 { 112 }
fn default_normalization() -> f32 { 127.5 }
fn default_true() -> bool { true }

impl Default for RecognizerConfig {
    fn default() -> Self {
        Self {
            input_size: default_recognizer_input(),
            normalization_value: default_normalization(),
            l2_normalize: true,
        }
    }
}

/// Timing of a single capture and of the decision display afterwards.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_dwell")]
    pub dwell_ms: u64,
    #[serde(default = "default_cooldown")]
    pub cooldown_ms: u64,
}

fn default_dwell() -> u64 { 2200 }
fn default_cooldown() -> u64 { 7000 }

impl CaptureConfig {
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dwell_ms: default_dwell(),
            cooldown_ms: default_cooldown(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MatchingConfig {
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

fn default_threshold() -> f32 {
    crate::core::matcher::DEFAULT_THRESHOLD
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self { threshold: default_threshold() }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_storage_key")]
    pub key: String,
}

fn default_storage_key() -> String {
    crate::storage::ENROLLMENT_KEY.to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            key: default_storage_key(),
        }
    }
}

impl Config {
    /// Loads the explicit path if given, otherwise the first existing default
    /// location, otherwise built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from_path(path);
        }

        for candidate in [paths::local_config_file(), paths::system_config_file()] {
            if candidate.exists() {
                return Self::load_from_path(&candidate);
            }
        }

        tracing::debug!("No config file found, using built-in defaults");
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(FaceGateError::Config(format!(
                "Config file not found: {}", path.display()
            )));
        }

        tracing::info!("Loading config from: {}", path.display());
        let contents = std::fs::read_to_string(path)?;
        let config = Self::parse(&contents)?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| FaceGateError::Config(format!("Config parse error: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.camera.width == 0 || self.camera.width > 4096 {
            return Err(FaceGateError::Config(format!(
                "Camera width must be between 1 and 4096, got {}", self.camera.width
            )));
        }
        if self.camera.height == 0 || self.camera.height > 4096 {
            return Err(FaceGateError::Config(format!(
                "Camera height must be between 1 and 4096, got {}", self.camera.height
            )));
        }

        if !self.matching.threshold.is_finite() || self.matching.threshold <= 0.0 {
            return Err(FaceGateError::Config(format!(
                "Match threshold must be a positive number, got {}",
                self.matching.threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence) {
            return Err(FaceGateError::Config(format!(
                "Detection confidence must be between 0.0 and 1.0, got {}",
                self.detector.confidence
            )));
        }
        if !(0.0..=1.0).contains(&self.detector.nms_iou) {
            return Err(FaceGateError::Config(format!(
                "NMS IoU threshold must be between 0.0 and 1.0, got {}",
                self.detector.nms_iou
            )));
        }

        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(FaceGateError::Config(format!(
                "Detector input must be non-zero, got {}x{}",
                self.detector.input_width, self.detector.input_height
            )));
        }
        if self.recognizer.input_size == 0 || self.recognizer.input_size > 1024 {
            return Err(FaceGateError::Config(format!(
                "Recognizer input size must be between 1 and 1024, got {}",
                self.recognizer.input_size
            )));
        }
        if self.recognizer.normalization_value <= 0.0 {
            return Err(FaceGateError::Config(format!(
                "Recognizer normalization value must be positive, got {}",
                self.recognizer.normalization_value
            )));
        }

        if self.storage.key.trim().is_empty() {
            return Err(FaceGateError::Config("Storage key must not be empty".into()));
        }

        Ok(())
    }
}
