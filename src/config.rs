use anyhow::{anyhow, Context, Result};
use chrono::format::{Item, StrftimeItems};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::{AcquisitionSettings, CameraSettings, SyntheticDriver, TriggerMode};
use crate::encoder::Codec;
use crate::queue::{DEFAULT_ENCODE_CAPACITY, DEFAULT_PREVIEW_CAPACITY};

const DEFAULT_OUTPUT_DIR: &str = "behav_vid";
const DEFAULT_FRAME_RATE: u32 = 10;
const DEFAULT_MAX_FRAME_RATE: u32 = 150;
const DEFAULT_HW_TRIGGER_FRAME_RATE: f64 = 200.0;
const DEFAULT_TRIGGER_LINE: &str = "Line3";
const DEFAULT_CODEC: Codec = Codec::Libx264;
const DEFAULT_QUALITY: u32 = 0;
const DEFAULT_VIDEO_EXTENSION: &str = "mp4";
const DEFAULT_GRAB_TIMEOUT_MS: u64 = 1000;
const DEFAULT_GRAB_POLL_MS: u64 = 100;
const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const DEFAULT_FFMPEG_PROGRAM: &str = "ffmpeg";
const DEFAULT_MAX_NUM_BUFFER: u32 = 16;
const DEFAULT_OUTPUT_QUEUE_SIZE: u32 = 8;
const DEFAULT_SYNTHETIC_CAMERAS: usize = 2;
const DEFAULT_SYNTHETIC_WIDTH: u32 = 640;
const DEFAULT_SYNTHETIC_HEIGHT: u32 = 480;

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RecorderConfigFile {
    output_dir: Option<PathBuf>,
    frame_rate: Option<u32>,
    max_frame_rate: Option<u32>,
    timestamp_format: Option<String>,
    camera_registry: Option<PathBuf>,
    acquisition: Option<AcquisitionConfigFile>,
    encoder: Option<EncoderConfigFile>,
    preview: Option<PreviewConfigFile>,
    synthetic: Option<SyntheticConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AcquisitionConfigFile {
    hardware_trigger: Option<bool>,
    hardware_trigger_frame_rate: Option<f64>,
    trigger_line: Option<String>,
    grab_timeout_ms: Option<u64>,
    grab_poll_ms: Option<u64>,
    max_num_buffer: Option<u32>,
    output_queue_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct EncoderConfigFile {
    codec: Option<String>,
    quality: Option<u32>,
    video_extension: Option<String>,
    write_timestamps: Option<bool>,
    queue_capacity: Option<usize>,
    ffmpeg_program: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PreviewConfigFile {
    enabled: Option<bool>,
    queue_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SyntheticConfigFile {
    cameras: Option<usize>,
    width: Option<u32>,
    height: Option<u32>,
    color: Option<bool>,
    trigger_rate: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub output_dir: PathBuf,
    pub frame_rate: u32,
    pub max_frame_rate: u32,
    pub timestamp_format: String,
    pub camera_registry: Option<PathBuf>,
    pub acquisition: AcquisitionConfig,
    pub encoder: EncoderConfig,
    pub preview: PreviewConfig,
    pub synthetic: SyntheticConfig,
}

#[derive(Debug, Clone)]
pub struct AcquisitionConfig {
    pub hardware_trigger: bool,
    pub hardware_trigger_frame_rate: f64,
    pub trigger_line: String,
    pub grab_timeout: Duration,
    pub grab_poll: Duration,
    pub max_num_buffer: u32,
    pub output_queue_size: u32,
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub codec: Codec,
    pub quality: u32,
    pub video_extension: String,
    pub write_timestamps: bool,
    pub queue_capacity: usize,
    pub ffmpeg_program: String,
}

#[derive(Debug, Clone)]
pub struct PreviewConfig {
    pub enabled: bool,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub cameras: usize,
    pub width: u32,
    pub height: u32,
    pub color: bool,
    /// Simulated trigger pulse rate. `None` leaves hardware-triggered cameras dark.
    pub trigger_rate: Option<f64>,
}

impl SyntheticConfig {
    pub fn driver(&self) -> SyntheticDriver {
        SyntheticDriver::uniform(self.cameras, self.width, self.height, self.color)
            .with_trigger_rate(self.trigger_rate)
    }
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self::assemble(RecorderConfigFile::default(), DEFAULT_CODEC)
    }
}

impl RecorderConfig {
    /// Defaults, then the file named by `RECORDER_CONFIG`, then `RECORDER_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RECORDER_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load one config file without environment overrides.
    pub fn from_path(path: &Path) -> Result<Self> {
        let mut cfg = Self::from_file(read_config_file(path)?)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RecorderConfigFile) -> Result<Self> {
        let codec = match file.encoder.as_ref().and_then(|e| e.codec.as_deref()) {
            Some(name) => name.parse()?,
            None => DEFAULT_CODEC,
        };
        Ok(Self::assemble(file, codec))
    }

    fn assemble(file: RecorderConfigFile, codec: Codec) -> Self {
        let acquisition = file.acquisition.unwrap_or_default();
        let encoder = file.encoder.unwrap_or_default();
        let preview = file.preview.unwrap_or_default();
        let synthetic = file.synthetic.unwrap_or_default();
        Self {
            output_dir: file
                .output_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR)),
            frame_rate: file.frame_rate.unwrap_or(DEFAULT_FRAME_RATE),
            max_frame_rate: file.max_frame_rate.unwrap_or(DEFAULT_MAX_FRAME_RATE),
            timestamp_format: file
                .timestamp_format
                .unwrap_or_else(|| DEFAULT_TIMESTAMP_FORMAT.to_string()),
            camera_registry: file.camera_registry,
            acquisition: AcquisitionConfig {
                hardware_trigger: acquisition.hardware_trigger.unwrap_or(false),
                hardware_trigger_frame_rate: acquisition
                    .hardware_trigger_frame_rate
                    .unwrap_or(DEFAULT_HW_TRIGGER_FRAME_RATE),
                trigger_line: acquisition
                    .trigger_line
                    .unwrap_or_else(|| DEFAULT_TRIGGER_LINE.to_string()),
                grab_timeout: Duration::from_millis(
                    acquisition.grab_timeout_ms.unwrap_or(DEFAULT_GRAB_TIMEOUT_MS),
                ),
                grab_poll: Duration::from_millis(
                    acquisition.grab_poll_ms.unwrap_or(DEFAULT_GRAB_POLL_MS),
                ),
                max_num_buffer: acquisition.max_num_buffer.unwrap_or(DEFAULT_MAX_NUM_BUFFER),
                output_queue_size: acquisition
                    .output_queue_size
                    .unwrap_or(DEFAULT_OUTPUT_QUEUE_SIZE),
            },
            encoder: EncoderConfig {
                codec,
                quality: encoder.quality.unwrap_or(DEFAULT_QUALITY),
                video_extension: encoder
                    .video_extension
                    .unwrap_or_else(|| DEFAULT_VIDEO_EXTENSION.to_string()),
                write_timestamps: encoder.write_timestamps.unwrap_or(false),
                queue_capacity: encoder.queue_capacity.unwrap_or(DEFAULT_ENCODE_CAPACITY),
                ffmpeg_program: encoder
                    .ffmpeg_program
                    .unwrap_or_else(|| DEFAULT_FFMPEG_PROGRAM.to_string()),
            },
            preview: PreviewConfig {
                enabled: preview.enabled.unwrap_or(true),
                queue_capacity: preview.queue_capacity.unwrap_or(DEFAULT_PREVIEW_CAPACITY),
            },
            synthetic: SyntheticConfig {
                cameras: synthetic.cameras.unwrap_or(DEFAULT_SYNTHETIC_CAMERAS),
                width: synthetic.width.unwrap_or(DEFAULT_SYNTHETIC_WIDTH),
                height: synthetic.height.unwrap_or(DEFAULT_SYNTHETIC_HEIGHT),
                color: synthetic.color.unwrap_or(false),
                trigger_rate: synthetic.trigger_rate,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("RECORDER_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(fps) = std::env::var("RECORDER_FPS") {
            self.frame_rate = fps
                .trim()
                .parse()
                .map_err(|_| anyhow!("RECORDER_FPS must be an integer frame rate"))?;
        }
        if let Ok(codec) = std::env::var("RECORDER_CODEC") {
            if !codec.trim().is_empty() {
                self.encoder.codec = codec.parse()?;
            }
        }
        if let Ok(quality) = std::env::var("RECORDER_QUALITY") {
            self.encoder.quality = quality
                .trim()
                .parse()
                .map_err(|_| anyhow!("RECORDER_QUALITY must be a non-negative integer"))?;
        }
        if let Ok(flag) = std::env::var("RECORDER_HW_TRIGGER") {
            self.acquisition.hardware_trigger = parse_flag("RECORDER_HW_TRIGGER", &flag)?;
        }
        if let Ok(flag) = std::env::var("RECORDER_WRITE_TIMESTAMPS") {
            self.encoder.write_timestamps = parse_flag("RECORDER_WRITE_TIMESTAMPS", &flag)?;
        }
        if let Ok(timeout) = std::env::var("RECORDER_GRAB_TIMEOUT_MS") {
            let ms: u64 = timeout.trim().parse().map_err(|_| {
                anyhow!("RECORDER_GRAB_TIMEOUT_MS must be an integer number of milliseconds")
            })?;
            self.acquisition.grab_timeout = Duration::from_millis(ms);
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.max_frame_rate == 0 {
            return Err(anyhow!("max_frame_rate must be greater than zero"));
        }
        if self.frame_rate == 0 || self.frame_rate > self.max_frame_rate {
            return Err(anyhow!(
                "frame_rate must be within 1..={}, got {}",
                self.max_frame_rate,
                self.frame_rate
            ));
        }
        if self.acquisition.hardware_trigger_frame_rate <= 0.0 {
            return Err(anyhow!("hardware_trigger_frame_rate must be positive"));
        }
        if self.acquisition.grab_timeout.is_zero() {
            return Err(anyhow!("grab timeout must be greater than zero"));
        }
        if self.acquisition.grab_poll.is_zero()
            || self.acquisition.grab_poll > self.acquisition.grab_timeout
        {
            return Err(anyhow!(
                "grab poll interval must be within 1..={} ms",
                self.acquisition.grab_timeout.as_millis()
            ));
        }
        if self.encoder.queue_capacity == 0 || self.preview.queue_capacity == 0 {
            return Err(anyhow!("queue capacities must be greater than zero"));
        }
        self.encoder.video_extension = self
            .encoder
            .video_extension
            .trim_start_matches('.')
            .to_string();
        if self.encoder.video_extension.is_empty() {
            return Err(anyhow!("video_extension must not be empty"));
        }
        if self.timestamp_format.trim().is_empty() {
            return Err(anyhow!("timestamp_format must not be empty"));
        }
        if StrftimeItems::new(&self.timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(anyhow!(
                "timestamp_format '{}' is not a valid strftime pattern",
                self.timestamp_format
            ));
        }
        if let Some(rate) = self.synthetic.trigger_rate {
            if rate <= 0.0 {
                return Err(anyhow!("synthetic trigger_rate must be positive"));
            }
        }
        Ok(())
    }

    /// Clamp a requested frame rate into `1..=max_frame_rate`.
    pub fn clamp_frame_rate(&self, requested: u32) -> u32 {
        let clamped = requested.clamp(1, self.max_frame_rate);
        if clamped != requested {
            log::info!(
                "RecorderConfig: frame rate {} clamped to {}",
                requested,
                clamped
            );
        }
        clamped
    }

    pub fn trigger_mode(&self) -> TriggerMode {
        if self.acquisition.hardware_trigger {
            TriggerMode::Hardware
        } else {
            TriggerMode::FreeRun
        }
    }

    pub fn acquisition_settings(&self) -> AcquisitionSettings {
        AcquisitionSettings {
            trigger: self.trigger_mode(),
            frame_rate: self.frame_rate as f64,
            hardware_trigger_frame_rate: self.acquisition.hardware_trigger_frame_rate,
            trigger_line: self.acquisition.trigger_line.clone(),
            max_num_buffer: self.acquisition.max_num_buffer,
            output_queue_size: self.acquisition.output_queue_size,
        }
    }
}

/// Settings file: camera entries keyed by camera name plus a few general keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsFile {
    #[serde(rename = "HW_trigg", default, skip_serializing_if = "Option::is_none")]
    pub hardware_trigger: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crf: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_path: Option<PathBuf>,
    #[serde(flatten)]
    pub cameras: BTreeMap<String, CameraSettings>,
}

impl SettingsFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid settings file {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw)
            .with_context(|| format!("failed to write settings file {}", path.display()))
    }

    /// Override recording options carried by the general keys.
    pub fn apply_general(&self, cfg: &mut RecorderConfig) -> Result<()> {
        if let Some(hw) = self.hardware_trigger {
            cfg.acquisition.hardware_trigger = hw;
        }
        if let Some(crf) = self.crf {
            cfg.encoder.quality = crf;
        }
        if let Some(codec) = &self.codec {
            cfg.encoder.codec = codec.parse()?;
        }
        if let Some(fps) = self.fps {
            cfg.frame_rate = cfg.clamp_frame_rate(fps);
        }
        if let Some(dir) = &self.save_path {
            cfg.output_dir = dir.clone();
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RecorderConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("{} must be a boolean, got '{}'", name, other)),
    }
}
