pub mod camera;
pub mod context;
pub mod error;
pub mod frame;
pub mod group;
pub mod pipeline;
pub mod recording;
pub mod shm;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::camera::{CameraConfig, CameraId, WorkerSpawner};
use crate::group::{CameraBufferLayout, CameraGroupSettings};
use crate::recording::default_writer_factory;
use crate::recording::writer::DEFAULT_JPEG_QUALITY;

pub use context::{StateSnapshot, SyncContext};
pub use error::{Result, SyncError};

/// Application configuration.
///
/// Loaded from defaults, then an optional TOML file, then `SYNCCAM__*`
/// environment variables (`SYNCCAM__PIPELINE__START_PAUSED=true`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub capture: CaptureConfig,
    pub pipeline: PipelineConfig,
    pub recording: RecordingConfig,
    pub logging: LoggingConfig,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub spawner: WorkerSpawner,
    /// Executable re-run for process workers, the running binary when unset.
    pub worker_binary: Option<PathBuf>,
    pub pin_workers_to_cores: bool,
    /// Budget for every synchronization wait.
    pub wait_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub camera_buffer: CameraBufferLayout,
    pub escape_budget_mb: usize,
    pub max_multi_frames: Option<u64>,
    pub start_paused: bool,
    pub preview_max_width: u32,
    pub preview_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub base_directory: PathBuf,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            pipeline: PipelineConfig::default(),
            recording: RecordingConfig::default(),
            logging: LoggingConfig::default(),
            cameras: (0..2).map(|id| CameraConfig::synthetic(CameraId(id))).collect(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            spawner: WorkerSpawner::Process,
            worker_binary: None,
            pin_workers_to_cores: false,
            wait_timeout_secs: 600,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            camera_buffer: CameraBufferLayout::default(),
            escape_budget_mb: 256,
            max_multi_frames: None,
            start_paused: false,
            preview_max_width: 640,
            preview_interval_ms: 50,
        }
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            base_directory: PathBuf::from("recordings"),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "synccam=info".into(),
        }
    }
}

impl Config {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("SYNCCAM").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Cameras keyed by id. A later entry with a repeated id wins.
    pub fn camera_map(&self) -> BTreeMap<CameraId, CameraConfig> {
        self.cameras
            .iter()
            .map(|config| (config.camera_id, config.clone()))
            .collect()
    }

    pub fn group_settings(&self) -> CameraGroupSettings {
        CameraGroupSettings {
            wait_timeout: Duration::from_secs(self.capture.wait_timeout_secs),
            camera_buffer: self.pipeline.camera_buffer,
            escape_budget_bytes: self.pipeline.escape_budget_mb * 1024 * 1024,
            spawner: self.capture.spawner.clone(),
            worker_binary: self.capture.worker_binary.clone(),
            pin_workers_to_cores: self.capture.pin_workers_to_cores,
            max_multi_frames: self.pipeline.max_multi_frames,
            start_paused: self.pipeline.start_paused,
            preview_max_width: self.pipeline.preview_max_width,
            preview_interval: Duration::from_millis(self.pipeline.preview_interval_ms),
            writer_factory: default_writer_factory(self.recording.jpeg_quality),
        }
    }
}
