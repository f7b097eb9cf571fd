//! What gets written next to the videos

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::camera::{CameraConfig, CameraId};
use crate::frame::TimebaseMapping;

const VIDEOS_FOLDER: &str = "synchronized_videos";
const TIMESTAMPS_FOLDER: &str = "timestamps";

/// A control-plane request to start recording.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordingRequest {
    /// Defaults to the local start time, e.g. `2026-10-16_14-03-59`.
    pub recording_name: Option<String>,
    /// Appended to the generated or given name.
    pub name_tag: Option<String>,
    /// Overrides the configured recordings directory.
    pub base_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub recording_uuid: Uuid,
    pub recording_name: String,
    pub recording_folder: PathBuf,
    pub camera_configs: Vec<CameraConfig>,
    pub start_time: DateTime<Utc>,
}

impl RecordingInfo {
    pub fn new(request: &RecordingRequest, base_directory: &Path, camera_configs: Vec<CameraConfig>) -> Self {
        let start_time = Utc::now();
        let mut recording_name = request
            .recording_name
            .clone()
            .unwrap_or_else(|| start_time.with_timezone(&Local).format("%Y-%m-%d_%H-%M-%S").to_string());
        if let Some(tag) = request.name_tag.as_deref().filter(|tag| !tag.is_empty()) {
            recording_name = format!("{recording_name}_{tag}");
        }
        let base = request.base_directory.as_deref().unwrap_or(base_directory);
        Self {
            recording_uuid: Uuid::new_v4(),
            recording_folder: base.join(&recording_name),
            recording_name,
            camera_configs,
            start_time,
        }
    }

    pub fn videos_folder(&self) -> PathBuf {
        self.recording_folder.join(VIDEOS_FOLDER)
    }

    /// `<folder>/synchronized_videos/<name>.camera.<id>.<ext>`
    pub fn video_path(&self, camera_id: CameraId, extension: &str) -> PathBuf {
        self.videos_folder()
            .join(format!("{}.camera.{camera_id}.{extension}", self.recording_name))
    }

    pub fn timestamps_path(&self) -> PathBuf {
        self.videos_folder()
            .join(TIMESTAMPS_FOLDER)
            .join(format!("{}_timestamps.csv", self.recording_name))
    }

    pub fn start_record_path(&self) -> PathBuf {
        self.recording_folder
            .join(format!("{}_recording_start.json", self.recording_name))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.recording_folder.join(format!("{}_info.json", self.recording_name))
    }
}

/// Time base of a recording, anchored at its first multi-frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingStartRecord {
    pub recording_name: String,
    pub first_multi_frame_number: u64,
    pub first_frame_monotonic_ns: u64,
    pub first_frame_utc: DateTime<Utc>,
    pub first_frame_local: String,
    pub timebase: TimebaseMapping,
}

impl RecordingStartRecord {
    pub fn new(recording_name: &str, first_multi_frame_number: u64, monotonic_ns: u64, timebase: TimebaseMapping) -> Self {
        Self {
            recording_name: recording_name.to_string(),
            first_multi_frame_number,
            first_frame_monotonic_ns: monotonic_ns,
            first_frame_utc: timebase.to_utc(monotonic_ns),
            first_frame_local: timebase.to_local_iso8601(monotonic_ns),
            timebase,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedVideo {
    pub camera_id: CameraId,
    pub path: PathBuf,
    pub frames: u64,
}

/// Written as `<name>_info.json` when a recording closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSummary {
    #[serde(flatten)]
    pub info: RecordingInfo,
    pub frame_count: u64,
    pub duration_s: f64,
    pub mean_framerate: Option<f64>,
    pub videos: Vec<RecordedVideo>,
}
