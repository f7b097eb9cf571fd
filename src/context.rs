//! Control-plane entry point: owns the global kill flag and at most one camera group

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::camera::{CameraConfig, CameraId};
use crate::error::{Result, SyncError};
use crate::group::ipc::GLOBAL_KILL;
use crate::group::{create_global_kill, CameraGroup, CameraGroupSettings, IpcMessage};
use crate::pipeline::PreviewFrame;
use crate::recording::{default_writer_factory, RecordingInfo, RecordingRequest, RecordingSummary, WriterFactory};
use crate::shm::{group_prefix, SharedFlagBlock};
use crate::Config;

/// What the control plane sees of the running system.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub camera_group_active: bool,
    pub camera_configs: Vec<CameraConfig>,
    pub cameras_connected: bool,
    pub frame_loop_paused: bool,
    pub loop_count: u64,
    pub latest_multi_frame_number: Option<u64>,
    pub recording: Option<RecordingInfo>,
}

pub struct SyncContext {
    config: Config,
    global_kill: SharedFlagBlock,
    /// Live configs, extracted ones once a group is running.
    camera_configs: ArcSwap<BTreeMap<CameraId, CameraConfig>>,
    group: Option<CameraGroup>,
    recording: Option<RecordingInfo>,
    writer_factory: WriterFactory,
    outbound: flume::Sender<IpcMessage>,
    messages: flume::Receiver<IpcMessage>,
}

impl SyncContext {
    pub fn new(config: Config) -> Result<Self> {
        let global_kill = create_global_kill(&group_prefix())?;
        let (outbound, messages) = flume::unbounded();
        Ok(Self {
            camera_configs: ArcSwap::from_pointee(config.camera_map()),
            writer_factory: default_writer_factory(config.recording.jpeg_quality),
            config,
            global_kill,
            group: None,
            recording: None,
            outbound,
            messages,
        })
    }

    /// Replace how video files are written, for groups created from now on.
    pub fn with_writer_factory(mut self, factory: WriterFactory) -> Self {
        self.writer_factory = factory;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn camera_configs(&self) -> Arc<BTreeMap<CameraId, CameraConfig>> {
        self.camera_configs.load_full()
    }

    pub fn camera_group(&self) -> Option<&CameraGroup> {
        self.group.as_ref()
    }

    /// Upstream messages from workers and the context itself.
    pub fn messages(&self) -> flume::Receiver<IpcMessage> {
        self.messages.clone()
    }

    fn settings(&self) -> CameraGroupSettings {
        CameraGroupSettings {
            writer_factory: self.writer_factory.clone(),
            ..self.config.group_settings()
        }
    }

    fn group(&self) -> Result<&CameraGroup> {
        self.group.as_ref().ok_or(SyncError::NoCameraGroup)
    }

    fn publish_state(&self) {
        let _ = self.outbound.try_send(IpcMessage::StateSnapshot(self.state_snapshot()));
    }

    /// Start a group for `configs`, closing any running one first.
    #[instrument(skip_all, fields(cameras = configs.len()))]
    pub fn create_camera_group(&mut self, configs: BTreeMap<CameraId, CameraConfig>) -> Result<()> {
        if self.global_kill.is_set(GLOBAL_KILL) {
            return Err(SyncError::Cancelled {
                what: "camera group creation".into(),
            });
        }
        self.close_camera_group()?;
        let group = CameraGroup::create(
            &configs,
            &self.global_kill.descriptor(),
            &self.settings(),
            self.outbound.clone(),
        )?;
        self.camera_configs.store(group.configs());
        self.group = Some(group);
        self.publish_state();
        Ok(())
    }

    /// Apply new configs in place when only settings changed; recreate the
    /// group when the camera set or an image shape changed.
    #[instrument(skip_all)]
    pub fn update_camera_group(&mut self, configs: BTreeMap<CameraId, CameraConfig>) -> Result<()> {
        let in_place = self.group.as_ref().map(|group| group.accepts_in_place(&configs));
        match in_place {
            Some(true) => {
                let group = self.group.as_mut().ok_or(SyncError::NoCameraGroup)?;
                group.update_configs(&configs)?;
                self.camera_configs.store(group.configs());
                self.publish_state();
                Ok(())
            }
            Some(false) => {
                info!("camera set or shape changed, recreating camera group");
                self.create_camera_group(configs)
            }
            None => self.create_camera_group(configs),
        }
    }

    /// Stops a running recording first.
    pub fn close_camera_group(&mut self) -> Result<()> {
        let Some(mut group) = self.group.take() else {
            return Ok(());
        };
        if let Some(recording) = self.recording.take() {
            match group.stop_recording() {
                Ok(summary) => info!(name = %recording.recording_name, frames = summary.frame_count, "recording stopped with the group"),
                Err(e) => warn!(name = %recording.recording_name, "recording did not finish cleanly: {}", e),
            }
        }
        let result = group.close();
        self.publish_state();
        result
    }

    pub fn start_recording(&mut self, request: RecordingRequest) -> Result<RecordingInfo> {
        if self.recording.is_some() {
            return Err(SyncError::Recording("a recording is already running".into()));
        }
        let group = self.group()?;
        let base_directory = request
            .base_directory
            .clone()
            .unwrap_or_else(|| self.config.recording.base_directory.clone());
        let info = RecordingInfo::new(&request, &base_directory, group.configs().values().cloned().collect());
        group.start_recording(info.clone())?;
        info!(name = %info.recording_name, folder = %info.recording_folder.display(), "recording started");

        self.recording = Some(info.clone());
        let _ = self.outbound.try_send(IpcMessage::RecordingInfo(info.clone()));
        self.publish_state();
        Ok(info)
    }

    /// Returns once every frame captured while recording is on disk.
    pub fn stop_recording(&mut self) -> Result<RecordingSummary> {
        let group = self.group()?;
        if self.recording.is_none() {
            return Err(SyncError::Recording("no recording is running".into()));
        }
        let summary = group.stop_recording();
        self.recording = None;
        self.publish_state();
        let summary = summary?;
        info!(name = %summary.info.recording_name, frames = summary.frame_count, "recording stopped");
        Ok(summary)
    }

    pub fn pause(&self) -> Result<()> {
        self.group()?.pause()
    }

    pub fn unpause(&self) -> Result<()> {
        self.group()?.unpause()
    }

    pub fn state_snapshot(&self) -> StateSnapshot {
        match &self.group {
            Some(group) => StateSnapshot {
                camera_group_active: true,
                camera_configs: group.configs().values().cloned().collect(),
                cameras_connected: group.ipc().cameras_connected(),
                frame_loop_paused: group.ipc().frame_loop_paused(),
                loop_count: group.loop_count(),
                latest_multi_frame_number: group.latest_multi_frame_number(),
                recording: self.recording.clone(),
            },
            None => StateSnapshot {
                camera_configs: self.camera_configs.load().values().cloned().collect(),
                ..Default::default()
            },
        }
    }

    pub fn latest_preview(&self) -> Option<PreviewFrame> {
        self.group.as_ref().and_then(CameraGroup::latest_preview)
    }

    /// Forward worker reports and check the group is still healthy. A group
    /// that went down is closed and its error returned.
    pub fn pump(&mut self) -> Result<()> {
        let Some(group) = self.group.as_mut() else {
            return Ok(());
        };
        let health = group
            .pump_reports()
            .and_then(|_| group.check_health())
            .and_then(|()| match group.ipc().should_continue() {
                true => Ok(()),
                false => Err(SyncError::Cancelled {
                    what: "camera group".into(),
                }),
            });
        if let Err(e) = health {
            warn!("camera group went down: {}", e);
            self.recording = None;
            if let Some(mut group) = self.group.take() {
                if let Err(close_error) = group.close() {
                    warn!("while closing: {}", close_error);
                }
            }
            self.publish_state();
            return Err(e);
        }
        self.camera_configs.store(group.configs());
        Ok(())
    }

    /// Block until the running group has triggered `count` multi-frames.
    pub fn wait_for_multi_frames(&mut self, count: u64) -> Result<()> {
        self.group
            .as_mut()
            .ok_or(SyncError::NoCameraGroup)?
            .wait_for_multi_frames(count)
    }

    /// Raise the global kill flag and close everything.
    pub fn shutdown(&mut self) -> Result<()> {
        info!("shutting down");
        let closed = self.close_camera_group();
        self.global_kill.set(GLOBAL_KILL);
        closed
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("shutdown: {}", e);
        }
    }
}
