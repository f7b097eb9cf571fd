//! One camera's pending frames and its video file

use std::collections::VecDeque;
use std::path::PathBuf;

use tracing::{debug, info};

use super::writer::{VideoWriter, WriterFactory};
use crate::camera::{CameraConfig, CameraId};
use crate::error::{Result, SyncError};
use crate::frame::{FrameLifecycle, FrameMetadata, FramePayload};

pub struct CameraVideoRecorder {
    config: CameraConfig,
    path: PathBuf,
    factory: WriterFactory,
    writer: Option<Box<dyn VideoWriter>>,
    pending: VecDeque<FramePayload>,
    finished_frames: Option<u64>,
}

impl CameraVideoRecorder {
    /// The file is opened with the first frame, so cameras that never record
    /// leave nothing behind.
    pub fn new(config: CameraConfig, path: PathBuf, factory: WriterFactory) -> Self {
        Self {
            config,
            path,
            factory,
            writer: None,
            pending: VecDeque::new(),
            finished_frames: None,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        self.config.camera_id
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn backlog(&self) -> usize {
        self.pending.len()
    }

    pub fn frames_written(&self) -> u64 {
        self.finished_frames
            .or_else(|| self.writer.as_ref().map(|w| w.frames_written()))
            .unwrap_or(0)
    }

    /// Shape check `enqueue` applies, without queueing anything.
    pub fn check_frame(&self, frame: &FramePayload) -> Result<()> {
        if frame.shape() != self.config.image_shape() {
            return Err(SyncError::Validation(format!(
                "camera {} frame {} has shape {:?}, expected {:?}",
                self.camera_id(),
                frame.frame_number(),
                frame.shape(),
                self.config.image_shape()
            )));
        }
        Ok(())
    }

    pub fn enqueue(&mut self, frame: FramePayload) -> Result<()> {
        self.check_frame(&frame)?;
        self.pending.push_back(frame);
        Ok(())
    }

    /// Encode and write the oldest pending frame. Returns its final metadata,
    /// `None` when nothing is pending.
    pub fn write_next(&mut self) -> Result<Option<FrameMetadata>> {
        let Some(mut frame) = self.pending.pop_front() else {
            return Ok(None);
        };
        if self.writer.is_none() {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.writer = Some((self.factory)(&self.path, &self.config)?);
            info!(camera_id = %self.camera_id(), path = %self.path.display(), "video file opened");
        }
        let writer = self.writer.as_mut().ok_or_else(|| SyncError::Recording("writer missing".into()))?;

        frame.stamp(FrameLifecycle::CompressionStart);
        let (image, shape) = frame.rotated(self.config.rotation);
        writer.write_frame(&image, shape)?;
        frame.stamp(FrameLifecycle::CompressionEnd);
        Ok(Some(frame.metadata))
    }

    /// Close the file. Pending frames must have been written first.
    pub fn finish(&mut self) -> Result<u64> {
        if !self.pending.is_empty() {
            return Err(SyncError::Recording(format!(
                "camera {} still has {} unwritten frames",
                self.camera_id(),
                self.pending.len()
            )));
        }
        if let Some(mut writer) = self.writer.take() {
            writer.finish()?;
            self.finished_frames = Some(writer.frames_written());
        }
        let frames = self.frames_written();
        debug!(camera_id = %self.camera_id(), frames, "video file closed");
        Ok(frames)
    }
}
