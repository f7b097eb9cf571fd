//! Encoded video through a GStreamer `appsrc` pipeline

use std::path::{Path, PathBuf};

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use tracing::{info, warn};

use super::writer::VideoWriter;
use crate::camera::{CameraConfig, FourCc};
use crate::error::{Result, SyncError};

const EOS_TIMEOUT_S: u64 = 10;

/// MP4V / H264 / X264 / XVID writer. Frames are pushed raw and encoded by the
/// pipeline.
pub struct GstVideoWriter {
    path: PathBuf,
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    frame_duration: gst::ClockTime,
    frames: u64,
    finished: bool,
}

fn gst_error(e: impl std::fmt::Display) -> SyncError {
    SyncError::Recording(format!("gstreamer: {e}"))
}

impl GstVideoWriter {
    pub fn create(path: &Path, config: &CameraConfig) -> Result<Self> {
        gst::init().map_err(gst_error)?;

        let (height, width, channels) = config.recorded_shape();
        let format = match channels {
            1 => gst_video::VideoFormat::Gray8,
            3 => gst_video::VideoFormat::Rgb,
            other => return Err(gst_error(format!("no raw format for {other} channels"))),
        };
        let (encoder, muxer) = match config.writer_fourcc {
            FourCc::MP4V => ("avenc_mpeg4", "mp4mux"),
            FourCc::H264 | FourCc::X264 => ("x264enc tune=zerolatency", "mp4mux"),
            FourCc::XVID => ("avenc_mpeg4", "avimux"),
            other => return Err(gst_error(format!("no encoder for writer fourcc {other}"))),
        };
        let fps_milli = (config.framerate * 1000.0).round().max(1.0) as u64;

        let caps = gst_video::VideoInfo::builder(format, width, height)
            .fps(gst::Fraction::new(fps_milli as i32, 1000))
            .build()
            .map_err(gst_error)?
            .to_caps()
            .map_err(gst_error)?;

        let description = format!(
            "appsrc name=src format=time ! videoconvert ! {encoder} ! {muxer} ! filesink location=\"{}\"",
            path.display()
        );
        info!("Pipeline: {}", description);

        let pipeline = gst::parse::launch(&description)
            .map_err(gst_error)?
            .downcast::<gst::Pipeline>()
            .map_err(|_| gst_error("launch did not produce a pipeline"))?;
        let appsrc = pipeline
            .by_name("src")
            .ok_or_else(|| gst_error("appsrc missing from pipeline"))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| gst_error("`src` is not an appsrc"))?;
        appsrc.set_caps(Some(&caps));
        pipeline.set_state(gst::State::Playing).map_err(gst_error)?;

        Ok(Self {
            path: path.to_path_buf(),
            pipeline,
            appsrc,
            frame_duration: gst::ClockTime::from_nseconds(1_000_000_000_000 / fps_milli),
            frames: 0,
            finished: false,
        })
    }
}

impl VideoWriter for GstVideoWriter {
    fn write_frame(&mut self, image: &[u8], _shape: (u32, u32, u32)) -> Result<()> {
        if self.finished {
            return Err(SyncError::Recording(format!("{} is already finished", self.path.display())));
        }
        let mut buffer = gst::Buffer::from_mut_slice(image.to_vec());
        if let Some(buffer) = buffer.get_mut() {
            buffer.set_pts(self.frame_duration * self.frames);
            buffer.set_duration(self.frame_duration);
        }
        self.appsrc.push_buffer(buffer).map_err(gst_error)?;
        self.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finish(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.finished, true) {
            return Ok(());
        }
        self.appsrc.end_of_stream().map_err(gst_error)?;
        if let Some(bus) = self.pipeline.bus() {
            let message = bus.timed_pop_filtered(
                gst::ClockTime::from_seconds(EOS_TIMEOUT_S),
                &[gst::MessageType::Eos, gst::MessageType::Error],
            );
            if let Some(gst::MessageView::Error(err)) = message.as_ref().map(|m| m.view()) {
                warn!(path = %self.path.display(), "encoder error: {}", err.error());
            }
        }
        self.pipeline.set_state(gst::State::Null).map_err(gst_error)?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for GstVideoWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!(path = %self.path.display(), "failed to close video: {}", e);
        }
    }
}
