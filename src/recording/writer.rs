//! Video file writers

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{debug, warn};

use crate::camera::{CameraConfig, FourCc};
use crate::error::{Result, SyncError};

pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// One video file, one camera.
pub trait VideoWriter: Send {
    /// Append one H x W x C frame.
    fn write_frame(&mut self, image: &[u8], shape: (u32, u32, u32)) -> Result<()>;

    fn frames_written(&self) -> u64;

    /// Flush and close; later writes fail.
    fn finish(&mut self) -> Result<()>;

    fn path(&self) -> &Path;
}

/// Opens a writer at a path for a camera.
pub type WriterFactory = Arc<dyn Fn(&Path, &CameraConfig) -> Result<Box<dyn VideoWriter>> + Send + Sync>;

/// Concatenated JPEGs, one per frame (`.mjpeg`).
pub struct MjpegWriter {
    path: PathBuf,
    file: Option<BufWriter<File>>,
    quality: u8,
    frames: u64,
}

impl MjpegWriter {
    pub fn create(path: &Path, quality: u8) -> Result<Self> {
        let file = File::create(path)?;
        debug!(path = %path.display(), "opened mjpeg writer");
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(BufWriter::new(file)),
            quality,
            frames: 0,
        })
    }
}

impl VideoWriter for MjpegWriter {
    fn write_frame(&mut self, image: &[u8], (height, width, channels): (u32, u32, u32)) -> Result<()> {
        let color = match channels {
            1 => ExtendedColorType::L8,
            3 => ExtendedColorType::Rgb8,
            other => {
                return Err(SyncError::Recording(format!(
                    "cannot encode {other}-channel frames as JPEG"
                )))
            }
        };
        let file = self.file.as_mut().ok_or_else(|| {
            SyncError::Recording(format!("{} is already finished", self.path.display()))
        })?;
        JpegEncoder::new_with_quality(file, self.quality).encode(image, width, height, color)?;
        self.frames += 1;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        }
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MjpegWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(e) = self.finish() {
                warn!(path = %self.path.display(), "failed to close video: {}", e);
            }
        }
    }
}

/// Frames in an `.mjpeg` file, counted by start-of-image markers.
pub fn count_mjpeg_frames(path: &Path) -> Result<u64> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    Ok(data.windows(3).filter(|w| w == &[0xFF, 0xD8, 0xFF]).count() as u64)
}

/// MJPEG for `MJPG` writer fourccs; the GStreamer writer for encoded formats when
/// built with `gstreamer-pipeline`.
pub fn default_writer_factory(quality: u8) -> WriterFactory {
    Arc::new(move |path: &Path, config: &CameraConfig| -> Result<Box<dyn VideoWriter>> {
        match config.writer_fourcc {
            FourCc::MJPG => Ok(Box::new(MjpegWriter::create(path, quality)?)),
            #[cfg(feature = "gstreamer-pipeline")]
            _ => Ok(Box::new(super::gst_writer::GstVideoWriter::create(path, config)?)),
            #[cfg(not(feature = "gstreamer-pipeline"))]
            other => Err(SyncError::Recording(format!(
                "writer fourcc {other} needs the gstreamer-pipeline feature"
            ))),
        }
    })
}
