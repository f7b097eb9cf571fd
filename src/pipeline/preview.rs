//! Low-resolution latest multi-frame for the control plane

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam::utils::CachePadded;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use tracing::{debug, trace, warn};

use crate::camera::CameraId;
use crate::error::{Result, SyncError};
use crate::frame::{FramePayload, MultiFramePayload};
use crate::group::{GroupIpcFlags, MultiFrameEscapeRingBuffer, MultiFrameEscapeRingBufferDescriptor};

pub const DEFAULT_PREVIEW_MAX_WIDTH: u32 = 640;
const PREVIEW_JPEG_QUALITY: u8 = 70;

#[derive(Debug, Clone, PartialEq)]
pub struct PreviewFrame {
    pub multi_frame_number: u64,
    /// JPEG per camera.
    pub images: BTreeMap<CameraId, Bytes>,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    replaced: AtomicU64,
    failed: AtomicU64,
}

/// Downscale one frame to at most `max_width` pixels wide and JPEG it.
pub fn encode_preview(frame: &FramePayload, max_width: u32) -> Result<Bytes> {
    let (height, width, channels) = frame.shape();
    let (target_w, target_h) = if width > max_width {
        let scaled = (height as u64 * max_width as u64 / width as u64).max(1) as u32;
        (max_width, scaled)
    } else {
        (width, height)
    };

    let mut jpeg = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut jpeg, PREVIEW_JPEG_QUALITY);
    let malformed = || SyncError::Shape {
        name: format!("camera {} preview", frame.camera_id()),
        expected: frame.metadata.image_size(),
        actual: frame.image.len(),
    };
    match channels {
        3 => {
            let image = RgbImage::from_raw(width, height, frame.image.to_vec()).ok_or_else(malformed)?;
            let image = if (target_w, target_h) == (width, height) {
                image
            } else {
                imageops::resize(&image, target_w, target_h, FilterType::Triangle)
            };
            encoder.encode_image(&image)?;
        }
        1 => {
            let image = GrayImage::from_raw(width, height, frame.image.to_vec()).ok_or_else(malformed)?;
            let image = if (target_w, target_h) == (width, height) {
                image
            } else {
                imageops::resize(&image, target_w, target_h, FilterType::Triangle)
            };
            encoder.encode_image(&image)?;
        }
        other => {
            return Err(SyncError::Validation(format!("no preview for {other}-channel frames")));
        }
    }
    drop(encoder);
    Ok(Bytes::from(jpeg))
}

fn build_preview(multi_frame: &MultiFramePayload, max_width: u32) -> Result<PreviewFrame> {
    let images = multi_frame
        .frames()
        .map(|frame| Ok((frame.camera_id(), encode_preview(frame, max_width)?)))
        .collect::<Result<_>>()?;
    Ok(PreviewFrame {
        multi_frame_number: multi_frame.multi_frame_number(),
        images,
    })
}

/// Publishes the freshest multi-frame, never more than one in flight. Stale
/// previews are replaced rather than queued.
pub struct PreviewRelay {
    receiver: flume::Receiver<PreviewFrame>,
    stats: Arc<CachePadded<Stats>>,
    thread: Option<JoinHandle<()>>,
}

impl PreviewRelay {
    pub fn start(
        ipc: Arc<GroupIpcFlags>,
        escape: &MultiFrameEscapeRingBufferDescriptor,
        max_width: u32,
        interval: Duration,
    ) -> Result<Self> {
        let escape = MultiFrameEscapeRingBuffer::recreate(escape, true)?;
        let (tx, rx) = flume::bounded(1);
        let stats = Arc::new(CachePadded::new(Stats::default()));

        let stale = rx.clone();
        let thread_stats = stats.clone();
        let thread = std::thread::Builder::new()
            .name("preview-relay".into())
            .spawn(move || {
                let mut last_sent = -1;
                while ipc.should_continue() {
                    std::thread::sleep(interval);
                    let latest = escape.last_written_index();
                    if latest <= last_sent {
                        continue;
                    }
                    let preview = escape
                        .get_latest_multi_frame()
                        .and_then(|multi_frame| build_preview(&multi_frame, max_width));
                    match preview {
                        Ok(preview) => {
                            last_sent = preview.multi_frame_number as i64;
                            if stale.try_recv().is_ok() {
                                thread_stats.replaced.fetch_add(1, Ordering::Relaxed);
                            }
                            if tx.try_send(preview).is_ok() {
                                thread_stats.published.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        Err(e) => {
                            thread_stats.failed.fetch_add(1, Ordering::Relaxed);
                            warn!("preview failed: {}", e);
                            last_sent = latest;
                        }
                    }
                    trace!(last_sent, "preview tick");
                }
                debug!("preview relay stopped");
            })?;

        Ok(Self {
            receiver: rx,
            stats,
            thread: Some(thread),
        })
    }

    /// The newest preview not yet taken, if any.
    pub fn latest(&self) -> Option<PreviewFrame> {
        self.receiver.try_iter().last()
    }

    /// For async consumers (`recv_async`).
    pub fn receiver(&self) -> flume::Receiver<PreviewFrame> {
        self.receiver.clone()
    }

    /// (published, replaced before anyone took them, failed)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.published.load(Ordering::Relaxed),
            self.stats.replaced.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed),
        )
    }

    /// Call after the group kill flag is up.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| SyncError::WorkerPanicked("preview-relay".into())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraConfig, Resolution};
    use crate::frame::{FrameMetadata, TimebaseMapping};
    use crate::shm::group_prefix;

    fn frame(camera: u32, number: u64, (h, w, c): (u32, u32, u32)) -> FramePayload {
        let metadata = FrameMetadata::new(CameraId(camera), number, (h, w, c));
        FramePayload::new(Bytes::from(vec![128; (h * w * c) as usize]), metadata).unwrap()
    }

    #[test]
    fn test_wide_frames_are_downscaled() {
        let jpeg = encode_preview(&frame(0, 0, (720, 1280, 3)), 640).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (640, 360));

        let jpeg = encode_preview(&frame(0, 0, (4, 6, 1)), 640).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (6, 4));
    }

    #[test]
    fn test_publishes_latest_multi_frame() {
        let prefix = group_prefix();
        let configs: BTreeMap<_, _> = (0..2)
            .map(|id| {
                let mut config = CameraConfig::synthetic(CameraId(id));
                config.resolution = Resolution { width: 8, height: 4 };
                (CameraId(id), config)
            })
            .collect();
        let ipc = Arc::new(GroupIpcFlags::create(&prefix, None).unwrap());
        let mut escape = MultiFrameEscapeRingBuffer::create(&prefix, &configs, 192 * 8).unwrap();
        let relay = PreviewRelay::start(ipc.clone(), &escape.descriptor(), 640, Duration::from_millis(1)).unwrap();

        let timebase = TimebaseMapping::now();
        for number in 0..3 {
            let mut multi_frame = MultiFramePayload::create_empty(configs.keys().copied(), number, timebase);
            for id in 0..2 {
                multi_frame.add_frame(frame(id, number, (4, 8, 3))).unwrap();
            }
            escape.put_multi_frame(&mut multi_frame).unwrap();
        }

        let preview = relay
            .receiver()
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
        assert_eq!(preview.images.len(), 2);
        assert!(preview.multi_frame_number <= 2);

        ipc.kill_group();
        relay.join().unwrap();
    }
}
