//! Second-stage ring buffer that carries complete multi-frames out of the
//! real-time loop
//!
//! A multi-frame is split over three rings that advance in lockstep: the
//! concatenated images, the concatenated metadata records and the timebase. The
//! writer fills them in that order, so at any instant
//! `images >= metadata >= timebase >= images - 1` holds for the last-written
//! cursors and all three last-read cursors are equal. Anything else is a desync.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::camera::{CameraConfig, CameraId};
use crate::error::{Result, SyncError};
use crate::frame::{FrameLifecycle, FrameMetadata, MultiFramePayload, TimebaseMapping};
use crate::shm::{segment_name, RingCapacity, SharedMemoryRingBuffer, SharedMemoryRingBufferDescriptor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiFrameEscapeRingBufferDescriptor {
    pub images: SharedMemoryRingBufferDescriptor,
    pub metadata: SharedMemoryRingBufferDescriptor,
    pub timebase: SharedMemoryRingBufferDescriptor,
}

#[derive(Debug)]
pub struct MultiFrameEscapeRingBuffer {
    images: SharedMemoryRingBuffer,
    metadata: SharedMemoryRingBuffer,
    timebase: SharedMemoryRingBuffer,
}

impl MultiFrameEscapeRingBuffer {
    /// Capacity is however many whole multi-frames fit in `budget_bytes` of image data.
    pub fn create(prefix: &str, configs: &BTreeMap<CameraId, CameraConfig>, budget_bytes: usize) -> Result<Self> {
        let image_size: usize = configs.values().map(CameraConfig::image_size_bytes).sum();
        let metadata_size = configs.len() * FrameMetadata::SIZE;
        let slots = RingCapacity::Budget(budget_bytes).slots(image_size);

        let images = SharedMemoryRingBuffer::create(
            &segment_name(prefix, "esc-i"),
            image_size,
            RingCapacity::Slots(slots),
            false,
        )?;
        let metadata = SharedMemoryRingBuffer::create(
            &segment_name(prefix, "esc-m"),
            metadata_size,
            RingCapacity::Slots(slots),
            false,
        )?;
        let timebase = SharedMemoryRingBuffer::create(
            &segment_name(prefix, "esc-t"),
            TimebaseMapping::SIZE,
            RingCapacity::Slots(slots),
            false,
        )?;
        debug!(capacity = slots, image_size, "created multi-frame escape buffer");

        Ok(Self {
            images,
            metadata,
            timebase,
        })
    }

    pub fn recreate(descriptor: &MultiFrameEscapeRingBufferDescriptor, read_only: bool) -> Result<Self> {
        Ok(Self {
            images: SharedMemoryRingBuffer::recreate(&descriptor.images, read_only)?,
            metadata: SharedMemoryRingBuffer::recreate(&descriptor.metadata, read_only)?,
            timebase: SharedMemoryRingBuffer::recreate(&descriptor.timebase, read_only)?,
        })
    }

    pub fn descriptor(&self) -> MultiFrameEscapeRingBufferDescriptor {
        MultiFrameEscapeRingBufferDescriptor {
            images: self.images.descriptor(),
            metadata: self.metadata.descriptor(),
            timebase: self.timebase.descriptor(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.images.capacity()
    }

    /// Last multi-frame fully written to all three rings.
    pub fn last_written_index(&self) -> i64 {
        self.timebase.last_written_index()
    }

    pub fn last_read_index(&self) -> i64 {
        self.timebase.last_read_index()
    }

    pub fn new_data_available(&self) -> bool {
        self.last_written_index() > self.last_read_index()
    }

    /// Multi-frames written but not yet consumed.
    pub fn backlog(&self) -> u64 {
        (self.last_written_index() - self.last_read_index()).max(0) as u64
    }

    fn check_cursors(&self) -> Result<()> {
        let (i, m, t) = (
            self.images.last_written_index(),
            self.metadata.last_written_index(),
            self.timebase.last_written_index(),
        );
        if !(i >= m && m >= t && t >= i - 1) {
            return Err(SyncError::Desync(format!(
                "escape buffer write cursors disagree: images {i}, metadata {m}, timebase {t}"
            )));
        }
        let (ri, rm, rt) = (
            self.images.last_read_index(),
            self.metadata.last_read_index(),
            self.timebase.last_read_index(),
        );
        if ri != rm || rm != rt {
            return Err(SyncError::Desync(format!(
                "escape buffer read cursors disagree: images {ri}, metadata {rm}, timebase {rt}"
            )));
        }
        Ok(())
    }

    /// Write a full multi-frame. Fails with a retryable `Overwrite` (and writes
    /// nothing) when the consumer is a whole ring behind.
    pub fn put_multi_frame(&mut self, multi_frame: &mut MultiFramePayload) -> Result<()> {
        if !(self.images.can_put() && self.metadata.can_put() && self.timebase.can_put()) {
            return Err(SyncError::Overwrite {
                name: self.images.name().to_string(),
                index: self.images.last_written_index() + 1,
            });
        }

        multi_frame.stamp_all(FrameLifecycle::CopyToEscapeBuffer);
        let (images, metadata, timebase) = multi_frame.to_buffers()?;
        let written = [
            self.images.put(&images)?,
            self.metadata.put(&metadata)?,
            self.timebase.put(&timebase)?,
        ];

        let number = multi_frame.multi_frame_number() as i64;
        if written.iter().any(|&index| index != number) {
            return Err(SyncError::Desync(format!(
                "multi-frame {number} landed at escape indices {written:?}"
            )));
        }
        trace!(multi_frame_number = number, "multi-frame escaped");
        Ok(())
    }

    /// Consume the oldest unread multi-frame.
    pub fn get_next_multi_frame(&mut self) -> Result<MultiFramePayload> {
        self.check_cursors()?;
        if !self.new_data_available() {
            return Err(SyncError::Empty {
                name: self.timebase.name().to_string(),
            });
        }

        let index = self.last_read_index() + 1;
        let images = self.images.get_next()?;
        let metadata = self.metadata.get_next()?;
        let timebase = self.timebase.get_next()?;
        self.finish_read(index, &images, &metadata, &timebase)
    }

    /// Copy the newest complete multi-frame without consuming it.
    pub fn get_latest_multi_frame(&self) -> Result<MultiFramePayload> {
        loop {
            self.check_cursors()?;
            let index = self.last_written_index();
            let read = (|| {
                Ok::<_, SyncError>((
                    self.images.get_at(index)?,
                    self.metadata.get_at(index)?,
                    self.timebase.get_at(index)?,
                ))
            })();
            match read {
                Ok((images, metadata, timebase)) => return self.finish_read(index, &images, &metadata, &timebase),
                // Writer lapped the slot while we copied it
                Err(SyncError::Overwrite { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn finish_read(&self, index: i64, images: &[u8], metadata: &[u8], timebase: &[u8]) -> Result<MultiFramePayload> {
        let mut multi_frame = MultiFramePayload::from_buffers(images, metadata, timebase)?;
        if multi_frame.multi_frame_number() as i64 != index {
            return Err(SyncError::Desync(format!(
                "escape slot {index} holds multi-frame {}",
                multi_frame.multi_frame_number()
            )));
        }
        multi_frame.stamp_all(FrameLifecycle::CopyFromEscapeBuffer);
        Ok(multi_frame)
    }

    #[cfg(test)]
    pub(crate) fn rings(&self) -> [&SharedMemoryRingBuffer; 3] {
        [&self.images, &self.metadata, &self.timebase]
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::camera::Resolution;
    use crate::frame::FramePayload;
    use crate::shm::group_prefix;

    fn configs() -> BTreeMap<CameraId, CameraConfig> {
        (0..3)
            .map(|i| {
                let mut config = CameraConfig::synthetic(CameraId(i));
                config.resolution = Resolution { width: 2, height: 2 };
                (config.camera_id, config)
            })
            .collect()
    }

    fn multi_frame(number: u64, timebase: TimebaseMapping) -> MultiFramePayload {
        let mut mf = MultiFramePayload::create_empty((0..3).map(CameraId), number, timebase);
        for camera in 0..3 {
            let metadata = FrameMetadata::new(CameraId(camera), number, (2, 2, 3));
            let image = Bytes::from(vec![(number as u8).wrapping_add(camera as u8); 12]);
            mf.add_frame(FramePayload::new(image, metadata).unwrap()).unwrap();
        }
        mf
    }

    #[test]
    fn test_consuming_and_latest_reads() {
        let timebase = TimebaseMapping::now();
        let mut writer = MultiFrameEscapeRingBuffer::create(&group_prefix(), &configs(), 36 * 4).unwrap();
        assert_eq!(writer.capacity(), 4);

        let mut consumer = MultiFrameEscapeRingBuffer::recreate(&writer.descriptor(), false).unwrap();
        let viewer = MultiFrameEscapeRingBuffer::recreate(&writer.descriptor(), true).unwrap();
        assert!(consumer.get_next_multi_frame().unwrap_err().is_retryable());

        for number in 0..3 {
            writer.put_multi_frame(&mut multi_frame(number, timebase)).unwrap();
        }

        let latest = viewer.get_latest_multi_frame().unwrap();
        assert_eq!(latest.multi_frame_number(), 2);
        assert_eq!(consumer.backlog(), 3);

        for number in 0..3 {
            let mf = consumer.get_next_multi_frame().unwrap();
            assert_eq!(mf.multi_frame_number(), number);
            assert!(mf.full());
            let frame = mf.get(CameraId(1)).unwrap();
            assert_eq!(frame.image[0], number as u8 + 1);
            assert!(frame.metadata.timestamp(FrameLifecycle::CopyToEscapeBuffer).is_some());
            assert!(frame.metadata.timestamp(FrameLifecycle::CopyFromEscapeBuffer).is_some());
        }
        assert!(matches!(consumer.get_next_multi_frame(), Err(SyncError::Empty { .. })));
    }

    #[test]
    fn test_full_ring_rejects_whole_multi_frame() {
        let timebase = TimebaseMapping::now();
        let mut writer = MultiFrameEscapeRingBuffer::create(&group_prefix(), &configs(), 36 * 2).unwrap();
        writer.put_multi_frame(&mut multi_frame(0, timebase)).unwrap();
        writer.put_multi_frame(&mut multi_frame(1, timebase)).unwrap();

        let err = writer.put_multi_frame(&mut multi_frame(2, timebase)).unwrap_err();
        assert!(err.is_retryable());
        for ring in writer.rings() {
            assert_eq!(ring.last_written_index(), 1);
        }
    }

    #[test]
    fn test_injected_cursor_mismatch_is_desync() {
        let timebase = TimebaseMapping::now();
        let mut writer = MultiFrameEscapeRingBuffer::create(&group_prefix(), &configs(), 36 * 4).unwrap();
        writer.put_multi_frame(&mut multi_frame(0, timebase)).unwrap();
        writer.put_multi_frame(&mut multi_frame(1, timebase)).unwrap();

        let mut consumer = MultiFrameEscapeRingBuffer::recreate(&writer.descriptor(), false).unwrap();
        let [_, metadata, _] = writer.rings();
        metadata.force_last_written(0);
        writer.rings()[0].force_last_written(3);

        assert!(matches!(consumer.get_next_multi_frame(), Err(SyncError::Desync(_))));
        assert!(matches!(consumer.get_latest_multi_frame(), Err(SyncError::Desync(_))));
    }

    #[test]
    fn test_rejects_partial_multi_frame() {
        let mut writer = MultiFrameEscapeRingBuffer::create(&group_prefix(), &configs(), 36 * 4).unwrap();
        let mut partial = MultiFramePayload::create_empty((0..3).map(CameraId), 0, TimebaseMapping::now());
        assert!(matches!(writer.put_multi_frame(&mut partial), Err(SyncError::Validation(_))));
        assert_eq!(writer.last_written_index(), -1);
    }
}
