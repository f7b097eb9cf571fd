//! One synchronized frame per camera

use std::collections::BTreeMap;

use bytes::Bytes;

use super::metadata::{FrameLifecycle, FrameMetadata};
use super::payload::FramePayload;
use super::timebase::TimebaseMapping;
use crate::camera::CameraId;
use crate::error::{Result, SyncError};

/// A set of frames, one per camera, sharing a multi-frame number.
///
/// The camera set is fixed at construction; adding a frame for a camera that
/// already has one replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiFramePayload {
    frames: BTreeMap<CameraId, Option<FramePayload>>,
    multi_frame_number: u64,
    timebase: TimebaseMapping,
}

impl MultiFramePayload {
    pub fn create_empty(
        camera_ids: impl IntoIterator<Item = CameraId>,
        multi_frame_number: u64,
        timebase: TimebaseMapping,
    ) -> Self {
        Self {
            frames: camera_ids.into_iter().map(|id| (id, None)).collect(),
            multi_frame_number,
            timebase,
        }
    }

    /// Empty payload for the next number, same cameras and timebase.
    pub fn from_previous(previous: &MultiFramePayload) -> Self {
        Self::create_empty(
            previous.frames.keys().copied(),
            previous.multi_frame_number + 1,
            previous.timebase,
        )
    }

    pub fn add_frame(&mut self, frame: FramePayload) -> Result<()> {
        let camera_id = frame.camera_id();
        if frame.frame_number() != self.multi_frame_number {
            return Err(SyncError::Desync(format!(
                "camera {camera_id} delivered frame {} into multi-frame {}",
                frame.frame_number(),
                self.multi_frame_number
            )));
        }
        let slot = self.frames.get_mut(&camera_id).ok_or_else(|| {
            SyncError::Validation(format!(
                "camera {camera_id} is not part of this multi-frame"
            ))
        })?;
        *slot = Some(frame);
        Ok(())
    }

    pub fn full(&self) -> bool {
        !self.frames.is_empty() && self.frames.values().all(Option::is_some)
    }

    pub fn multi_frame_number(&self) -> u64 {
        self.multi_frame_number
    }

    pub fn timebase(&self) -> &TimebaseMapping {
        &self.timebase
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.frames.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn get(&self, camera_id: CameraId) -> Option<&FramePayload> {
        self.frames.get(&camera_id).and_then(Option::as_ref)
    }

    /// Filled slots, in camera id order.
    pub fn frames(&self) -> impl Iterator<Item = &FramePayload> {
        self.frames.values().flatten()
    }

    pub fn into_frames(self) -> impl Iterator<Item = FramePayload> {
        self.frames.into_values().flatten()
    }

    pub fn stamp_all(&mut self, stage: FrameLifecycle) {
        for frame in self.frames.values_mut().flatten() {
            frame.stamp(stage);
        }
    }

    /// Spread between the earliest and latest post-grab timestamp, in ns.
    pub fn intercamera_grab_range_ns(&self) -> Option<u64> {
        let grabs: Vec<u64> = self
            .frames()
            .filter_map(|f| f.metadata.timestamp(FrameLifecycle::PostGrab))
            .collect();
        let min = grabs.iter().min()?;
        let max = grabs.iter().max()?;
        Some(max - min)
    }

    /// Mean of one lifecycle timestamp across cameras that have it.
    pub fn mean_timestamp_ns(&self, stage: FrameLifecycle) -> Option<u64> {
        let stamps: Vec<u64> = self.frames().filter_map(|f| f.metadata.timestamp(stage)).collect();
        if stamps.is_empty() {
            return None;
        }
        let sum: u128 = stamps.iter().map(|&ns| ns as u128).sum();
        Some((sum / stamps.len() as u128) as u64)
    }

    /// Serialize into the three escape-buffer elements: concatenated images,
    /// concatenated metadata records and the timebase. Camera id order.
    pub fn to_buffers(&self) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>)> {
        if !self.full() {
            return Err(SyncError::Validation(format!(
                "multi-frame {} is not full",
                self.multi_frame_number
            )));
        }
        let image_len = self.frames().map(|f| f.image.len()).sum();
        let mut images = Vec::with_capacity(image_len);
        let mut metadata = Vec::with_capacity(self.len() * FrameMetadata::SIZE);
        for frame in self.frames() {
            images.extend_from_slice(&frame.image);
            metadata.extend_from_slice(frame.metadata.as_bytes());
        }
        Ok((images, metadata, self.timebase.as_bytes().to_vec()))
    }

    /// Inverse of [`to_buffers`](Self::to_buffers). The multi-frame number is taken
    /// from the metadata records, which must all agree.
    pub fn from_buffers(images: &[u8], metadata: &[u8], timebase: &[u8]) -> Result<Self> {
        let timebase = TimebaseMapping::from_bytes(timebase)
            .ok_or_else(|| SyncError::Validation("malformed timebase record".into()))?;
        if metadata.is_empty() || metadata.len() % FrameMetadata::SIZE != 0 {
            return Err(SyncError::Validation(format!(
                "metadata block of {} bytes is not a whole number of records",
                metadata.len()
            )));
        }

        let records: Vec<FrameMetadata> = metadata
            .chunks_exact(FrameMetadata::SIZE)
            .filter_map(FrameMetadata::from_bytes)
            .collect();
        let number = records[0].frame_number;

        let mut payload = Self::create_empty(records.iter().map(|m| m.camera_id()), number, timebase);
        let mut offset = 0;
        for record in records {
            let end = offset + record.image_size();
            let image = images.get(offset..end).ok_or_else(|| SyncError::Shape {
                name: "escape image block".into(),
                expected: end,
                actual: images.len(),
            })?;
            payload.add_frame(FramePayload::new(Bytes::copy_from_slice(image), record)?)?;
            offset = end;
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(camera: u32, number: u64, fill: u8) -> FramePayload {
        let mut metadata = FrameMetadata::new(CameraId(camera), number, (2, 2, 3));
        metadata.stamp(FrameLifecycle::PostGrab);
        FramePayload::new(Bytes::from(vec![fill; 12]), metadata).unwrap()
    }

    fn abc(number: u64) -> MultiFramePayload {
        MultiFramePayload::create_empty([CameraId(0), CameraId(1), CameraId(2)], number, TimebaseMapping::now())
    }

    #[test]
    fn test_full_only_when_every_slot_is_filled() {
        let mut mf = abc(4);
        assert!(!mf.full());
        mf.add_frame(frame(0, 4, 0)).unwrap();
        mf.add_frame(frame(1, 4, 1)).unwrap();
        assert!(!mf.full());
        mf.add_frame(frame(2, 4, 2)).unwrap();
        assert!(mf.full());
        assert!(mf.intercamera_grab_range_ns().is_some());
    }

    #[test]
    fn test_readding_replaces_without_growing() {
        let mut mf = abc(0);
        mf.add_frame(frame(1, 0, 10)).unwrap();
        mf.add_frame(frame(1, 0, 20)).unwrap();
        assert_eq!(mf.len(), 3);
        assert_eq!(mf.get(CameraId(1)).unwrap().image[0], 20);
        assert_eq!(mf.frames().count(), 1);
    }

    #[test]
    fn test_rejects_unknown_camera_and_wrong_number() {
        let mut mf = abc(3);
        assert!(matches!(mf.add_frame(frame(9, 3, 0)), Err(SyncError::Validation(_))));
        assert!(matches!(mf.add_frame(frame(0, 2, 0)), Err(SyncError::Desync(_))));
    }

    #[test]
    fn test_buffers_round_trip_and_require_full() {
        let mut mf = abc(8);
        assert!(mf.to_buffers().is_err());
        for camera in 0..3 {
            mf.add_frame(frame(camera, 8, camera as u8)).unwrap();
        }
        let (images, metadata, timebase) = mf.to_buffers().unwrap();
        assert_eq!(images.len(), 36);
        let decoded = MultiFramePayload::from_buffers(&images, &metadata, &timebase).unwrap();
        assert_eq!(decoded, mf);

        let next = MultiFramePayload::from_previous(&decoded);
        assert_eq!(next.multi_frame_number(), 9);
        assert_eq!(next.camera_ids().count(), 3);
        assert!(!next.full());
    }
}
