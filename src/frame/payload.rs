//! A single camera frame

use bytes::Bytes;

use super::metadata::{FrameLifecycle, FrameMetadata};
use crate::camera::{CameraId, Rotation};
use crate::error::{Result, SyncError};

/// Image bytes (H x W x C, 8-bit, row major) plus their metadata.
///
/// The image is a `Bytes`, so handing a payload to the recorder queue and the
/// preview relay at the same time does not copy pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct FramePayload {
    pub image: Bytes,
    pub metadata: FrameMetadata,
}

impl FramePayload {
    pub fn new(image: Bytes, metadata: FrameMetadata) -> Result<Self> {
        if image.len() != metadata.image_size() {
            return Err(SyncError::Shape {
                name: format!("camera {} frame {}", metadata.camera_id, metadata.frame_number),
                expected: metadata.image_size(),
                actual: image.len(),
            });
        }
        Ok(Self { image, metadata })
    }

    #[inline]
    pub fn camera_id(&self) -> CameraId {
        self.metadata.camera_id()
    }

    #[inline]
    pub fn frame_number(&self) -> u64 {
        self.metadata.frame_number
    }

    pub fn shape(&self) -> (u32, u32, u32) {
        self.metadata.shape()
    }

    pub fn stamp(&mut self, stage: FrameLifecycle) {
        self.metadata.stamp(stage);
    }

    /// Layout used in the per-camera shared memory slot: metadata, then image.
    pub fn write_slot(&self, slot: &mut Vec<u8>) {
        slot.clear();
        slot.extend_from_slice(self.metadata.as_bytes());
        slot.extend_from_slice(&self.image);
    }

    pub fn from_slot(slot: &[u8]) -> Result<Self> {
        let header = slot.get(..FrameMetadata::SIZE).ok_or_else(|| SyncError::Shape {
            name: "frame slot".into(),
            expected: FrameMetadata::SIZE,
            actual: slot.len(),
        })?;
        let metadata = FrameMetadata::from_bytes(header).ok_or_else(|| {
            SyncError::Validation("frame slot header is not a metadata record".into())
        })?;
        let image_end = FrameMetadata::SIZE + metadata.image_size();
        let image = slot.get(FrameMetadata::SIZE..image_end).ok_or_else(|| SyncError::Shape {
            name: format!("camera {} frame slot", metadata.camera_id),
            expected: image_end,
            actual: slot.len(),
        })?;
        Ok(Self {
            image: Bytes::copy_from_slice(image),
            metadata,
        })
    }

    /// Pixels turned per `rotation`. Returns the new shape with the bytes.
    pub fn rotated(&self, rotation: Rotation) -> (Bytes, (u32, u32, u32)) {
        let shape = self.shape();
        if rotation == Rotation::None {
            return (self.image.clone(), shape);
        }

        let (h, w, c) = (shape.0 as usize, shape.1 as usize, shape.2 as usize);
        let src = &self.image[..];
        let mut dst = vec![0u8; src.len()];

        for y in 0..h {
            for x in 0..w {
                let (ny, nx, nw) = match rotation {
                    Rotation::Clockwise90 => (x, h - 1 - y, h),
                    Rotation::Counterclockwise90 => (w - 1 - x, y, h),
                    Rotation::Rotate180 => (h - 1 - y, w - 1 - x, w),
                    Rotation::None => (y, x, w),
                };
                let s = (y * w + x) * c;
                let d = (ny * nw + nx) * c;
                dst[d..d + c].copy_from_slice(&src[s..s + c]);
            }
        }

        (Bytes::from(dst), rotation.rotated_shape(shape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload_2x3() -> FramePayload {
        // 2 rows, 3 columns, 1 channel:
        // 0 1 2
        // 3 4 5
        let metadata = FrameMetadata::new(CameraId(1), 0, (2, 3, 1));
        FramePayload::new(Bytes::from_static(&[0, 1, 2, 3, 4, 5]), metadata).unwrap()
    }

    #[test]
    fn test_new_checks_image_length() {
        let metadata = FrameMetadata::new(CameraId(0), 0, (2, 2, 3));
        assert!(FramePayload::new(Bytes::from_static(&[0; 11]), metadata).is_err());
    }

    #[test]
    fn test_rotations() {
        let frame = payload_2x3();

        let (cw, shape) = frame.rotated(Rotation::Clockwise90);
        assert_eq!(shape, (3, 2, 1));
        assert_eq!(&cw[..], &[3, 0, 4, 1, 5, 2]);

        let (ccw, shape) = frame.rotated(Rotation::Counterclockwise90);
        assert_eq!(shape, (3, 2, 1));
        assert_eq!(&ccw[..], &[2, 5, 1, 4, 0, 3]);

        let (half, shape) = frame.rotated(Rotation::Rotate180);
        assert_eq!(shape, (2, 3, 1));
        assert_eq!(&half[..], &[5, 4, 3, 2, 1, 0]);
    }

    #[test]
    fn test_slot_layout() {
        let frame = payload_2x3();
        let mut slot = Vec::new();
        frame.write_slot(&mut slot);
        assert_eq!(slot.len(), FrameMetadata::SIZE + 6);
        assert_eq!(FramePayload::from_slot(&slot).unwrap(), frame);
        assert!(FramePayload::from_slot(&slot[..FrameMetadata::SIZE + 2]).is_err());
    }
}
