//! Fixed-layout per-frame metadata

use bytemuck::{Pod, Zeroable};
use nix::time::{clock_gettime, ClockId};

use crate::camera::CameraId;

/// Stages a frame passes through, in order. Each gets one timestamp slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(usize)]
pub enum FrameLifecycle {
    Initialized = 0,
    PreGrab,
    PostGrab,
    PreRetrieve,
    PostRetrieve,
    CopyToCameraBuffer,
    CopyFromCameraBuffer,
    CopyToEscapeBuffer,
    CopyFromEscapeBuffer,
    CompressionStart,
    CompressionEnd,
}

impl FrameLifecycle {
    pub const COUNT: usize = 11;

    pub const ALL: [FrameLifecycle; Self::COUNT] = [
        FrameLifecycle::Initialized,
        FrameLifecycle::PreGrab,
        FrameLifecycle::PostGrab,
        FrameLifecycle::PreRetrieve,
        FrameLifecycle::PostRetrieve,
        FrameLifecycle::CopyToCameraBuffer,
        FrameLifecycle::CopyFromCameraBuffer,
        FrameLifecycle::CopyToEscapeBuffer,
        FrameLifecycle::CopyFromEscapeBuffer,
        FrameLifecycle::CompressionStart,
        FrameLifecycle::CompressionEnd,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Column-friendly name, e.g. `post_grab`.
    pub fn name(self) -> &'static str {
        match self {
            FrameLifecycle::Initialized => "initialized",
            FrameLifecycle::PreGrab => "pre_grab",
            FrameLifecycle::PostGrab => "post_grab",
            FrameLifecycle::PreRetrieve => "pre_retrieve",
            FrameLifecycle::PostRetrieve => "post_retrieve",
            FrameLifecycle::CopyToCameraBuffer => "copy_to_camera_buffer",
            FrameLifecycle::CopyFromCameraBuffer => "copy_from_camera_buffer",
            FrameLifecycle::CopyToEscapeBuffer => "copy_to_escape_buffer",
            FrameLifecycle::CopyFromEscapeBuffer => "copy_from_escape_buffer",
            FrameLifecycle::CompressionStart => "compression_start",
            FrameLifecycle::CompressionEnd => "compression_end",
        }
    }
}

/// Nanoseconds on `CLOCK_MONOTONIC`. Comparable across processes on one host.
pub fn monotonic_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or_default()
}

/// Frame metadata as stored next to the image in shared memory.
///
/// A zero timestamp means the stage has not happened (yet).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct FrameMetadata {
    pub camera_id: u64,
    pub frame_number: u64,
    pub height: u32,
    pub width: u32,
    pub channels: u32,
    _pad: u32,
    pub timestamps_ns: [u64; FrameLifecycle::COUNT],
}

impl FrameMetadata {
    pub const SIZE: usize = std::mem::size_of::<FrameMetadata>();

    pub fn new(camera_id: CameraId, frame_number: u64, (height, width, channels): (u32, u32, u32)) -> Self {
        let mut metadata = Self {
            camera_id: camera_id.0 as u64,
            frame_number,
            height,
            width,
            channels,
            _pad: 0,
            timestamps_ns: [0; FrameLifecycle::COUNT],
        };
        metadata.stamp(FrameLifecycle::Initialized);
        metadata
    }

    pub fn camera_id(&self) -> CameraId {
        CameraId(self.camera_id as u32)
    }

    pub fn shape(&self) -> (u32, u32, u32) {
        (self.height, self.width, self.channels)
    }

    pub fn image_size(&self) -> usize {
        self.height as usize * self.width as usize * self.channels as usize
    }

    #[inline]
    pub fn stamp(&mut self, stage: FrameLifecycle) {
        self.timestamps_ns[stage.index()] = monotonic_ns();
    }

    pub fn timestamp(&self, stage: FrameLifecycle) -> Option<u64> {
        match self.timestamps_ns[stage.index()] {
            0 => None,
            ns => Some(ns),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Read from an arbitrary (possibly unaligned) byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        (bytes.len() == Self::SIZE).then(|| bytemuck::pod_read_unaligned(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_stable() {
        assert_eq!(FrameMetadata::SIZE, 120);
        assert_eq!(FrameLifecycle::ALL.len(), FrameLifecycle::COUNT);
        for (i, stage) in FrameLifecycle::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
    }

    #[test]
    fn test_stamps_are_monotonic_and_survive_bytes() {
        let mut metadata = FrameMetadata::new(CameraId(3), 7, (4, 6, 3));
        assert!(metadata.timestamp(FrameLifecycle::Initialized).is_some());
        assert!(metadata.timestamp(FrameLifecycle::PreGrab).is_none());

        metadata.stamp(FrameLifecycle::PreGrab);
        metadata.stamp(FrameLifecycle::PostGrab);
        let pre = metadata.timestamp(FrameLifecycle::PreGrab).unwrap();
        let post = metadata.timestamp(FrameLifecycle::PostGrab).unwrap();
        assert!(post >= pre);

        let decoded = FrameMetadata::from_bytes(metadata.as_bytes()).unwrap();
        assert_eq!(decoded, metadata);
        assert_eq!(decoded.camera_id(), CameraId(3));
        assert_eq!(decoded.image_size(), 72);
        assert!(FrameMetadata::from_bytes(&[0; 3]).is_none());
    }
}
