//! Per-camera frame buffers and their group-level aggregate

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::camera::{CameraConfig, CameraId};
use crate::error::{Result, SyncError};
use crate::frame::{FrameLifecycle, FrameMetadata, FramePayload, MultiFramePayload, TimebaseMapping};
use crate::shm::{
    segment_name, RingCapacity, SharedMemoryNumber, SharedMemoryNumberDescriptor,
    SharedMemoryRingBuffer, SharedMemoryRingBufferDescriptor,
};

/// How each camera's frame buffer is laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CameraBufferLayout {
    /// One slot; the camera cannot run ahead of the relay.
    SingleSlot,
    /// As many slots as fit in the byte budget.
    Ring { budget_bytes: usize },
}

impl Default for CameraBufferLayout {
    fn default() -> Self {
        CameraBufferLayout::Ring {
            budget_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCameraSharedMemoryDescriptor {
    pub camera_id: CameraId,
    pub layout: CameraBufferLayout,
    pub shape: (u32, u32, u32),
    pub ring: SharedMemoryRingBufferDescriptor,
}

/// One camera's stream of image + metadata slots.
///
/// Both variants put and consume through the same ring contract; the single slot
/// is a ring of capacity one.
#[derive(Debug)]
pub enum PerCameraSharedMemory {
    SingleSlot {
        camera_id: CameraId,
        shape: (u32, u32, u32),
        ring: SharedMemoryRingBuffer,
    },
    Ring {
        camera_id: CameraId,
        shape: (u32, u32, u32),
        ring: SharedMemoryRingBuffer,
    },
}

fn slot_size((h, w, c): (u32, u32, u32)) -> usize {
    FrameMetadata::SIZE + h as usize * w as usize * c as usize
}

impl PerCameraSharedMemory {
    pub fn create(prefix: &str, config: &CameraConfig, layout: CameraBufferLayout) -> Result<Self> {
        let camera_id = config.camera_id;
        let shape = config.image_shape();
        let name = segment_name(prefix, &format!("c{camera_id}"));
        let memory = match layout {
            CameraBufferLayout::SingleSlot => PerCameraSharedMemory::SingleSlot {
                camera_id,
                shape,
                ring: SharedMemoryRingBuffer::create(&name, slot_size(shape), RingCapacity::Slots(1), false)?,
            },
            CameraBufferLayout::Ring { budget_bytes } => PerCameraSharedMemory::Ring {
                camera_id,
                shape,
                ring: SharedMemoryRingBuffer::create(
                    &name,
                    slot_size(shape),
                    RingCapacity::Budget(budget_bytes),
                    false,
                )?,
            },
        };
        debug!(%camera_id, ?layout, capacity = memory.ring().capacity(), "created camera frame buffer");
        Ok(memory)
    }

    pub fn recreate(descriptor: &PerCameraSharedMemoryDescriptor, read_only: bool) -> Result<Self> {
        let ring = SharedMemoryRingBuffer::recreate(&descriptor.ring, read_only)?;
        if ring.element_size() != slot_size(descriptor.shape) {
            return Err(SyncError::Shape {
                name: descriptor.ring.name.clone(),
                expected: slot_size(descriptor.shape),
                actual: ring.element_size(),
            });
        }
        let (camera_id, shape) = (descriptor.camera_id, descriptor.shape);
        Ok(match descriptor.layout {
            CameraBufferLayout::SingleSlot => PerCameraSharedMemory::SingleSlot { camera_id, shape, ring },
            CameraBufferLayout::Ring { .. } => PerCameraSharedMemory::Ring { camera_id, shape, ring },
        })
    }

    pub fn descriptor(&self) -> PerCameraSharedMemoryDescriptor {
        let layout = match self {
            PerCameraSharedMemory::SingleSlot { .. } => CameraBufferLayout::SingleSlot,
            PerCameraSharedMemory::Ring { ring, .. } => CameraBufferLayout::Ring {
                budget_bytes: ring.capacity() * ring.element_size(),
            },
        };
        PerCameraSharedMemoryDescriptor {
            camera_id: self.camera_id(),
            layout,
            shape: self.shape(),
            ring: self.ring().descriptor(),
        }
    }

    fn ring(&self) -> &SharedMemoryRingBuffer {
        match self {
            PerCameraSharedMemory::SingleSlot { ring, .. } | PerCameraSharedMemory::Ring { ring, .. } => ring,
        }
    }

    fn ring_mut(&mut self) -> &mut SharedMemoryRingBuffer {
        match self {
            PerCameraSharedMemory::SingleSlot { ring, .. } | PerCameraSharedMemory::Ring { ring, .. } => ring,
        }
    }

    pub fn camera_id(&self) -> CameraId {
        match self {
            PerCameraSharedMemory::SingleSlot { camera_id, .. } | PerCameraSharedMemory::Ring { camera_id, .. } => {
                *camera_id
            }
        }
    }

    pub fn shape(&self) -> (u32, u32, u32) {
        match self {
            PerCameraSharedMemory::SingleSlot { shape, .. } | PerCameraSharedMemory::Ring { shape, .. } => *shape,
        }
    }

    /// Camera side: publish a frame. Overwrite errors are retryable.
    pub fn put_frame(&mut self, frame: &FramePayload) -> Result<i64> {
        if frame.shape() != self.shape() {
            return Err(SyncError::Shape {
                name: format!("camera {} frame buffer", self.camera_id()),
                expected: slot_size(self.shape()),
                actual: slot_size(frame.shape()),
            });
        }
        let mut slot = Vec::with_capacity(slot_size(self.shape()));
        frame.write_slot(&mut slot);
        self.ring_mut().put(&slot)
    }

    /// Relay side: consume the oldest unread frame.
    pub fn next_frame(&mut self) -> Result<FramePayload> {
        let slot = self.ring_mut().get_next()?;
        FramePayload::from_slot(&slot)
    }

    pub fn latest_frame(&self) -> Result<FramePayload> {
        FramePayload::from_slot(&self.ring().get_latest()?)
    }

    pub fn new_data_available(&self) -> bool {
        self.ring().new_data_available()
    }

    pub fn last_written_index(&self) -> i64 {
        self.ring().last_written_index()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraGroupSharedMemoryDescriptor {
    pub cameras: BTreeMap<CameraId, PerCameraSharedMemoryDescriptor>,
    pub latest_multi_frame_number: SharedMemoryNumberDescriptor,
}

/// All camera frame buffers of a group plus the published multi-frame number.
#[derive(Debug)]
pub struct CameraGroupSharedMemory {
    cameras: BTreeMap<CameraId, PerCameraSharedMemory>,
    latest_multi_frame_number: SharedMemoryNumber,
}

impl CameraGroupSharedMemory {
    pub fn create(
        prefix: &str,
        configs: &BTreeMap<CameraId, CameraConfig>,
        layout: CameraBufferLayout,
    ) -> Result<Self> {
        if configs.is_empty() {
            return Err(SyncError::Validation("a camera group needs at least one camera".into()));
        }
        let cameras = configs
            .values()
            .map(|config| Ok((config.camera_id, PerCameraSharedMemory::create(prefix, config, layout)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            cameras,
            latest_multi_frame_number: SharedMemoryNumber::create(&segment_name(prefix, "mfn"), -1)?,
        })
    }

    pub fn recreate(descriptor: &CameraGroupSharedMemoryDescriptor, read_only: bool) -> Result<Self> {
        let cameras = descriptor
            .cameras
            .iter()
            .map(|(id, camera)| Ok((*id, PerCameraSharedMemory::recreate(camera, read_only)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            cameras,
            latest_multi_frame_number: SharedMemoryNumber::recreate(&descriptor.latest_multi_frame_number)?,
        })
    }

    pub fn descriptor(&self) -> CameraGroupSharedMemoryDescriptor {
        CameraGroupSharedMemoryDescriptor {
            cameras: self.cameras.iter().map(|(id, m)| (*id, m.descriptor())).collect(),
            latest_multi_frame_number: self.latest_multi_frame_number.descriptor(),
        }
    }

    pub fn camera_ids(&self) -> impl Iterator<Item = CameraId> + '_ {
        self.cameras.keys().copied()
    }

    pub fn camera(&self, camera_id: CameraId) -> Option<&PerCameraSharedMemory> {
        self.cameras.get(&camera_id)
    }

    /// Every camera has published something the relay has not pulled yet.
    pub fn all_new_data_available(&self) -> bool {
        self.cameras.values().all(PerCameraSharedMemory::new_data_available)
    }

    /// Pull exactly one frame per camera and assemble multi-frame `expected`.
    ///
    /// Any camera delivering a different frame number is a desync.
    pub fn build_next_multi_frame(&mut self, expected: u64, timebase: TimebaseMapping) -> Result<MultiFramePayload> {
        let mut multi_frame = MultiFramePayload::create_empty(self.cameras.keys().copied(), expected, timebase);
        for memory in self.cameras.values_mut() {
            let mut frame = memory.next_frame()?;
            if frame.frame_number() != expected {
                return Err(SyncError::Desync(format!(
                    "camera {} published frame {} while multi-frame {expected} was expected",
                    memory.camera_id(),
                    frame.frame_number()
                )));
            }
            frame.stamp(FrameLifecycle::CopyFromCameraBuffer);
            multi_frame.add_frame(frame)?;
        }
        trace!(multi_frame_number = expected, "assembled multi-frame");
        Ok(multi_frame)
    }

    /// Latest published multi-frame number, `None` before the first.
    pub fn latest_multi_frame_number(&self) -> Option<u64> {
        u64::try_from(self.latest_multi_frame_number.get()).ok()
    }

    pub fn publish_multi_frame_number(&self, number: u64) {
        self.latest_multi_frame_number.set(number as i64);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::camera::Resolution;
    use crate::shm::group_prefix;

    fn configs() -> BTreeMap<CameraId, CameraConfig> {
        [0, 1]
            .into_iter()
            .map(|i| {
                let mut config = CameraConfig::synthetic(CameraId(i));
                config.resolution = Resolution { width: 4, height: 2 };
                (config.camera_id, config)
            })
            .collect()
    }

    fn frame(camera: u32, number: u64) -> FramePayload {
        let metadata = FrameMetadata::new(CameraId(camera), number, (2, 4, 3));
        FramePayload::new(Bytes::from(vec![number as u8; 24]), metadata).unwrap()
    }

    #[test]
    fn test_build_pulls_one_frame_per_camera() {
        let prefix = group_prefix();
        let mut group = CameraGroupSharedMemory::create(&prefix, &configs(), CameraBufferLayout::SingleSlot).unwrap();

        let descriptor = group.descriptor();
        let mut camera0 = PerCameraSharedMemory::recreate(&descriptor.cameras[&CameraId(0)], false).unwrap();
        let mut camera1 = PerCameraSharedMemory::recreate(&descriptor.cameras[&CameraId(1)], false).unwrap();

        camera0.put_frame(&frame(0, 0)).unwrap();
        assert!(!group.all_new_data_available());
        camera1.put_frame(&frame(1, 0)).unwrap();
        assert!(group.all_new_data_available());
        // Single slot: the camera cannot run ahead of the relay
        assert!(camera0.put_frame(&frame(0, 1)).unwrap_err().is_retryable());

        let mf = group.build_next_multi_frame(0, TimebaseMapping::now()).unwrap();
        assert!(mf.full());
        assert!(mf
            .frames()
            .all(|f| f.metadata.timestamp(FrameLifecycle::CopyFromCameraBuffer).is_some()));
        assert!(!group.all_new_data_available());

        assert_eq!(group.latest_multi_frame_number(), None);
        group.publish_multi_frame_number(0);
        assert_eq!(group.latest_multi_frame_number(), Some(0));
    }

    #[test]
    fn test_frame_number_mismatch_is_desync() {
        let prefix = group_prefix();
        let layout = CameraBufferLayout::Ring { budget_bytes: 4096 };
        let mut group = CameraGroupSharedMemory::create(&prefix, &configs(), layout).unwrap();
        let descriptor = group.descriptor();
        let mut camera0 = PerCameraSharedMemory::recreate(&descriptor.cameras[&CameraId(0)], false).unwrap();
        let mut camera1 = PerCameraSharedMemory::recreate(&descriptor.cameras[&CameraId(1)], false).unwrap();

        camera0.put_frame(&frame(0, 0)).unwrap();
        camera1.put_frame(&frame(1, 1)).unwrap();
        assert!(matches!(
            group.build_next_multi_frame(0, TimebaseMapping::now()),
            Err(SyncError::Desync(_))
        ));
    }

    #[test]
    fn test_put_rejects_wrong_shape() {
        let prefix = group_prefix();
        let mut group = CameraGroupSharedMemory::create(&prefix, &configs(), CameraBufferLayout::SingleSlot).unwrap();
        let memory = group.cameras.get_mut(&CameraId(0)).unwrap();
        let metadata = FrameMetadata::new(CameraId(0), 0, (1, 1, 3));
        let small = FramePayload::new(Bytes::from_static(&[0, 0, 0]), metadata).unwrap();
        assert!(matches!(memory.put_frame(&small), Err(SyncError::Shape { .. })));
    }
}
