//! Messages between camera workers, the controller and the control plane

use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::camera::{CameraConfig, CameraId};
use crate::context::StateSnapshot;
use crate::error::{Result, SyncError};
use crate::group::PerCameraSharedMemoryDescriptor;
use crate::pipeline::FramerateSample;
use crate::recording::RecordingInfo;
use crate::shm::{RingCapacity, SharedMemoryRingBuffer, SharedMemoryRingBufferDescriptor};

/// Upstream messages: workers to controller, controller to control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcMessage {
    /// The config a camera actually runs with, after the hardware had its say.
    ConfigUpdate { config: CameraConfig },
    RecordingInfo(RecordingInfo),
    FramerateSample(FramerateSample),
    StateSnapshot(StateSnapshot),
}

/// Downstream messages: controller to one camera worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CameraCommand {
    /// Frame buffer sized from the extracted config; the worker attaches it and
    /// reads its probe frame.
    AttachFrameBuffer {
        buffer: PerCameraSharedMemoryDescriptor,
    },
    /// Reapply a config between loop iterations.
    UpdateConfig { config: CameraConfig },
}

impl IpcMessage {
    pub fn camera_id(&self) -> Option<CameraId> {
        match self {
            IpcMessage::ConfigUpdate { config } => Some(config.camera_id),
            IpcMessage::RecordingInfo(_) | IpcMessage::FramerateSample(_) | IpcMessage::StateSnapshot(_) => {
                None
            }
        }
    }
}

const SLOT_SIZE: usize = 8 * 1024;
const LENGTH_PREFIX: usize = 4;
const SLOTS: usize = 16;

/// A shared memory ring of JSON messages, one writer and one reader.
#[derive(Debug)]
pub struct Mailbox<T> {
    ring: SharedMemoryRingBuffer,
    scratch: Vec<u8>,
    _message: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Mailbox<T> {
    pub fn create(name: &str) -> Result<Self> {
        Ok(Self::wrap(SharedMemoryRingBuffer::create(
            name,
            SLOT_SIZE,
            RingCapacity::Slots(SLOTS),
            false,
        )?))
    }

    pub fn recreate(descriptor: &SharedMemoryRingBufferDescriptor) -> Result<Self> {
        Ok(Self::wrap(SharedMemoryRingBuffer::recreate(descriptor, false)?))
    }

    fn wrap(ring: SharedMemoryRingBuffer) -> Self {
        Self {
            ring,
            scratch: vec![0; SLOT_SIZE],
            _message: PhantomData,
        }
    }

    pub fn descriptor(&self) -> SharedMemoryRingBufferDescriptor {
        self.ring.descriptor()
    }

    /// Fails with a retryable `Overwrite` when the reader is `SLOTS` messages behind.
    pub fn send(&mut self, message: &T) -> Result<()> {
        let body = serde_json::to_vec(message)?;
        if body.len() > SLOT_SIZE - LENGTH_PREFIX {
            return Err(SyncError::Validation(format!(
                "{} byte message does not fit a {SLOT_SIZE} byte mailbox slot",
                body.len()
            )));
        }
        self.scratch.fill(0);
        self.scratch[..LENGTH_PREFIX].copy_from_slice(&(body.len() as u32).to_le_bytes());
        self.scratch[LENGTH_PREFIX..LENGTH_PREFIX + body.len()].copy_from_slice(&body);
        self.ring.put(&self.scratch)?;
        Ok(())
    }

    pub fn recv(&mut self) -> Result<Option<T>> {
        let slot = match self.ring.get_next() {
            Ok(slot) => slot,
            Err(SyncError::Empty { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut len = [0u8; LENGTH_PREFIX];
        len.copy_from_slice(&slot[..LENGTH_PREFIX]);
        let len = u32::from_le_bytes(len) as usize;
        let body = slot
            .get(LENGTH_PREFIX..LENGTH_PREFIX + len)
            .ok_or_else(|| SyncError::Validation(format!("mailbox slot claims {len} bytes")))?;
        Ok(Some(serde_json::from_slice(body)?))
    }

    pub fn drain(&mut self) -> Result<Vec<T>> {
        let mut messages = Vec::new();
        while let Some(message) = self.recv()? {
            messages.push(message);
        }
        Ok(messages)
    }

    pub fn has_messages(&self) -> bool {
        self.ring.new_data_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{group_prefix, segment_name};

    #[test]
    fn test_mailbox_delivers_in_order_across_instances() {
        let mut controller: Mailbox<IpcMessage> = Mailbox::create(&segment_name(&group_prefix(), "mb")).unwrap();
        let mut worker: Mailbox<IpcMessage> = Mailbox::recreate(&controller.descriptor()).unwrap();

        let first = CameraConfig::synthetic(CameraId(0));
        let mut second = first.clone();
        second.exposure = -3;

        worker.send(&IpcMessage::ConfigUpdate { config: first.clone() }).unwrap();
        worker.send(&IpcMessage::ConfigUpdate { config: second.clone() }).unwrap();

        let received = controller.drain().unwrap();
        assert_eq!(
            received,
            vec![
                IpcMessage::ConfigUpdate { config: first },
                IpcMessage::ConfigUpdate { config: second }
            ]
        );
        assert_eq!(received[0].camera_id(), Some(CameraId(0)));
        assert!(controller.recv().unwrap().is_none());
    }

    #[test]
    fn test_full_mailbox_is_retryable() {
        let mut mailbox: Mailbox<CameraCommand> = Mailbox::create(&segment_name(&group_prefix(), "full")).unwrap();
        let command = CameraCommand::UpdateConfig {
            config: CameraConfig::default(),
        };
        for _ in 0..SLOTS {
            mailbox.send(&command).unwrap();
        }
        assert!(mailbox.send(&command).unwrap_err().is_retryable());
    }
}
