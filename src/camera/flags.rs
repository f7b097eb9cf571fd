//! Per-camera trigger flags shared between a camera worker and the orchestrator

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::shm::{SharedFlagBlock, SharedFlagBlockDescriptor};

pub const CAMERA_READY: usize = 0;
pub const SHOULD_GRAB: usize = 1;
pub const SHOULD_RETRIEVE: usize = 2;
pub const SHOULD_COPY: usize = 3;
pub const NEW_FRAME_AVAILABLE: usize = 4;
pub const CLOSE_SELF: usize = 5;

const FLAG_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraFrameLoopFlagsDescriptor {
    pub block: SharedFlagBlockDescriptor,
}

/// The handshake flags for one camera.
///
/// The orchestrator raises `should_*`, the camera lowers them again to
/// acknowledge. `camera_ready` and `close_self` belong to the camera.
#[derive(Debug)]
pub struct CameraFrameLoopFlags {
    block: SharedFlagBlock,
}

impl CameraFrameLoopFlags {
    pub fn create(name: &str) -> Result<Self> {
        Ok(Self {
            block: SharedFlagBlock::create(name, FLAG_COUNT)?,
        })
    }

    pub fn recreate(descriptor: &CameraFrameLoopFlagsDescriptor) -> Result<Self> {
        Ok(Self {
            block: SharedFlagBlock::recreate(&descriptor.block)?,
        })
    }

    pub fn descriptor(&self) -> CameraFrameLoopFlagsDescriptor {
        CameraFrameLoopFlagsDescriptor {
            block: self.block.descriptor(),
        }
    }

    pub fn block(&self) -> &SharedFlagBlock {
        &self.block
    }

    pub fn camera_ready(&self) -> bool {
        self.block.is_set(CAMERA_READY)
    }

    pub fn set_camera_ready(&self, ready: bool) {
        self.block.store(CAMERA_READY, ready);
    }

    pub fn should_grab(&self) -> bool {
        self.block.is_set(SHOULD_GRAB)
    }

    pub fn should_retrieve(&self) -> bool {
        self.block.is_set(SHOULD_RETRIEVE)
    }

    pub fn should_copy(&self) -> bool {
        self.block.is_set(SHOULD_COPY)
    }

    pub fn new_frame_available(&self) -> bool {
        self.block.is_set(NEW_FRAME_AVAILABLE)
    }

    pub fn close_self(&self) -> bool {
        self.block.is_set(CLOSE_SELF)
    }

    pub fn request(&self, flag: usize) {
        self.block.set(flag);
    }

    pub fn acknowledge(&self, flag: usize) {
        self.block.clear(flag);
    }

    pub fn set_new_frame_available(&self, available: bool) {
        self.block.store(NEW_FRAME_AVAILABLE, available);
    }

    pub fn set_close_self(&self) {
        self.block.set(CLOSE_SELF);
    }

    /// Reset the per-loop flags. Readiness and close-self are left alone.
    pub fn clear_loop_flags(&self) {
        for flag in [SHOULD_GRAB, SHOULD_RETRIEVE, SHOULD_COPY, NEW_FRAME_AVAILABLE] {
            self.block.clear(flag);
        }
    }

    /// Every per-loop flag is down.
    pub fn loop_flags_reset(&self) -> bool {
        !self.should_grab() && !self.should_retrieve() && !self.should_copy() && !self.new_frame_available()
    }

    pub fn park(&self, flag: usize, current: bool, quantum: Duration) {
        self.block.park(flag, current, quantum);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::{group_prefix, segment_name};

    #[test]
    fn test_clear_loop_flags_keeps_ready_and_close_self() {
        let flags = CameraFrameLoopFlags::create(&segment_name(&group_prefix(), "c0-f")).unwrap();
        let camera = CameraFrameLoopFlags::recreate(&flags.descriptor()).unwrap();

        camera.set_camera_ready(true);
        flags.request(SHOULD_GRAB);
        flags.request(SHOULD_COPY);
        camera.set_new_frame_available(true);
        assert!(!flags.loop_flags_reset());

        flags.clear_loop_flags();
        assert!(flags.loop_flags_reset());
        assert!(camera.camera_ready());

        camera.set_close_self();
        flags.clear_loop_flags();
        assert!(flags.close_self());
    }
}
