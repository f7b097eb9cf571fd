//! Group-wide IPC flags

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::wait::KillSwitch;
use crate::error::Result;
use crate::shm::{
    segment_name, SharedFlagBlock, SharedFlagBlockDescriptor, SharedMemoryNumber,
    SharedMemoryNumberDescriptor,
};

/// Only flag in the application-wide kill block.
pub const GLOBAL_KILL: usize = 0;

pub const GROUP_KILL: usize = 0;
pub const RECORD_FRAMES: usize = 1;
pub const CAMERAS_CONNECTED: usize = 2;
pub const SHOULD_PULL_MULTI_FRAME: usize = 3;
pub const PAUSE_WHEN_ABLE: usize = 4;
pub const FRAME_LOOP_PAUSED: usize = 5;

const GROUP_FLAG_COUNT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupIpcFlagsDescriptor {
    pub global: SharedFlagBlockDescriptor,
    pub group: SharedFlagBlockDescriptor,
    pub loop_count: SharedMemoryNumberDescriptor,
}

/// The application-wide kill flag plus everything shared by one camera group.
#[derive(Debug)]
pub struct GroupIpcFlags {
    global: SharedFlagBlock,
    group: SharedFlagBlock,
    loop_count: SharedMemoryNumber,
}

/// Create the block holding the application-wide kill flag.
pub fn create_global_kill(prefix: &str) -> Result<SharedFlagBlock> {
    SharedFlagBlock::create(&segment_name(prefix, "gk"), 1)
}

impl GroupIpcFlags {
    /// Allocate the group flags. `global` is the application kill block; a private
    /// one is created when none is given.
    pub fn create(prefix: &str, global: Option<&SharedFlagBlockDescriptor>) -> Result<Self> {
        let global = match global {
            Some(descriptor) => SharedFlagBlock::recreate(descriptor)?,
            None => create_global_kill(prefix)?,
        };
        Ok(Self {
            global,
            group: SharedFlagBlock::create(&segment_name(prefix, "ipc"), GROUP_FLAG_COUNT)?,
            loop_count: SharedMemoryNumber::create(&segment_name(prefix, "loops"), 0)?,
        })
    }

    pub fn recreate(descriptor: &GroupIpcFlagsDescriptor) -> Result<Self> {
        Ok(Self {
            global: SharedFlagBlock::recreate(&descriptor.global)?,
            group: SharedFlagBlock::recreate(&descriptor.group)?,
            loop_count: SharedMemoryNumber::recreate(&descriptor.loop_count)?,
        })
    }

    pub fn descriptor(&self) -> GroupIpcFlagsDescriptor {
        GroupIpcFlagsDescriptor {
            global: self.global.descriptor(),
            group: self.group.descriptor(),
            loop_count: self.loop_count.descriptor(),
        }
    }

    pub fn global_kill(&self) -> bool {
        self.global.is_set(GLOBAL_KILL)
    }

    pub fn set_global_kill(&self) {
        self.global.set(GLOBAL_KILL);
    }

    pub fn group_kill(&self) -> bool {
        self.group.is_set(GROUP_KILL)
    }

    pub fn kill_group(&self) {
        if !self.group_kill() {
            warn!("camera group kill flag raised");
        }
        self.group.set(GROUP_KILL);
    }

    /// Neither kill flag is up.
    #[inline]
    pub fn should_continue(&self) -> bool {
        !self.global_kill() && !self.group_kill()
    }

    /// The group flag block, for parking on one of its flags.
    pub fn block(&self) -> &SharedFlagBlock {
        &self.group
    }

    pub fn is_set(&self, flag: usize) -> bool {
        self.group.is_set(flag)
    }

    pub fn store(&self, flag: usize, value: bool) {
        self.group.store(flag, value);
    }

    pub fn park(&self, flag: usize, current: bool, quantum: Duration) {
        self.group.park(flag, current, quantum);
    }

    pub fn record_frames(&self) -> bool {
        self.is_set(RECORD_FRAMES)
    }

    pub fn set_record_frames(&self, record: bool) {
        self.store(RECORD_FRAMES, record);
    }

    pub fn cameras_connected(&self) -> bool {
        self.is_set(CAMERAS_CONNECTED)
    }

    pub fn should_pull_multi_frame(&self) -> bool {
        self.is_set(SHOULD_PULL_MULTI_FRAME)
    }

    pub fn pause_when_able(&self) -> bool {
        self.is_set(PAUSE_WHEN_ABLE)
    }

    pub fn frame_loop_paused(&self) -> bool {
        self.is_set(FRAME_LOOP_PAUSED)
    }

    pub fn loop_count(&self) -> u64 {
        self.loop_count.get().max(0) as u64
    }

    pub(crate) fn increment_loop_count(&self) -> u64 {
        (self.loop_count.fetch_add(1) + 1) as u64
    }
}

impl KillSwitch for GroupIpcFlags {
    fn should_stop(&self) -> bool {
        !self.should_continue()
    }

    fn escalate(&self) {
        self.kill_group();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::group_prefix;

    #[test]
    fn test_global_kill_is_shared_across_groups() {
        let app = create_global_kill(&group_prefix()).unwrap();
        let first = GroupIpcFlags::create(&group_prefix(), Some(&app.descriptor())).unwrap();
        let second = GroupIpcFlags::create(&group_prefix(), Some(&app.descriptor())).unwrap();

        first.kill_group();
        assert!(!first.should_continue());
        assert!(second.should_continue());

        app.set(0);
        assert!(second.global_kill());
        assert!(second.should_stop());
    }

    #[test]
    fn test_attached_flags_see_loop_count() {
        let ipc = GroupIpcFlags::create(&group_prefix(), None).unwrap();
        let worker = GroupIpcFlags::recreate(&ipc.descriptor()).unwrap();

        assert_eq!(ipc.increment_loop_count(), 1);
        assert_eq!(worker.loop_count(), 1);

        worker.set_record_frames(true);
        assert!(ipc.record_frames());
        assert!(!ipc.frame_loop_paused());
    }
}
