//! Grab / retrieve / copy rendezvous for every camera in a group

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, trace};

use super::ipc::{GroupIpcFlags, CAMERAS_CONNECTED, FRAME_LOOP_PAUSED, PAUSE_WHEN_ABLE, SHOULD_PULL_MULTI_FRAME};
use super::wait::{KillSwitch, WaitBudget, Waiter, ORCHESTRATOR_QUANTUM, READINESS_QUANTUM};
use crate::camera::flags::{SHOULD_COPY, SHOULD_GRAB, SHOULD_RETRIEVE};
use crate::camera::{CameraFrameLoopFlags, CameraId};
use crate::error::{Result, SyncError};

/// Polls of the per-loop flags after a pull before calling it a desync.
const VERIFY_ATTEMPTS: usize = 100;

/// Drives the per-camera flags through one trigger cycle at a time.
///
/// Every wait is bounded by `timeout`; running out raises the group kill flag
/// so all camera workers and the relay stop with it.
#[derive(Debug)]
pub struct CameraGroupOrchestrator {
    ipc: Arc<GroupIpcFlags>,
    cameras: BTreeMap<CameraId, Arc<CameraFrameLoopFlags>>,
    timeout: Duration,
}

impl KillSwitch for CameraGroupOrchestrator {
    fn should_stop(&self) -> bool {
        !self.ipc.should_continue() || self.closed_camera().is_some()
    }

    fn escalate(&self) {
        self.ipc.kill_group();
    }
}

impl CameraGroupOrchestrator {
    pub fn new(
        ipc: Arc<GroupIpcFlags>,
        cameras: BTreeMap<CameraId, Arc<CameraFrameLoopFlags>>,
        timeout: Duration,
    ) -> Self {
        Self { ipc, cameras, timeout }
    }

    pub fn ipc(&self) -> &GroupIpcFlags {
        &self.ipc
    }

    pub fn all_ready(&self) -> bool {
        self.cameras.values().all(|flags| flags.camera_ready())
    }

    /// First camera that asked to be shut down, if any.
    pub fn closed_camera(&self) -> Option<CameraId> {
        self.cameras
            .iter()
            .find(|(_, flags)| flags.close_self())
            .map(|(id, _)| *id)
    }

    /// Turn a cancellation caused by a camera closing itself into a group failure.
    fn escalate_closed_camera(&self, err: SyncError) -> SyncError {
        let closed = match &err {
            SyncError::CameraClosed(camera_id) => Some(*camera_id),
            e if e.is_cancelled() => self.closed_camera(),
            _ => None,
        };
        match closed {
            Some(camera_id) => {
                error!(%camera_id, "camera shut itself down, closing the group");
                self.ipc.kill_group();
                SyncError::CameraClosed(camera_id)
            }
            None => err,
        }
    }

    pub fn await_ready(&self) -> Result<()> {
        Waiter::new("all cameras ready", WaitBudget::readiness(self.timeout), self)
            .until(|| match self.closed_camera() {
                Some(camera_id) => Err(SyncError::CameraClosed(camera_id)),
                None => Ok(self.all_ready()),
            })
            .map_err(|e| self.escalate_closed_camera(e))
    }

    fn await_acknowledged(&self, what: &str, flag: usize) -> Result<()> {
        let mut waiter = Waiter::new(what, WaitBudget::orchestrator(self.timeout), self);
        for flags in self.cameras.values() {
            waiter.until_flag(flags.block(), flag, false)?;
        }
        Ok(())
    }

    fn request_all(&self, flag: usize) {
        for flags in self.cameras.values() {
            flags.request(flag);
        }
    }

    fn verify_loop_reset(&self, number: u64) -> Result<()> {
        for _ in 0..VERIFY_ATTEMPTS {
            if self.cameras.values().all(|flags| flags.loop_flags_reset()) {
                return Ok(());
            }
            std::thread::sleep(ORCHESTRATOR_QUANTUM);
        }
        self.ipc.kill_group();
        Err(SyncError::Desync(format!(
            "per-camera flags did not reset after multi-frame {number}"
        )))
    }

    /// Run one full trigger cycle. Returns the new loop count.
    pub fn trigger_multi_frame_loop(&self) -> Result<u64> {
        let number = self.ipc.loop_count();
        trace!(multi_frame_number = number, "trigger cycle");

        let cycle = || -> Result<()> {
            self.await_ready()?;
            for flags in self.cameras.values() {
                flags.clear_loop_flags();
            }

            self.request_all(SHOULD_GRAB);
            self.await_acknowledged("grab acknowledgements", SHOULD_GRAB)?;

            self.request_all(SHOULD_RETRIEVE);
            self.await_acknowledged("retrieve acknowledgements", SHOULD_RETRIEVE)?;

            self.request_all(SHOULD_COPY);
            self.await_acknowledged("copy acknowledgements", SHOULD_COPY)?;

            self.ipc.store(SHOULD_PULL_MULTI_FRAME, true);
            Waiter::new("multi-frame pull", WaitBudget::orchestrator(self.timeout), self).until_flag(
                self.ipc.block(),
                SHOULD_PULL_MULTI_FRAME,
                false,
            )
        };
        cycle().map_err(|e| self.escalate_closed_camera(e))?;

        self.verify_loop_reset(number)?;
        Ok(self.ipc.increment_loop_count())
    }

    /// Ask the trigger loop to pause at the next loop boundary.
    pub fn pause(&self) {
        info!("pausing frame loop");
        self.ipc.store(PAUSE_WHEN_ABLE, true);
    }

    /// Block until the trigger loop reports it is paused.
    pub fn await_paused(&self) -> Result<()> {
        Waiter::new("frame loop pause", WaitBudget::readiness(self.timeout), &*self.ipc).until(|| {
            Ok(self.ipc.frame_loop_paused())
        })
    }

    /// Clear a pause request and wait for the loop to pick back up.
    pub fn unpause(&self) -> Result<()> {
        info!("unpausing frame loop");
        self.ipc.store(PAUSE_WHEN_ABLE, false);
        Waiter::new("frame loop resume", WaitBudget::readiness(self.timeout), &*self.ipc)
            .until(|| Ok(!self.ipc.frame_loop_paused()))
    }

    fn hold_while_paused(&self) -> Result<()> {
        self.ipc.store(FRAME_LOOP_PAUSED, true);
        info!(loop_count = self.ipc.loop_count(), "frame loop paused");
        let held = Waiter::new("unpause", WaitBudget::unbounded(READINESS_QUANTUM), self).until(|| {
            Ok(!self.ipc.pause_when_able())
        });
        self.ipc.store(FRAME_LOOP_PAUSED, false);
        held
    }

    /// The trigger loop: wait for every camera, then cycle until killed or
    /// `max_multi_frames` have been produced.
    #[instrument(skip(self), fields(cameras = self.cameras.len()))]
    pub fn run(&self, max_multi_frames: Option<u64>) -> Result<()> {
        let result = self.run_inner(max_multi_frames).map_err(|e| self.escalate_closed_camera(e));
        match result {
            Err(e) if e.is_cancelled() => {
                debug!("trigger loop cancelled by kill flag");
                Ok(())
            }
            other => other,
        }
    }

    fn run_inner(&self, max_multi_frames: Option<u64>) -> Result<()> {
        self.await_ready()?;
        self.ipc.store(CAMERAS_CONNECTED, true);
        info!("all cameras connected, starting trigger loop");

        while self.ipc.should_continue() {
            if max_multi_frames.is_some_and(|max| self.ipc.loop_count() >= max) {
                info!(loop_count = self.ipc.loop_count(), "requested number of multi-frames reached");
                break;
            }
            if self.ipc.pause_when_able() {
                self.hold_while_paused()?;
                continue;
            }
            self.trigger_multi_frame_loop()?;
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use std::thread::JoinHandle;
    use std::time::Instant;

    use super::*;
    use crate::camera::flags::CameraFrameLoopFlagsDescriptor;
    use crate::group::ipc::GroupIpcFlagsDescriptor;
    use crate::shm::{group_prefix, segment_name};

    struct Rig {
        orchestrator: Arc<CameraGroupOrchestrator>,
        threads: Vec<JoinHandle<()>>,
    }

    /// A camera that acknowledges every request, except grab when `stuck`.
    fn simulated_camera(ipc: GroupIpcFlagsDescriptor, flags: CameraFrameLoopFlagsDescriptor, stuck: bool) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let ipc = GroupIpcFlags::recreate(&ipc).unwrap();
            let flags = CameraFrameLoopFlags::recreate(&flags).unwrap();
            flags.set_camera_ready(true);
            while ipc.should_continue() {
                if flags.should_grab() && !stuck {
                    flags.acknowledge(SHOULD_GRAB);
                }
                if flags.should_retrieve() {
                    flags.acknowledge(SHOULD_RETRIEVE);
                }
                if flags.should_copy() {
                    flags.set_new_frame_available(true);
                    flags.acknowledge(SHOULD_COPY);
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        })
    }

    /// Stands in for the frame-loop relay: consumes every pull request.
    fn simulated_relay(ipc: GroupIpcFlagsDescriptor, cameras: Vec<CameraFrameLoopFlagsDescriptor>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            let ipc = GroupIpcFlags::recreate(&ipc).unwrap();
            let cameras: Vec<_> = cameras.iter().map(|d| CameraFrameLoopFlags::recreate(d).unwrap()).collect();
            while ipc.should_continue() {
                if ipc.should_pull_multi_frame() {
                    for flags in &cameras {
                        flags.set_new_frame_available(false);
                    }
                    ipc.store(SHOULD_PULL_MULTI_FRAME, false);
                }
                std::thread::sleep(Duration::from_micros(200));
            }
        })
    }

    fn rig(cameras: u32, stuck: Option<u32>, timeout: Duration) -> Rig {
        let prefix = group_prefix();
        let ipc = Arc::new(GroupIpcFlags::create(&prefix, None).unwrap());
        let flags: BTreeMap<_, _> = (0..cameras)
            .map(|i| {
                let name = segment_name(&prefix, &format!("c{i}-f"));
                (CameraId(i), Arc::new(CameraFrameLoopFlags::create(&name).unwrap()))
            })
            .collect();

        let mut threads: Vec<_> = flags
            .iter()
            .map(|(id, f)| simulated_camera(ipc.descriptor(), f.descriptor(), stuck == Some(id.0)))
            .collect();
        threads.push(simulated_relay(ipc.descriptor(), flags.values().map(|f| f.descriptor()).collect()));

        Rig {
            orchestrator: Arc::new(CameraGroupOrchestrator::new(ipc, flags, timeout)),
            threads,
        }
    }

    impl Rig {
        fn shutdown(self) {
            self.orchestrator.ipc().set_global_kill();
            for thread in self.threads {
                thread.join().unwrap();
            }
        }
    }

    #[test]
    fn test_cycles_increment_loop_count_by_one() {
        let rig = rig(3, None, Duration::from_secs(10));
        rig.orchestrator.run(Some(5)).unwrap();
        assert_eq!(rig.orchestrator.ipc().loop_count(), 5);
        assert!(rig.orchestrator.ipc().cameras_connected());
        assert!(rig.orchestrator.ipc().should_continue());
        rig.shutdown();
    }

    #[test]
    fn test_unacknowledged_grab_times_out_and_kills_group() {
        let timeout = Duration::from_millis(300);
        let rig = rig(3, Some(1), timeout);

        let start = Instant::now();
        let err = rig.orchestrator.run(None).unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, SyncError::Timeout { .. }), "{err:?}");
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(2), "{elapsed:?}");
        assert!(rig.orchestrator.ipc().group_kill());
        assert!(!rig.orchestrator.ipc().should_continue());
        // The simulated workers observed the kill and exited
        for thread in rig.threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn test_camera_closing_itself_tears_group_down() {
        let rig = rig(2, None, Duration::from_secs(10));
        rig.orchestrator.cameras[&CameraId(1)].set_close_self();

        let err = rig.orchestrator.run(None).unwrap_err();
        assert!(matches!(err, SyncError::CameraClosed(CameraId(1))), "{err:?}");
        assert!(rig.orchestrator.ipc().group_kill());
        for thread in rig.threads {
            thread.join().unwrap();
        }
    }

    #[test]
    fn test_pause_holds_loop_until_unpaused() {
        let rig = rig(2, None, Duration::from_secs(10));
        rig.orchestrator.pause();

        let runner = {
            let orchestrator = rig.orchestrator.clone();
            std::thread::spawn(move || orchestrator.run(Some(3)))
        };

        rig.orchestrator.await_paused().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(rig.orchestrator.ipc().loop_count(), 0);

        rig.orchestrator.unpause().unwrap();
        runner.join().unwrap().unwrap();
        assert_eq!(rig.orchestrator.ipc().loop_count(), 3);
        rig.shutdown();
    }
}
