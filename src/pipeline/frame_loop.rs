//! Trigger loop and multi-frame relay threads

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, trace};

use super::framerate::{FramerateTracker, DEFAULT_FRAMERATE_WINDOW};
use crate::camera::{CameraFrameLoopFlags, CameraId};
use crate::error::{Result, SyncError};
use crate::frame::{FrameLifecycle, TimebaseMapping};
use crate::group::ipc::SHOULD_PULL_MULTI_FRAME;
use crate::group::messages::IpcMessage;
use crate::group::wait::{WaitBudget, Waiter, ORCHESTRATOR_QUANTUM, TRIGGER_QUANTUM};
use crate::group::{
    CameraGroupOrchestrator, CameraGroupSharedMemory, CameraGroupSharedMemoryDescriptor, GroupIpcFlags,
    MultiFrameEscapeRingBuffer, MultiFrameEscapeRingBufferDescriptor,
};

/// Multi-frames between framerate reports.
pub const FRAMERATE_REPORT_INTERVAL: u64 = 10;

/// Pulls each completed multi-frame out of the camera buffers and republishes it
/// into the escape buffer.
pub struct FrameRelay {
    ipc: Arc<GroupIpcFlags>,
    cameras: BTreeMap<CameraId, Arc<CameraFrameLoopFlags>>,
    shm: CameraGroupSharedMemory,
    escape: MultiFrameEscapeRingBuffer,
    timebase: TimebaseMapping,
    timeout: Duration,
    next_number: u64,
    tracker: FramerateTracker,
    outbound: Option<flume::Sender<IpcMessage>>,
}

impl FrameRelay {
    pub fn new(
        ipc: Arc<GroupIpcFlags>,
        cameras: BTreeMap<CameraId, Arc<CameraFrameLoopFlags>>,
        shm: &CameraGroupSharedMemoryDescriptor,
        escape: &MultiFrameEscapeRingBufferDescriptor,
        timebase: TimebaseMapping,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            next_number: ipc.loop_count(),
            ipc,
            cameras,
            shm: CameraGroupSharedMemory::recreate(shm, false)?,
            escape: MultiFrameEscapeRingBuffer::recreate(escape, false)?,
            timebase,
            timeout,
            tracker: FramerateTracker::new(DEFAULT_FRAMERATE_WINDOW),
            outbound: None,
        })
    }

    /// Send framerate samples upstream.
    pub fn with_outbound(mut self, outbound: flume::Sender<IpcMessage>) -> Self {
        self.outbound = Some(outbound);
        self
    }

    /// Move multi-frame `next_number` from the camera buffers to the escape buffer,
    /// then let the orchestrator start the next cycle.
    pub fn relay_one(&mut self) -> Result<u64> {
        let number = self.next_number;
        let mut multi_frame = self.shm.build_next_multi_frame(number, self.timebase)?;

        let escape = &mut self.escape;
        Waiter::new("escape buffer space", WaitBudget::orchestrator(self.timeout), &*self.ipc).until(|| {
            match escape.put_multi_frame(&mut multi_frame) {
                Ok(()) => Ok(true),
                Err(e) if e.is_retryable() => {
                    metrics::counter!("synccam_escape_overwrite_backoffs").increment(1);
                    Ok(false)
                }
                Err(e) => Err(e),
            }
        })?;
        self.shm.publish_multi_frame_number(number);

        for flags in self.cameras.values() {
            flags.set_new_frame_available(false);
        }
        self.ipc.store(SHOULD_PULL_MULTI_FRAME, false);
        metrics::counter!("synccam_multi_frames_relayed").increment(1);
        trace!(multi_frame_number = number, "multi-frame relayed");

        if let Some(grab_ns) = multi_frame.mean_timestamp_ns(FrameLifecycle::PostGrab) {
            self.tracker.record(grab_ns);
        }
        if number > 0 && number % FRAMERATE_REPORT_INTERVAL == 0 {
            if let Some(sample) = self.tracker.sample(number) {
                metrics::gauge!("synccam_framerate").set(sample.mean_framerate);
                debug!(framerate = sample.mean_framerate, "measured framerate");
                if let Some(outbound) = &self.outbound {
                    let _ = outbound.try_send(IpcMessage::FramerateSample(sample));
                }
            }
        }

        self.next_number += 1;
        Ok(number)
    }

    fn run_inner(&mut self) -> Result<()> {
        while self.ipc.should_continue() {
            if !self.ipc.should_pull_multi_frame() {
                self.ipc.park(SHOULD_PULL_MULTI_FRAME, false, ORCHESTRATOR_QUANTUM);
                continue;
            }
            if !self.shm.all_new_data_available() {
                std::thread::sleep(TRIGGER_QUANTUM);
                continue;
            }
            self.relay_one()?;
        }
        Ok(())
    }

    /// Relay until a kill flag goes up. A failure takes the group down with it.
    pub fn run(mut self) -> Result<()> {
        match self.run_inner() {
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => {
                error!("multi-frame relay failed: {}", e);
                self.ipc.kill_group();
                Err(e)
            }
            Ok(()) => {
                debug!(relayed = self.next_number, "multi-frame relay stopped");
                Ok(())
            }
        }
    }
}

fn join_worker(name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .join()
        .map_err(|_| SyncError::WorkerPanicked(name.to_string()))?
}

/// Owns the trigger thread (orchestrator) and the relay thread of one group.
pub struct FrameLoopManager {
    orchestrator: Arc<CameraGroupOrchestrator>,
    trigger: Option<JoinHandle<Result<()>>>,
    relay: Option<JoinHandle<Result<()>>>,
}

impl FrameLoopManager {
    /// Start both threads. The trigger loop stops by itself after
    /// `max_multi_frames`; the relay runs until the group is killed.
    pub fn start(
        orchestrator: Arc<CameraGroupOrchestrator>,
        relay: FrameRelay,
        max_multi_frames: Option<u64>,
    ) -> Result<Self> {
        let relay = std::thread::Builder::new()
            .name("multi-frame-relay".into())
            .spawn(move || relay.run())?;

        let trigger_orchestrator = orchestrator.clone();
        let trigger = std::thread::Builder::new()
            .name("trigger-loop".into())
            .spawn(move || trigger_orchestrator.run(max_multi_frames));
        let trigger = match trigger {
            Ok(trigger) => trigger,
            Err(e) => {
                orchestrator.ipc().kill_group();
                let _ = join_worker("multi-frame-relay", relay);
                return Err(e.into());
            }
        };
        info!(?max_multi_frames, "frame loop started");

        Ok(Self {
            orchestrator,
            trigger: Some(trigger),
            relay: Some(relay),
        })
    }

    pub fn orchestrator(&self) -> &Arc<CameraGroupOrchestrator> {
        &self.orchestrator
    }

    /// The trigger thread has exited (finished its frame budget, or failed).
    pub fn trigger_finished(&self) -> bool {
        self.trigger.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Join both threads; call after the group kill flag is up. Returns the
    /// first failure.
    pub fn join(mut self) -> Result<()> {
        let trigger = self.trigger.take().map(|h| join_worker("trigger-loop", h));
        let relay = self.relay.take().map(|h| join_worker("multi-frame-relay", h));
        trigger.unwrap_or(Ok(())).and(relay.unwrap_or(Ok(())))
    }
}
