//! One worker per camera: owns the capture handle and answers the trigger flags
//!
//! A worker is normally its own OS process (the `synccam` binary re-executed with
//! the hidden `camera-worker` subcommand). The same worker function can run on a
//! thread instead; it attaches shared memory by name either way.

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, trace, warn};

use super::config::{CameraConfig, CameraId};
use super::device::{apply_config, open_device, CaptureDevice};
use super::flags::{CameraFrameLoopFlags, CameraFrameLoopFlagsDescriptor, SHOULD_COPY, SHOULD_GRAB, SHOULD_RETRIEVE};
use crate::error::{Result, SyncError};
use crate::frame::{FrameLifecycle, FrameMetadata, FramePayload};
use crate::group::messages::{CameraCommand, IpcMessage, Mailbox};
use crate::group::wait::{KillSwitch, WaitBudget, Waiter, READINESS_QUANTUM};
use crate::group::{GroupIpcFlags, GroupIpcFlagsDescriptor, PerCameraSharedMemory};
use crate::shm::SharedMemoryRingBufferDescriptor;

/// Overrides the binary re-executed for camera worker processes, unless the
/// group settings name one.
pub const WORKER_BINARY_ENV: &str = "SYNCCAM_WORKER_BIN";

/// Everything a worker needs, passed as JSON on its command line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraWorkerDescriptor {
    pub camera_id: CameraId,
    /// Position in the group, used for synthetic frame content and core pinning.
    pub camera_index: usize,
    pub config: CameraConfig,
    pub ipc: GroupIpcFlagsDescriptor,
    pub flags: CameraFrameLoopFlagsDescriptor,
    /// Controller to worker.
    pub commands: SharedMemoryRingBufferDescriptor,
    /// Worker to controller.
    pub reports: SharedMemoryRingBufferDescriptor,
    pub wait_timeout: Duration,
    pub pin_to_core: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSpawner {
    /// Re-execute the current binary, one OS process per camera.
    #[default]
    Process,
    /// Run the worker on a thread of this process.
    Thread,
}

/// Kill flags as seen from inside a camera worker.
struct WorkerKill<'a> {
    ipc: &'a GroupIpcFlags,
    flags: &'a CameraFrameLoopFlags,
}

impl KillSwitch for WorkerKill<'_> {
    fn should_stop(&self) -> bool {
        !self.ipc.should_continue() || self.flags.close_self()
    }

    fn escalate(&self) {
        self.ipc.kill_group();
    }
}

struct CameraWorker<'a> {
    descriptor: &'a CameraWorkerDescriptor,
    kill: WorkerKill<'a>,
    commands: Mailbox<CameraCommand>,
    reports: Mailbox<IpcMessage>,
    device: Box<dyn CaptureDevice>,
    config: CameraConfig,
    frame_buffer: Option<PerCameraSharedMemory>,
    frame_number: u64,
}

impl CameraWorker<'_> {
    fn flags(&self) -> &CameraFrameLoopFlags {
        self.kill.flags
    }

    fn report_config(&mut self) -> Result<()> {
        let message = IpcMessage::ConfigUpdate {
            config: self.config.clone(),
        };
        let mut waiter = Waiter::new("report mailbox space", WaitBudget::readiness(self.descriptor.wait_timeout), &self.kill);
        let reports = &mut self.reports;
        waiter.until(|| match reports.send(&message) {
            Ok(()) => Ok(true),
            Err(e) if e.is_retryable() => Ok(false),
            Err(e) => Err(e),
        })
    }

    fn apply(&mut self, requested: &CameraConfig) -> Result<()> {
        let extracted = apply_config(self.device.as_mut(), requested)?;
        if let Some(buffer) = &self.frame_buffer {
            if extracted.image_shape() != buffer.shape() {
                return Err(SyncError::ConfigRejected {
                    camera_id: extracted.camera_id,
                    reason: format!(
                        "image shape changed from {:?} to {:?} without recreating the group",
                        buffer.shape(),
                        extracted.image_shape()
                    ),
                });
            }
        }
        self.config = extracted;
        self.report_config()
    }

    fn handle_command(&mut self, command: CameraCommand) -> Result<()> {
        match command {
            CameraCommand::AttachFrameBuffer { buffer } => {
                let memory = PerCameraSharedMemory::recreate(&buffer, false)?;
                if memory.shape() != self.config.image_shape() {
                    return Err(SyncError::Shape {
                        name: buffer.ring.name.clone(),
                        expected: self.config.image_size_bytes(),
                        actual: memory.shape().0 as usize * memory.shape().1 as usize * memory.shape().2 as usize,
                    });
                }
                debug!("frame buffer attached");
                self.frame_buffer = Some(memory);
            }
            CameraCommand::UpdateConfig { config } => {
                info!("applying config update");
                self.flags().set_camera_ready(false);
                self.apply(&config)?;
                if self.frame_buffer.is_some() {
                    self.flags().set_camera_ready(true);
                }
            }
        }
        Ok(())
    }

    fn await_frame_buffer(&mut self) -> Result<()> {
        let started = Instant::now();
        while self.frame_buffer.is_none() {
            if self.kill.should_stop() {
                return Err(SyncError::Cancelled {
                    what: "frame buffer".into(),
                });
            }
            if started.elapsed() > self.descriptor.wait_timeout {
                return Err(SyncError::Timeout {
                    what: "frame buffer".into(),
                    waited: started.elapsed(),
                });
            }
            match self.commands.recv()? {
                Some(command) => self.handle_command(command)?,
                None => std::thread::sleep(READINESS_QUANTUM),
            }
        }
        Ok(())
    }

    fn read_probe_frame(&mut self) -> Result<()> {
        let camera_id = self.descriptor.camera_id;
        if !self.device.grab() {
            return Err(SyncError::Capture {
                camera_id,
                reason: "probe frame could not be grabbed".into(),
            });
        }
        let image = self.device.retrieve().ok_or_else(|| SyncError::Capture {
            camera_id,
            reason: "probe frame could not be retrieved".into(),
        })?;
        if image.len() != self.config.image_size_bytes() {
            return Err(SyncError::ConfigRejected {
                camera_id,
                reason: format!(
                    "probe frame has {} bytes, config says {}",
                    image.len(),
                    self.config.image_size_bytes()
                ),
            });
        }
        Ok(())
    }

    /// Idle until the orchestrator asks for a grab, applying commands meanwhile.
    /// Returns `false` when a kill flag ended the wait.
    fn await_grab(&mut self) -> Result<bool> {
        loop {
            if self.kill.should_stop() {
                return Ok(false);
            }
            if self.flags().should_grab() {
                return Ok(true);
            }
            if self.commands.has_messages() {
                if let Some(command) = self.commands.recv()? {
                    self.handle_command(command)?;
                }
                continue;
            }
            self.flags().park(SHOULD_GRAB, false, READINESS_QUANTUM);
        }
    }

    fn capture_one(&mut self) -> Result<()> {
        let camera_id = self.descriptor.camera_id;
        let timeout = self.descriptor.wait_timeout;
        let mut metadata = FrameMetadata::new(camera_id, self.frame_number, self.config.image_shape());

        metadata.stamp(FrameLifecycle::PreGrab);
        let grabbed = self.device.grab();
        metadata.stamp(FrameLifecycle::PostGrab);
        if !grabbed {
            return Err(SyncError::Capture {
                camera_id,
                reason: format!("grab failed for frame {}", self.frame_number),
            });
        }
        self.flags().acknowledge(SHOULD_GRAB);

        Waiter::new("retrieve trigger", WaitBudget::trigger(timeout), &self.kill).until_flag(
            self.flags().block(),
            SHOULD_RETRIEVE,
            true,
        )?;
        metadata.stamp(FrameLifecycle::PreRetrieve);
        let image = self.device.retrieve();
        metadata.stamp(FrameLifecycle::PostRetrieve);
        let image = image.ok_or_else(|| SyncError::Capture {
            camera_id,
            reason: format!("retrieve failed for frame {}", self.frame_number),
        })?;
        self.flags().acknowledge(SHOULD_RETRIEVE);

        Waiter::new("copy trigger", WaitBudget::trigger(timeout), &self.kill).until_flag(
            self.flags().block(),
            SHOULD_COPY,
            true,
        )?;
        metadata.stamp(FrameLifecycle::CopyToCameraBuffer);
        let frame = FramePayload::new(image, metadata)?;

        let buffer = self.frame_buffer.as_mut().ok_or_else(|| SyncError::Capture {
            camera_id,
            reason: "no frame buffer attached".into(),
        })?;
        Waiter::new("camera buffer space", WaitBudget::trigger(timeout), &self.kill).until(|| {
            match buffer.put_frame(&frame) {
                Ok(_) => Ok(true),
                Err(e) if e.is_retryable() => Ok(false),
                Err(e) => Err(e),
            }
        })?;

        self.kill.flags.set_new_frame_available(true);
        self.kill.flags.acknowledge(SHOULD_COPY);
        trace!(frame_number = self.frame_number, "frame published");
        self.frame_number += 1;
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let descriptor = self.descriptor;
        self.apply(&descriptor.config)?;
        self.await_frame_buffer()?;
        self.read_probe_frame()?;

        self.flags().set_camera_ready(true);
        info!(config = ?self.config.resolution, framerate = self.config.framerate, "camera ready");

        while self.await_grab()? {
            self.capture_one()?;
        }
        Ok(())
    }
}

/// Worker entry point, for both the `camera-worker` subcommand and thread workers.
///
/// Any failure sets this camera's close-self flag; failures inside the frame loop
/// also bring the whole group down.
pub fn run_camera_worker(descriptor: &CameraWorkerDescriptor) -> Result<()> {
    let span = info_span!("camera", id = %descriptor.camera_id);
    let _entered = span.enter();

    let ipc = GroupIpcFlags::recreate(&descriptor.ipc)?;
    let flags = CameraFrameLoopFlags::recreate(&descriptor.flags)?;

    if let Some(core) = descriptor.pin_to_core {
        if !core_affinity::set_for_current(core_affinity::CoreId { id: core }) {
            warn!(core, "could not pin camera worker to core");
        }
    }

    let result = (|| -> Result<u64> {
        let commands = Mailbox::recreate(&descriptor.commands)?;
        let reports = Mailbox::recreate(&descriptor.reports)?;
        let device = open_device(&descriptor.config, descriptor.camera_index)?;
        let mut worker = CameraWorker {
            descriptor,
            kill: WorkerKill {
                ipc: &ipc,
                flags: &flags,
            },
            commands,
            reports,
            device,
            config: descriptor.config.clone(),
            frame_buffer: None,
            frame_number: 0,
        };
        let result = worker.run();
        worker.device.release();
        result.map(|()| worker.frame_number)
    })();

    flags.set_camera_ready(false);
    match result {
        Ok(frames) => {
            info!(frames, "camera worker finished");
            Ok(())
        }
        Err(e) if e.is_cancelled() => {
            debug!("camera worker stopped by kill flag");
            Ok(())
        }
        Err(e) => {
            error!("camera worker failed: {}", e);
            flags.set_close_self();
            if ipc.cameras_connected() {
                ipc.kill_group();
            }
            Err(e)
        }
    }
}

enum WorkerHandle {
    Process(Child),
    Thread(Option<JoinHandle<Result<()>>>),
}

/// Controller-side handle on one camera worker.
pub struct CameraProcess {
    camera_id: CameraId,
    handle: WorkerHandle,
}

impl CameraProcess {
    /// `worker_binary` is the executable re-run for `WorkerSpawner::Process`;
    /// defaults to `$SYNCCAM_WORKER_BIN`, then the current executable.
    pub fn spawn(
        descriptor: CameraWorkerDescriptor,
        spawner: &WorkerSpawner,
        worker_binary: Option<&Path>,
    ) -> Result<Self> {
        let camera_id = descriptor.camera_id;
        let handle = match spawner {
            WorkerSpawner::Process => {
                let program = match (worker_binary, std::env::var_os(WORKER_BINARY_ENV)) {
                    (Some(path), _) => path.to_path_buf(),
                    (None, Some(path)) => PathBuf::from(path),
                    (None, None) => std::env::current_exe()?,
                };
                let child = Command::new(&program)
                    .arg("camera-worker")
                    .arg(serde_json::to_string(&descriptor)?)
                    .stdin(Stdio::null())
                    .spawn()?;
                info!(%camera_id, pid = child.id(), program = %program.display(), "spawned camera worker process");
                WorkerHandle::Process(child)
            }
            WorkerSpawner::Thread => {
                let thread = std::thread::Builder::new()
                    .name(format!("camera-{camera_id}"))
                    .spawn(move || run_camera_worker(&descriptor))?;
                info!(%camera_id, "spawned camera worker thread");
                WorkerHandle::Thread(Some(thread))
            }
        };
        Ok(Self { camera_id, handle })
    }

    pub fn camera_id(&self) -> CameraId {
        self.camera_id
    }

    /// OS process id, `None` for thread workers.
    pub fn pid(&self) -> Option<u32> {
        match &self.handle {
            WorkerHandle::Process(child) => Some(child.id()),
            WorkerHandle::Thread(_) => None,
        }
    }

    /// Liveness check. A worker that exited (for any reason) is not alive.
    pub fn is_alive(&mut self) -> bool {
        match &mut self.handle {
            WorkerHandle::Process(child) => matches!(child.try_wait(), Ok(None)),
            WorkerHandle::Thread(thread) => thread.as_ref().is_some_and(|t| !t.is_finished()),
        }
    }

    /// Wait for the worker to exit after the kill flags went up. Processes that
    /// outstay `timeout` are killed.
    pub fn join(mut self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        match &mut self.handle {
            WorkerHandle::Process(child) => loop {
                if let Some(status) = child.try_wait()? {
                    return if status.success() {
                        Ok(())
                    } else {
                        Err(SyncError::Capture {
                            camera_id: self.camera_id,
                            reason: format!("worker process exited with {status}"),
                        })
                    };
                }
                if started.elapsed() > timeout {
                    warn!(camera_id = %self.camera_id, "camera worker did not exit, killing it");
                    child.kill()?;
                    child.wait()?;
                    return Err(SyncError::Timeout {
                        what: format!("camera {} worker exit", self.camera_id),
                        waited: started.elapsed(),
                    });
                }
                std::thread::sleep(READINESS_QUANTUM);
            },
            WorkerHandle::Thread(thread) => {
                let Some(thread) = thread.take() else {
                    return Ok(());
                };
                while !thread.is_finished() {
                    if started.elapsed() > timeout {
                        return Err(SyncError::Timeout {
                            what: format!("camera {} worker exit", self.camera_id),
                            waited: started.elapsed(),
                        });
                    }
                    std::thread::sleep(READINESS_QUANTUM);
                }
                thread
                    .join()
                    .map_err(|_| SyncError::WorkerPanicked(format!("camera-{}", self.camera_id)))?
            }
        }
    }
}

impl Drop for CameraProcess {
    fn drop(&mut self) {
        if let WorkerHandle::Process(child) = &mut self.handle {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
    }
}
