//! One running camera group: worker processes, shared memory and the
//! controller-side threads around them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::{error, info, instrument, warn};

use super::escape::MultiFrameEscapeRingBuffer;
use super::ipc::{GroupIpcFlags, PAUSE_WHEN_ABLE};
use super::messages::{CameraCommand, IpcMessage, Mailbox};
use super::orchestrator::CameraGroupOrchestrator;
use super::shared_memory::{CameraBufferLayout, CameraGroupSharedMemory};
use super::wait::{WaitBudget, Waiter, DEFAULT_WAIT_TIMEOUT};
use crate::camera::{CameraConfig, CameraFrameLoopFlags, CameraId, CameraProcess, CameraWorkerDescriptor, WorkerSpawner};
use crate::error::{Result, SyncError};
use crate::frame::TimebaseMapping;
use crate::pipeline::preview::DEFAULT_PREVIEW_MAX_WIDTH;
use crate::pipeline::{FrameLoopManager, FrameRelay, FrameWrangler, PreviewFrame, PreviewRelay};
use crate::recording::writer::DEFAULT_JPEG_QUALITY;
use crate::recording::{default_writer_factory, RecordingInfo, RecordingSummary, WriterFactory};
use crate::shm::{group_prefix, segment_name, SharedFlagBlockDescriptor};

const WORKER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ESCAPE_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// How a group is built and run.
#[derive(Clone)]
pub struct CameraGroupSettings {
    pub wait_timeout: Duration,
    pub camera_buffer: CameraBufferLayout,
    pub escape_budget_bytes: usize,
    pub spawner: WorkerSpawner,
    /// Executable re-run for process workers.
    pub worker_binary: Option<PathBuf>,
    pub pin_workers_to_cores: bool,
    /// Stop triggering after this many multi-frames.
    pub max_multi_frames: Option<u64>,
    /// Connect the cameras but hold the trigger loop until `unpause`.
    pub start_paused: bool,
    pub preview_max_width: u32,
    pub preview_interval: Duration,
    pub writer_factory: WriterFactory,
}

impl Default for CameraGroupSettings {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            camera_buffer: CameraBufferLayout::default(),
            escape_budget_bytes: DEFAULT_ESCAPE_BUDGET_BYTES,
            spawner: WorkerSpawner::default(),
            worker_binary: None,
            pin_workers_to_cores: false,
            max_multi_frames: None,
            start_paused: false,
            preview_max_width: DEFAULT_PREVIEW_MAX_WIDTH,
            preview_interval: Duration::from_millis(50),
            writer_factory: default_writer_factory(DEFAULT_JPEG_QUALITY),
        }
    }
}

/// Controller ends of one camera's flags and mailboxes.
struct CameraLink {
    flags: Arc<CameraFrameLoopFlags>,
    commands: Mailbox<CameraCommand>,
    reports: Mailbox<IpcMessage>,
}

pub struct CameraGroup {
    prefix: String,
    timeout: Duration,
    ipc: Arc<GroupIpcFlags>,
    configs: ArcSwap<BTreeMap<CameraId, CameraConfig>>,
    links: BTreeMap<CameraId, CameraLink>,
    workers: BTreeMap<CameraId, CameraProcess>,
    shm: Option<CameraGroupSharedMemory>,
    escape: Option<MultiFrameEscapeRingBuffer>,
    orchestrator: Option<Arc<CameraGroupOrchestrator>>,
    frame_loop: Option<FrameLoopManager>,
    wrangler: Option<FrameWrangler>,
    preview: Option<PreviewRelay>,
    timebase: TimebaseMapping,
    outbound: flume::Sender<IpcMessage>,
    closed: bool,
}

impl CameraGroup {
    /// Spawn a worker per camera, size shared memory from the configs the
    /// cameras report back, then start the frame loop, wrangler and preview.
    ///
    /// `global_kill` is the application-wide kill block; `outbound` receives
    /// every upstream message.
    #[instrument(skip_all, fields(cameras = configs.len()))]
    pub fn create(
        configs: &BTreeMap<CameraId, CameraConfig>,
        global_kill: &SharedFlagBlockDescriptor,
        settings: &CameraGroupSettings,
        outbound: flume::Sender<IpcMessage>,
    ) -> Result<Self> {
        let requested: BTreeMap<CameraId, CameraConfig> = configs
            .iter()
            .filter(|(_, config)| config.use_this_camera)
            .map(|(id, config)| (*id, config.clone()))
            .collect();
        if requested.is_empty() {
            return Err(SyncError::Validation("no cameras selected for the group".into()));
        }

        let prefix = group_prefix();
        let ipc = Arc::new(GroupIpcFlags::create(&prefix, Some(global_kill))?);
        if settings.start_paused {
            ipc.store(PAUSE_WHEN_ABLE, true);
        }
        info!(%prefix, cameras = ?requested.keys().collect::<Vec<_>>(), "creating camera group");

        let mut group = Self {
            prefix,
            timeout: settings.wait_timeout,
            ipc,
            configs: ArcSwap::from_pointee(requested),
            links: BTreeMap::new(),
            workers: BTreeMap::new(),
            shm: None,
            escape: None,
            orchestrator: None,
            frame_loop: None,
            wrangler: None,
            preview: None,
            timebase: TimebaseMapping::now(),
            outbound,
            closed: false,
        };
        if let Err(e) = group.spawn_workers(settings).and_then(|()| group.connect(settings)) {
            error!("camera group failed to start: {}", e);
            if let Err(close_error) = group.close() {
                warn!("while closing: {}", close_error);
            }
            return Err(e);
        }
        Ok(group)
    }

    fn spawn_workers(&mut self, settings: &CameraGroupSettings) -> Result<()> {
        let cores = if settings.pin_workers_to_cores {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };
        let requested = self.configs.load_full();

        for (index, config) in requested.values().enumerate() {
            let id = config.camera_id;
            let link = CameraLink {
                flags: Arc::new(CameraFrameLoopFlags::create(&segment_name(&self.prefix, &format!("f{id}")))?),
                commands: Mailbox::create(&segment_name(&self.prefix, &format!("cmd{id}")))?,
                reports: Mailbox::create(&segment_name(&self.prefix, &format!("rep{id}")))?,
            };
            let descriptor = CameraWorkerDescriptor {
                camera_id: id,
                camera_index: index,
                config: config.clone(),
                ipc: self.ipc.descriptor(),
                flags: link.flags.descriptor(),
                commands: link.commands.descriptor(),
                reports: link.reports.descriptor(),
                wait_timeout: self.timeout,
                pin_to_core: (!cores.is_empty()).then(|| cores[index % cores.len()].id),
            };
            self.links.insert(id, link);
            self.workers
                .insert(
                    id,
                    CameraProcess::spawn(descriptor, &settings.spawner, settings.worker_binary.as_deref())?,
                );
        }
        Ok(())
    }

    /// Forward reports from every camera upstream; config updates also replace
    /// the live config. Returns the camera ids that reported a config.
    fn drain_reports(&mut self) -> Result<Vec<CameraId>> {
        let mut reported = Vec::new();
        for (id, link) in self.links.iter_mut() {
            for message in link.reports.drain()? {
                if let IpcMessage::ConfigUpdate { config } = &message {
                    self.configs.rcu(|configs| {
                        let mut configs = BTreeMap::clone(configs);
                        configs.insert(*id, config.clone());
                        configs
                    });
                    reported.push(*id);
                }
                let _ = self.outbound.try_send(message);
            }
        }
        Ok(reported)
    }

    /// Process ids of the camera workers that run as OS processes.
    pub fn worker_pids(&self) -> BTreeMap<CameraId, u32> {
        self.workers
            .iter()
            .filter_map(|(id, worker)| worker.pid().map(|pid| (*id, pid)))
            .collect()
    }

    /// Forward pending worker reports. Call periodically.
    pub fn pump_reports(&mut self) -> Result<usize> {
        self.drain_reports().map(|reported| reported.len())
    }

    /// Fails with `CameraClosed` if any worker died or asked to be shut down.
    pub fn check_health(&mut self) -> Result<()> {
        for (id, worker) in self.workers.iter_mut() {
            let closed = self.links.get(id).is_some_and(|link| link.flags.close_self());
            if closed || !worker.is_alive() {
                return Err(SyncError::CameraClosed(*id));
            }
        }
        Ok(())
    }

    /// Block until each camera in `pending` has reported a config.
    fn await_config_reports(&mut self, mut pending: Vec<CameraId>, what: &str) -> Result<()> {
        let ipc = self.ipc.clone();
        Waiter::new(what, WaitBudget::readiness(self.timeout), &*ipc).until(|| {
            let reported = self.drain_reports()?;
            pending.retain(|id| !reported.contains(id));
            if !pending.is_empty() {
                self.check_health()?;
            }
            Ok(pending.is_empty())
        })
    }

    fn connect(&mut self, settings: &CameraGroupSettings) -> Result<()> {
        let pending = self.links.keys().copied().collect();
        self.await_config_reports(pending, "extracted camera configs")?;
        let extracted = self.configs.load_full();

        let shm = CameraGroupSharedMemory::create(&self.prefix, &extracted, settings.camera_buffer)?;
        let escape = MultiFrameEscapeRingBuffer::create(&self.prefix, &extracted, settings.escape_budget_bytes)?;
        let shm_descriptor = shm.descriptor();
        let escape_descriptor = escape.descriptor();
        info!(escape_capacity = escape.capacity(), "shared memory sized from extracted configs");

        for (id, link) in self.links.iter_mut() {
            let buffer = shm_descriptor
                .cameras
                .get(id)
                .cloned()
                .ok_or_else(|| SyncError::Validation(format!("no frame buffer for camera {id}")))?;
            link.commands.send(&CameraCommand::AttachFrameBuffer { buffer })?;
        }
        self.shm = Some(shm);
        self.escape = Some(escape);

        self.timebase = TimebaseMapping::now();
        let camera_flags: BTreeMap<_, _> = self
            .links
            .iter()
            .map(|(id, link)| (*id, link.flags.clone()))
            .collect();
        let orchestrator = Arc::new(CameraGroupOrchestrator::new(
            self.ipc.clone(),
            camera_flags.clone(),
            self.timeout,
        ));
        let relay = FrameRelay::new(
            self.ipc.clone(),
            camera_flags,
            &shm_descriptor,
            &escape_descriptor,
            self.timebase,
            self.timeout,
        )?
        .with_outbound(self.outbound.clone());

        self.wrangler = Some(FrameWrangler::start(
            self.ipc.clone(),
            &escape_descriptor,
            settings.writer_factory.clone(),
            self.timeout,
        )?);
        self.preview = Some(PreviewRelay::start(
            self.ipc.clone(),
            &escape_descriptor,
            settings.preview_max_width,
            settings.preview_interval,
        )?);
        self.frame_loop = Some(FrameLoopManager::start(
            orchestrator.clone(),
            relay,
            settings.max_multi_frames,
        )?);
        self.orchestrator = Some(orchestrator);
        Ok(())
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn camera_ids(&self) -> Vec<CameraId> {
        self.links.keys().copied().collect()
    }

    /// Live (extracted) camera configs.
    pub fn configs(&self) -> Arc<BTreeMap<CameraId, CameraConfig>> {
        self.configs.load_full()
    }

    pub fn ipc(&self) -> &Arc<GroupIpcFlags> {
        &self.ipc
    }

    pub fn timebase(&self) -> TimebaseMapping {
        self.timebase
    }

    pub fn loop_count(&self) -> u64 {
        self.ipc.loop_count()
    }

    pub fn latest_multi_frame_number(&self) -> Option<u64> {
        self.shm.as_ref().and_then(CameraGroupSharedMemory::latest_multi_frame_number)
    }

    pub fn is_recording(&self) -> bool {
        self.ipc.record_frames()
    }

    /// The trigger loop has stopped, by finishing its budget or by failing.
    pub fn frame_loop_finished(&self) -> bool {
        self.frame_loop.as_ref().map_or(true, FrameLoopManager::trigger_finished)
    }

    fn orchestrator(&self) -> Result<&Arc<CameraGroupOrchestrator>> {
        self.orchestrator.as_ref().ok_or(SyncError::NoCameraGroup)
    }

    fn wrangler(&self) -> Result<&FrameWrangler> {
        self.wrangler.as_ref().ok_or(SyncError::NoCameraGroup)
    }

    /// Returns once the trigger loop is parked.
    pub fn pause(&self) -> Result<()> {
        let orchestrator = self.orchestrator()?;
        orchestrator.pause();
        orchestrator.await_paused()
    }

    pub fn unpause(&self) -> Result<()> {
        self.orchestrator()?.unpause()
    }

    pub fn start_recording(&self, info: RecordingInfo) -> Result<()> {
        self.wrangler()?
            .start_recording(info, BTreeMap::clone(&self.configs.load()))
    }

    pub fn stop_recording(&self) -> Result<RecordingSummary> {
        self.wrangler()?.stop_recording()
    }

    pub fn latest_preview(&self) -> Option<PreviewFrame> {
        self.preview.as_ref().and_then(PreviewRelay::latest)
    }

    /// Block until `count` multi-frames have been triggered.
    pub fn wait_for_multi_frames(&mut self, count: u64) -> Result<()> {
        let ipc = self.ipc.clone();
        Waiter::new(format!("{count} multi-frames"), WaitBudget::readiness(self.timeout), &*ipc).until(|| {
            self.check_health()?;
            Ok(ipc.loop_count() >= count)
        })
    }

    /// Configs that can be applied without rebuilding shared memory: the same
    /// cameras with the same image shapes.
    pub fn accepts_in_place(&self, configs: &BTreeMap<CameraId, CameraConfig>) -> bool {
        let current = self.configs.load();
        let selected: Vec<&CameraConfig> = configs.values().filter(|c| c.use_this_camera).collect();
        selected.len() == current.len()
            && selected.iter().all(|config| {
                current
                    .get(&config.camera_id)
                    .is_some_and(|live| live.image_shape() == config.image_shape())
            })
    }

    /// Push changed configs to their workers, applied between loop iterations,
    /// and wait for the new extracted configs.
    #[instrument(skip_all)]
    pub fn update_configs(&mut self, configs: &BTreeMap<CameraId, CameraConfig>) -> Result<()> {
        if !self.accepts_in_place(configs) {
            return Err(SyncError::Validation(
                "camera set or image shape changed, the group has to be recreated".into(),
            ));
        }
        let current = self.configs.load_full();
        let mut changed = Vec::new();
        for config in configs.values().filter(|c| c.use_this_camera) {
            if current.get(&config.camera_id) == Some(config) {
                continue;
            }
            let link = self
                .links
                .get_mut(&config.camera_id)
                .ok_or(SyncError::CameraClosed(config.camera_id))?;
            link.commands.send(&CameraCommand::UpdateConfig { config: config.clone() })?;
            changed.push(config.camera_id);
        }
        if changed.is_empty() {
            return Ok(());
        }
        info!(cameras = ?changed, "config update sent");
        self.await_config_reports(changed, "updated camera configs")
    }

    /// Stop every worker and thread and release shared memory. A recording that
    /// is still running is finished first.
    pub fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        info!(prefix = %self.prefix, "closing camera group");
        self.ipc.kill_group();

        let mut result = Ok(());
        if let Some(frame_loop) = self.frame_loop.take() {
            result = result.and(frame_loop.join());
        }
        if let Some(wrangler) = self.wrangler.take() {
            result = result.and(wrangler.join());
        }
        if let Some(preview) = self.preview.take() {
            result = result.and(preview.join());
        }
        for (id, worker) in std::mem::take(&mut self.workers) {
            if let Err(e) = worker.join(WORKER_EXIT_TIMEOUT) {
                warn!(camera_id = %id, "camera worker exit: {}", e);
                result = result.and(Err(e));
            }
        }
        if let Err(e) = self.drain_reports() {
            warn!("could not drain final reports: {}", e);
        }

        self.orchestrator = None;
        self.escape = None;
        self.shm = None;
        self.links.clear();
        info!("camera group closed");
        result
    }
}

impl Drop for CameraGroup {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("camera group closed with error: {}", e);
        }
    }
}
