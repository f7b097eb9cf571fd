//! Escape buffer consumer that feeds the recorder

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::camera::{CameraConfig, CameraId};
use crate::error::{Result, SyncError};
use crate::group::wait::ORCHESTRATOR_QUANTUM;
use crate::group::{GroupIpcFlags, MultiFrameEscapeRingBuffer, MultiFrameEscapeRingBufferDescriptor};
use crate::recording::{RecordingInfo, RecordingSummary, VideoRecorderManager, WriterFactory};

pub enum WranglerCommand {
    StartRecording {
        info: RecordingInfo,
        configs: BTreeMap<CameraId, CameraConfig>,
        reply: flume::Sender<Result<()>>,
    },
    StopRecording {
        reply: flume::Sender<Result<RecordingSummary>>,
    },
}

struct ActiveRecording {
    manager: VideoRecorderManager,
    /// Multi-frames numbered below this were captured before the start.
    first_number: u64,
}

struct WranglerLoop {
    ipc: Arc<GroupIpcFlags>,
    escape: MultiFrameEscapeRingBuffer,
    writer_factory: WriterFactory,
    commands: flume::Receiver<WranglerCommand>,
    recording: Option<ActiveRecording>,
    dropped: u64,
}

impl WranglerLoop {
    /// Consume one multi-frame from the escape buffer, if there is one.
    fn pull_one(&mut self) -> Result<bool> {
        if !self.escape.new_data_available() {
            return Ok(false);
        }
        let multi_frame = self.escape.get_next_multi_frame()?;
        match self.recording.as_mut() {
            Some(recording) if multi_frame.multi_frame_number() >= recording.first_number => {
                recording.manager.add_multi_frame(multi_frame)?;
            }
            _ => {
                self.dropped += 1;
                trace!(multi_frame_number = multi_frame.multi_frame_number(), "not recording, dropped");
            }
        }
        Ok(true)
    }

    fn start_recording(&mut self, info: RecordingInfo, configs: &BTreeMap<CameraId, CameraConfig>) -> Result<()> {
        if self.recording.is_some() {
            return Err(SyncError::Recording("a recording is already running".into()));
        }
        let manager = VideoRecorderManager::create(info, configs, self.writer_factory.clone())?;
        let first_number = (self.escape.last_written_index() + 1).max(0) as u64;
        self.recording = Some(ActiveRecording { manager, first_number });
        self.ipc.set_record_frames(true);
        info!(first_multi_frame = first_number, "recording frames");
        Ok(())
    }

    /// Take in everything already in the escape buffer, then close the files.
    fn stop_recording(&mut self) -> Result<RecordingSummary> {
        let Some(recording) = self.recording.as_ref() else {
            return Err(SyncError::Recording("no recording is running".into()));
        };
        self.ipc.set_record_frames(false);
        let last = self.escape.last_written_index();
        debug!(first = recording.first_number, last, "draining escape buffer before closing");
        while self.escape.last_read_index() < last {
            self.pull_one()?;
        }
        let recording = self
            .recording
            .take()
            .ok_or_else(|| SyncError::Recording("no recording is running".into()))?;
        recording.manager.finish_and_close()
    }

    fn handle(&mut self, command: WranglerCommand) {
        match command {
            WranglerCommand::StartRecording { info, configs, reply } => {
                let _ = reply.send(self.start_recording(info, &configs));
            }
            WranglerCommand::StopRecording { reply } => {
                let _ = reply.send(self.stop_recording());
            }
        }
    }

    fn run_inner(&mut self) -> Result<()> {
        while self.ipc.should_continue() {
            while let Ok(command) = self.commands.try_recv() {
                self.handle(command);
            }
            let pulled = self.pull_one()?;
            let saved = match self.recording.as_mut() {
                Some(recording) => recording.manager.save_one_frame()?,
                None => false,
            };
            if !pulled && !saved {
                std::thread::sleep(ORCHESTRATOR_QUANTUM);
            }
        }
        Ok(())
    }

    fn run(mut self) -> Result<()> {
        let result = self.run_inner();
        if let Err(e) = &result {
            error!("frame wrangler failed: {}", e);
            self.ipc.kill_group();
        }

        // A recording that failed validation is abandoned, not finalized
        if matches!(result, Err(SyncError::Validation(_))) {
            if let Some(recording) = self.recording.take() {
                self.ipc.set_record_frames(false);
                error!(
                    folder = %recording.manager.info().recording_folder.display(),
                    "recording aborted, files left unfinished"
                );
            }
        }

        // Whatever was captured still gets written when the group goes down
        if self.recording.is_some() {
            warn!("group closing with a recording still running, finishing it");
            match self.stop_recording() {
                Ok(summary) => info!(frames = summary.frame_count, "recording finished on shutdown"),
                Err(e) => error!("could not finish recording: {}", e),
            }
        }
        // Commands that raced shutdown
        let pending: Vec<_> = self.commands.drain().collect();
        for command in pending {
            self.handle(command);
        }
        debug!(dropped = self.dropped, "frame wrangler stopped");
        result
    }
}

/// Handle on the wrangler thread.
pub struct FrameWrangler {
    commands: flume::Sender<WranglerCommand>,
    thread: Option<JoinHandle<Result<()>>>,
    timeout: Duration,
}

impl FrameWrangler {
    pub fn start(
        ipc: Arc<GroupIpcFlags>,
        escape: &MultiFrameEscapeRingBufferDescriptor,
        writer_factory: WriterFactory,
        timeout: Duration,
    ) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let worker = WranglerLoop {
            ipc,
            escape: MultiFrameEscapeRingBuffer::recreate(escape, false)?,
            writer_factory,
            commands: rx,
            recording: None,
            dropped: 0,
        };
        let thread = std::thread::Builder::new()
            .name("frame-wrangler".into())
            .spawn(move || worker.run())?;
        Ok(Self {
            commands: tx,
            thread: Some(thread),
            timeout,
        })
    }

    fn request<T>(&self, command: impl FnOnce(flume::Sender<Result<T>>) -> WranglerCommand) -> Result<T> {
        let (reply, response) = flume::bounded(1);
        self.commands
            .send(command(reply))
            .map_err(|_| SyncError::Recording("frame wrangler is not running".into()))?;
        response
            .recv_timeout(self.timeout)
            .map_err(|_| SyncError::Recording("frame wrangler did not answer".into()))?
    }

    /// Returns once the recorder is set up; multi-frames relayed from now on
    /// are recorded.
    pub fn start_recording(&self, info: RecordingInfo, configs: BTreeMap<CameraId, CameraConfig>) -> Result<()> {
        self.request(|reply| WranglerCommand::StartRecording { info, configs, reply })
    }

    /// Returns once every multi-frame relayed so far is on disk.
    pub fn stop_recording(&self) -> Result<RecordingSummary> {
        self.request(|reply| WranglerCommand::StopRecording { reply })
    }

    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| SyncError::WorkerPanicked("frame-wrangler".into()))?,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::camera::Resolution;
    use crate::frame::{FrameMetadata, FramePayload, MultiFramePayload, TimebaseMapping};
    use crate::recording::{count_mjpeg_frames, default_writer_factory, RecordingRequest};
    use crate::shm::group_prefix;

    fn configs() -> BTreeMap<CameraId, CameraConfig> {
        (0..2)
            .map(|id| {
                let mut config = CameraConfig::synthetic(CameraId(id));
                config.resolution = Resolution { width: 4, height: 2 };
                (CameraId(id), config)
            })
            .collect()
    }

    fn put(escape: &mut MultiFrameEscapeRingBuffer, number: u64, timebase: TimebaseMapping) {
        let mut multi_frame = MultiFramePayload::create_empty([CameraId(0), CameraId(1)], number, timebase);
        for id in 0..2 {
            let metadata = FrameMetadata::new(CameraId(id), number, (2, 4, 3));
            multi_frame
                .add_frame(FramePayload::new(Bytes::from(vec![1; 24]), metadata).unwrap())
                .unwrap();
        }
        escape.put_multi_frame(&mut multi_frame).unwrap();
    }

    #[test]
    fn test_records_only_between_start_and_stop() {
        let prefix = group_prefix();
        let configs = configs();
        let ipc = Arc::new(GroupIpcFlags::create(&prefix, None).unwrap());
        let mut escape = MultiFrameEscapeRingBuffer::create(&prefix, &configs, 48 * 16).unwrap();
        let wrangler = FrameWrangler::start(
            ipc.clone(),
            &escape.descriptor(),
            default_writer_factory(90),
            Duration::from_secs(10),
        )
        .unwrap();
        let timebase = TimebaseMapping::now();

        // Before recording: consumed and dropped
        for number in 0..3 {
            put(&mut escape, number, timebase);
        }
        while escape.last_read_index() < 2 {
            std::thread::sleep(Duration::from_millis(1));
        }

        let dir = tempfile::tempdir().unwrap();
        let request = RecordingRequest {
            recording_name: Some("wrangled".into()),
            ..Default::default()
        };
        let info = RecordingInfo::new(&request, dir.path(), configs.values().cloned().collect());
        wrangler.start_recording(info.clone(), configs.clone()).unwrap();
        assert!(ipc.record_frames());

        for number in 3..8 {
            put(&mut escape, number, timebase);
        }
        let summary = wrangler.stop_recording().unwrap();
        assert!(!ipc.record_frames());
        assert_eq!(summary.frame_count, 5);
        assert_eq!(count_mjpeg_frames(&info.video_path(CameraId(1), "mjpeg")).unwrap(), 5);

        assert!(wrangler.stop_recording().is_err());
        ipc.kill_group();
        wrangler.join().unwrap();
    }

    #[test]
    fn test_validation_failure_aborts_the_recording() {
        let prefix = group_prefix();
        let configs = configs();
        let ipc = Arc::new(GroupIpcFlags::create(&prefix, None).unwrap());
        let mut escape = MultiFrameEscapeRingBuffer::create(&prefix, &configs, 48 * 16).unwrap();
        let wrangler = FrameWrangler::start(
            ipc.clone(),
            &escape.descriptor(),
            default_writer_factory(90),
            Duration::from_secs(10),
        )
        .unwrap();

        // Recorder expects a bigger image than the cameras deliver
        let mut recorded = configs.clone();
        for config in recorded.values_mut() {
            config.resolution = Resolution { width: 8, height: 4 };
        }
        let dir = tempfile::tempdir().unwrap();
        let info = RecordingInfo::new(&RecordingRequest::default(), dir.path(), recorded.values().cloned().collect());
        wrangler.start_recording(info.clone(), recorded).unwrap();

        put(&mut escape, 0, TimebaseMapping::now());
        let err = wrangler.join().unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)), "{err}");
        assert!(!ipc.should_continue());
        assert!(!ipc.record_frames());
        assert!(!info.summary_path().exists());
        assert!(!info.timestamps_path().exists());
    }
}
