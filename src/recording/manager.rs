//! Backlog-aware recording of multi-frames, one video per camera

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use tracing::{info, instrument, warn};

use super::info::{RecordedVideo, RecordingInfo, RecordingStartRecord, RecordingSummary};
use super::recorder::CameraVideoRecorder;
use super::timestamps::TimestampLog;
use super::writer::WriterFactory;
use crate::camera::{CameraConfig, CameraId};
use crate::error::{Result, SyncError};
use crate::frame::MultiFramePayload;
use crate::pipeline::FramerateTracker;

/// Queues every full multi-frame and writes frames out one at a time, always
/// from the camera that is furthest behind.
///
/// `add_multi_frame` does no video I/O, so it can run between escape-buffer
/// reads without holding up capture.
pub struct VideoRecorderManager {
    info: RecordingInfo,
    recorders: BTreeMap<CameraId, CameraVideoRecorder>,
    timestamps: TimestampLog,
    created_folder: bool,
    multi_frames: u64,
}

impl VideoRecorderManager {
    #[instrument(skip_all, fields(recording = %info.recording_name))]
    pub fn create(
        info: RecordingInfo,
        camera_configs: &BTreeMap<CameraId, CameraConfig>,
        writer_factory: WriterFactory,
    ) -> Result<Self> {
        if camera_configs.is_empty() {
            return Err(SyncError::Validation("nothing to record without cameras".into()));
        }
        let created_folder = !info.recording_folder.exists();
        fs::create_dir_all(info.videos_folder())?;

        let recorders = camera_configs
            .values()
            .map(|config| {
                let path = info.video_path(config.camera_id, config.video_file_extension());
                (
                    config.camera_id,
                    CameraVideoRecorder::new(config.clone(), path, writer_factory.clone()),
                )
            })
            .collect();
        info!(folder = %info.recording_folder.display(), cameras = camera_configs.len(), "recording started");

        Ok(Self {
            info,
            recorders,
            timestamps: TimestampLog::new(),
            created_folder,
            multi_frames: 0,
        })
    }

    pub fn info(&self) -> &RecordingInfo {
        &self.info
    }

    pub fn multi_frames_received(&self) -> u64 {
        self.multi_frames
    }

    pub fn add_multi_frame(&mut self, multi_frame: MultiFramePayload) -> Result<()> {
        let expected: BTreeSet<CameraId> = self.recorders.keys().copied().collect();
        let received: BTreeSet<CameraId> = multi_frame.camera_ids().collect();
        if expected != received {
            return Err(SyncError::Validation(format!(
                "multi-frame {} has cameras {received:?}, recording has {expected:?}",
                multi_frame.multi_frame_number()
            )));
        }
        if !multi_frame.full() {
            return Err(SyncError::Validation(format!(
                "multi-frame {} is not full",
                multi_frame.multi_frame_number()
            )));
        }

        // All or nothing: a rejected multi-frame leaves no queue or row behind
        for frame in multi_frame.frames() {
            let camera_id = frame.camera_id();
            self.recorders
                .get(&camera_id)
                .ok_or_else(|| SyncError::Validation(format!("no recorder for camera {camera_id}")))?
                .check_frame(frame)?;
        }

        self.timestamps.add_multi_frame(&multi_frame);
        for frame in multi_frame.into_frames() {
            let camera_id = frame.camera_id();
            let recorder = self
                .recorders
                .get_mut(&camera_id)
                .ok_or_else(|| SyncError::Validation(format!("no recorder for camera {camera_id}")))?;
            recorder.enqueue(frame)?;
            metrics::gauge!("synccam_recorder_backlog", "camera" => camera_id.to_string())
                .set(recorder.backlog() as f64);
        }
        self.multi_frames += 1;
        Ok(())
    }

    /// Write one frame from the deepest queue (lowest camera id on ties).
    /// Returns `false` when every queue is empty.
    pub fn save_one_frame(&mut self) -> Result<bool> {
        let deepest = self
            .recorders
            .values_mut()
            .filter(|r| r.backlog() > 0)
            .fold(None::<&mut CameraVideoRecorder>, |best, r| match best {
                Some(best) if best.backlog() >= r.backlog() => Some(best),
                _ => Some(r),
            });
        let Some(recorder) = deepest else {
            return Ok(false);
        };

        if let Some(metadata) = recorder.write_next()? {
            metrics::counter!("synccam_frames_written", "camera" => recorder.camera_id().to_string())
                .increment(1);
            metrics::gauge!("synccam_recorder_backlog", "camera" => recorder.camera_id().to_string())
                .set(recorder.backlog() as f64);
            self.timestamps.update_frame(&metadata);
        }
        Ok(true)
    }

    pub fn backlog(&self, camera_id: CameraId) -> Option<usize> {
        self.recorders.get(&camera_id).map(CameraVideoRecorder::backlog)
    }

    pub fn frames_to_save(&self) -> usize {
        self.recorders.values().map(CameraVideoRecorder::backlog).sum()
    }

    /// Drain, close every file, write the timestamp table, the start record and
    /// the summary, then check every video against the table.
    #[instrument(skip_all, fields(recording = %self.info.recording_name))]
    pub fn finish_and_close(mut self) -> Result<RecordingSummary> {
        while self.save_one_frame()? {}

        let mut videos = Vec::with_capacity(self.recorders.len());
        for recorder in self.recorders.values_mut() {
            let frames = recorder.finish()?;
            videos.push(RecordedVideo {
                camera_id: recorder.camera_id(),
                path: recorder.path().clone(),
                frames,
            });
        }

        if self.multi_frames == 0 {
            warn!("no multi-frames were recorded");
            if self.created_folder {
                fs::remove_dir_all(&self.info.recording_folder)?;
                info!(folder = %self.info.recording_folder.display(), "removed empty recording folder");
            }
            return Ok(RecordingSummary {
                info: self.info,
                frame_count: 0,
                duration_s: 0.0,
                mean_framerate: None,
                videos,
            });
        }

        let rows = self.timestamps.write_csv(&self.info.timestamps_path())? as u64;

        let mut tracker = FramerateTracker::new(rows as usize);
        let mut duration_s = 0.0;
        if let Some((number, first_ns, timebase)) = self.timestamps.first_timestamp_ns() {
            let start = RecordingStartRecord::new(&self.info.recording_name, number, first_ns, timebase);
            fs::write(self.info.start_record_path(), serde_json::to_vec_pretty(&start)?)?;
            duration_s = self.timestamps.grab_times_ns().last().map_or(0.0, |&last| {
                (last.saturating_sub(first_ns)) as f64 / 1e9
            });
        }
        for ns in self.timestamps.grab_times_ns() {
            tracker.record(ns);
        }

        let summary = RecordingSummary {
            info: self.info.clone(),
            frame_count: rows,
            duration_s,
            mean_framerate: tracker.mean_framerate(),
            videos,
        };
        fs::write(self.info.summary_path(), serde_json::to_vec_pretty(&summary)?)?;

        for video in &summary.videos {
            if video.frames != rows {
                return Err(SyncError::Validation(format!(
                    "camera {} video has {} frames, timestamp table has {rows} rows",
                    video.camera_id, video.frames
                )));
            }
        }
        info!(frames = rows, duration_s, "recording closed");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;

    use super::*;
    use crate::camera::Resolution;
    use crate::frame::{FrameLifecycle, FrameMetadata, FramePayload, TimebaseMapping};
    use crate::recording::writer::{count_mjpeg_frames, default_writer_factory, VideoWriter, DEFAULT_JPEG_QUALITY};
    use crate::recording::RecordingRequest;

    fn configs(ids: &[u32]) -> BTreeMap<CameraId, CameraConfig> {
        ids.iter()
            .map(|&id| {
                let mut config = CameraConfig::synthetic(CameraId(id));
                config.resolution = Resolution { width: 8, height: 4 };
                (CameraId(id), config)
            })
            .collect()
    }

    fn multi_frame(ids: &[u32], number: u64, timebase: TimebaseMapping) -> MultiFramePayload {
        let mut payload = MultiFramePayload::create_empty(ids.iter().map(|&id| CameraId(id)), number, timebase);
        for &id in ids {
            let mut metadata = FrameMetadata::new(CameraId(id), number, (4, 8, 3));
            metadata.stamp(FrameLifecycle::PostGrab);
            payload
                .add_frame(FramePayload::new(Bytes::from(vec![number as u8; 96]), metadata).unwrap())
                .unwrap();
        }
        payload
    }

    fn recording(dir: &Path) -> RecordingInfo {
        let request = RecordingRequest {
            recording_name: Some("test".into()),
            ..Default::default()
        };
        RecordingInfo::new(&request, dir, configs(&[0, 1]).into_values().collect())
    }

    /// Records writes per camera without touching the disk.
    struct CountingWriter {
        camera_id: CameraId,
        path: std::path::PathBuf,
        frames: u64,
        log: Arc<Mutex<Vec<CameraId>>>,
    }

    impl VideoWriter for CountingWriter {
        fn write_frame(&mut self, _image: &[u8], _shape: (u32, u32, u32)) -> Result<()> {
            self.frames += 1;
            self.log.lock().unwrap().push(self.camera_id);
            Ok(())
        }

        fn frames_written(&self) -> u64 {
            self.frames
        }

        fn finish(&mut self) -> Result<()> {
            Ok(())
        }

        fn path(&self) -> &Path {
            &self.path
        }
    }

    fn counting_factory(log: Arc<Mutex<Vec<CameraId>>>) -> WriterFactory {
        Arc::new(move |path: &Path, config: &CameraConfig| -> Result<Box<dyn VideoWriter>> {
            Ok(Box::new(CountingWriter {
                camera_id: config.camera_id,
                path: path.to_path_buf(),
                frames: 0,
                log: log.clone(),
            }))
        })
    }

    #[test]
    fn test_deepest_backlog_drains_first() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager =
            VideoRecorderManager::create(recording(dir.path()), &configs(&[0, 1]), counting_factory(log.clone()))
                .unwrap();

        // Camera 0 ten frames behind, camera 1 two
        let timebase = TimebaseMapping::now();
        for number in 0..10 {
            manager.add_multi_frame(multi_frame(&[0, 1], number, timebase)).unwrap();
        }
        for _ in 0..8 {
            assert!(manager.save_one_frame().unwrap());
        }
        // Ties break toward camera 0, so the eight writes alternate
        assert_eq!(manager.backlog(CameraId(0)), Some(6));
        assert_eq!(manager.backlog(CameraId(1)), Some(6));

        let mut manager =
            VideoRecorderManager::create(recording(dir.path()), &configs(&[0, 1]), counting_factory(log.clone()))
                .unwrap();
        for number in 0..10 {
            manager.add_multi_frame(multi_frame(&[0, 1], number, timebase)).unwrap();
        }
        for _ in 0..8 {
            manager.recorders.get_mut(&CameraId(1)).unwrap().write_next().unwrap();
        }
        assert_eq!(manager.backlog(CameraId(0)), Some(10));
        assert_eq!(manager.backlog(CameraId(1)), Some(2));

        log.lock().unwrap().clear();
        while manager.backlog(CameraId(0)) > manager.backlog(CameraId(1)) {
            assert!(manager.save_one_frame().unwrap());
        }
        assert_eq!(*log.lock().unwrap(), vec![CameraId(0); 8]);
        assert_eq!(manager.frames_to_save(), 4);
    }

    #[test]
    fn test_rejects_mismatched_multi_frames() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = VideoRecorderManager::create(
            recording(dir.path()),
            &configs(&[0, 1]),
            counting_factory(Arc::default()),
        )
        .unwrap();
        let timebase = TimebaseMapping::now();

        let err = manager.add_multi_frame(multi_frame(&[0], 0, timebase)).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let partial = MultiFramePayload::create_empty([CameraId(0), CameraId(1)], 0, timebase);
        assert!(manager.add_multi_frame(partial).is_err());
        assert_eq!(manager.frames_to_save(), 0);
    }

    #[test]
    fn test_wrong_shape_on_one_camera_rejects_whole_multi_frame() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = VideoRecorderManager::create(
            recording(dir.path()),
            &configs(&[0, 1]),
            counting_factory(Arc::default()),
        )
        .unwrap();
        let timebase = TimebaseMapping::now();
        manager.add_multi_frame(multi_frame(&[0, 1], 0, timebase)).unwrap();

        let mut mixed = MultiFramePayload::create_empty([CameraId(0), CameraId(1)], 1, timebase);
        let good = FrameMetadata::new(CameraId(0), 1, (4, 8, 3));
        mixed.add_frame(FramePayload::new(Bytes::from(vec![1; 96]), good).unwrap()).unwrap();
        let gray = FrameMetadata::new(CameraId(1), 1, (4, 8, 1));
        mixed.add_frame(FramePayload::new(Bytes::from(vec![1; 32]), gray).unwrap()).unwrap();

        let err = manager.add_multi_frame(mixed).unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)), "{err}");
        assert_eq!(manager.backlog(CameraId(0)), Some(1));
        assert_eq!(manager.backlog(CameraId(1)), Some(1));
        assert_eq!(manager.timestamps.len(), 1);
        assert_eq!(manager.multi_frames_received(), 1);
    }

    #[test]
    fn test_finish_writes_videos_table_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let info = recording(dir.path());
        let mut manager =
            VideoRecorderManager::create(info.clone(), &configs(&[0, 1]), default_writer_factory(DEFAULT_JPEG_QUALITY))
                .unwrap();
        let timebase = TimebaseMapping::now();
        for number in 0..5 {
            manager.add_multi_frame(multi_frame(&[0, 1], number, timebase)).unwrap();
        }
        let summary = manager.finish_and_close().unwrap();

        assert_eq!(summary.frame_count, 5);
        for id in [0, 1] {
            let path = info.video_path(CameraId(id), "mjpeg");
            assert_eq!(count_mjpeg_frames(&path).unwrap(), 5);
        }
        assert!(info.start_record_path().exists());
        let written: RecordingSummary =
            serde_json::from_slice(&fs::read(info.summary_path()).unwrap()).unwrap();
        assert_eq!(written.frame_count, 5);
        assert_eq!(written.info.recording_uuid, info.recording_uuid);
        assert_eq!(csv::Reader::from_path(info.timestamps_path()).unwrap().records().count(), 5);
    }

    #[test]
    fn test_empty_recording_removes_its_folder() {
        let dir = tempfile::tempdir().unwrap();
        let info = recording(dir.path());
        let manager = VideoRecorderManager::create(
            info.clone(),
            &configs(&[0, 1]),
            default_writer_factory(DEFAULT_JPEG_QUALITY),
        )
        .unwrap();
        assert!(info.videos_folder().exists());

        let summary = manager.finish_and_close().unwrap();
        assert_eq!(summary.frame_count, 0);
        assert!(!info.recording_folder.exists());
    }
}
