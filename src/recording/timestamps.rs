//! Per multi-frame timestamp table

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::camera::CameraId;
use crate::error::Result;
use crate::frame::{FrameLifecycle, FrameMetadata, MultiFramePayload, TimebaseMapping};

/// Mean, median, population standard deviation and range of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Stats {
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub range: f64,
}

impl Stats {
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let n = sorted.len();
        let mean = sorted.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 0 {
            (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
        } else {
            sorted[n / 2]
        };
        let variance = sorted.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
        Some(Self {
            mean,
            median,
            std: variance.sqrt(),
            range: sorted[n - 1] - sorted[0],
        })
    }
}

struct Row {
    timebase: TimebaseMapping,
    frames: BTreeMap<CameraId, FrameMetadata>,
}

/// Collects frame metadata as multi-frames arrive and as their frames are
/// encoded; written out once when the recording closes.
#[derive(Default)]
pub struct TimestampLog {
    rows: BTreeMap<u64, Row>,
}

fn ms_since(start_ns: u64, ns: u64) -> f64 {
    (ns as f64 - start_ns as f64) / 1e6
}

impl TimestampLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn add_multi_frame(&mut self, multi_frame: &MultiFramePayload) {
        let frames = multi_frame.frames().map(|f| (f.camera_id(), f.metadata)).collect();
        self.rows.insert(
            multi_frame.multi_frame_number(),
            Row {
                timebase: *multi_frame.timebase(),
                frames,
            },
        );
    }

    /// Replace a frame's metadata with a later copy, e.g. after compression.
    pub fn update_frame(&mut self, metadata: &FrameMetadata) {
        if let Some(row) = self.rows.get_mut(&metadata.frame_number) {
            row.frames.insert(metadata.camera_id(), *metadata);
        }
    }

    /// Monotonic ns of the first multi-frame (its mean post-grab time).
    pub fn first_timestamp_ns(&self) -> Option<(u64, u64, TimebaseMapping)> {
        let (number, row) = self.rows.iter().next()?;
        Some((*number, Self::grab_ns(row)?, row.timebase))
    }

    /// Mean post-grab time of every multi-frame, in multi-frame order.
    pub fn grab_times_ns(&self) -> Vec<u64> {
        self.rows.values().filter_map(Self::grab_ns).collect()
    }

    fn grab_ns(row: &Row) -> Option<u64> {
        let stamps: Vec<u64> = row
            .frames
            .values()
            .filter_map(|m| m.timestamp(FrameLifecycle::PostGrab))
            .collect();
        (!stamps.is_empty()).then(|| stamps.iter().sum::<u64>() / stamps.len() as u64)
    }

    fn header() -> Vec<String> {
        let mut header: Vec<String> = [
            "multi_frame_number",
            "recording_time_s",
            "monotonic_ns",
            "utc_s",
            "local_iso8601",
            "frame_duration_ms",
            "framerate",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        for stage in FrameLifecycle::ALL {
            for stat in ["mean", "median", "std", "range"] {
                header.push(format!("{}_{stat}_ms", stage.name()));
            }
        }
        header.push("intercamera_grab_range_ms".into());
        header
    }

    /// Write the CSV, one row per multi-frame. Stage times are milliseconds since
    /// the first multi-frame. Returns the number of rows.
    pub fn write_csv(&self, path: &Path) -> Result<usize> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(Self::header())?;

        let start_ns = self.first_timestamp_ns().map(|(_, ns, _)| ns).unwrap_or_default();
        let mut previous_ns: Option<u64> = None;
        for (number, row) in &self.rows {
            let grab_ns = Self::grab_ns(row).unwrap_or_default();
            let duration_ms = previous_ns.map(|prev| ms_since(prev, grab_ns));
            previous_ns = Some(grab_ns);

            let mut record = vec![
                number.to_string(),
                format!("{:.6}", ms_since(start_ns, grab_ns) / 1e3),
                grab_ns.to_string(),
                format!("{:.6}", row.timebase.to_utc_seconds(grab_ns)),
                row.timebase.to_local_iso8601(grab_ns),
                duration_ms.map(|d| format!("{d:.3}")).unwrap_or_default(),
                duration_ms
                    .filter(|&d| d > 0.0)
                    .map(|d| format!("{:.3}", 1e3 / d))
                    .unwrap_or_default(),
            ];
            for stage in FrameLifecycle::ALL {
                let values: Vec<f64> = row
                    .frames
                    .values()
                    .filter_map(|m| m.timestamp(stage))
                    .map(|ns| ms_since(start_ns, ns))
                    .collect();
                match Stats::of(&values) {
                    Some(stats) => record.extend(
                        [stats.mean, stats.median, stats.std, stats.range].map(|v| format!("{v:.3}")),
                    ),
                    None => record.extend(std::iter::repeat(String::new()).take(4)),
                }
            }
            let grabs: Vec<f64> = row
                .frames
                .values()
                .filter_map(|m| m.timestamp(FrameLifecycle::PostGrab))
                .map(|ns| ns as f64 / 1e6)
                .collect();
            record.push(
                Stats::of(&grabs)
                    .map(|s| format!("{:.3}", s.range))
                    .unwrap_or_default(),
            );
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(self.rows.len())
    }
}
