use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use v4l::{capability::Flags, video::Capture, Device};

use super::config::{CameraConfig, CameraId, CaptureBackend, FourCc};

const MAX_VIDEO_NODES: u32 = 10;

// Detected capture device info
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedDevice {
    pub index: u32,
    pub path: String,
    pub card: String,
    pub driver: String,
    pub formats: Vec<FourCc>,
}

impl DetectedDevice {
    /// Preferred capture format: MJPEG, then YUYV.
    pub fn preferred_format(&self) -> Option<FourCc> {
        [FourCc::MJPG, FourCc::YUYV]
            .into_iter()
            .find(|fourcc| self.formats.contains(fourcc))
    }

    /// A starting config for this device; the camera settles the rest.
    pub fn camera_config(&self) -> Option<CameraConfig> {
        let capture_fourcc = self.preferred_format()?;
        Some(CameraConfig {
            camera_id: CameraId(self.index),
            camera_name: self.card.clone(),
            capture_fourcc,
            backend: CaptureBackend::V4l2,
            device_path: Some(self.path.clone()),
            ..Default::default()
        })
    }
}

/// Scan `/dev/video0..9` for capture devices with a format we can decode.
pub fn detect_devices() -> Vec<DetectedDevice> {
    info!("Auto-detecting capture devices...");

    let mut found = Vec::new();
    for index in 0..MAX_VIDEO_NODES {
        let path = format!("/dev/video{}", index);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        // Metadata nodes of UVC cameras show up as separate video devices
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
            debug!("Skipping {} - no capture capability", path);
            continue;
        }

        let formats: Vec<FourCc> = dev
            .enum_formats()
            .map(|formats| formats.iter().map(|f| FourCc(f.fourcc.repr)).collect())
            .unwrap_or_default();

        let device = DetectedDevice {
            index,
            path,
            card: caps.card,
            driver: caps.driver,
            formats,
        };
        match device.preferred_format() {
            Some(fourcc) => {
                info!("Found {} device: {} - {}", fourcc, device.path, device.card);
                found.push(device);
            }
            None => debug!("Skipping {} - no MJPEG or YUYV support", device.path),
        }
    }
    found
}

/// Configs for every usable camera, numbered by their video node.
pub fn detect_cameras() -> Vec<CameraConfig> {
    detect_devices()
        .iter()
        .filter_map(DetectedDevice::camera_config)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefers_mjpeg_over_yuyv() {
        let device = DetectedDevice {
            index: 2,
            path: "/dev/video2".into(),
            card: "Test Cam".into(),
            driver: "uvcvideo".into(),
            formats: vec![FourCc::YUYV, FourCc::MJPG],
        };
        assert_eq!(device.preferred_format(), Some(FourCc::MJPG));

        let config = device.camera_config().unwrap();
        assert_eq!(config.camera_id, CameraId(2));
        assert_eq!(config.backend, CaptureBackend::V4l2);
        assert_eq!(config.device_path(), "/dev/video2");
    }

    #[test]
    fn test_unusable_formats_yield_no_config() {
        let device = DetectedDevice {
            index: 0,
            path: "/dev/video0".into(),
            card: "IR".into(),
            driver: "uvcvideo".into(),
            formats: vec![FourCc(*b"GREY")],
        };
        assert!(device.camera_config().is_none());
    }
}
