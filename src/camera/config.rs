//! Per-camera configuration

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Four-character codec tag such as `MJPG`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const MJPG: FourCc = FourCc(*b"MJPG");
    pub const YUYV: FourCc = FourCc(*b"YUYV");
    pub const MP4V: FourCc = FourCc(*b"MP4V");
    pub const H264: FourCc = FourCc(*b"H264");
    pub const X264: FourCc = FourCc(*b"X264");
    pub const XVID: FourCc = FourCc(*b"XVID");

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self.as_str())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for FourCc {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        let bytes = value.to_ascii_uppercase().into_bytes();
        <[u8; 4]>::try_from(bytes.as_slice())
            .map(FourCc)
            .map_err(|_| format!("fourcc must be exactly four ASCII characters, got `{value}`"))
    }
}

impl From<FourCc> for String {
    fn from(value: FourCc) -> Self {
        value.as_str().to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExposureMode {
    Auto,
    Manual,
    /// Manual, with the value picked by an external calibration step.
    Recommended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    None,
    Clockwise90,
    Counterclockwise90,
    Rotate180,
}

impl Rotation {
    /// Shape after rotation, `(height, width, channels)`.
    pub fn rotated_shape(self, (height, width, channels): (u32, u32, u32)) -> (u32, u32, u32) {
        match self {
            Rotation::None | Rotation::Rotate180 => (height, width, channels),
            Rotation::Clockwise90 | Rotation::Counterclockwise90 => (width, height, channels),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaptureBackend {
    V4l2,
    /// Deterministic generated frames, no hardware needed.
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub camera_id: CameraId,
    pub camera_name: String,
    pub use_this_camera: bool,
    pub resolution: Resolution,
    pub color_channels: u32,
    pub exposure_mode: ExposureMode,
    pub exposure: i32,
    pub rotation: Rotation,
    pub framerate: f64,
    pub capture_fourcc: FourCc,
    pub writer_fourcc: FourCc,
    pub backend: CaptureBackend,
    /// V4L2 node, defaults to `/dev/video<camera_id>`.
    pub device_path: Option<String>,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            camera_id: CameraId(0),
            camera_name: "camera-0".into(),
            use_this_camera: true,
            resolution: Resolution {
                width: 640,
                height: 480,
            },
            color_channels: 3,
            exposure_mode: ExposureMode::Auto,
            exposure: -7,
            rotation: Rotation::None,
            framerate: 30.0,
            capture_fourcc: FourCc::MJPG,
            writer_fourcc: FourCc::MJPG,
            backend: CaptureBackend::Synthetic,
            device_path: None,
        }
    }
}

impl CameraConfig {
    pub fn synthetic(camera_id: CameraId) -> Self {
        Self {
            camera_id,
            camera_name: format!("camera-{camera_id}"),
            ..Default::default()
        }
    }

    /// `(height, width, channels)` of the captured image, before rotation.
    pub fn image_shape(&self) -> (u32, u32, u32) {
        (self.resolution.height, self.resolution.width, self.color_channels)
    }

    pub fn image_size_bytes(&self) -> usize {
        let (h, w, c) = self.image_shape();
        h as usize * w as usize * c as usize
    }

    /// Shape of the frames handed to the video writer.
    pub fn recorded_shape(&self) -> (u32, u32, u32) {
        self.rotation.rotated_shape(self.image_shape())
    }

    pub fn device_path(&self) -> String {
        self.device_path
            .clone()
            .unwrap_or_else(|| format!("/dev/video{}", self.camera_id))
    }

    pub fn video_file_extension(&self) -> &'static str {
        match &self.writer_fourcc.0 {
            b"MJPG" => "mjpeg",
            b"MP4V" | b"H264" | b"X264" => "mp4",
            _ => "avi",
        }
    }

    /// Accept whatever the hardware settled on unless it is unusable.
    ///
    /// `self` is the extracted config, `requested` what was asked for.
    pub fn validate_extracted(&self, requested: &CameraConfig) -> Result<()> {
        let (h, w, c) = self.image_shape();
        if h == 0 || w == 0 || c == 0 || !(self.framerate > 0.0) {
            return Err(SyncError::ConfigRejected {
                camera_id: self.camera_id,
                reason: format!(
                    "device reported an unusable mode: {w}x{h}x{c} @ {} fps",
                    self.framerate
                ),
            });
        }

        if self.resolution != requested.resolution {
            warn!(
                camera_id = %self.camera_id,
                "requested {}x{}, device gave {}x{}",
                requested.resolution.width,
                requested.resolution.height,
                w,
                h
            );
        }
        if (self.framerate - requested.framerate).abs() > 0.5 {
            warn!(
                camera_id = %self.camera_id,
                "requested {} fps, device gave {} fps", requested.framerate, self.framerate
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_values() {
        let mut config = CameraConfig::synthetic(CameraId(2));
        config.resolution = Resolution {
            width: 8,
            height: 4,
        };
        config.rotation = Rotation::Clockwise90;

        assert_eq!(config.image_shape(), (4, 8, 3));
        assert_eq!(config.recorded_shape(), (8, 4, 3));
        assert_eq!(config.image_size_bytes(), 96);
        assert_eq!(config.video_file_extension(), "mjpeg");
        assert_eq!(config.device_path(), "/dev/video2");

        config.writer_fourcc = FourCc::XVID;
        assert_eq!(config.video_file_extension(), "avi");
    }

    #[test]
    fn test_extracted_config_only_rejects_unusable_modes() {
        let requested = CameraConfig::synthetic(CameraId(0));

        let mut extracted = requested.clone();
        extracted.resolution.width = 320;
        extracted.framerate = 15.0;
        assert!(extracted.validate_extracted(&requested).is_ok());

        extracted.color_channels = 0;
        assert!(matches!(
            extracted.validate_extracted(&requested),
            Err(SyncError::ConfigRejected { .. })
        ));
    }

    #[test]
    fn test_fourcc_serde() {
        let fourcc: FourCc = serde_json::from_str("\"mjpg\"").unwrap();
        assert_eq!(fourcc, FourCc::MJPG);
        assert_eq!(serde_json::to_string(&FourCc::XVID).unwrap(), "\"XVID\"");
        assert!(serde_json::from_str::<FourCc>("\"MJPEG\"").is_err());
    }
}
