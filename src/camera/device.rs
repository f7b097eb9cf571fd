//! Capture device boundary

use bytes::Bytes;
use tracing::{debug, info, instrument};

use super::config::{CameraConfig, CaptureBackend, ExposureMode};
use super::synthetic::SyntheticCamera;
use super::v4l2::V4l2Camera;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureProperty {
    Width,
    Height,
    Framerate,
    /// 1.0 for automatic exposure, 0.0 for manual.
    AutoExposure,
    Exposure,
    /// Read-only on every backend.
    Channels,
}

/// A native camera handle.
///
/// `grab` latches a frame as close to the trigger as possible; `retrieve` does
/// the expensive part (decode / convert) afterwards, so grabs across cameras
/// stay tight.
pub trait CaptureDevice: Send {
    fn set(&mut self, property: CaptureProperty, value: f64) -> Result<()>;

    fn get(&self, property: CaptureProperty) -> Option<f64>;

    fn grab(&mut self) -> bool;

    /// The last grabbed frame as H x W x C bytes, `None` if there is none.
    fn retrieve(&mut self) -> Option<Bytes>;

    fn release(&mut self);
}

/// Open the device `config` names. `camera_index` is the camera's position in
/// its group.
#[instrument(skip(config), fields(camera_id = %config.camera_id, backend = ?config.backend))]
pub fn open_device(config: &CameraConfig, camera_index: usize) -> Result<Box<dyn CaptureDevice>> {
    let device: Box<dyn CaptureDevice> = match config.backend {
        CaptureBackend::V4l2 => Box::new(V4l2Camera::open(config)?),
        CaptureBackend::Synthetic => Box::new(SyntheticCamera::new(config, camera_index)),
    };
    info!("capture device opened");
    Ok(device)
}

/// Push `requested` into the device and read back what it actually does.
pub fn apply_config(device: &mut dyn CaptureDevice, requested: &CameraConfig) -> Result<CameraConfig> {
    device.set(CaptureProperty::Width, requested.resolution.width as f64)?;
    device.set(CaptureProperty::Height, requested.resolution.height as f64)?;
    device.set(CaptureProperty::Framerate, requested.framerate)?;
    match requested.exposure_mode {
        ExposureMode::Auto => device.set(CaptureProperty::AutoExposure, 1.0)?,
        ExposureMode::Manual | ExposureMode::Recommended => {
            device.set(CaptureProperty::AutoExposure, 0.0)?;
            device.set(CaptureProperty::Exposure, requested.exposure as f64)?;
        }
    }

    let mut extracted = requested.clone();
    if let Some(width) = device.get(CaptureProperty::Width) {
        extracted.resolution.width = width as u32;
    }
    if let Some(height) = device.get(CaptureProperty::Height) {
        extracted.resolution.height = height as u32;
    }
    if let Some(framerate) = device.get(CaptureProperty::Framerate) {
        extracted.framerate = framerate;
    }
    if let Some(channels) = device.get(CaptureProperty::Channels) {
        extracted.color_channels = channels as u32;
    }
    if let Some(exposure) = device.get(CaptureProperty::Exposure) {
        extracted.exposure = exposure as i32;
    }
    debug!(?extracted, "extracted camera config");

    extracted.validate_extracted(requested)?;
    Ok(extracted)
}
