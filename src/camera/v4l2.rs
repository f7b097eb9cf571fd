//! V4L2 capture device

use bytes::Bytes;
use tracing::{debug, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value as ControlValue};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::config::{CameraConfig, CameraId, FourCc};
use super::decoder::decode_frame;
use super::device::{CaptureDevice, CaptureProperty};
use crate::error::{Result, SyncError};

const V4L2_CID_EXPOSURE_AUTO: u32 = 0x009a_0901;
const V4L2_CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;
const V4L2_EXPOSURE_MANUAL: i64 = 1;
const V4L2_EXPOSURE_APERTURE_PRIORITY: i64 = 3;

const STREAM_BUFFERS: u32 = 4;

/// A UVC-style camera behind `/dev/videoN`.
///
/// `grab` dequeues and copies the raw buffer; `retrieve` decodes it to RGB.
pub struct V4l2Camera {
    camera_id: CameraId,
    device: Device,
    stream: Option<MmapStream<'static>>,
    fourcc: FourCc,
    width: u32,
    height: u32,
    raw: Vec<u8>,
    grabbed: bool,
}

impl V4l2Camera {
    #[instrument(skip(config), fields(camera_id = %config.camera_id))]
    pub fn open(config: &CameraConfig) -> Result<Self> {
        let camera_id = config.camera_id;
        let path = config.device_path();
        let fail = |e: std::io::Error| SyncError::Capture {
            camera_id,
            reason: format!("{path}: {e}"),
        };

        let device = Device::with_path(&path).map_err(fail)?;
        let caps = device.query_caps().map_err(fail)?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SyncError::Capture {
                camera_id,
                reason: format!("{path} doesn't support video capture"),
            });
        }

        let mut camera = Self {
            camera_id,
            device,
            stream: None,
            fourcc: config.capture_fourcc,
            width: config.resolution.width,
            height: config.resolution.height,
            raw: Vec::new(),
            grabbed: false,
        };
        camera.apply_format()?;
        Ok(camera)
    }

    fn error(&self, reason: impl ToString) -> SyncError {
        SyncError::Capture {
            camera_id: self.camera_id,
            reason: reason.to_string(),
        }
    }

    /// Push width/height/fourcc and keep whatever the driver settled on.
    fn apply_format(&mut self) -> Result<()> {
        // Format changes need the buffers released first
        self.stream = None;

        let mut fmt = self.device.format().map_err(|e| self.error(e))?;
        fmt.width = self.width;
        fmt.height = self.height;
        fmt.fourcc = FourCC::new(&self.fourcc.0);
        let actual = self.device.set_format(&fmt).map_err(|e| self.error(e))?;

        self.width = actual.width;
        self.height = actual.height;
        self.fourcc = FourCc(actual.fourcc.repr);
        debug!(width = self.width, height = self.height, fourcc = %self.fourcc, "format applied");
        Ok(())
    }

    fn framerate(&self) -> Option<f64> {
        let params = self.device.params().ok()?;
        let interval = params.interval;
        (interval.numerator > 0).then(|| interval.denominator as f64 / interval.numerator as f64)
    }

    fn set_control(&self, id: u32, value: i64) -> Result<()> {
        self.device
            .set_control(Control {
                id,
                value: ControlValue::Integer(value),
            })
            .map_err(|e| self.error(format!("control {id:#x}: {e}")))
    }

    fn control(&self, id: u32) -> Option<i64> {
        match self.device.control(id).ok()?.value {
            ControlValue::Integer(value) => Some(value),
            ControlValue::Boolean(value) => Some(value as i64),
            _ => None,
        }
    }

    fn ensure_stream(&mut self) -> Result<&mut MmapStream<'static>> {
        if self.stream.is_none() {
            let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, STREAM_BUFFERS)
                .map_err(|e| self.error(e))?;
            info!("Capture stream started with {} buffers", STREAM_BUFFERS);
            self.stream = Some(stream);
        }
        self.stream.as_mut().ok_or_else(|| SyncError::Capture {
            camera_id: self.camera_id,
            reason: "stream not started".into(),
        })
    }
}

impl CaptureDevice for V4l2Camera {
    fn set(&mut self, property: CaptureProperty, value: f64) -> Result<()> {
        match property {
            CaptureProperty::Width => {
                if self.width != value as u32 {
                    self.width = value as u32;
                    self.apply_format()?;
                }
            }
            CaptureProperty::Height => {
                if self.height != value as u32 {
                    self.height = value as u32;
                    self.apply_format()?;
                }
            }
            CaptureProperty::Framerate => {
                self.stream = None;
                self.device
                    .set_params(&Parameters::with_fps(value.round() as u32))
                    .map_err(|e| self.error(e))?;
            }
            CaptureProperty::AutoExposure => {
                let mode = if value >= 0.5 {
                    V4L2_EXPOSURE_APERTURE_PRIORITY
                } else {
                    V4L2_EXPOSURE_MANUAL
                };
                // Not every camera exposes the control; keep going without it
                if let Err(e) = self.set_control(V4L2_CID_EXPOSURE_AUTO, mode) {
                    warn!("{}", e);
                }
            }
            CaptureProperty::Exposure => {
                if let Err(e) = self.set_control(V4L2_CID_EXPOSURE_ABSOLUTE, value as i64) {
                    warn!("{}", e);
                }
            }
            CaptureProperty::Channels => {}
        }
        Ok(())
    }

    fn get(&self, property: CaptureProperty) -> Option<f64> {
        match property {
            CaptureProperty::Width => Some(self.width as f64),
            CaptureProperty::Height => Some(self.height as f64),
            CaptureProperty::Framerate => self.framerate(),
            CaptureProperty::AutoExposure => self
                .control(V4L2_CID_EXPOSURE_AUTO)
                .map(|mode| f64::from(u8::from(mode != V4L2_EXPOSURE_MANUAL))),
            CaptureProperty::Exposure => self.control(V4L2_CID_EXPOSURE_ABSOLUTE).map(|v| v as f64),
            // Frames are always decoded to RGB
            CaptureProperty::Channels => Some(3.0),
        }
    }

    fn grab(&mut self) -> bool {
        let next = match self.ensure_stream() {
            Ok(stream) => stream.next().map(|(buf, meta)| {
                let used = (meta.bytesused as usize).min(buf.len());
                buf[..used].to_vec()
            }),
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };
        match next {
            Ok(raw) => {
                self.raw = raw;
                self.grabbed = true;
                true
            }
            Err(e) => {
                warn!(camera_id = %self.camera_id, "dequeue failed: {}", e);
                false
            }
        }
    }

    fn retrieve(&mut self) -> Option<Bytes> {
        if !std::mem::take(&mut self.grabbed) {
            return None;
        }
        match decode_frame(&self.raw, self.fourcc, self.width, self.height) {
            Ok(pixels) => Some(Bytes::from(pixels)),
            Err(e) => {
                warn!(camera_id = %self.camera_id, "{}", e);
                None
            }
        }
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            info!(camera_id = %self.camera_id, "capture stream stopped");
        }
    }
}
