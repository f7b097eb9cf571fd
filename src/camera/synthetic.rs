//! Deterministic generated frames
//!
//! Every pixel of the n-th retrieved frame equals `(n + camera_index) % 256`,
//! which makes dropped or duplicated frames visible in recorded output.

use std::time::{Duration, Instant};

use bytes::Bytes;

use super::config::CameraConfig;
use super::device::{CaptureDevice, CaptureProperty};
use crate::error::Result;

#[derive(Debug)]
pub struct SyntheticCamera {
    camera_index: usize,
    width: u32,
    height: u32,
    channels: u32,
    framerate: f64,
    auto_exposure: bool,
    exposure: f64,
    frames_retrieved: u64,
    grabbed: bool,
    next_frame_due: Option<Instant>,
    released: bool,
}

impl SyntheticCamera {
    pub fn new(config: &CameraConfig, camera_index: usize) -> Self {
        Self {
            camera_index,
            width: config.resolution.width,
            height: config.resolution.height,
            channels: config.color_channels,
            framerate: config.framerate,
            auto_exposure: true,
            exposure: config.exposure as f64,
            frames_retrieved: 0,
            grabbed: false,
            next_frame_due: None,
            released: false,
        }
    }

    /// Pixel value of the frame `frame_index` frames after opening.
    pub fn pixel_value(frame_index: u64, camera_index: usize) -> u8 {
        ((frame_index + camera_index as u64) % 256) as u8
    }

    fn pace(&mut self) {
        if self.framerate <= 0.0 {
            return;
        }
        if let Some(due) = self.next_frame_due {
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        self.next_frame_due = Some(Instant::now() + Duration::from_secs_f64(1.0 / self.framerate));
    }
}

impl CaptureDevice for SyntheticCamera {
    fn set(&mut self, property: CaptureProperty, value: f64) -> Result<()> {
        match property {
            CaptureProperty::Width => self.width = value as u32,
            CaptureProperty::Height => self.height = value as u32,
            CaptureProperty::Framerate => self.framerate = value,
            CaptureProperty::AutoExposure => self.auto_exposure = value >= 0.5,
            CaptureProperty::Exposure => self.exposure = value,
            // Fixed at construction
            CaptureProperty::Channels => {}
        }
        Ok(())
    }

    fn get(&self, property: CaptureProperty) -> Option<f64> {
        Some(match property {
            CaptureProperty::Width => self.width as f64,
            CaptureProperty::Height => self.height as f64,
            CaptureProperty::Framerate => self.framerate,
            CaptureProperty::AutoExposure => f64::from(u8::from(self.auto_exposure)),
            CaptureProperty::Exposure => self.exposure,
            CaptureProperty::Channels => self.channels as f64,
        })
    }

    fn grab(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.pace();
        self.grabbed = true;
        true
    }

    fn retrieve(&mut self) -> Option<Bytes> {
        if !std::mem::take(&mut self.grabbed) {
            return None;
        }
        let value = Self::pixel_value(self.frames_retrieved, self.camera_index);
        self.frames_retrieved += 1;
        let size = self.width as usize * self.height as usize * self.channels as usize;
        Some(Bytes::from(vec![value; size]))
    }

    fn release(&mut self) {
        self.released = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraId, Resolution};

    fn camera(index: usize) -> SyntheticCamera {
        let mut config = CameraConfig::synthetic(CameraId(index as u32));
        config.resolution = Resolution { width: 4, height: 2 };
        config.framerate = 1000.0;
        SyntheticCamera::new(&config, index)
    }

    #[test]
    fn test_frames_follow_the_pixel_formula() {
        let mut cam = camera(3);
        for n in 0..5u64 {
            assert!(cam.grab());
            let image = cam.retrieve().unwrap();
            assert_eq!(image.len(), 24);
            assert!(image.iter().all(|&p| p == SyntheticCamera::pixel_value(n, 3)));
        }
        assert_eq!(SyntheticCamera::pixel_value(255, 3), 2);
    }

    #[test]
    fn test_retrieve_needs_a_grab_and_release_stops_grabs() {
        let mut cam = camera(0);
        assert!(cam.retrieve().is_none());
        assert!(cam.grab());
        assert!(cam.retrieve().is_some());
        assert!(cam.retrieve().is_none());
        cam.release();
        assert!(!cam.grab());
    }
}
