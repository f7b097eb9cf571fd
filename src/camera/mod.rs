//! Camera side of the group: configs, capture devices, per-camera flags and the
//! worker process that ties them together.

pub mod config;
pub mod decoder;
pub mod detect;
pub mod device;
pub mod flags;
pub mod process;
pub mod synthetic;
pub mod v4l2;

pub use config::{CameraConfig, CameraId, CaptureBackend, ExposureMode, FourCc, Resolution, Rotation};
pub use detect::{detect_cameras, detect_devices, DetectedDevice};
pub use device::{apply_config, open_device, CaptureDevice, CaptureProperty};
pub use flags::{CameraFrameLoopFlags, CameraFrameLoopFlagsDescriptor};
pub use process::{run_camera_worker, CameraProcess, CameraWorkerDescriptor, WorkerSpawner};
pub use synthetic::SyntheticCamera;
