//! Writing multi-frames to disk

#[cfg(feature = "gstreamer-pipeline")]
pub mod gst_writer;
pub mod info;
pub mod manager;
pub mod recorder;
pub mod timestamps;
pub mod writer;

#[cfg(feature = "gstreamer-pipeline")]
pub use gst_writer::GstVideoWriter;
pub use info::{RecordedVideo, RecordingInfo, RecordingRequest, RecordingStartRecord, RecordingSummary};
pub use manager::VideoRecorderManager;
pub use writer::{count_mjpeg_frames, default_writer_factory, MjpegWriter, VideoWriter, WriterFactory};
