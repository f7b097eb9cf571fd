//! Frame data model: metadata, single frames and synchronized multi-frames

pub mod metadata;
pub mod multi_frame;
pub mod payload;
pub mod timebase;

pub use metadata::{monotonic_ns, FrameLifecycle, FrameMetadata};
pub use multi_frame::MultiFramePayload;
pub use payload::FramePayload;
pub use timebase::TimebaseMapping;
