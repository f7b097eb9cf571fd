//! Controller-side workers: trigger loop, relay, wrangler and preview

pub mod frame_loop;
pub mod framerate;
pub mod preview;
pub mod wrangler;

pub use frame_loop::{FrameLoopManager, FrameRelay};
pub use framerate::{FramerateSample, FramerateTracker};
pub use preview::{PreviewFrame, PreviewRelay};
pub use wrangler::FrameWrangler;
