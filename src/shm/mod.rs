//! Shared memory primitives: raw segments, scalar cursors, flags and the ring buffer

pub mod element;
pub mod flag;
pub mod futex;
pub mod number;
pub mod platform;
pub mod ring_buffer;

pub use element::{SharedMemoryElement, SharedMemoryElementDescriptor};
pub use flag::{SharedFlagBlock, SharedFlagBlockDescriptor};
pub use number::{SharedMemoryNumber, SharedMemoryNumberDescriptor};
pub use platform::{group_prefix, segment_name};
pub use ring_buffer::{RingCapacity, SharedMemoryRingBuffer, SharedMemoryRingBufferDescriptor};
