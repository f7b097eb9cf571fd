//! A camera group: flags, buffers and the threads that drive synchronized capture

pub mod camera_group;
pub mod escape;
pub mod ipc;
pub mod messages;
pub mod orchestrator;
pub mod shared_memory;
pub mod wait;

pub use camera_group::{CameraGroup, CameraGroupSettings};
pub use escape::{MultiFrameEscapeRingBuffer, MultiFrameEscapeRingBufferDescriptor};
pub use ipc::{create_global_kill, GroupIpcFlags, GroupIpcFlagsDescriptor};
pub use messages::{CameraCommand, IpcMessage, Mailbox};
pub use orchestrator::CameraGroupOrchestrator;
pub use shared_memory::{
    CameraBufferLayout, CameraGroupSharedMemory, CameraGroupSharedMemoryDescriptor, PerCameraSharedMemory,
    PerCameraSharedMemoryDescriptor,
};
