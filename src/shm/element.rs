//! Named POSIX shared memory segment

use std::fs::File;

use memmap2::{MmapMut, MmapOptions};
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::platform::{page_aligned, MAX_SEGMENT_NAME_LEN};
use crate::error::{Result, SyncError};

/// Everything another process needs to attach to a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemoryElementDescriptor {
    pub name: String,
    pub size: usize,
}

/// A fixed-size, named shared memory segment.
///
/// Created once by an owning process, recreated (attached) by every other
/// process, detached on drop. Only the creating instance may unlink the name; if
/// it is dropped without an explicit [`unlink`](Self::unlink) the name is unlinked
/// then.
#[derive(Debug)]
pub struct SharedMemoryElement {
    mmap: MmapMut,
    name: String,
    size: usize,
    original: bool,
    unlinked: bool,
    _file: File,
}

impl SharedMemoryElement {
    /// Allocate a new zero-filled segment. Fails if the name already exists.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        validate_name(name)?;
        if size == 0 {
            return Err(SyncError::Validation(format!(
                "shared memory segment `{name}` must not be empty"
            )));
        }

        let fd = shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| SyncError::shm(name, e))?;
        let file = File::from(fd);

        if let Err(e) = file.set_len(page_aligned(size) as u64) {
            let _ = shm_unlink(name);
            return Err(SyncError::shm(name, e));
        }

        let mmap = match unsafe { MmapOptions::new().len(size).map_mut(&file) } {
            Ok(mmap) => mmap,
            Err(e) => {
                let _ = shm_unlink(name);
                return Err(SyncError::shm(name, e));
            }
        };

        trace!(name, size, "created shared memory segment");

        Ok(Self {
            mmap,
            name: name.to_string(),
            size,
            original: true,
            unlinked: false,
            _file: file,
        })
    }

    /// Attach to a segment created elsewhere. Never allocates.
    pub fn recreate(descriptor: &SharedMemoryElementDescriptor) -> Result<Self> {
        let name = descriptor.name.as_str();
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty()).map_err(|e| SyncError::shm(name, e))?;
        let file = File::from(fd);

        let actual = file.metadata().map_err(|e| SyncError::shm(name, e))?.len() as usize;
        if actual < descriptor.size {
            return Err(SyncError::Shape {
                name: name.to_string(),
                expected: descriptor.size,
                actual,
            });
        }

        let mmap = unsafe { MmapOptions::new().len(descriptor.size).map_mut(&file) }
            .map_err(|e| SyncError::shm(name, e))?;

        trace!(name, size = descriptor.size, "attached shared memory segment");

        Ok(Self {
            mmap,
            name: descriptor.name.clone(),
            size: descriptor.size,
            original: false,
            unlinked: false,
            _file: file,
        })
    }

    pub fn descriptor(&self) -> SharedMemoryElementDescriptor {
        SharedMemoryElementDescriptor {
            name: self.name.clone(),
            size: self.size,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Created by this instance (as opposed to attached).
    pub fn is_original(&self) -> bool {
        self.original
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.mmap[..]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.mmap[..]
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }

    /// Remove the name from the system. Existing mappings in other processes stay
    /// valid until they detach.
    pub fn unlink(&mut self) -> Result<()> {
        if !self.original {
            return Err(SyncError::NotOwner {
                name: self.name.clone(),
            });
        }
        if self.unlinked {
            return Ok(());
        }
        shm_unlink(self.name.as_str()).map_err(|e| SyncError::shm(&self.name, e))?;
        self.unlinked = true;
        debug!(name = %self.name, "unlinked shared memory segment");
        Ok(())
    }
}

impl Drop for SharedMemoryElement {
    fn drop(&mut self) {
        if self.original && !self.unlinked {
            if let Err(e) = shm_unlink(self.name.as_str()) {
                warn!(name = %self.name, "failed to unlink shared memory on drop: {}", e);
            }
        }
    }
}

// The mapping is plain shared bytes; synchronization is the caller's job (atomics
// in the header words, publish-after-write in the ring buffer).
unsafe impl Send for SharedMemoryElement {}
unsafe impl Sync for SharedMemoryElement {}

fn validate_name(name: &str) -> Result<()> {
    let valid = name.starts_with('/')
        && name.len() > 1
        && name.len() <= MAX_SEGMENT_NAME_LEN
        && !name[1..].contains('/');
    if valid {
        Ok(())
    } else {
        Err(SyncError::Validation(format!(
            "invalid shared memory segment name `{name}`"
        )))
    }
}
