//! Process-shared boolean flags

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::element::{SharedMemoryElement, SharedMemoryElementDescriptor};
use super::futex;
use crate::error::{Result, SyncError};

/// One cache line per flag so camera workers hammering their own flags don't
/// contend with each other.
const FLAG_STRIDE: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedFlagBlockDescriptor {
    pub element: SharedMemoryElementDescriptor,
    pub count: usize,
}

/// A fixed number of booleans in one shared memory segment.
///
/// Every store wakes futex waiters on that flag, so [`park`](Self::park) returns as
/// soon as another process flips it.
#[derive(Debug)]
pub struct SharedFlagBlock {
    element: SharedMemoryElement,
    count: usize,
}

impl SharedFlagBlock {
    pub fn create(name: &str, count: usize) -> Result<Self> {
        if count == 0 {
            return Err(SyncError::Validation(format!(
                "flag block `{name}` needs at least one flag"
            )));
        }
        let element = SharedMemoryElement::create(name, count * FLAG_STRIDE)?;
        Ok(Self { element, count })
    }

    pub fn recreate(descriptor: &SharedFlagBlockDescriptor) -> Result<Self> {
        let element = SharedMemoryElement::recreate(&descriptor.element)?;
        if element.size() < descriptor.count * FLAG_STRIDE {
            return Err(SyncError::Shape {
                name: descriptor.element.name.clone(),
                expected: descriptor.count * FLAG_STRIDE,
                actual: element.size(),
            });
        }
        Ok(Self {
            element,
            count: descriptor.count,
        })
    }

    pub fn descriptor(&self) -> SharedFlagBlockDescriptor {
        SharedFlagBlockDescriptor {
            element: self.element.descriptor(),
            count: self.count,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn word(&self, index: usize) -> &AtomicU32 {
        assert!(index < self.count, "flag index {index} out of range");
        unsafe { &*(self.element.as_ptr().add(index * FLAG_STRIDE) as *const AtomicU32) }
    }

    #[inline]
    pub fn is_set(&self, index: usize) -> bool {
        self.word(index).load(Ordering::Acquire) != 0
    }

    pub fn store(&self, index: usize, value: bool) {
        let word = self.word(index);
        if word.swap(value as u32, Ordering::AcqRel) != value as u32 {
            futex::wake_all(word);
        }
    }

    #[inline]
    pub fn set(&self, index: usize) {
        self.store(index, true);
    }

    #[inline]
    pub fn clear(&self, index: usize) {
        self.store(index, false);
    }

    pub fn clear_all(&self) {
        for index in 0..self.count {
            self.clear(index);
        }
    }

    /// Sleep for at most `quantum` while the flag still reads `current`.
    pub fn park(&self, index: usize, current: bool, quantum: Duration) {
        futex::wait(self.word(index), current as u32, quantum);
    }

    pub fn unlink(&mut self) -> Result<()> {
        self.element.unlink()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::shm::platform::{group_prefix, segment_name};

    #[test]
    fn test_flags_are_independent_and_shared() {
        let name = segment_name(&group_prefix(), "flags");
        let block = SharedFlagBlock::create(&name, 3).unwrap();
        let attached = SharedFlagBlock::recreate(&block.descriptor()).unwrap();

        block.set(1);
        assert!(!attached.is_set(0));
        assert!(attached.is_set(1));
        assert!(!attached.is_set(2));

        attached.clear_all();
        assert!(!block.is_set(1));
    }

    #[test]
    fn test_park_wakes_on_store_from_other_instance() {
        let name = segment_name(&group_prefix(), "park");
        let block = SharedFlagBlock::create(&name, 1).unwrap();
        let descriptor = block.descriptor();

        let setter = std::thread::spawn(move || {
            let attached = SharedFlagBlock::recreate(&descriptor).unwrap();
            std::thread::sleep(Duration::from_millis(20));
            attached.set(0);
        });

        let start = Instant::now();
        while !block.is_set(0) {
            block.park(0, false, Duration::from_millis(100));
            assert!(start.elapsed() < Duration::from_secs(5));
        }
        setter.join().unwrap();
    }
}
