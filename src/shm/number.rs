//! Shared scalar used for ring cursors and counters

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};

use super::element::{SharedMemoryElement, SharedMemoryElementDescriptor};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemoryNumberDescriptor {
    pub element: SharedMemoryElementDescriptor,
}

/// An `i64` living in its own shared memory segment.
#[derive(Debug)]
pub struct SharedMemoryNumber {
    element: SharedMemoryElement,
}

impl SharedMemoryNumber {
    pub fn create(name: &str, initial: i64) -> Result<Self> {
        let element = SharedMemoryElement::create(name, std::mem::size_of::<i64>())?;
        let number = Self { element };
        number.atomic().store(initial, Ordering::SeqCst);
        Ok(number)
    }

    pub fn recreate(descriptor: &SharedMemoryNumberDescriptor) -> Result<Self> {
        Ok(Self {
            element: SharedMemoryElement::recreate(&descriptor.element)?,
        })
    }

    pub fn descriptor(&self) -> SharedMemoryNumberDescriptor {
        SharedMemoryNumberDescriptor {
            element: self.element.descriptor(),
        }
    }

    fn atomic(&self) -> &AtomicI64 {
        // Mappings are page aligned and at least 8 bytes long
        unsafe { &*(self.element.as_ptr() as *const AtomicI64) }
    }

    #[inline]
    pub fn get(&self) -> i64 {
        self.atomic().load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: i64) {
        self.atomic().store(value, Ordering::Release);
    }

    pub fn fetch_add(&self, delta: i64) -> i64 {
        self.atomic().fetch_add(delta, Ordering::AcqRel)
    }

    /// Returns `Ok(previous)` if the swap happened, `Err(actual)` otherwise.
    pub fn compare_exchange(&self, current: i64, new: i64) -> std::result::Result<i64, i64> {
        self.atomic()
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn is_original(&self) -> bool {
        self.element.is_original()
    }

    pub fn unlink(&mut self) -> Result<()> {
        self.element.unlink()
    }
}
