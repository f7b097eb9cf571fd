//! Fixed-capacity circular buffer over shared memory
//!
//! One writer, at most one consuming reader, any number of latest-value readers.
//! Indices are logical and only ever grow; the physical slot is `index % capacity`.
//!
//! Cursor protocol:
//! - `last_written` starts at -1 and is advanced (Release) after the slot bytes
//!   are in place, so a reader that observes index `i` also observes its data.
//! - `write_claim` is raised to the index being written before its slot bytes
//!   change. A non-consuming read re-checks it after copying; a claim that
//!   reached `index + capacity` means the copy may be torn.
//! - `last_read` starts at -2, meaning "no consumer attached yet". The first
//!   non-read-only attach moves it to -1. The writer treats anything below -1 as
//!   -1 when checking for overwrites.

use std::sync::atomic::{fence, Ordering};

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::element::{SharedMemoryElement, SharedMemoryElementDescriptor};
use super::number::{SharedMemoryNumber, SharedMemoryNumberDescriptor};
use crate::error::{Result, SyncError};

const NOTHING_WRITTEN: i64 = -1;
const NO_READER_ATTACHED: i64 = -2;

/// How many slots a ring gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RingCapacity {
    /// As many whole elements as fit in this many bytes.
    Budget(usize),
    /// Exactly this many slots.
    Slots(usize),
}

impl RingCapacity {
    pub fn slots(self, element_size: usize) -> usize {
        match self {
            RingCapacity::Budget(bytes) => bytes / element_size.max(1),
            RingCapacity::Slots(n) => n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemoryRingBufferDescriptor {
    pub name: String,
    pub data: SharedMemoryElementDescriptor,
    pub last_written: SharedMemoryNumberDescriptor,
    pub write_claim: SharedMemoryNumberDescriptor,
    pub last_read: SharedMemoryNumberDescriptor,
    pub element_size: usize,
    pub capacity: usize,
}

#[derive(Debug)]
pub struct SharedMemoryRingBuffer {
    name: String,
    data: SharedMemoryElement,
    last_written: SharedMemoryNumber,
    write_claim: SharedMemoryNumber,
    last_read: SharedMemoryNumber,
    element_size: usize,
    capacity: usize,
    read_only: bool,
}

impl SharedMemoryRingBuffer {
    /// Allocate the data segment and the cursors.
    ///
    /// `name` is used as the prefix of the four segment names, so keep it short.
    pub fn create(
        name: &str,
        element_size: usize,
        capacity: RingCapacity,
        read_only: bool,
    ) -> Result<Self> {
        if element_size == 0 {
            return Err(SyncError::Validation(format!(
                "ring buffer `{name}` has zero-sized elements"
            )));
        }
        let slots = capacity.slots(element_size);
        if slots == 0 {
            return Err(SyncError::Validation(format!(
                "ring buffer `{name}` has no room for a single {element_size} byte element ({capacity:?})"
            )));
        }

        let data = SharedMemoryElement::create(&format!("{name}-d"), slots * element_size)?;
        let last_written = SharedMemoryNumber::create(&format!("{name}-w"), NOTHING_WRITTEN)?;
        let write_claim = SharedMemoryNumber::create(&format!("{name}-c"), NOTHING_WRITTEN)?;
        let last_read = SharedMemoryNumber::create(&format!("{name}-r"), NO_READER_ATTACHED)?;
        if !read_only {
            last_read.set(NOTHING_WRITTEN);
        }

        trace!(name, element_size, capacity = slots, "created ring buffer");

        Ok(Self {
            name: name.to_string(),
            data,
            last_written,
            write_claim,
            last_read,
            element_size,
            capacity: slots,
            read_only,
        })
    }

    /// Attach to an existing ring. A non-read-only attach claims the consumer role.
    pub fn recreate(descriptor: &SharedMemoryRingBufferDescriptor, read_only: bool) -> Result<Self> {
        let data = SharedMemoryElement::recreate(&descriptor.data)?;
        let expected = descriptor.capacity * descriptor.element_size;
        if data.size() != expected {
            return Err(SyncError::Shape {
                name: descriptor.name.clone(),
                expected,
                actual: data.size(),
            });
        }

        let last_written = SharedMemoryNumber::recreate(&descriptor.last_written)?;
        let write_claim = SharedMemoryNumber::recreate(&descriptor.write_claim)?;
        let last_read = SharedMemoryNumber::recreate(&descriptor.last_read)?;
        if !read_only {
            // Only the first consumer moves the sentinel
            let _ = last_read.compare_exchange(NO_READER_ATTACHED, NOTHING_WRITTEN);
        }

        Ok(Self {
            name: descriptor.name.clone(),
            data,
            last_written,
            write_claim,
            last_read,
            element_size: descriptor.element_size,
            capacity: descriptor.capacity,
            read_only,
        })
    }

    pub fn descriptor(&self) -> SharedMemoryRingBufferDescriptor {
        SharedMemoryRingBufferDescriptor {
            name: self.name.clone(),
            data: self.data.descriptor(),
            last_written: self.last_written.descriptor(),
            write_claim: self.write_claim.descriptor(),
            last_read: self.last_read.descriptor(),
            element_size: self.element_size,
            capacity: self.capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    pub fn last_written_index(&self) -> i64 {
        self.last_written.get()
    }

    /// Clamped to -1 while no consumer has attached.
    #[inline]
    pub fn last_read_index(&self) -> i64 {
        self.last_read.get().max(NOTHING_WRITTEN)
    }

    pub fn first_data_written(&self) -> bool {
        self.last_written_index() > NOTHING_WRITTEN
    }

    pub fn new_data_available(&self) -> bool {
        self.last_written_index() > self.last_read_index()
    }

    /// Whether the next `put` would succeed.
    pub fn can_put(&self) -> bool {
        let next = self.last_written_index() + 1;
        next - self.last_read_index() <= self.capacity as i64
    }

    fn slot_range(&self, index: i64) -> std::ops::Range<usize> {
        let slot = index.rem_euclid(self.capacity as i64) as usize;
        let start = slot * self.element_size;
        start..start + self.element_size
    }

    /// Copy `element` into the next slot and publish it. Returns the new index.
    pub fn put(&mut self, element: &[u8]) -> Result<i64> {
        if self.read_only {
            return Err(SyncError::ReadOnly {
                name: self.name.clone(),
                operation: "put",
            });
        }
        if element.len() != self.element_size {
            return Err(SyncError::Shape {
                name: self.name.clone(),
                expected: self.element_size,
                actual: element.len(),
            });
        }

        let next = self.last_written_index() + 1;
        if next - self.last_read_index() > self.capacity as i64 {
            return Err(SyncError::Overwrite {
                name: self.name.clone(),
                index: next,
            });
        }

        let range = self.slot_range(next);
        self.write_claim.set(next);
        // Claim must be visible before any slot byte changes
        fence(Ordering::SeqCst);
        self.data.as_mut_slice()[range].copy_from_slice(element);
        self.last_written.set(next);
        Ok(next)
    }

    /// Consume the oldest unread element.
    pub fn get_next(&mut self) -> Result<Vec<u8>> {
        if self.read_only {
            return Err(SyncError::ReadOnly {
                name: self.name.clone(),
                operation: "get_next",
            });
        }

        let written = self.last_written_index();
        let read = self.last_read_index();
        if written <= read {
            return Err(SyncError::Empty {
                name: self.name.clone(),
            });
        }

        let index = read + 1;
        let element = self.data.as_slice()[self.slot_range(index)].to_vec();
        self.last_read.set(index);
        Ok(element)
    }

    /// Copy the most recently written element without consuming anything.
    pub fn get_latest(&self) -> Result<Vec<u8>> {
        loop {
            match self.get_at(self.last_written_index()) {
                // Writer lapped us mid-copy, try the newer slot
                Err(SyncError::Overwrite { .. }) => std::hint::spin_loop(),
                other => return other,
            }
        }
    }

    /// Non-consuming read of a specific logical index, as long as it has been
    /// written and the writer has not started reusing its slot.
    pub fn get_at(&self, index: i64) -> Result<Vec<u8>> {
        if index <= NOTHING_WRITTEN || index > self.last_written_index() {
            return Err(SyncError::Empty {
                name: self.name.clone(),
            });
        }
        let element = self.data.as_slice()[self.slot_range(index)].to_vec();
        fence(Ordering::SeqCst);
        if self.write_claim.get() - index >= self.capacity as i64 {
            return Err(SyncError::Overwrite {
                name: self.name.clone(),
                index,
            });
        }
        Ok(element)
    }

    /// Remove all four segments. Only valid on the creating instance.
    pub fn unlink(&mut self) -> Result<()> {
        self.data.unlink()?;
        self.last_written.unlink()?;
        self.write_claim.unlink()?;
        self.last_read.unlink()
    }

    #[cfg(test)]
    pub(crate) fn force_last_written(&self, index: i64) {
        self.write_claim.set(index);
        self.last_written.set(index);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;
    use crate::shm::platform::{group_prefix, segment_name};

    fn ring(element_size: usize, capacity: RingCapacity) -> SharedMemoryRingBuffer {
        let name = segment_name(&group_prefix(), "rb");
        SharedMemoryRingBuffer::create(&name, element_size, capacity, false).unwrap()
    }

    fn element(size: usize, value: u8) -> Vec<u8> {
        vec![value; size]
    }

    #[test]
    fn test_put_then_get_next_advances_read_by_one() {
        let mut rb = ring(4, RingCapacity::Slots(3));
        assert_eq!(rb.last_read_index(), -1);

        rb.put(&[1, 2, 3, 4]).unwrap();
        assert!(rb.new_data_available());
        assert_eq!(rb.get_next().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(rb.last_read_index(), 0);
        assert!(!rb.new_data_available());
        assert!(matches!(rb.get_next(), Err(SyncError::Empty { .. })));
    }

    #[test]
    fn test_get_latest_does_not_consume() {
        let mut rb = ring(1, RingCapacity::Slots(4));
        rb.put(&[7]).unwrap();
        rb.put(&[8]).unwrap();

        assert_eq!(rb.get_latest().unwrap(), vec![8]);
        assert_eq!(rb.get_latest().unwrap(), vec![8]);
        assert_eq!(rb.last_read_index(), -1);
        assert_eq!(rb.get_next().unwrap(), vec![7]);
        assert_eq!(rb.get_at(0).unwrap(), vec![7]);
        assert!(rb.get_at(2).is_err());
    }

    #[test]
    fn test_peek_rejects_slot_with_write_in_flight() {
        let mut rb = ring(1, RingCapacity::Slots(2));
        rb.put(&[0]).unwrap();
        rb.put(&[1]).unwrap();
        assert_eq!(rb.get_next().unwrap(), vec![0]);

        // Writer has claimed index 2 (slot 0) but not yet published it
        rb.write_claim.set(2);
        assert_eq!(rb.last_written_index(), 1);
        assert!(matches!(rb.get_at(0), Err(SyncError::Overwrite { .. })));
        assert_eq!(rb.get_at(1).unwrap(), vec![1]);
    }

    #[test]
    fn test_single_slot_peek_rejects_write_in_flight() {
        let mut rb = ring(1, RingCapacity::Slots(1));
        rb.put(&[4]).unwrap();
        assert_eq!(rb.get_latest().unwrap(), vec![4]);
        assert_eq!(rb.get_next().unwrap(), vec![4]);

        rb.write_claim.set(1);
        assert!(matches!(rb.get_at(0), Err(SyncError::Overwrite { .. })));
    }

    #[test]
    fn test_peek_never_returns_a_torn_element() {
        const SIZE: usize = 256 * 1024;
        const PUTS: i64 = 200;

        let mut writer = ring(SIZE, RingCapacity::Slots(2));
        let descriptor = writer.descriptor();
        let done = Arc::new(AtomicBool::new(false));

        let consumer = {
            let descriptor = descriptor.clone();
            std::thread::spawn(move || {
                let mut rb = SharedMemoryRingBuffer::recreate(&descriptor, false).unwrap();
                let mut expected = 0;
                while expected < PUTS {
                    match rb.get_next() {
                        Ok(e) => {
                            assert_eq!(e[0] as i64, expected % 256);
                            expected += 1;
                        }
                        Err(SyncError::Empty { .. }) => std::hint::spin_loop(),
                        Err(e) => panic!("{e}"),
                    }
                }
            })
        };
        let peeker = {
            let done = done.clone();
            std::thread::spawn(move || {
                let rb = SharedMemoryRingBuffer::recreate(&descriptor, true).unwrap();
                let mut peeks = 0u64;
                while !done.load(AtomicOrdering::Acquire) {
                    match rb.get_latest() {
                        Ok(e) => {
                            assert!(e.iter().all(|&b| b == e[0]), "torn element at peek {peeks}");
                            peeks += 1;
                        }
                        Err(SyncError::Empty { .. }) => std::hint::spin_loop(),
                        Err(e) => panic!("{e}"),
                    }
                }
            })
        };

        for value in 0..PUTS {
            loop {
                match writer.put(&element(SIZE, value as u8)) {
                    Ok(_) => break,
                    Err(e) if e.is_retryable() => std::hint::spin_loop(),
                    Err(e) => panic!("{e}"),
                }
            }
        }
        consumer.join().unwrap();
        done.store(true, AtomicOrdering::Release);
        peeker.join().unwrap();
    }

    #[test]
    fn test_wrong_element_length_is_shape_error() {
        let mut rb = ring(4, RingCapacity::Slots(2));
        assert!(matches!(rb.put(&[1, 2]), Err(SyncError::Shape { .. })));
        assert!(!rb.first_data_written());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let name = segment_name(&group_prefix(), "zc");
        let result = SharedMemoryRingBuffer::create(&name, 100, RingCapacity::Budget(99), false);
        assert!(matches!(result, Err(SyncError::Validation(_))));
    }

    #[test]
    fn test_read_only_instances_cannot_consume() {
        let mut rb = ring(2, RingCapacity::Slots(2));
        rb.put(&[5, 6]).unwrap();

        let mut viewer = SharedMemoryRingBuffer::recreate(&rb.descriptor(), true).unwrap();
        assert!(matches!(viewer.get_next(), Err(SyncError::ReadOnly { .. })));
        assert_eq!(viewer.get_latest().unwrap(), vec![5, 6]);
        assert_eq!(rb.last_read_index(), -1);
    }

    #[test]
    fn test_first_consumer_attach_moves_sentinel() {
        let name = segment_name(&group_prefix(), "att");
        let mut writer = SharedMemoryRingBuffer::create(&name, 1, RingCapacity::Slots(2), true).unwrap();
        writer.read_only = false;
        assert_eq!(writer.last_read.get(), -2);
        assert_eq!(writer.last_read_index(), -1);

        let mut reader = SharedMemoryRingBuffer::recreate(&writer.descriptor(), false).unwrap();
        assert_eq!(reader.last_read.get(), -1);

        writer.put(&[1]).unwrap();
        assert_eq!(reader.get_next().unwrap(), vec![1]);

        // A second consumer attach must not rewind the cursor
        let again = SharedMemoryRingBuffer::recreate(&writer.descriptor(), false).unwrap();
        assert_eq!(again.last_read_index(), 0);
    }

    #[test]
    fn test_wraps_once_consumer_catches_up() {
        let mut rb = ring(1, RingCapacity::Slots(2));
        rb.put(&[0]).unwrap();
        rb.put(&[1]).unwrap();
        assert!(!rb.can_put());
        assert_eq!(rb.get_next().unwrap(), vec![0]);
        assert!(rb.can_put());
        assert_eq!(rb.put(&[2]).unwrap(), 2);
        assert_eq!(rb.get_next().unwrap(), vec![1]);
        assert_eq!(rb.get_next().unwrap(), vec![2]);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_capacity_from_budget(element_size in 1usize..512, budget in 1usize..16_384) {
            prop_assume!(budget >= element_size);
            let rb = ring(element_size, RingCapacity::Budget(budget));
            prop_assert_eq!(rb.capacity(), budget / element_size);
            prop_assert!(matches!(rb.get_latest(), Err(SyncError::Empty { .. })), "expected SyncError::Empty");
        }

        #[test]
        fn prop_fifo_without_loss(capacity in 1usize..16, element_size in 1usize..64, count in 0usize..16) {
            let count = count.min(capacity);
            let mut rb = ring(element_size, RingCapacity::Slots(capacity));
            prop_assert!(rb.get_next().is_err());

            for i in 0..count {
                rb.put(&element(element_size, i as u8)).unwrap();
            }
            for i in 0..count {
                prop_assert_eq!(rb.get_next().unwrap(), element(element_size, i as u8));
            }
            prop_assert!(rb.get_next().is_err());
        }

        #[test]
        fn prop_overflow_fails_on_last_put(capacity in 1usize..16) {
            let mut rb = ring(8, RingCapacity::Slots(capacity));
            for i in 0..capacity {
                prop_assert!(rb.put(&element(8, i as u8)).is_ok());
            }
            let overflow = rb.put(&element(8, 0xff));
            prop_assert!(matches!(overflow, Err(SyncError::Overwrite { .. })), "expected SyncError::Overwrite");
            prop_assert!(overflow.unwrap_err().is_retryable());
            // Nothing was clobbered
            prop_assert_eq!(rb.get_next().unwrap(), element(8, 0));
        }
    }
}
