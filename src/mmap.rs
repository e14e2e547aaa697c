//! Caller mappings of queue-owned memory.
//!
//! Every plane of an [`MemoryModel::Mmap`](crate::MemoryModel::Mmap) buffer
//! gets a page-aligned offset cookie. The cookie table has its own lock so
//! that mapping requests never contend with the queue lock, while pool
//! resizing holds it across the whole free/allocate step.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::dmabuf::SharedMemory;
use crate::error::{QueueError, Result};
use crate::memory::{MmapMemory, page_align};

/// A caller mapping of one plane.
///
/// The mapping keeps the memory alive and counts as a user of it, so a pool
/// with live mappings reports itself as in use.
pub struct PlaneMapping {
    memory: Arc<dyn SharedMemory>,
}

impl PlaneMapping {
    /// Creates a mapping that holds a reference to `memory`.
    #[must_use]
    pub fn new(memory: Arc<dyn SharedMemory>) -> Self {
        Self { memory }
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.size()
    }

    /// Returns `true` if the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start address of the mapping.
    #[must_use]
    pub fn as_ptr(&self) -> Option<NonNull<u8>> {
        self.memory.vaddr()
    }

    /// Returns the mapped bytes.
    ///
    /// # Safety
    ///
    /// The caller must own the buffer (it is dequeued) so the consumer is
    /// not writing to it concurrently.
    #[must_use]
    pub unsafe fn as_slice(&self) -> &[u8] {
        match self.as_ptr() {
            // SAFETY: vaddr is valid for len bytes while memory is alive.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len()) },
            None => &[],
        }
    }

    /// Returns the mapped bytes mutably.
    ///
    /// # Safety
    ///
    /// The caller must own the buffer and must not hold any other slice of
    /// the same mapping.
    #[must_use]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        match self.as_ptr() {
            // SAFETY: vaddr is valid for len bytes; exclusivity is on the caller.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len()) },
            None => &mut [],
        }
    }
}

impl fmt::Debug for PlaneMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlaneMapping")
            .field("ptr", &self.as_ptr())
            .field("len", &self.len())
            .finish()
    }
}

/// One mappable plane.
#[derive(Clone)]
pub(crate) struct MmapEntry {
    pub(crate) offset: u64,
    pub(crate) index: usize,
    pub(crate) plane: usize,
    pub(crate) length: usize,
    pub(crate) memory: Arc<dyn MmapMemory>,
}

/// Offset cookie to plane lookup table.
#[derive(Default)]
pub(crate) struct MmapTable {
    entries: Mutex<Vec<MmapEntry>>,
}

impl MmapTable {
    /// Takes the pool-resize lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<MmapEntry>> {
        self.entries.lock()
    }

    /// Maps the plane registered at `offset`.
    pub(crate) fn map(&self, offset: u64, len: usize) -> Result<(usize, usize, PlaneMapping)> {
        let entries = self.entries.lock();
        if entries.is_empty() {
            return Err(QueueError::InvalidArgument(
                "queue is not currently set up for mmap".into(),
            ));
        }
        let entry = entries
            .iter()
            .find(|e| e.offset == offset)
            .ok_or_else(|| QueueError::InvalidArgument(format!("no plane at offset {offset:#x}")))?;

        let max = page_align(entry.length).unwrap_or(entry.length);
        if len > max {
            return Err(QueueError::InvalidArgument(format!(
                "mapping of {len} bytes would overflow plane length {}",
                entry.length
            )));
        }
        let mapping = entry.memory.mmap()?;
        Ok((entry.index, entry.plane, mapping))
    }
}

/// Removes every entry belonging to buffers at or above `first`.
pub(crate) fn retain_below(entries: &mut Vec<MmapEntry>, first: usize) {
    entries.retain(|e| e.index < first);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::HeapAllocator;
    use crate::memory::{DmaDirection, MmapOps, PAGE_SIZE};

    fn entry(offset: u64, index: usize, length: usize) -> MmapEntry {
        let memory = HeapAllocator::new()
            .alloc(page_align(length).unwrap(), DmaDirection::FromDevice)
            .unwrap();
        MmapEntry {
            offset,
            index,
            plane: 0,
            length,
            memory,
        }
    }

    #[test]
    fn test_map_by_offset() {
        let table = MmapTable::default();
        table.lock().push(entry(0, 0, 100));
        table.lock().push(entry(PAGE_SIZE as u64, 1, 100));

        let (index, plane, mapping) = table.map(PAGE_SIZE as u64, PAGE_SIZE).unwrap();
        assert_eq!((index, plane), (1, 0));
        assert_eq!(mapping.len(), PAGE_SIZE);
        assert!(mapping.as_ptr().is_some());

        unsafe {
            mapping.as_mut_slice()[0] = 7;
            assert_eq!(mapping.as_slice()[0], 7);
        }
    }

    #[test]
    fn test_map_errors() {
        let table = MmapTable::default();
        assert!(table.map(0, 1).is_err());

        table.lock().push(entry(0, 0, 100));
        assert!(table.map(123, 1).is_err());
        assert!(table.map(0, PAGE_SIZE + 1).is_err());
    }

    #[test]
    fn test_retain_below() {
        let table = MmapTable::default();
        {
            let mut entries = table.lock();
            entries.push(entry(0, 0, 10));
            entries.push(entry(PAGE_SIZE as u64, 1, 10));
            entries.push(entry(2 * PAGE_SIZE as u64, 2, 10));
            retain_below(&mut entries, 1);
            assert_eq!(entries.len(), 1);
        }
        assert!(table.map(PAGE_SIZE as u64, 1).is_err());
    }
}
