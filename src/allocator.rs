//! Built-in memory adapters.
//!
//! - [`HeapAllocator`] backs [`MemoryModel::Mmap`](crate::MemoryModel::Mmap)
//!   queues with page-aligned heap memory from the global allocator.
//! - [`UserPtrImporter`] wraps caller supplied addresses.
//! - [`DmaBufImporter`] attaches [`DmaBuf`] handles.
//!
//! Custom adapters implement the traits in [`crate::memory`] instead.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::dmabuf::{DmaBuf, SharedMemory};
use crate::error::{QueueError, Result};
use crate::memory::{
    DmaBufAttachment, DmaBufOps, DmaDirection, MmapMemory, MmapOps, PAGE_SIZE, PlaneMemory,
    UserPtrOps,
};
use crate::mmap::PlaneMapping;

/// Heap allocator for queue-owned plane memory.
///
/// Allocations are zeroed and aligned to [`PAGE_SIZE`]. An optional limit
/// caps the number of bytes live at once; the limit is released when the
/// last reference to a region (queue, mapping or export) goes away.
#[derive(Debug, Default, Clone)]
pub struct HeapAllocator {
    limit: Option<usize>,
    allocated: Arc<AtomicUsize>,
}

impl HeapAllocator {
    /// Creates an allocator without a memory limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an allocator that refuses to hold more than `limit` bytes.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            allocated: Arc::default(),
        }
    }

    /// Bytes currently held by live regions.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    fn reserve(&self, size: usize) -> Result<()> {
        let Some(limit) = self.limit else {
            self.allocated.fetch_add(size, Ordering::AcqRel);
            return Ok(());
        };
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|&total| total <= limit)
            })
            .map(|_| ())
            .map_err(|current| {
                QueueError::OutOfMemory(format!(
                    "memory limit reached: {current} of {limit} bytes in use, {size} requested"
                ))
            })
    }
}

impl MmapOps for HeapAllocator {
    fn alloc(&self, size: usize, _dir: DmaDirection) -> Result<Arc<dyn MmapMemory>> {
        if size == 0 {
            return Err(QueueError::InvalidArgument("size must be > 0".into()));
        }
        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .map_err(|e| QueueError::InvalidArgument(e.to_string()))?;

        self.reserve(size)?;

        // SAFETY: layout has a non-zero size and a power of two alignment.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            self.allocated.fetch_sub(size, Ordering::AcqRel);
            return Err(QueueError::OutOfMemory("failed to allocate memory".into()));
        };

        let region = HeapRegion {
            ptr,
            layout,
            allocated: Arc::clone(&self.allocated),
        };
        Ok(Arc::new(HeapMemory {
            region: Arc::new(region),
        }))
    }
}

/// A heap allocation, freed when the last reference drops.
#[derive(Debug)]
struct HeapRegion {
    ptr: NonNull<u8>,
    layout: Layout,
    allocated: Arc<AtomicUsize>,
}

// SAFETY: the region exclusively owns its allocation; access to the bytes is
// coordinated by buffer ownership, not by this type.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl SharedMemory for HeapRegion {
    fn size(&self) -> usize {
        self.layout.size()
    }

    fn vaddr(&self) -> Option<NonNull<u8>> {
        Some(self.ptr)
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        self.allocated.fetch_sub(self.layout.size(), Ordering::AcqRel);
    }
}

/// Plane memory handed out by [`HeapAllocator`].
#[derive(Debug)]
struct HeapMemory {
    region: Arc<HeapRegion>,
}

impl PlaneMemory for HeapMemory {
    fn size(&self) -> usize {
        self.region.size()
    }

    fn num_users(&self) -> usize {
        Arc::strong_count(&self.region)
    }

    fn vaddr(&self) -> Option<NonNull<u8>> {
        Some(self.region.ptr)
    }
}

impl MmapMemory for HeapMemory {
    fn mmap(&self) -> Result<PlaneMapping> {
        Ok(PlaneMapping::new(Arc::clone(&self.region) as Arc<dyn SharedMemory>))
    }

    fn export(&self) -> Result<DmaBuf> {
        Ok(DmaBuf::new(Arc::clone(&self.region) as Arc<dyn SharedMemory>))
    }
}

/// Wraps caller supplied addresses without copying.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserPtrImporter;

impl UserPtrImporter {
    /// Creates a new importer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl UserPtrOps for UserPtrImporter {
    fn get_userptr(
        &self,
        addr: usize,
        len: usize,
        _dir: DmaDirection,
    ) -> Result<Box<dyn PlaneMemory>> {
        if addr == 0 {
            return Err(QueueError::InvalidArgument("null user pointer".into()));
        }
        if len == 0 || addr.checked_add(len).is_none() {
            return Err(QueueError::InvalidArgument(format!(
                "invalid user region {addr:#x}+{len}"
            )));
        }
        Ok(Box::new(UserMemory { addr, len }))
    }
}

#[derive(Debug)]
struct UserMemory {
    addr: usize,
    len: usize,
}

impl PlaneMemory for UserMemory {
    fn size(&self) -> usize {
        self.len
    }

    fn vaddr(&self) -> Option<NonNull<u8>> {
        NonNull::new(std::ptr::with_exposed_provenance_mut(self.addr))
    }
}

/// Attaches [`DmaBuf`] handles without copying.
#[derive(Debug, Default, Clone, Copy)]
pub struct DmaBufImporter;

impl DmaBufImporter {
    /// Creates a new importer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl DmaBufOps for DmaBufImporter {
    fn attach(
        &self,
        buf: &DmaBuf,
        len: usize,
        _dir: DmaDirection,
    ) -> Result<Box<dyn DmaBufAttachment>> {
        if len > buf.size() {
            return Err(QueueError::InvalidArgument(format!(
                "length {len} exceeds dmabuf size {}",
                buf.size()
            )));
        }
        Ok(Box::new(Attachment {
            buf: buf.clone(),
            len,
            mapped: false,
        }))
    }
}

#[derive(Debug)]
struct Attachment {
    buf: DmaBuf,
    len: usize,
    mapped: bool,
}

impl PlaneMemory for Attachment {
    fn size(&self) -> usize {
        self.len
    }

    fn vaddr(&self) -> Option<NonNull<u8>> {
        self.buf.vaddr()
    }
}

impl DmaBufAttachment for Attachment {
    fn map(&mut self) -> Result<()> {
        debug_assert!(!self.mapped, "attachment mapped twice");
        self.mapped = true;
        Ok(())
    }

    fn unmap(&mut self) {
        self.mapped = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_allocator_basic() {
        let allocator = HeapAllocator::new();

        let size = 1024 * 1024;
        let memory = allocator.alloc(size, DmaDirection::FromDevice).unwrap();
        assert_eq!(memory.size(), size);
        assert_eq!(allocator.allocated(), size);

        let ptr = memory.vaddr().unwrap().as_ptr();
        assert_eq!(ptr as usize % PAGE_SIZE, 0);

        // Zeroed, then writable
        unsafe {
            assert_eq!(*ptr, 0);
            std::ptr::write_bytes(ptr, 0xAB, size);
            assert_eq!(*ptr.add(size - 1), 0xAB);
        }

        drop(memory);
        assert_eq!(allocator.allocated(), 0);
    }

    #[test]
    fn test_heap_allocator_zero_size() {
        let allocator = HeapAllocator::new();
        assert!(allocator.alloc(0, DmaDirection::ToDevice).is_err());
    }

    #[test]
    fn test_heap_allocator_limit() {
        let allocator = HeapAllocator::with_limit(2 * PAGE_SIZE);

        let a = allocator.alloc(PAGE_SIZE, DmaDirection::ToDevice).unwrap();
        let _b = allocator.alloc(PAGE_SIZE, DmaDirection::ToDevice).unwrap();
        let err = allocator
            .alloc(PAGE_SIZE, DmaDirection::ToDevice)
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::OutOfMemory);

        drop(a);
        assert!(allocator.alloc(PAGE_SIZE, DmaDirection::ToDevice).is_ok());
    }

    #[test]
    fn test_heap_memory_users() {
        let allocator = HeapAllocator::new();
        let memory = allocator.alloc(PAGE_SIZE, DmaDirection::ToDevice).unwrap();
        assert_eq!(memory.num_users(), 1);

        let mapping = memory.mmap().unwrap();
        assert_eq!(memory.num_users(), 2);

        let exported = memory.export().unwrap();
        assert_eq!(memory.num_users(), 3);
        assert_eq!(exported.size(), PAGE_SIZE);

        drop(mapping);
        drop(exported);
        assert_eq!(memory.num_users(), 1);
    }

    #[test]
    fn test_mapping_outlives_memory() {
        let allocator = HeapAllocator::new();
        let memory = allocator.alloc(PAGE_SIZE, DmaDirection::ToDevice).unwrap();
        let mapping = memory.mmap().unwrap();
        drop(memory);

        // Region stays alive while mapped
        assert_eq!(allocator.allocated(), PAGE_SIZE);
        assert_eq!(mapping.len(), PAGE_SIZE);
        drop(mapping);
        assert_eq!(allocator.allocated(), 0);
    }

    #[test]
    fn test_userptr_importer() {
        let importer = UserPtrImporter::new();
        let mut backing = vec![0u8; 64];
        let addr = backing.as_mut_ptr() as usize;

        let memory = importer
            .get_userptr(addr, backing.len(), DmaDirection::FromDevice)
            .unwrap();
        assert_eq!(memory.size(), 64);
        assert_eq!(memory.vaddr().unwrap().as_ptr() as usize, addr);

        assert!(importer.get_userptr(0, 64, DmaDirection::ToDevice).is_err());
        assert!(importer.get_userptr(addr, 0, DmaDirection::ToDevice).is_err());
    }

    #[test]
    fn test_dmabuf_importer() {
        let allocator = HeapAllocator::new();
        let memory = allocator.alloc(PAGE_SIZE, DmaDirection::ToDevice).unwrap();
        let buf = memory.export().unwrap();

        let importer = DmaBufImporter::new();
        let mut attachment = importer
            .attach(&buf, PAGE_SIZE, DmaDirection::ToDevice)
            .unwrap();
        assert_eq!(attachment.size(), PAGE_SIZE);
        assert_eq!(attachment.vaddr(), memory.vaddr());
        attachment.map().unwrap();
        attachment.unmap();

        assert!(
            importer
                .attach(&buf, PAGE_SIZE + 1, DmaDirection::ToDevice)
                .is_err()
        );
    }
}
