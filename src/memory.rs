//! Memory provenance adapters.
//!
//! A queue can hold buffers whose memory comes from three places:
//!
//! - [`MemoryModel::Mmap`]: allocated by the queue through [`MmapOps`] and
//!   exposed to callers by mapping or exporting it.
//! - [`MemoryModel::UserPtr`]: owned by the caller and wrapped through
//!   [`UserPtrOps`] every time the address or length changes.
//! - [`MemoryModel::DmaBuf`]: owned by a third party and shared through a
//!   [`DmaBuf`] handle, attached through [`DmaBufOps`].
//!
//! Each model is a separate capability set. A queue supports a model exactly
//! when the matching trait object is present in its [`MemOps`]; there are no
//! half-implemented sets. Releasing memory is dropping the handle.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::dmabuf::DmaBuf;
use crate::error::{QueueError, Result};
use crate::mmap::PlaneMapping;

/// Page size used for mmap offsets and allocation rounding.
pub const PAGE_SIZE: usize = 4096;

/// Rounds `size` up to a multiple of [`PAGE_SIZE`], or `None` on overflow.
#[must_use]
pub const fn page_align(size: usize) -> Option<usize> {
    match size.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

/// Who owns the memory backing a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryModel {
    /// Allocated and owned by the queue.
    Mmap,
    /// Owned by the caller, passed as an address and length.
    UserPtr,
    /// Owned by a third party, passed as a shared handle.
    DmaBuf,
}

impl fmt::Display for MemoryModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mmap => "mmap",
            Self::UserPtr => "userptr",
            Self::DmaBuf => "dmabuf",
        })
    }
}

/// Direction of data flow between the consumer and memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Caller fills buffers, consumer reads them (output queues).
    ToDevice,
    /// Consumer fills buffers, caller reads them (capture queues).
    FromDevice,
    /// Both sides read and write.
    Bidirectional,
}

/// Memory held by one plane.
///
/// Implementations own whatever the adapter acquired; dropping the value
/// releases it.
pub trait PlaneMemory: Send + Sync + fmt::Debug {
    /// Size of the memory in bytes.
    fn size(&self) -> usize;

    /// Makes CPU writes visible to the consumer. Called before the consumer
    /// takes ownership.
    fn prepare(&self) {}

    /// Makes consumer writes visible to the CPU. Called when ownership
    /// returns to the caller.
    fn finish(&self) {}

    /// Number of parties referencing this memory, the queue included.
    ///
    /// Zero means the adapter does not track users.
    fn num_users(&self) -> usize {
        0
    }

    /// CPU address of the memory, if it has one.
    fn vaddr(&self) -> Option<NonNull<u8>> {
        None
    }
}

/// Memory allocated by the queue itself.
pub trait MmapMemory: PlaneMemory {
    /// Maps the memory for the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the memory cannot be mapped.
    fn mmap(&self) -> Result<PlaneMapping>;

    /// Exports the memory as a shared handle.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Unsupported`] unless the adapter can export.
    fn export(&self) -> Result<DmaBuf> {
        Err(QueueError::Unsupported("buffer export"))
    }
}

/// A [`DmaBuf`] attached for use by the consumer.
pub trait DmaBufAttachment: PlaneMemory {
    /// Pins the attachment for device access.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be mapped.
    fn map(&mut self) -> Result<()>;

    /// Releases the pin taken by [`map`](Self::map).
    fn unmap(&mut self);
}

/// Capability set for queue-allocated memory.
pub trait MmapOps: Send + Sync {
    /// Allocates `size` bytes for one plane.
    ///
    /// # Errors
    ///
    /// Returns an error if memory cannot be allocated.
    fn alloc(&self, size: usize, dir: DmaDirection) -> Result<Arc<dyn MmapMemory>>;
}

/// Capability set for caller-owned memory.
pub trait UserPtrOps: Send + Sync {
    /// Wraps `len` bytes at `addr` for use by the consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the region is not usable.
    fn get_userptr(&self, addr: usize, len: usize, dir: DmaDirection)
    -> Result<Box<dyn PlaneMemory>>;
}

/// Capability set for third-party shared memory.
pub trait DmaBufOps: Send + Sync {
    /// Attaches `len` bytes of `buf` for use by the consumer.
    ///
    /// # Errors
    ///
    /// Returns an error if the handle cannot be attached.
    fn attach(&self, buf: &DmaBuf, len: usize, dir: DmaDirection)
    -> Result<Box<dyn DmaBufAttachment>>;
}

/// The memory capability sets available to a queue.
#[derive(Clone, Default)]
pub struct MemOps {
    pub(crate) mmap: Option<Arc<dyn MmapOps>>,
    pub(crate) userptr: Option<Arc<dyn UserPtrOps>>,
    pub(crate) dmabuf: Option<Arc<dyn DmaBufOps>>,
}

impl MemOps {
    /// Creates an empty set. At least one model must be added before use.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables [`MemoryModel::Mmap`].
    #[must_use]
    pub fn with_mmap(mut self, ops: Arc<dyn MmapOps>) -> Self {
        self.mmap = Some(ops);
        self
    }

    /// Enables [`MemoryModel::UserPtr`].
    #[must_use]
    pub fn with_userptr(mut self, ops: Arc<dyn UserPtrOps>) -> Self {
        self.userptr = Some(ops);
        self
    }

    /// Enables [`MemoryModel::DmaBuf`].
    #[must_use]
    pub fn with_dmabuf(mut self, ops: Arc<dyn DmaBufOps>) -> Self {
        self.dmabuf = Some(ops);
        self
    }

    /// Returns `true` if the model's capability set is present.
    #[must_use]
    pub fn supports(&self, model: MemoryModel) -> bool {
        match model {
            MemoryModel::Mmap => self.mmap.is_some(),
            MemoryModel::UserPtr => self.userptr.is_some(),
            MemoryModel::DmaBuf => self.dmabuf.is_some(),
        }
    }

    /// Returns `true` if no model is supported.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_none() && self.userptr.is_none() && self.dmabuf.is_none()
    }
}

impl fmt::Debug for MemOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemOps")
            .field("mmap", &self.mmap.is_some())
            .field("userptr", &self.userptr.is_some())
            .field("dmabuf", &self.dmabuf.is_some())
            .finish()
    }
}

/// Memory currently bound to a plane, tagged by provenance.
#[derive(Debug)]
pub(crate) enum PlaneMem {
    Mmap(Arc<dyn MmapMemory>),
    UserPtr(Box<dyn PlaneMemory>),
    DmaBuf {
        attachment: Box<dyn DmaBufAttachment>,
        buf: DmaBuf,
        mapped: bool,
    },
}

impl PlaneMem {
    pub(crate) fn prepare(&self) {
        match self {
            Self::Mmap(m) => m.prepare(),
            Self::UserPtr(m) => m.prepare(),
            Self::DmaBuf { attachment, .. } => attachment.prepare(),
        }
    }

    pub(crate) fn finish(&self) {
        match self {
            Self::Mmap(m) => m.finish(),
            Self::UserPtr(m) => m.finish(),
            Self::DmaBuf { attachment, .. } => attachment.finish(),
        }
    }

    pub(crate) fn num_users(&self) -> usize {
        match self {
            Self::Mmap(m) => m.num_users(),
            Self::UserPtr(m) => m.num_users(),
            Self::DmaBuf { attachment, .. } => attachment.num_users(),
        }
    }

    pub(crate) fn vaddr(&self) -> Option<NonNull<u8>> {
        match self {
            Self::Mmap(m) => m.vaddr(),
            Self::UserPtr(m) => m.vaddr(),
            Self::DmaBuf { attachment, .. } => attachment.vaddr(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{DmaBufImporter, HeapAllocator, UserPtrImporter};

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0), Some(0));
        assert_eq!(page_align(1), Some(PAGE_SIZE));
        assert_eq!(page_align(PAGE_SIZE), Some(PAGE_SIZE));
        assert_eq!(page_align(PAGE_SIZE + 1), Some(2 * PAGE_SIZE));
        assert_eq!(page_align(usize::MAX), None);
    }

    #[test]
    fn test_mem_ops_supports() {
        let ops = MemOps::new();
        assert!(ops.is_empty());

        let ops = ops.with_mmap(Arc::new(HeapAllocator::new()));
        assert!(ops.supports(MemoryModel::Mmap));
        assert!(!ops.supports(MemoryModel::UserPtr));

        let ops = ops
            .with_userptr(Arc::new(UserPtrImporter::new()))
            .with_dmabuf(Arc::new(DmaBufImporter::new()));
        assert!(ops.supports(MemoryModel::UserPtr));
        assert!(ops.supports(MemoryModel::DmaBuf));
        assert!(format!("{ops:?}").contains("dmabuf: true"));
    }

    #[test]
    fn test_memory_model_display() {
        assert_eq!(MemoryModel::Mmap.to_string(), "mmap");
        assert_eq!(MemoryModel::UserPtr.to_string(), "userptr");
        assert_eq!(MemoryModel::DmaBuf.to_string(), "dmabuf");
    }
}
