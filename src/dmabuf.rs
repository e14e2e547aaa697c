//! Shared memory handles passed between queues and third parties.

use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

/// Memory that can be shared through a [`DmaBuf`].
pub trait SharedMemory: Send + Sync + fmt::Debug {
    /// Size of the memory in bytes.
    fn size(&self) -> usize;

    /// CPU address of the memory, if it has one.
    fn vaddr(&self) -> Option<NonNull<u8>> {
        None
    }
}

/// A reference-counted handle to memory owned by someone else.
///
/// Cloning the handle adds a user; two handles are the same buffer when
/// [`same_as`](Self::same_as) returns `true`.
#[derive(Clone)]
pub struct DmaBuf {
    memory: Arc<dyn SharedMemory>,
}

impl DmaBuf {
    /// Wraps shared memory in a handle.
    #[must_use]
    pub fn new(memory: Arc<dyn SharedMemory>) -> Self {
        Self { memory }
    }

    /// Size of the underlying memory in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        self.memory.size()
    }

    /// CPU address of the underlying memory, if any.
    #[must_use]
    pub fn vaddr(&self) -> Option<NonNull<u8>> {
        self.memory.vaddr()
    }

    /// Returns `true` if both handles refer to the same memory.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.memory, &other.memory)
    }

    /// Number of live references to the underlying memory.
    #[must_use]
    pub fn users(&self) -> usize {
        Arc::strong_count(&self.memory)
    }
}

impl fmt::Debug for DmaBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuf")
            .field("size", &self.size())
            .field("users", &self.users())
            .finish_non_exhaustive()
    }
}
