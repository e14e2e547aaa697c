//! Buffer, plane and state types.
//!
//! A [`Buffer`] is one slot of the queue's pool. Its [`BufferState`] says who
//! owns it; everything else about it lives under the queue lock and is shown
//! read-only to consumer hooks.

use std::fmt;
use std::ptr::NonNull;

use crate::dmabuf::DmaBuf;
use crate::memory::{MemoryModel, PlaneMem};
use crate::request::RequestId;

/// Maximum number of planes per buffer.
pub const MAX_PLANES: usize = 8;

/// Lifecycle state of a buffer.
///
/// ```text
///            prepare            enqueue             dispatch
/// DEQUEUED ──────────> PREPARING ─┐ ┌──> QUEUED ──────────────> ACTIVE
///   ▲  │                          │ │      ▲                      │
///   │  └─ bind request ─> IN_REQUEST ┘      └──── requeue ─────────┤
///   │                                                             │ complete
///   └──────────────── dequeue ────────── DONE / ERROR <───────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    /// Owned by the caller.
    Dequeued,
    /// Owned by the caller, bound to a request that has not been submitted.
    InRequest,
    /// Owned by the caller, validation in progress.
    Preparing,
    /// Owned by the queue, waiting to be handed to the consumer.
    Queued,
    /// Owned by the consumer.
    Active,
    /// Finished, waiting to be dequeued.
    Done,
    /// Finished with an error, waiting to be dequeued.
    Error,
}

/// Party that owns a buffer in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    /// The control path using the queue.
    Caller,
    /// The queue's wait list.
    Queue,
    /// The processing path.
    Consumer,
    /// Nobody; visible to the caller on the completion list.
    Completed,
}

impl BufferState {
    /// Lowercase name of the state.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dequeued => "dequeued",
            Self::InRequest => "in request",
            Self::Preparing => "preparing",
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    /// Owner of a buffer in this state.
    #[must_use]
    pub const fn owner(self) -> Owner {
        match self {
            Self::Dequeued | Self::InRequest | Self::Preparing => Owner::Caller,
            Self::Queued => Owner::Queue,
            Self::Active => Owner::Consumer,
            Self::Done | Self::Error => Owner::Completed,
        }
    }

    /// Returns `true` if the buffer sits on the completion list.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// Returns `true` if the queue ever moves a buffer from `self` to `to`.
    ///
    /// Cancellation may move any state back to [`Dequeued`](Self::Dequeued).
    #[must_use]
    pub const fn is_valid_transition(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Dequeued | Self::InRequest, Self::Preparing)
                | (Self::Preparing, Self::Dequeued | Self::InRequest)
                | (Self::Dequeued, Self::InRequest)
                | (Self::Dequeued | Self::InRequest, Self::Queued)
                | (Self::Queued, Self::Active)
                | (Self::Active, Self::Done | Self::Error | Self::Queued)
                | (Self::Done, Self::Error)
                | (_, Self::Dequeued)
        )
    }
}

impl fmt::Display for BufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One contiguous memory region of a buffer.
#[derive(Debug)]
pub struct Plane {
    pub(crate) mem: Option<PlaneMem>,
    pub(crate) length: usize,
    pub(crate) min_length: usize,
    pub(crate) bytes_used: usize,
    pub(crate) data_offset: usize,
    pub(crate) mem_offset: u64,
    pub(crate) userptr: usize,
}

impl Plane {
    pub(crate) const fn new(size: usize) -> Self {
        Self {
            mem: None,
            length: size,
            min_length: size,
            bytes_used: 0,
            data_offset: 0,
            mem_offset: 0,
            userptr: 0,
        }
    }

    /// Length of the bound memory in bytes.
    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    /// Minimum length negotiated for this plane.
    #[must_use]
    pub const fn min_length(&self) -> usize {
        self.min_length
    }

    /// Bytes of payload in the plane.
    #[must_use]
    pub const fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Offset of the payload from the start of the plane.
    #[must_use]
    pub const fn data_offset(&self) -> usize {
        self.data_offset
    }

    /// Returns `true` if memory is bound to the plane.
    #[must_use]
    pub const fn has_memory(&self) -> bool {
        self.mem.is_some()
    }

    /// CPU address of the plane memory, if bound and addressable.
    #[must_use]
    pub fn vaddr(&self) -> Option<NonNull<u8>> {
        self.mem.as_ref().and_then(PlaneMem::vaddr)
    }

    /// Where the caller finds this plane.
    #[must_use]
    pub fn location(&self) -> PlaneLocation {
        match &self.mem {
            Some(PlaneMem::Mmap(_)) => PlaneLocation::Offset(self.mem_offset),
            Some(PlaneMem::UserPtr(_)) => PlaneLocation::UserPtr(self.userptr),
            Some(PlaneMem::DmaBuf { buf, .. }) => PlaneLocation::DmaBuf(buf.clone()),
            None => PlaneLocation::Unbound,
        }
    }

    /// Drops bound memory and forgets the caller supplied binding.
    pub(crate) fn clear(&mut self) {
        self.mem = None;
        self.bytes_used = 0;
        self.length = 0;
        self.userptr = 0;
        self.data_offset = 0;
    }
}

/// Caller visible location of a plane.
#[derive(Debug, Clone)]
pub enum PlaneLocation {
    /// No memory bound.
    Unbound,
    /// Mmap offset cookie.
    Offset(u64),
    /// Caller address.
    UserPtr(usize),
    /// Shared handle.
    DmaBuf(DmaBuf),
}

impl PartialEq for PlaneLocation {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unbound, Self::Unbound) => true,
            (Self::Offset(a), Self::Offset(b)) => a == b,
            (Self::UserPtr(a), Self::UserPtr(b)) => a == b,
            (Self::DmaBuf(a), Self::DmaBuf(b)) => a.same_as(b),
            _ => false,
        }
    }
}

/// One slot of the queue's pool.
#[derive(Debug)]
pub struct Buffer {
    pub(crate) index: usize,
    pub(crate) memory: MemoryModel,
    pub(crate) planes: Vec<Plane>,
    pub(crate) prepared: bool,
    pub(crate) synced: bool,
    pub(crate) need_cache_sync: bool,
    pub(crate) pending: Option<BufferArgs>,
}

impl Buffer {
    pub(crate) fn new(index: usize, memory: MemoryModel, sizes: &[usize]) -> Self {
        Self {
            index,
            memory,
            planes: sizes.iter().map(|&size| Plane::new(size)).collect(),
            prepared: false,
            synced: false,
            // The owner of a shared handle keeps it coherent.
            need_cache_sync: memory != MemoryModel::DmaBuf,
            pending: None,
        }
    }

    /// Index of the buffer in the pool.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Memory model the buffer was allocated for.
    #[must_use]
    pub const fn memory(&self) -> MemoryModel {
        self.memory
    }

    /// Number of planes.
    #[must_use]
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// All planes of the buffer.
    #[must_use]
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Plane `plane`, if it exists.
    #[must_use]
    pub fn plane(&self, plane: usize) -> Option<&Plane> {
        self.planes.get(plane)
    }

    /// Returns `true` once validation ran for the current submission.
    #[must_use]
    pub const fn is_prepared(&self) -> bool {
        self.prepared
    }

    /// Caller arguments describing the current binding.
    pub(crate) fn current_args(&self) -> BufferArgs {
        let planes = self
            .planes
            .iter()
            .map(|p| PlaneArgs {
                source: match &p.mem {
                    Some(PlaneMem::DmaBuf { buf, .. }) => PlaneSource::DmaBuf(buf.clone()),
                    _ if self.memory == MemoryModel::UserPtr => PlaneSource::UserPtr(p.userptr),
                    _ => PlaneSource::Mmap,
                },
                length: p.length,
                bytes_used: p.bytes_used,
                data_offset: p.data_offset,
            })
            .collect();
        BufferArgs { planes }
    }

    /// Builds a caller descriptor.
    pub(crate) fn info(&self, state: BufferState, request: Option<RequestId>) -> BufferInfo {
        BufferInfo {
            index: self.index,
            state,
            memory: self.memory,
            prepared: self.prepared,
            request,
            planes: self
                .planes
                .iter()
                .map(|p| PlaneInfo {
                    length: p.length,
                    bytes_used: p.bytes_used,
                    data_offset: p.data_offset,
                    location: p.location(),
                })
                .collect(),
        }
    }
}

/// Where a caller supplied plane comes from.
#[derive(Debug, Clone)]
pub enum PlaneSource {
    /// Queue-owned memory; nothing to bind.
    Mmap,
    /// Caller address.
    UserPtr(usize),
    /// Shared handle.
    DmaBuf(DmaBuf),
}

/// Caller arguments for one plane.
#[derive(Debug, Clone)]
pub struct PlaneArgs {
    /// Memory to bind.
    pub source: PlaneSource,
    /// Length of the memory. Zero for a [`PlaneSource::DmaBuf`] means the
    /// whole handle.
    pub length: usize,
    /// Payload size (output queues).
    pub bytes_used: usize,
    /// Payload offset (output queues).
    pub data_offset: usize,
}

impl PlaneArgs {
    /// Arguments binding `source` with `length` bytes.
    #[must_use]
    pub const fn new(source: PlaneSource, length: usize) -> Self {
        Self {
            source,
            length,
            bytes_used: 0,
            data_offset: 0,
        }
    }
}

/// Caller arguments for prepare and enqueue.
#[derive(Debug, Clone, Default)]
pub struct BufferArgs {
    /// One entry per plane.
    pub planes: Vec<PlaneArgs>,
}

impl BufferArgs {
    /// Arguments for a queue-owned buffer with `num_planes` planes.
    #[must_use]
    pub fn mmap(num_planes: usize) -> Self {
        Self {
            planes: (0..num_planes)
                .map(|_| PlaneArgs::new(PlaneSource::Mmap, 0))
                .collect(),
        }
    }

    /// Arguments binding caller regions given as `(address, length)`.
    #[must_use]
    pub fn userptr(regions: &[(usize, usize)]) -> Self {
        Self {
            planes: regions
                .iter()
                .map(|&(addr, len)| PlaneArgs::new(PlaneSource::UserPtr(addr), len))
                .collect(),
        }
    }

    /// Arguments binding shared handles given as `(handle, length)`.
    #[must_use]
    pub fn dmabuf(handles: Vec<(DmaBuf, usize)>) -> Self {
        Self {
            planes: handles
                .into_iter()
                .map(|(buf, len)| PlaneArgs::new(PlaneSource::DmaBuf(buf), len))
                .collect(),
        }
    }

    /// Sets the payload size of `plane`.
    ///
    /// # Panics
    ///
    /// Panics if `plane` is out of range.
    #[must_use]
    pub fn with_bytes_used(mut self, plane: usize, bytes_used: usize) -> Self {
        self.planes[plane].bytes_used = bytes_used;
        self
    }

    /// Sets the payload offset of `plane`.
    ///
    /// # Panics
    ///
    /// Panics if `plane` is out of range.
    #[must_use]
    pub fn with_data_offset(mut self, plane: usize, data_offset: usize) -> Self {
        self.planes[plane].data_offset = data_offset;
        self
    }
}

/// Caller descriptor of a plane.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaneInfo {
    /// Length of the bound memory.
    pub length: usize,
    /// Payload size.
    pub bytes_used: usize,
    /// Payload offset.
    pub data_offset: usize,
    /// Where the caller finds the plane.
    pub location: PlaneLocation,
}

/// Caller descriptor of a buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferInfo {
    /// Index in the pool.
    pub index: usize,
    /// State at the time of the snapshot.
    pub state: BufferState,
    /// Memory model.
    pub memory: MemoryModel,
    /// Whether validation already ran.
    pub prepared: bool,
    /// Associated request.
    pub request: Option<RequestId>,
    /// Plane descriptors.
    pub planes: Vec<PlaneInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_owner() {
        assert_eq!(BufferState::Dequeued.owner(), Owner::Caller);
        assert_eq!(BufferState::InRequest.owner(), Owner::Caller);
        assert_eq!(BufferState::Preparing.owner(), Owner::Caller);
        assert_eq!(BufferState::Queued.owner(), Owner::Queue);
        assert_eq!(BufferState::Active.owner(), Owner::Consumer);
        assert_eq!(BufferState::Done.owner(), Owner::Completed);
        assert_eq!(BufferState::Error.owner(), Owner::Completed);
    }

    #[test]
    fn test_valid_transitions() {
        use BufferState::*;

        assert!(Dequeued.is_valid_transition(Queued));
        assert!(Queued.is_valid_transition(Active));
        assert!(Active.is_valid_transition(Done));
        assert!(Active.is_valid_transition(Queued));
        assert!(Done.is_valid_transition(Dequeued));
        assert!(Active.is_valid_transition(Dequeued));

        assert!(!Dequeued.is_valid_transition(Active));
        assert!(!Queued.is_valid_transition(Done));
        assert!(!Done.is_valid_transition(Queued));
        assert!(!Preparing.is_valid_transition(Queued));
    }

    #[test]
    fn test_new_buffer() {
        let buffer = Buffer::new(2, MemoryModel::UserPtr, &[100, 50]);
        assert_eq!(buffer.index(), 2);
        assert_eq!(buffer.num_planes(), 2);
        assert_eq!(buffer.plane(1).unwrap().min_length(), 50);
        assert!(buffer.need_cache_sync);
        assert!(!buffer.planes()[0].has_memory());
        assert_eq!(buffer.planes()[0].location(), PlaneLocation::Unbound);

        let buffer = Buffer::new(0, MemoryModel::DmaBuf, &[100]);
        assert!(!buffer.need_cache_sync);
    }

    #[test]
    fn test_buffer_args() {
        let args = BufferArgs::userptr(&[(0x1000, 64), (0x2000, 32)])
            .with_bytes_used(0, 10)
            .with_data_offset(1, 4);
        assert_eq!(args.planes.len(), 2);
        assert_eq!(args.planes[0].bytes_used, 10);
        assert_eq!(args.planes[1].data_offset, 4);
        assert!(matches!(args.planes[1].source, PlaneSource::UserPtr(0x2000)));

        let args = BufferArgs::mmap(3);
        assert_eq!(args.planes.len(), 3);
    }

    #[test]
    fn test_info_snapshot() {
        let buffer = Buffer::new(1, MemoryModel::Mmap, &[4096]);
        let info = buffer.info(BufferState::Queued, None);
        assert_eq!(info.index, 1);
        assert_eq!(info.state, BufferState::Queued);
        assert_eq!(info.planes[0].length, 4096);
        assert!(!info.prepared);
    }
}
