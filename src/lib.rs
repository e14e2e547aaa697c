//! # ruapc-bufqueue
//!
//! A streaming buffer queue that hands a fixed pool of buffers back and
//! forth between a caller and a consumer. This crate is part of the
//! [ruapc](https://github.com/SF-Zhou/ruapc) project.
//!
//! ## Features
//!
//! - **Ownership Tracking**: Every buffer is owned by exactly one party at a
//!   time: the caller, the queue, the consumer, or the completion list
//! - **Three Memory Models**: Queue-allocated ([`MemoryModel::Mmap`]),
//!   caller addresses ([`MemoryModel::UserPtr`]) and shared handles
//!   ([`MemoryModel::DmaBuf`]), with re-validation that skips unchanged planes
//! - **Layout Negotiation**: The consumer proposes or validates plane sizes
//!   through [`QueueOps::queue_setup`]
//! - **Deferred Requests**: Buffers can be bound to a [`RequestId`] and
//!   enqueued together on submit
//! - **Both Sync and Async APIs**: Blocking [`BufferQueue::dequeue`] and
//!   [`BufferQueue::async_dequeue`]
//! - **Instrumentation**: Pluggable [`Instrumentation`] sink with balance
//!   checking in [`OpCounters`]
//!
//! ## Example
//!
//! ```rust
//! use ruapc_bufqueue::{
//!     Buffer, BufferArgs, BufferQueueBuilder, BufferState, Completer, MemoryModel, QueueOps,
//!     QueueSetup, Result,
//! };
//!
//! struct Consumer {
//!     pending: Vec<usize>,
//! }
//!
//! impl QueueOps for Consumer {
//!     fn queue_setup(&mut self, setup: &mut QueueSetup) -> Result<()> {
//!         setup.set_planes(&[64 * 1024]);
//!         Ok(())
//!     }
//!
//!     fn buf_queue(&mut self, buffer: &Buffer, _completer: &Completer) {
//!         self.pending.push(buffer.index());
//!     }
//!
//!     fn stop_streaming(&mut self, completer: &Completer) {
//!         for index in self.pending.drain(..) {
//!             completer.buffer_done(index, BufferState::Error);
//!         }
//!     }
//! }
//!
//! # fn main() -> ruapc_bufqueue::Result<()> {
//! let queue = BufferQueueBuilder::new()
//!     .name("capture0")
//!     .build(Consumer { pending: Vec::new() })?;
//! let count = queue.request_buffers(MemoryModel::Mmap, 4)?;
//!
//! queue.stream_on()?;
//! for index in 0..count {
//!     queue.enqueue(index, &BufferArgs::mmap(1), None)?;
//! }
//!
//! // The consumer finishes a buffer, possibly from another thread
//! queue.completer().buffer_done_with(2, BufferState::Done, &[1500]);
//!
//! let info = queue.dequeue(true)?;
//! assert_eq!(info.index, 2);
//! assert_eq!(info.planes[0].bytes_used, 1500);
//!
//! queue.stream_off()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(unsafe_op_in_unsafe_fn)]

mod allocator;
mod buffer;
mod dmabuf;
mod done;
mod error;
mod instrument;
mod memory;
mod mmap;
mod ops;
mod prepare;
mod protocol;
mod queue;
mod request;
mod setup;
mod streaming;

#[cfg(test)]
mod testing;

pub use allocator::{DmaBufImporter, HeapAllocator, UserPtrImporter};
pub use buffer::{
    Buffer, BufferArgs, BufferInfo, BufferState, MAX_PLANES, Owner, Plane, PlaneArgs, PlaneInfo,
    PlaneLocation, PlaneSource,
};
pub use dmabuf::{DmaBuf, SharedMemory};
pub use done::Completer;
pub use error::{QueueError, Result};
pub use instrument::{Instrumentation, NoopInstrumentation, Op, OpCounters};
pub use memory::{
    DmaBufAttachment, DmaBufOps, DmaDirection, MemOps, MemoryModel, MmapMemory, MmapOps,
    PAGE_SIZE, PlaneMemory, UserPtrOps, page_align,
};
pub use mmap::PlaneMapping;
pub use ops::{QueueOps, QueueSetup};
pub use queue::{BufferQueue, BufferQueueBuilder, MAX_BUFFERS, Readiness};
pub use request::{RequestId, RequestState};
