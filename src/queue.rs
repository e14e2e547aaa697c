//! Buffer queue handle and its builder.
//!
//! This module provides the [`BufferQueue`] and [`BufferQueueBuilder`] types.
//! The queue logic itself is split by concern: pool allocation in
//! `setup`, buffer validation in `prepare`, the enqueue/dequeue protocol in
//! `protocol` and stream control in `streaming`.
//!
//! # Locking
//!
//! Three locks are involved, always taken in this order:
//!
//! 1. the queue lock (`tokio::sync::Mutex<QueueInner>`), held across
//!    nearly every operation and released only while a dequeue waits;
//! 2. the pool-resize lock inside [`MmapTable`], held while buffers are
//!    created or destroyed and while a plane is mapped;
//! 3. the completion lock inside [`DoneQueue`], held only for short state
//!    updates. The consumer's [`Completer`] takes nothing else.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::allocator::HeapAllocator;
use crate::buffer::{Buffer, BufferArgs, BufferInfo, BufferState};
use crate::dmabuf::DmaBuf;
use crate::done::{Completer, DoneQueue};
use crate::error::{QueueError, Result};
use crate::instrument::{Instrumentation, NoopInstrumentation, Op};
use crate::memory::{DmaDirection, MemOps, MemoryModel, PlaneMem};
use crate::mmap::{MmapTable, PlaneMapping};
use crate::ops::QueueOps;
use crate::request::{RequestId, RequestState};

/// Fixed maximum number of buffers in a pool.
pub const MAX_BUFFERS: usize = 64;

/// Builder for creating a [`BufferQueue`] with custom configuration.
///
/// # Example
///
/// ```rust
/// use ruapc_bufqueue::{BufferQueueBuilder, MemOps, UserPtrImporter};
/// use std::sync::Arc;
///
/// let builder = BufferQueueBuilder::new()
///     .name("capture0")
///     .min_buffers(2)
///     .mem_ops(MemOps::new().with_userptr(Arc::new(UserPtrImporter::new())));
/// ```
pub struct BufferQueueBuilder {
    name: String,
    output: bool,
    bidirectional: bool,
    min_buffers: usize,
    max_buffers: usize,
    supports_requests: bool,
    requires_requests: bool,
    mem_ops: MemOps,
    instrumentation: Arc<dyn Instrumentation>,
}

impl Default for BufferQueueBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferQueueBuilder {
    /// Creates a new builder with default settings.
    ///
    /// Default settings:
    /// - Direction: capture
    /// - Minimum buffers: 0
    /// - Maximum buffers: [`MAX_BUFFERS`]
    /// - Requests: unsupported
    /// - Memory: [`MemoryModel::Mmap`] through [`HeapAllocator`]
    /// - Instrumentation: [`NoopInstrumentation`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: "bufqueue".to_string(),
            output: false,
            bidirectional: false,
            min_buffers: 0,
            max_buffers: MAX_BUFFERS,
            supports_requests: false,
            requires_requests: false,
            mem_ops: MemOps::new().with_mmap(Arc::new(HeapAllocator::new())),
            instrumentation: Arc::new(NoopInstrumentation),
        }
    }

    /// Sets the name used in log events.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Makes this an output queue: the caller fills buffers and the
    /// consumer reads them.
    #[must_use]
    pub const fn output(mut self, output: bool) -> Self {
        self.output = output;
        self
    }

    /// Maps memory for access in both directions.
    #[must_use]
    pub const fn bidirectional(mut self, bidirectional: bool) -> Self {
        self.bidirectional = bidirectional;
        self
    }

    /// Sets how many buffers must be queued before the consumer starts.
    #[must_use]
    pub const fn min_buffers(mut self, min_buffers: usize) -> Self {
        self.min_buffers = min_buffers;
        self
    }

    /// Sets the pool size limit. Values above [`MAX_BUFFERS`] are clamped.
    #[must_use]
    pub const fn max_buffers(mut self, max_buffers: usize) -> Self {
        self.max_buffers = if max_buffers > MAX_BUFFERS {
            MAX_BUFFERS
        } else {
            max_buffers
        };
        self
    }

    /// Allows buffers to be enqueued through deferred requests.
    #[must_use]
    pub const fn supports_requests(mut self, supports: bool) -> Self {
        self.supports_requests = supports;
        self
    }

    /// Only accepts buffers through deferred requests.
    #[must_use]
    pub const fn requires_requests(mut self, requires: bool) -> Self {
        self.requires_requests = requires;
        self
    }

    /// Sets the memory capability sets.
    #[must_use]
    pub fn mem_ops(mut self, mem_ops: MemOps) -> Self {
        self.mem_ops = mem_ops;
        self
    }

    /// Sets the instrumentation sink.
    #[must_use]
    pub fn instrumentation(mut self, instrumentation: Arc<dyn Instrumentation>) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Builds the queue around the consumer's hooks.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidArgument`] if no memory model is
    /// enabled, if requests are required but not supported, or if the
    /// minimum exceeds the maximum buffer count.
    pub fn build(self, ops: impl QueueOps + 'static) -> Result<BufferQueue> {
        if self.mem_ops.is_empty() {
            return Err(QueueError::InvalidArgument(
                "at least one memory model must be enabled".into(),
            ));
        }
        if self.requires_requests && !self.supports_requests {
            return Err(QueueError::InvalidArgument(
                "requests required but not supported".into(),
            ));
        }
        if self.min_buffers > self.max_buffers {
            return Err(QueueError::InvalidArgument(format!(
                "min_buffers {} exceeds max_buffers {}",
                self.min_buffers, self.max_buffers
            )));
        }

        let dma_dir = if self.bidirectional {
            DmaDirection::Bidirectional
        } else if self.output {
            DmaDirection::ToDevice
        } else {
            DmaDirection::FromDevice
        };

        let name: Arc<str> = self.name.into();
        let done = Arc::new(DoneQueue::new(Arc::clone(&name), self.instrumentation));
        let mmap = Arc::new(MmapTable::default());

        let inner = QueueInner {
            name,
            is_output: self.output,
            dma_dir,
            min_buffers: self.min_buffers,
            max_buffers: self.max_buffers,
            supports_requests: self.supports_requests,
            requires_requests: self.requires_requests,
            mem_ops: self.mem_ops,
            ops: Box::new(ops),
            memory: None,
            bufs: Vec::new(),
            queued_list: VecDeque::new(),
            start_streaming_called: false,
            uses_qbuf: false,
            uses_requests: false,
            completer: Completer::new(Arc::clone(&done)),
            done: Arc::clone(&done),
            mmap: Arc::clone(&mmap),
        };

        Ok(BufferQueue {
            inner: Arc::new(Mutex::new(inner)),
            done,
            mmap,
        })
    }
}

/// Readiness reported by [`BufferQueue::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A buffer can be dequeued without blocking.
    Ready,
    /// Streaming, but nothing completed yet.
    Pending,
    /// Nothing to wait for: not streaming or the queue errored.
    Error,
}

/// A streaming buffer queue shared between a caller and a consumer.
///
/// The caller drives the pool through this handle; the consumer plugs in
/// through [`QueueOps`] and reports completions through a [`Completer`].
///
/// # Thread Safety
///
/// The queue uses `tokio::sync::Mutex`, so every blocking method must be
/// called outside an async runtime (or through `spawn_blocking`). Async
/// callers use [`async_dequeue`](Self::async_dequeue).
///
/// # Example
///
/// ```rust
/// use ruapc_bufqueue::{
///     Buffer, BufferArgs, BufferQueueBuilder, BufferState, Completer, MemoryModel, QueueOps,
///     QueueSetup, Result,
/// };
///
/// struct Loopback;
///
/// impl QueueOps for Loopback {
///     fn queue_setup(&mut self, setup: &mut QueueSetup) -> Result<()> {
///         setup.set_planes(&[4096]);
///         Ok(())
///     }
///
///     fn buf_queue(&mut self, buffer: &Buffer, completer: &Completer) {
///         completer.buffer_done(buffer.index(), BufferState::Done);
///     }
/// }
///
/// # fn main() -> ruapc_bufqueue::Result<()> {
/// let queue = BufferQueueBuilder::new().build(Loopback)?;
/// let count = queue.request_buffers(MemoryModel::Mmap, 2)?;
/// assert_eq!(count, 2);
///
/// queue.stream_on()?;
/// queue.enqueue(0, &BufferArgs::mmap(1), None)?;
/// let info = queue.dequeue(true)?;
/// assert_eq!(info.index, 0);
/// assert_eq!(info.state, BufferState::Done);
/// queue.stream_off()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BufferQueue {
    pub(crate) inner: Arc<Mutex<QueueInner>>,
    pub(crate) done: Arc<DoneQueue>,
    mmap: Arc<MmapTable>,
}

impl std::fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueue")
            .field("name", &self.done.name)
            .field("streaming", &self.done.is_streaming())
            .field("owned", &self.done.owned())
            .finish_non_exhaustive()
    }
}

impl BufferQueue {
    /// Frees the pool and allocates `count` buffers for `memory`.
    ///
    /// `count` is clamped to the configured minimum and maximum. The
    /// consumer may lower it further during negotiation. A `count` of zero
    /// only frees the pool, without asking the consumer. Returns the number
    /// of buffers allocated.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Busy`] if streaming, if a dequeue is waiting, or if
    ///   mmap buffers are still mapped or exported
    /// - [`QueueError::TryAgain`] if a buffer is being prepared
    /// - [`QueueError::OutOfMemory`] if fewer than the minimum could be
    ///   allocated
    /// - the consumer's error from layout negotiation
    pub fn request_buffers(&self, memory: MemoryModel, count: usize) -> Result<usize> {
        self.inner.blocking_lock().request_buffers(memory, count)
    }

    /// Adds up to `count` buffers with the given plane sizes.
    ///
    /// An empty `sizes` lets the consumer pick the layout. Returns the
    /// number of buffers added.
    ///
    /// # Errors
    ///
    /// - [`QueueError::NoBufferSlots`] if the pool is full
    /// - [`QueueError::MemoryMismatch`] if the pool uses another model
    /// - [`QueueError::OutOfMemory`] if nothing could be allocated
    pub fn create_buffers(
        &self,
        memory: MemoryModel,
        count: usize,
        sizes: &[usize],
    ) -> Result<usize> {
        self.inner
            .blocking_lock()
            .create_buffers(memory, count, sizes)
    }

    /// Number of buffers in the pool.
    #[must_use]
    pub fn num_buffers(&self) -> usize {
        self.inner.blocking_lock().bufs.len()
    }

    /// Memory model of the pool, or `None` while it is empty.
    #[must_use]
    pub fn memory(&self) -> Option<MemoryModel> {
        self.inner.blocking_lock().memory
    }

    /// Returns a descriptor of buffer `index`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::IndexOutOfRange`] for an unknown index.
    pub fn query_buffer(&self, index: usize) -> Result<BufferInfo> {
        let inner = self.inner.blocking_lock();
        inner.check_index(index)?;
        Ok(inner.info(index))
    }

    /// Validates a dequeued buffer ahead of enqueueing it.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidState`] unless the buffer is dequeued and not
    ///   yet prepared
    /// - [`QueueError::QueueErrored`] if the queue latched an error
    /// - adapter or consumer errors; the buffer keeps its state
    pub fn prepare_buffer(&self, index: usize, args: &BufferArgs) -> Result<BufferInfo> {
        self.inner.blocking_lock().prepare_buffer(index, args)
    }

    /// Hands buffer `index` to the queue, or binds it to `request`.
    ///
    /// # Errors
    ///
    /// - [`QueueError::QueueErrored`] if the queue latched an error
    /// - [`QueueError::InvalidState`] if the buffer is not owned by the caller
    /// - [`QueueError::RequestRequired`] or [`QueueError::WrongMode`] on
    ///   request policy violations
    /// - prepare errors, or the consumer's error if streaming fails to start
    pub fn enqueue(
        &self,
        index: usize,
        args: &BufferArgs,
        request: Option<RequestId>,
    ) -> Result<BufferInfo> {
        self.inner.blocking_lock().enqueue(index, args, request)
    }

    /// Takes the oldest completed buffer back.
    ///
    /// Blocks until a buffer completes unless `nonblocking` is set. While
    /// blocked the queue lock is released, so other operations (such as
    /// [`stream_off`](Self::stream_off)) proceed.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Busy`] if another dequeue is already waiting
    /// - [`QueueError::StreamingOff`] if the queue is not streaming
    /// - [`QueueError::QueueErrored`] if the queue latched an error
    /// - [`QueueError::WouldBlock`] if `nonblocking` and nothing completed
    /// - [`QueueError::Interrupted`] if [`interrupt`](Self::interrupt) was called
    pub fn dequeue(&self, nonblocking: bool) -> Result<BufferInfo> {
        let mut inner = self.inner.blocking_lock();
        loop {
            if inner.ready_to_dequeue(nonblocking)? {
                return inner.dequeue_done();
            }

            let _wait = self.done.begin_wait()?;
            inner.ops.wait_prepare();
            inner.record(Op::WaitPrepare, None);
            tracing::trace!(queue = &*inner.name, "will sleep waiting for buffers");
            drop(inner);

            self.done.wait_for_done();

            inner = self.inner.blocking_lock();
            inner.ops.wait_finish();
            inner.record(Op::WaitFinish, None);
            if self.done.take_interrupt() {
                tracing::debug!(queue = &*inner.name, "sleep was interrupted");
                return Err(QueueError::Interrupted);
            }
        }
    }

    /// Async version of [`dequeue`](Self::dequeue).
    ///
    /// The queue lock is not held while waiting, and the consumer's
    /// wait hooks are not called.
    ///
    /// # Errors
    ///
    /// Same as [`dequeue`](Self::dequeue).
    pub async fn async_dequeue(&self, nonblocking: bool) -> Result<BufferInfo> {
        loop {
            let _wait = {
                let mut inner = self.inner.lock().await;
                if inner.ready_to_dequeue(nonblocking)? {
                    return inner.dequeue_done();
                }
                self.done.begin_wait()?
            };

            self.done.wait_for_done_async().await;
            if self.done.take_interrupt() {
                return Err(QueueError::Interrupted);
            }
        }
    }

    /// Starts streaming.
    ///
    /// The consumer is started once the minimum number of buffers is
    /// queued, now or at a later enqueue.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidArgument`] if too few buffers are allocated
    /// - the consumer's error if it refuses to start
    pub fn stream_on(&self) -> Result<()> {
        self.inner.blocking_lock().stream_on()
    }

    /// Stops streaming and returns every buffer to the caller.
    ///
    /// Also clears a latched error.
    ///
    /// # Errors
    ///
    /// Never fails today; the result is kept for API symmetry.
    pub fn stream_off(&self) -> Result<()> {
        self.inner.blocking_lock().stream_off();
        Ok(())
    }

    /// Returns `true` while streaming.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.done.is_streaming()
    }

    /// Exports a plane of an mmap buffer as a shared handle.
    ///
    /// # Errors
    ///
    /// - [`QueueError::InvalidArgument`] unless the pool uses mmap memory
    ///   or if `plane` is out of range
    /// - [`QueueError::IndexOutOfRange`] for an unknown buffer
    /// - [`QueueError::Unsupported`] if the allocator cannot export
    pub fn export(&self, index: usize, plane: usize) -> Result<DmaBuf> {
        self.inner.blocking_lock().export(index, plane)
    }

    /// Maps the mmap plane registered at `offset`.
    ///
    /// Only takes the pool-resize lock, never the queue lock.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidArgument`] if the pool does not use mmap
    /// memory, if no plane sits at `offset`, or if `len` exceeds the plane.
    pub fn mmap(&self, offset: u64, len: usize) -> Result<PlaneMapping> {
        let (index, plane, mapping) = self.mmap.map(offset, len).inspect_err(|e| {
            tracing::debug!(queue = &*self.done.name, offset, "mmap failed: {e}");
        })?;
        tracing::trace!(queue = &*self.done.name, index, plane, "buffer plane mapped");
        Ok(mapping)
    }

    /// Returns `true` if any plane is referenced outside the pool.
    #[must_use]
    pub fn buffers_in_use(&self) -> bool {
        self.inner.blocking_lock().buffers_in_use()
    }

    /// Stops streaming and frees the pool even if buffers are still mapped.
    ///
    /// This is the error-recovery path; outside references keep their
    /// memory alive.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::TryAgain`] if a buffer is being prepared.
    pub fn reset(&self) -> Result<()> {
        self.inner.blocking_lock().reset()
    }

    /// Tears the queue down: stops streaming and frees every buffer.
    pub fn release(&self) {
        self.inner.blocking_lock().release();
    }

    /// Latches a fatal error and wakes any waiting dequeue.
    pub fn set_error(&self) {
        tracing::debug!(queue = &*self.done.name, "fatal error set by caller");
        self.done.set_error(true);
        self.done.wake_all();
    }

    /// Returns `true` if an error is latched.
    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.done.is_errored()
    }

    /// Interrupts a blocked dequeue, which returns
    /// [`QueueError::Interrupted`]. With no dequeue blocked, the next
    /// blocking wait is interrupted instead, unless streaming is turned off
    /// first.
    pub fn interrupt(&self) {
        self.done.interrupt();
    }

    /// Reports whether a dequeue would complete without blocking.
    #[must_use]
    pub fn poll(&self) -> Readiness {
        if !self.done.is_streaming() || self.done.is_errored() {
            return Readiness::Error;
        }
        if self.done.has_done() {
            Readiness::Ready
        } else {
            Readiness::Pending
        }
    }

    /// Returns a completion handle for the consumer.
    #[must_use]
    pub fn completer(&self) -> Completer {
        Completer::new(Arc::clone(&self.done))
    }

    /// Number of buffers the queue or the consumer own.
    #[must_use]
    pub fn queued_count(&self) -> usize {
        self.done.queued_count()
    }

    /// Number of buffers the consumer owns.
    #[must_use]
    pub fn owned_by_consumer(&self) -> usize {
        self.done.owned()
    }

    /// Creates an empty request.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Unsupported`] if the queue has no request
    /// support.
    pub fn new_request(&self) -> Result<RequestId> {
        let inner = self.inner.blocking_lock();
        if !inner.supports_requests {
            return Err(QueueError::Unsupported("requests"));
        }
        inner.done.lock_held(&inner).requests.create()
    }

    /// Submits `request`: prepares every bound buffer, then enqueues them.
    ///
    /// # Errors
    ///
    /// Returns the first prepare error; buffers prepared before it are
    /// rolled back and the request stays idle. Once every buffer is
    /// prepared the request is queued as a whole: if the consumer then
    /// refuses to start, all its buffers still end up `QUEUED`, the request
    /// is in flight and the refusal is returned.
    pub fn submit_request(&self, request: RequestId) -> Result<()> {
        self.inner.blocking_lock().submit_request(request)
    }

    /// Returns the state of `request`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidArgument`] for an unknown or released
    /// request.
    pub fn request_state(&self, request: RequestId) -> Result<RequestState> {
        self.done.request_state(request)
    }

    /// Releases `request`, returning unsubmitted buffers to the caller.
    ///
    /// # Errors
    ///
    /// - [`QueueError::Busy`] if the request is in flight
    /// - [`QueueError::InvalidArgument`] for an unknown request
    pub fn release_request(&self, request: RequestId) -> Result<()> {
        self.inner.blocking_lock().release_request(request)
    }
}

/// Internal queue state protected by the queue lock.
pub(crate) struct QueueInner {
    pub(crate) name: Arc<str>,
    pub(crate) is_output: bool,
    pub(crate) dma_dir: DmaDirection,
    pub(crate) min_buffers: usize,
    pub(crate) max_buffers: usize,
    pub(crate) supports_requests: bool,
    pub(crate) requires_requests: bool,
    pub(crate) mem_ops: MemOps,
    pub(crate) ops: Box<dyn QueueOps>,

    /// Memory model of the pool; `None` while empty.
    pub(crate) memory: Option<MemoryModel>,
    pub(crate) bufs: Vec<Buffer>,

    /// Buffers enqueued and not yet dequeued, in enqueue order.
    pub(crate) queued_list: VecDeque<usize>,

    /// The consumer's start hook ran and succeeded.
    pub(crate) start_streaming_called: bool,
    pub(crate) uses_qbuf: bool,
    pub(crate) uses_requests: bool,

    pub(crate) done: Arc<DoneQueue>,
    pub(crate) completer: Completer,
    pub(crate) mmap: Arc<MmapTable>,
}

impl QueueInner {
    pub(crate) fn record(&self, op: Op, index: Option<usize>) {
        self.done.instrumentation.record(op, index);
    }

    pub(crate) fn check_index(&self, index: usize) -> Result<()> {
        if index < self.bufs.len() {
            Ok(())
        } else {
            Err(QueueError::IndexOutOfRange {
                index,
                count: self.bufs.len(),
            })
        }
    }

    pub(crate) fn info(&self, index: usize) -> BufferInfo {
        let (state, request) = {
            let st = self.done.lock_held(self);
            (st.states[index], st.bindings[index])
        };
        self.bufs[index].info(state, request)
    }

    /// Moves buffer `index` to `to` under the completion lock.
    pub(crate) fn set_state(&self, index: usize, to: BufferState) {
        let mut st = self.done.lock_held(self);
        self.done.set_state(&mut st, index, to);
    }

    pub(crate) fn state(&self, index: usize) -> BufferState {
        self.done.lock_held(self).states[index]
    }

    fn export(&self, index: usize, plane: usize) -> Result<DmaBuf> {
        if self.memory != Some(MemoryModel::Mmap) {
            return Err(QueueError::InvalidArgument(
                "queue is not currently set up for mmap".into(),
            ));
        }
        self.check_index(index)?;
        let buffer = &self.bufs[index];
        let Some(p) = buffer.planes.get(plane) else {
            return Err(QueueError::InvalidArgument(format!(
                "buffer plane {plane} out of range"
            )));
        };
        match &p.mem {
            Some(PlaneMem::Mmap(memory)) => {
                let buf = memory.export().inspect_err(|e| {
                    tracing::debug!(
                        queue = &*self.name,
                        index,
                        plane,
                        "failed to export buffer: {e}"
                    );
                })?;
                tracing::trace!(queue = &*self.name, index, plane, "buffer exported");
                Ok(buf)
            }
            _ => Err(QueueError::InvalidArgument(format!(
                "buffer {index} plane {plane} has no memory"
            ))),
        }
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        self.release();
    }
}
