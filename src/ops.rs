//! Consumer hooks.
//!
//! The consumer is the processing path that receives `ACTIVE` buffers. It
//! plugs into the queue through [`QueueOps`]: [`queue_setup`] and
//! [`buf_queue`] are required, every other hook has a default that accepts.
//!
//! Hooks run with the queue lock held, so they must not call back into the
//! [`BufferQueue`](crate::BufferQueue). The [`Completer`] handed to
//! [`buf_queue`] and the streaming hooks is the only way back in, and it is
//! safe to use from any thread at any time.
//!
//! [`queue_setup`]: QueueOps::queue_setup
//! [`buf_queue`]: QueueOps::buf_queue

use crate::buffer::{Buffer, MAX_PLANES};
use crate::done::Completer;
use crate::error::Result;

/// Layout negotiation between the queue and the consumer.
///
/// On entry `num_buffers` holds the requested count. When the caller passed
/// explicit plane sizes (`create_buffers`) `num_planes` and `sizes` are
/// filled in and the consumer only validates them; otherwise `num_planes`
/// is zero and the consumer proposes a layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSetup {
    /// Buffers requested; the consumer may lower it.
    pub num_buffers: usize,
    /// Planes per buffer.
    pub num_planes: usize,
    /// Per-plane size in bytes; only the first `num_planes` entries count.
    pub sizes: [usize; MAX_PLANES],
    /// Buffers already allocated on the queue.
    pub existing: usize,
}

impl QueueSetup {
    /// Sets the layout to `sizes.len()` planes of the given sizes.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_PLANES`] sizes are given.
    pub fn set_planes(&mut self, sizes: &[usize]) {
        assert!(sizes.len() <= MAX_PLANES, "too many planes");
        self.num_planes = sizes.len();
        self.sizes = [0; MAX_PLANES];
        self.sizes[..sizes.len()].copy_from_slice(sizes);
    }

    /// The negotiated plane sizes.
    #[must_use]
    pub fn plane_sizes(&self) -> &[usize] {
        &self.sizes[..self.num_planes.min(MAX_PLANES)]
    }
}

/// Hooks implemented by the consumer of a queue.
pub trait QueueOps: Send {
    /// Proposes or validates a buffer layout.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the allocation with no buffers created.
    fn queue_setup(&mut self, setup: &mut QueueSetup) -> Result<()>;

    /// Hands an `ACTIVE` buffer to the consumer.
    ///
    /// The consumer owns the buffer until it reports completion through
    /// `completer`, possibly from another thread.
    fn buf_queue(&mut self, buffer: &Buffer, completer: &Completer);

    /// One-time setup after memory is bound to a buffer.
    ///
    /// # Errors
    ///
    /// An error frees the buffer (allocation) or unbinds its memory
    /// (re-validation).
    fn buf_init(&mut self, _buffer: &Buffer) -> Result<()> {
        Ok(())
    }

    /// Teardown before a buffer's memory is released.
    fn buf_cleanup(&mut self, _buffer: &Buffer) {}

    /// Validates the payload of an output buffer before it is prepared.
    ///
    /// # Errors
    ///
    /// An error rejects the prepare or enqueue.
    fn buf_out_validate(&mut self, _buffer: &Buffer) -> Result<()> {
        Ok(())
    }

    /// Per-submission validation.
    ///
    /// # Errors
    ///
    /// An error rejects the prepare or enqueue; the buffer keeps its state.
    fn buf_prepare(&mut self, _buffer: &Buffer) -> Result<()> {
        Ok(())
    }

    /// Called when a prepared buffer returns to the caller.
    fn buf_finish(&mut self, _buffer: &Buffer) {}

    /// Called when a submitted request is cancelled before completing.
    fn buf_request_complete(&mut self, _buffer: &Buffer) {}

    /// Starts processing with `count` buffers already handed over.
    ///
    /// # Errors
    ///
    /// On error the consumer should give its buffers back with
    /// [`BufferState::Queued`](crate::BufferState::Queued); the queue
    /// reclaims any it keeps.
    fn start_streaming(&mut self, _count: usize, _completer: &Completer) -> Result<()> {
        Ok(())
    }

    /// Stops processing. The consumer should complete every buffer it owns
    /// before returning.
    fn stop_streaming(&mut self, _completer: &Completer) {}

    /// Called before a blocking dequeue releases the queue lock.
    fn wait_prepare(&mut self) {}

    /// Called after a blocking dequeue reacquired the queue lock.
    fn wait_finish(&mut self) {}
}
