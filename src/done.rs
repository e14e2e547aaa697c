//! Completion side of the queue.
//!
//! [`DoneQueue`] holds everything the consumer touches when it finishes a
//! buffer: per-buffer states, the completion list, request bindings and a
//! handful of atomics. It is guarded by its own lock, which is always taken
//! after the queue lock (or without it, from the consumer), never before.
//! Outside this module a guard is only handed out against a `&QueueInner`,
//! which exists only under the queue lock; everything else here takes the
//! lock for a single step and never lets the guard escape.
//! [`Completer`] is the consumer's handle to it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::sync::Notify;

use crate::buffer::BufferState;
use crate::error::{QueueError, Result};
use crate::instrument::{Instrumentation, Op};
use crate::queue::QueueInner;
use crate::request::{RequestId, RequestRegistry, RequestState};

/// State guarded by the completion lock.
#[derive(Debug, Default)]
pub(crate) struct DoneState {
    pub(crate) states: Vec<BufferState>,
    pub(crate) done_list: VecDeque<usize>,
    /// Payload sizes reported by the consumer, applied at dequeue.
    pub(crate) payloads: Vec<Option<Vec<usize>>>,
    pub(crate) bindings: Vec<Option<RequestId>>,
    pub(crate) requests: RequestRegistry,
}

impl DoneState {
    pub(crate) fn resize(&mut self, count: usize) {
        self.states.resize(count, BufferState::Dequeued);
        self.payloads.resize(count, None);
        self.bindings.resize(count, None);
        self.done_list.retain(|&i| i < count);
    }

    /// Unbinds buffer `index` from its request, if any.
    pub(crate) fn unbind(&mut self, index: usize) -> Option<RequestId> {
        let id = self.bindings.get_mut(index)?.take()?;
        self.requests.unbind(id, index);
        Some(id)
    }
}

/// Completion list, per-buffer states and wake-up plumbing.
pub(crate) struct DoneQueue {
    pub(crate) name: Arc<str>,
    pub(crate) instrumentation: Arc<dyn Instrumentation>,
    state: Mutex<DoneState>,
    cond: Condvar,
    notify: Notify,
    owned: AtomicUsize,
    streaming: AtomicBool,
    error: AtomicBool,
    waiting: AtomicBool,
    interrupted: AtomicBool,
}

impl DoneQueue {
    pub(crate) fn new(name: Arc<str>, instrumentation: Arc<dyn Instrumentation>) -> Self {
        Self {
            name,
            instrumentation,
            state: Mutex::new(DoneState::default()),
            cond: Condvar::new(),
            notify: Notify::new(),
            owned: AtomicUsize::new(0),
            streaming: AtomicBool::new(false),
            error: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DoneState> {
        self.state.lock()
    }

    /// Takes the completion lock while the queue lock is held.
    pub(crate) fn lock_held(&self, _queue: &QueueInner) -> MutexGuard<'_, DoneState> {
        self.state.lock()
    }

    /// Moves buffer `index` to `to` and reports the transition.
    pub(crate) fn set_state(&self, st: &mut DoneState, index: usize, to: BufferState) {
        let from = std::mem::replace(&mut st.states[index], to);
        if from != to {
            tracing::trace!(queue = &*self.name, index, "{from} -> {to}");
            self.instrumentation.transition(index, from, to);
        }
    }

    /// Number of buffers in `QUEUED` or `ACTIVE`.
    pub(crate) fn queued_count(&self) -> usize {
        self.lock()
            .states
            .iter()
            .filter(|s| matches!(s, BufferState::Queued | BufferState::Active))
            .count()
    }

    pub(crate) fn request_state(&self, id: RequestId) -> Result<RequestState> {
        self.lock().requests.state(id)
    }

    pub(crate) fn owned(&self) -> usize {
        self.owned.load(Ordering::Acquire)
    }

    pub(crate) fn add_owned(&self) {
        self.owned.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn reset_owned(&self) {
        self.owned.store(0, Ordering::Release);
    }

    pub(crate) fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    pub(crate) fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    pub(crate) fn is_errored(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub(crate) fn set_error(&self, error: bool) {
        self.error.store(error, Ordering::Release);
    }

    pub(crate) fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.wake_all();
    }

    pub(crate) fn clear_interrupt(&self) {
        self.interrupted.store(false, Ordering::Release);
    }

    /// Consumes a pending interrupt.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    /// Marks the single dequeue wait slot as taken.
    pub(crate) fn begin_wait(&self) -> Result<WaitGuard<'_>> {
        self.waiting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| WaitGuard { done: self })
            .map_err(|_| QueueError::Busy("another dequeue is already waiting"))
    }

    /// Wakes every blocked dequeue and idle waiter.
    pub(crate) fn wake_all(&self) {
        let _st = self.state.lock();
        self.cond.notify_all();
        self.notify.notify_waiters();
    }

    pub(crate) fn has_done(&self) -> bool {
        !self.state.lock().done_list.is_empty()
    }

    /// Blocks until a buffer completes, streaming stops, the queue errors or
    /// the wait is interrupted. The caller must not hold the queue lock.
    pub(crate) fn wait_for_done(&self) {
        let mut st = self.state.lock();
        while st.done_list.is_empty()
            && self.is_streaming()
            && !self.is_errored()
            && !self.interrupted.load(Ordering::Acquire)
        {
            self.cond.wait(&mut st);
        }
    }

    /// Async counterpart of [`wait_for_done`](Self::wait_for_done).
    pub(crate) async fn wait_for_done_async(&self) {
        loop {
            let mut notified = std::pin::pin!(self.notify.notified());
            notified.as_mut().enable();
            {
                let st = self.state.lock();
                if !st.done_list.is_empty()
                    || !self.is_streaming()
                    || self.is_errored()
                    || self.interrupted.load(Ordering::Acquire)
                {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Removes the oldest completed buffer from the completion list.
    pub(crate) fn pop_done(&self) -> Option<(usize, BufferState, Option<Vec<usize>>)> {
        let mut st = self.state.lock();
        let index = st.done_list.pop_front()?;
        let payload = st.payloads[index].take();
        Some((index, st.states[index], payload))
    }

    fn buffer_done(&self, index: usize, state: BufferState, payload: Option<Vec<usize>>) {
        let name = &*self.name;
        let target = match state {
            BufferState::Done | BufferState::Error | BufferState::Queued => state,
            other => {
                tracing::warn!(queue = name, index, "illegal completion state {other}, using error");
                BufferState::Error
            }
        };

        let mut st = self.state.lock();
        match st.states.get(index) {
            Some(BufferState::Active) => {}
            Some(current) => {
                tracing::warn!(queue = name, index, "completing buffer that is {current}, ignored");
                return;
            }
            None => {
                tracing::warn!(queue = name, index, "completing unknown buffer, ignored");
                return;
            }
        }

        tracing::debug!(queue = name, index, "done processing on buffer, state: {target}");
        self.instrumentation.record(Op::BufDone, Some(index));
        self.set_state(&mut st, index, target);
        if target != BufferState::Queued {
            st.done_list.push_back(index);
            st.payloads[index] = payload;
            st.unbind(index);
        }
        self.owned.fetch_sub(1, Ordering::AcqRel);

        // Idle waiters care about every completion, dequeue only about
        // buffers that reached the completion list.
        self.cond.notify_all();
        if target != BufferState::Queued {
            self.notify.notify_waiters();
        }
    }
}

/// Releases the dequeue wait slot on drop.
pub(crate) struct WaitGuard<'a> {
    done: &'a DoneQueue,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.done.waiting.store(false, Ordering::Release);
    }
}

/// The consumer's handle for reporting completions.
///
/// A `Completer` never takes the queue lock, so it may be used from any
/// thread, including from inside consumer hooks.
#[derive(Clone)]
pub struct Completer {
    done: Arc<DoneQueue>,
}

impl std::fmt::Debug for Completer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completer")
            .field("queue", &self.done.name)
            .field("owned", &self.done.owned())
            .finish()
    }
}

impl Completer {
    pub(crate) fn new(done: Arc<DoneQueue>) -> Self {
        Self { done }
    }

    /// Reports that the consumer finished buffer `index`.
    ///
    /// `state` must be [`Done`](BufferState::Done),
    /// [`Error`](BufferState::Error) or [`Queued`](BufferState::Queued);
    /// anything else is logged and treated as `Error`. `Queued` returns the
    /// buffer to the wait list without showing it to the caller. Completing
    /// a buffer the consumer does not own is logged and ignored.
    pub fn buffer_done(&self, index: usize, state: BufferState) {
        self.done.buffer_done(index, state, None);
    }

    /// Like [`buffer_done`](Self::buffer_done), also reporting how many
    /// bytes of each plane hold data.
    pub fn buffer_done_with(&self, index: usize, state: BufferState, bytes_used: &[usize]) {
        self.done.buffer_done(index, state, Some(bytes_used.to_vec()));
    }

    /// Marks every buffer waiting to be dequeued as failed.
    pub fn discard_done(&self) {
        let mut st = self.done.lock();
        let pending: Vec<usize> = st.done_list.iter().copied().collect();
        for index in pending {
            self.done.set_state(&mut st, index, BufferState::Error);
        }
    }

    /// Latches a fatal error. Every later prepare, enqueue and dequeue fails
    /// until streaming is turned off.
    pub fn queue_error(&self) {
        tracing::debug!(queue = &*self.done.name, "fatal error reported by consumer");
        self.done.set_error(true);
        self.done.wake_all();
    }

    /// Number of buffers the consumer currently owns.
    #[must_use]
    pub fn owned(&self) -> usize {
        self.done.owned()
    }

    /// Returns `true` while the queue is streaming.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.done.is_streaming()
    }

    /// Blocks until the consumer owns no buffers.
    ///
    /// Must not be called from a consumer hook, since completions from the
    /// same thread could never arrive.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::StreamingOff`] if the queue is not streaming.
    pub fn wait_idle(&self) -> Result<()> {
        if !self.done.is_streaming() {
            return Err(QueueError::StreamingOff);
        }
        let mut st = self.done.lock();
        while self.done.owned() > 0 && self.done.is_streaming() {
            self.done.cond.wait(&mut st);
        }
        Ok(())
    }
}
