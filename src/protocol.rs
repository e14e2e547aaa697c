//! Enqueue and dequeue.
//!
//! A buffer moves `DEQUEUED -> QUEUED -> ACTIVE -> DONE/ERROR -> DEQUEUED`.
//! Enqueue prepares it if needed and puts it on the wait list; once the
//! consumer was started it is dispatched straight away. The consumer
//! completes it through the [`Completer`](crate::Completer), and dequeue
//! hands it back to the caller in completion order.
//!
//! Buffers may instead be bound to a request (`IN_REQUEST`) and enqueued
//! together when the request is submitted.

use crate::buffer::{BufferArgs, BufferInfo, BufferState};
use crate::error::{QueueError, Result};
use crate::instrument::Op;
use crate::queue::QueueInner;
use crate::request::{RequestId, RequestState};

impl QueueInner {
    pub(crate) fn enqueue(
        &mut self,
        index: usize,
        args: &BufferArgs,
        request: Option<RequestId>,
    ) -> Result<BufferInfo> {
        if self.done.is_errored() {
            tracing::debug!(queue = &*self.name, "fatal error occurred on queue");
            return Err(QueueError::QueueErrored);
        }
        self.check_index(index)?;

        match request {
            Some(_) if !self.supports_requests => {
                return Err(QueueError::Unsupported("requests"));
            }
            None if self.requires_requests => {
                tracing::debug!(queue = &*self.name, "enqueue requires a request");
                return Err(QueueError::RequestRequired);
            }
            Some(_) if self.uses_qbuf => {
                tracing::debug!(queue = &*self.name, "queue in wrong mode (direct vs requests)");
                return Err(QueueError::WrongMode);
            }
            None if self.uses_requests => {
                tracing::debug!(queue = &*self.name, "queue in wrong mode (direct vs requests)");
                return Err(QueueError::WrongMode);
            }
            _ => {}
        }

        if let Some(request) = request {
            self.bind_request(index, args, request)?;
            tracing::debug!(queue = &*self.name, index, "bound buffer to {request}");
            return Ok(self.info(index));
        }

        let state = self.state(index);
        if state == BufferState::InRequest {
            return Err(QueueError::InvalidState {
                index,
                state,
                op: "enqueue without its request",
            });
        }
        self.queue_buffer(index, Some(args))?;
        Ok(self.info(index))
    }

    fn bind_request(&mut self, index: usize, args: &BufferArgs, request: RequestId) -> Result<()> {
        self.uses_requests = true;
        let state = self.state(index);
        if state != BufferState::Dequeued {
            tracing::debug!(queue = &*self.name, index, "buffer not in dequeued state");
            return Err(QueueError::InvalidState {
                index,
                state,
                op: "bind to a request",
            });
        }

        if self.is_output && !self.bufs[index].prepared {
            self.ops
                .buf_out_validate(&self.bufs[index])
                .inspect_err(|e| {
                    tracing::debug!(queue = &*self.name, index, "buffer validation failed: {e}");
                })?;
        }

        {
            let mut st = self.done.lock_held(self);
            st.requests.bind(request, index)?;
            st.bindings[index] = Some(request);
            self.done.set_state(&mut st, index, BufferState::InRequest);
        }
        self.bufs[index].pending = Some(args.clone());
        Ok(())
    }

    /// Puts a `DEQUEUED` or `IN_REQUEST` buffer on the wait list.
    fn queue_buffer(&mut self, index: usize, args: Option<&BufferArgs>) -> Result<()> {
        let state = self.state(index);
        if state != BufferState::InRequest {
            self.uses_qbuf = true;
        }

        match state {
            BufferState::Dequeued | BufferState::InRequest => {
                if !self.bufs[index].prepared {
                    self.buf_prepare(index, args)?;
                }
            }
            BufferState::Preparing => {
                tracing::debug!(queue = &*self.name, index, "buffer still being prepared");
                return Err(QueueError::InvalidState {
                    index,
                    state,
                    op: "enqueue",
                });
            }
            _ => {
                tracing::debug!(queue = &*self.name, index, "invalid buffer state {state}");
                return Err(QueueError::InvalidState {
                    index,
                    state,
                    op: "enqueue",
                });
            }
        }

        self.queued_list.push_back(index);
        self.set_state(index, BufferState::Queued);
        self.bufs[index].pending = None;

        if self.start_streaming_called {
            self.enqueue_in_driver(index);
        }

        if self.done.is_streaming()
            && !self.start_streaming_called
            && self.queued_list.len() >= self.min_buffers
        {
            self.start_streaming()?;
        }

        tracing::debug!(queue = &*self.name, index, "enqueue of buffer succeeded");
        Ok(())
    }

    /// Hands buffer `index` to the consumer.
    pub(crate) fn enqueue_in_driver(&mut self, index: usize) {
        self.set_state(index, BufferState::Active);
        self.done.add_owned();
        self.record(Op::BufQueue, Some(index));
        self.ops.buf_queue(&self.bufs[index], &self.completer);
    }

    /// Returns `Ok(true)` if a completed buffer is waiting, `Ok(false)` if
    /// the caller should block.
    pub(crate) fn ready_to_dequeue(&self, nonblocking: bool) -> Result<bool> {
        if self.done.is_waiting() {
            tracing::debug!(queue = &*self.name, "another dequeue is waiting for a buffer");
            return Err(QueueError::Busy("another dequeue is already waiting"));
        }
        if !self.done.is_streaming() {
            tracing::debug!(queue = &*self.name, "streaming off, will not wait for buffers");
            return Err(QueueError::StreamingOff);
        }
        if self.done.is_errored() {
            tracing::debug!(queue = &*self.name, "queue in error state, will not wait for buffers");
            return Err(QueueError::QueueErrored);
        }
        if self.done.has_done() {
            return Ok(true);
        }
        if nonblocking {
            tracing::trace!(queue = &*self.name, "nonblocking and no buffers to dequeue");
            return Err(QueueError::WouldBlock);
        }
        Ok(false)
    }

    /// Returns the oldest completed buffer to the caller.
    ///
    /// The descriptor reports the completion state; the buffer itself is
    /// `DEQUEUED` afterwards.
    pub(crate) fn dequeue_done(&mut self) -> Result<BufferInfo> {
        let Some((index, state, payload)) = self.done.pop_done() else {
            return Err(QueueError::WouldBlock);
        };

        match state {
            BufferState::Done => tracing::trace!(queue = &*self.name, index, "returning done buffer"),
            BufferState::Error => {
                tracing::trace!(queue = &*self.name, index, "returning done buffer with errors");
            }
            _ => {
                tracing::debug!(queue = &*self.name, index, "invalid buffer state {state}");
                return Err(QueueError::InvalidState {
                    index,
                    state,
                    op: "dequeue",
                });
            }
        }

        self.mem_finish(index);
        if let Some(bytes_used) = payload {
            for (plane, bytes) in self.bufs[index].planes.iter_mut().zip(bytes_used) {
                plane.bytes_used = bytes.min(plane.length);
            }
        }
        self.ops.buf_finish(&self.bufs[index]);
        self.record(Op::BufFinish, Some(index));
        self.bufs[index].prepared = false;

        let info = self.bufs[index].info(state, None);
        self.queued_list.retain(|&i| i != index);
        self.set_state(index, BufferState::Dequeued);
        self.bufs[index].pending = None;

        tracing::debug!(queue = &*self.name, index, "dequeue of buffer, state: {state}");
        Ok(info)
    }

    pub(crate) fn submit_request(&mut self, request: RequestId) -> Result<()> {
        if !self.supports_requests {
            return Err(QueueError::Unsupported("requests"));
        }
        let buffers = {
            let st = self.done.lock_held(self);
            st.requests.check_idle(request)?;
            st.requests.buffers(request)?.to_vec()
        };
        if buffers.is_empty() {
            return Err(QueueError::InvalidArgument(format!(
                "request {request} has no buffers"
            )));
        }

        let mut prepared = Vec::with_capacity(buffers.len());
        for &index in &buffers {
            if self.state(index) != BufferState::InRequest {
                continue;
            }
            if let Err(e) = self.buf_prepare(index, None) {
                tracing::debug!(queue = &*self.name, index, "request prepare failed: {e}");
                for &index in &prepared {
                    self.unprepare(index);
                }
                return Err(e);
            }
            prepared.push(index);
        }

        self.done.lock_held(self).requests.mark_queued(request)?;
        tracing::debug!(queue = &*self.name, "submitting {request}");

        // Every bound buffer is queued even if starting the consumer fails
        // on the way, so the request is never left half submitted.
        let mut first_error = None;
        for index in buffers {
            if self.state(index) != BufferState::InRequest {
                continue;
            }
            if let Err(e) = self.queue_buffer(index, None) {
                tracing::debug!(queue = &*self.name, index, "queueing request buffer failed: {e}");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Undoes a prepare of a request buffer.
    fn unprepare(&mut self, index: usize) {
        self.mem_finish(index);
        self.ops.buf_finish(&self.bufs[index]);
        self.record(Op::BufFinish, Some(index));
        self.bufs[index].prepared = false;
        self.set_state(index, BufferState::InRequest);
    }

    pub(crate) fn release_request(&mut self, request: RequestId) -> Result<()> {
        let mut st = self.done.lock_held(self);
        if st.requests.state(request)? == RequestState::Queued {
            return Err(QueueError::Busy("request in flight"));
        }
        let buffers = st.requests.release(request)?;
        for index in buffers {
            if st.bindings.get(index).copied().flatten() != Some(request) {
                continue;
            }
            st.bindings[index] = None;
            if st.states[index] == BufferState::InRequest {
                self.done.set_state(&mut st, index, BufferState::Dequeued);
                self.bufs[index].pending = None;
            }
        }
        tracing::debug!(queue = &*self.name, "released {request}");
        Ok(())
    }
}
