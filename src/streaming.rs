//! Stream control.

use crate::buffer::BufferState;
use crate::error::{QueueError, Result};
use crate::instrument::Op;
use crate::queue::QueueInner;
use crate::request::RequestState;

impl QueueInner {
    fn active_buffers(&self) -> Vec<usize> {
        let st = self.done.lock_held(self);
        st.states
            .iter()
            .enumerate()
            .filter(|&(_, &s)| s == BufferState::Active)
            .map(|(i, _)| i)
            .collect()
    }

    /// Dispatches every queued buffer and starts the consumer.
    ///
    /// If the consumer refuses, every buffer it still owns is reclaimed as
    /// `QUEUED`.
    pub(crate) fn start_streaming(&mut self) -> Result<()> {
        let queued: Vec<usize> = self.queued_list.iter().copied().collect();
        for index in queued {
            if self.state(index) == BufferState::Queued {
                self.enqueue_in_driver(index);
            }
        }

        self.start_streaming_called = true;
        let owned = self.done.owned();
        match self.ops.start_streaming(owned, &self.completer) {
            Ok(()) => {
                self.record(Op::StartStreaming, None);
                tracing::debug!(queue = &*self.name, "started streaming with {owned} buffers");
                Ok(())
            }
            Err(e) => {
                self.start_streaming_called = false;
                tracing::debug!(queue = &*self.name, "consumer refused to start streaming: {e}");

                if self.done.owned() > 0 {
                    tracing::warn!(
                        queue = &*self.name,
                        "consumer kept {} buffers after refusing to start",
                        self.done.owned()
                    );
                    for index in self.active_buffers() {
                        self.completer.buffer_done(index, BufferState::Queued);
                    }
                }
                if self.done.has_done() {
                    tracing::warn!(
                        queue = &*self.name,
                        "consumer completed buffers while refusing to start"
                    );
                }
                Err(e)
            }
        }
    }

    /// Stops the consumer and walks every buffer back to `DEQUEUED`.
    ///
    /// Completed buffers that were not dequeued yet are dropped, and the
    /// latched error and any pending interrupt are cleared.
    pub(crate) fn cancel(&mut self) {
        if self.start_streaming_called {
            self.ops.stop_streaming(&self.completer);
            self.record(Op::StopStreaming, None);
        }

        if self.done.owned() > 0 {
            for index in self.active_buffers() {
                tracing::warn!(
                    queue = &*self.name,
                    index,
                    "consumer left buffer active after stop, reclaiming"
                );
                self.completer.buffer_done(index, BufferState::Error);
            }
        }

        self.done.set_streaming(false);
        self.start_streaming_called = false;
        self.done.set_error(false);
        self.done.clear_interrupt();
        self.uses_requests = false;
        self.uses_qbuf = false;
        self.queued_list.clear();
        self.done.lock_held(self).done_list.clear();
        self.done.reset_owned();
        self.done.wake_all();

        for index in 0..self.bufs.len() {
            let request_queued = {
                let st = self.done.lock_held(self);
                st.bindings[index]
                    .is_some_and(|id| matches!(st.requests.state(id), Ok(RequestState::Queued)))
            };
            if request_queued {
                self.ops.buf_request_complete(&self.bufs[index]);
                self.record(Op::BufRequestComplete, Some(index));
            }

            self.mem_finish(index);
            if self.bufs[index].prepared {
                self.ops.buf_finish(&self.bufs[index]);
                self.record(Op::BufFinish, Some(index));
                self.bufs[index].prepared = false;
            }

            {
                let mut st = self.done.lock_held(self);
                self.done.set_state(&mut st, index, BufferState::Dequeued);
                st.unbind(index);
                st.payloads[index] = None;
            }
            self.bufs[index].pending = None;
        }
    }

    pub(crate) fn stream_on(&mut self) -> Result<()> {
        if self.done.is_streaming() {
            tracing::trace!(queue = &*self.name, "already streaming");
            return Ok(());
        }
        if self.bufs.is_empty() {
            tracing::debug!(queue = &*self.name, "no buffers have been allocated");
            return Err(QueueError::InvalidArgument(
                "no buffers have been allocated".into(),
            ));
        }
        if self.bufs.len() < self.min_buffers {
            tracing::debug!(
                queue = &*self.name,
                "need at least {} allocated buffers",
                self.min_buffers
            );
            return Err(QueueError::InvalidArgument(format!(
                "need at least {} allocated buffers",
                self.min_buffers
            )));
        }

        if self.queued_list.len() >= self.min_buffers {
            self.start_streaming()?;
        }
        self.done.set_streaming(true);
        tracing::debug!(queue = &*self.name, "stream on successful");
        Ok(())
    }

    pub(crate) fn stream_off(&mut self) {
        self.cancel();
        tracing::debug!(queue = &*self.name, "stream off successful");
    }
}
