//! Recording consumer for unit tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::{DmaBufImporter, HeapAllocator, UserPtrImporter};
use crate::buffer::{Buffer, BufferState};
use crate::done::Completer;
use crate::error::{QueueError, Result};
use crate::memory::MemOps;
use crate::ops::{QueueOps, QueueSetup};
use crate::queue::{BufferQueue, BufferQueueBuilder};

/// How the test consumer behaves.
#[derive(Debug, Clone)]
pub(crate) struct Script {
    pub(crate) planes: Vec<usize>,
    /// Largest pool the consumer accepts.
    pub(crate) max_buffers: Option<usize>,
    pub(crate) fail_setup: bool,
    pub(crate) fail_init: Option<usize>,
    pub(crate) fail_prepare: Option<usize>,
    pub(crate) fail_out_validate: bool,
    pub(crate) fail_start: bool,
    /// Keep buffers when refusing to start.
    pub(crate) keep_on_start_failure: bool,
    /// Keep buffers when stopped.
    pub(crate) keep_on_stop: bool,
    /// Complete buffers as soon as they are queued.
    pub(crate) complete_on_queue: Option<BufferState>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            planes: vec![4096],
            max_buffers: None,
            fail_setup: false,
            fail_init: None,
            fail_prepare: None,
            fail_out_validate: false,
            fail_start: false,
            keep_on_start_failure: false,
            keep_on_stop: false,
            complete_on_queue: None,
        }
    }
}

#[derive(Default)]
struct ProbeState {
    calls: Vec<String>,
    active: VecDeque<usize>,
    setups: Vec<QueueSetup>,
    script: Script,
}

/// Shared view of what the test consumer saw.
#[derive(Clone, Default)]
pub(crate) struct Probe(Arc<Mutex<ProbeState>>);

impl Probe {
    pub(crate) fn with_script(f: impl FnOnce(&mut Script)) -> Self {
        let probe = Self::default();
        probe.script(f);
        probe
    }

    pub(crate) fn script(&self, f: impl FnOnce(&mut Script)) {
        f(&mut self.0.lock().script);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.0.lock().calls.clone()
    }

    /// Number of calls to the hook `name`.
    pub(crate) fn count(&self, name: &str) -> usize {
        self.0
            .lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(name))
            .count()
    }

    pub(crate) fn clear(&self) {
        self.0.lock().calls.clear();
    }

    /// Buffers the consumer currently holds, oldest first.
    pub(crate) fn take_active(&self) -> Vec<usize> {
        self.0.lock().active.drain(..).collect()
    }

    pub(crate) fn setups(&self) -> Vec<QueueSetup> {
        self.0.lock().setups.clone()
    }

    fn log(&self, call: String) {
        self.0.lock().calls.push(call);
    }
}

/// Consumer that records every hook and follows its [`Script`].
pub(crate) struct TestOps {
    probe: Probe,
}

impl TestOps {
    pub(crate) fn new(probe: Probe) -> Self {
        Self { probe }
    }

    fn script(&self) -> Script {
        self.probe.0.lock().script.clone()
    }

    fn give_back(&self, completer: &Completer, state: BufferState) {
        let active = self.probe.take_active();
        for index in active {
            completer.buffer_done(index, state);
        }
    }
}

impl QueueOps for TestOps {
    fn queue_setup(&mut self, setup: &mut QueueSetup) -> Result<()> {
        let script = self.script();
        self.probe
            .log(format!("queue_setup {} {}", setup.num_buffers, setup.num_planes));
        self.probe.0.lock().setups.push(setup.clone());
        if script.fail_setup {
            return Err(QueueError::rejected("setup refused"));
        }
        if let Some(max) = script.max_buffers {
            setup.num_buffers = setup.num_buffers.min(max);
        }
        if setup.num_planes == 0 {
            setup.set_planes(&script.planes);
        }
        Ok(())
    }

    fn buf_queue(&mut self, buffer: &Buffer, completer: &Completer) {
        let index = buffer.index();
        self.probe.log(format!("buf_queue {index}"));
        match self.script().complete_on_queue {
            Some(state) => completer.buffer_done(index, state),
            None => self.probe.0.lock().active.push_back(index),
        }
    }

    fn buf_init(&mut self, buffer: &Buffer) -> Result<()> {
        self.probe.log(format!("buf_init {}", buffer.index()));
        if self.script().fail_init == Some(buffer.index()) {
            return Err(QueueError::rejected("init refused"));
        }
        Ok(())
    }

    fn buf_cleanup(&mut self, buffer: &Buffer) {
        self.probe.log(format!("buf_cleanup {}", buffer.index()));
    }

    fn buf_out_validate(&mut self, buffer: &Buffer) -> Result<()> {
        self.probe.log(format!("buf_out_validate {}", buffer.index()));
        if self.script().fail_out_validate {
            return Err(QueueError::rejected("payload refused"));
        }
        Ok(())
    }

    fn buf_prepare(&mut self, buffer: &Buffer) -> Result<()> {
        self.probe.log(format!("buf_prepare {}", buffer.index()));
        if self.script().fail_prepare == Some(buffer.index()) {
            return Err(QueueError::rejected("prepare refused"));
        }
        Ok(())
    }

    fn buf_finish(&mut self, buffer: &Buffer) {
        self.probe.log(format!("buf_finish {}", buffer.index()));
    }

    fn buf_request_complete(&mut self, buffer: &Buffer) {
        self.probe
            .log(format!("buf_request_complete {}", buffer.index()));
    }

    fn start_streaming(&mut self, count: usize, completer: &Completer) -> Result<()> {
        self.probe.log(format!("start_streaming {count}"));
        let script = self.script();
        if script.fail_start {
            if !script.keep_on_start_failure {
                self.give_back(completer, BufferState::Queued);
            }
            return Err(QueueError::rejected("start refused"));
        }
        Ok(())
    }

    fn stop_streaming(&mut self, completer: &Completer) {
        self.probe.log("stop_streaming".to_string());
        if !self.script().keep_on_stop {
            self.give_back(completer, BufferState::Error);
        }
    }

    fn wait_prepare(&mut self) {
        self.probe.log("wait_prepare".to_string());
    }

    fn wait_finish(&mut self) {
        self.probe.log("wait_finish".to_string());
    }
}

/// Builder with every memory model enabled.
pub(crate) fn builder() -> BufferQueueBuilder {
    BufferQueueBuilder::new().name("test").mem_ops(
        MemOps::new()
            .with_mmap(Arc::new(HeapAllocator::new()))
            .with_userptr(Arc::new(UserPtrImporter::new()))
            .with_dmabuf(Arc::new(DmaBufImporter::new())),
    )
}

/// Capture queue with every memory model, driven by `probe`.
pub(crate) fn queue(probe: &Probe) -> BufferQueue {
    builder()
        .build(TestOps::new(probe.clone()))
        .expect("valid test queue")
}
