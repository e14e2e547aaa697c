//! Buffer validation and memory binding.
//!
//! Preparing a buffer binds caller memory to its planes (user-pointer and
//! shared-handle queues), runs the consumer's validation hooks and syncs
//! the memory for the device. Planes whose binding did not change since
//! the previous submission are kept as they are.

use std::sync::Arc;

use crate::buffer::{BufferArgs, BufferInfo, BufferState, PlaneArgs, PlaneSource};
use crate::error::{QueueError, Result};
use crate::instrument::Op;
use crate::memory::{DmaBufOps, MemoryModel, PlaneMem, UserPtrOps};
use crate::queue::QueueInner;
use crate::setup::put_plane;

impl QueueInner {
    pub(crate) fn prepare_buffer(&mut self, index: usize, args: &BufferArgs) -> Result<BufferInfo> {
        self.check_index(index)?;
        let state = self.state(index);
        if state != BufferState::Dequeued {
            tracing::debug!(queue = &*self.name, index, "invalid buffer state {state}");
            return Err(QueueError::InvalidState {
                index,
                state,
                op: "prepare",
            });
        }
        if self.bufs[index].prepared {
            tracing::debug!(queue = &*self.name, index, "buffer already prepared");
            return Err(QueueError::InvalidState {
                index,
                state,
                op: "prepare twice",
            });
        }

        self.buf_prepare(index, Some(args))?;
        tracing::debug!(queue = &*self.name, index, "prepare of buffer succeeded");
        Ok(self.info(index))
    }

    /// Validates buffer `index` for submission.
    ///
    /// Without `args` the arguments stored at request enqueue are used, or
    /// failing that the current binding.
    pub(crate) fn buf_prepare(&mut self, index: usize, args: Option<&BufferArgs>) -> Result<()> {
        if self.done.is_errored() {
            tracing::debug!(queue = &*self.name, "fatal error occurred on queue");
            return Err(QueueError::QueueErrored);
        }
        if self.bufs[index].prepared {
            return Ok(());
        }
        debug_assert!(!self.bufs[index].synced);

        if self.is_output {
            self.ops
                .buf_out_validate(&self.bufs[index])
                .inspect_err(|e| {
                    tracing::debug!(queue = &*self.name, index, "buffer validation failed: {e}");
                })?;
        }

        let args = match args {
            Some(args) => args.clone(),
            None => match self.bufs[index].pending.clone() {
                Some(args) => args,
                None => self.bufs[index].current_args(),
            },
        };

        let orig_state = self.state(index);
        self.set_state(index, BufferState::Preparing);
        let result = self.stage(index, &args).and_then(|planes| {
            match self.bufs[index].memory {
                MemoryModel::Mmap => self.prepare_mmap(index, &planes),
                MemoryModel::UserPtr => self.prepare_userptr(index, &planes),
                MemoryModel::DmaBuf => self.prepare_dmabuf(index, &planes),
            }
        });
        self.set_state(index, orig_state);

        if let Err(e) = result {
            tracing::debug!(queue = &*self.name, index, "buffer preparation failed: {e}");
            return Err(e);
        }

        self.mem_prepare(index);
        self.bufs[index].prepared = true;
        Ok(())
    }

    /// Checks caller arguments against the buffer and resolves the
    /// effective plane lengths and payload.
    fn stage(&self, index: usize, args: &BufferArgs) -> Result<Vec<PlaneArgs>> {
        let buffer = &self.bufs[index];
        if args.planes.len() != buffer.num_planes() {
            return Err(QueueError::InvalidArgument(format!(
                "expected {} planes, got {}",
                buffer.num_planes(),
                args.planes.len()
            )));
        }

        args.planes
            .iter()
            .zip(&buffer.planes)
            .enumerate()
            .map(|(p, (a, plane))| {
                let length = match (&a.source, buffer.memory) {
                    (PlaneSource::Mmap, MemoryModel::Mmap) => plane.length,
                    (PlaneSource::UserPtr(_), MemoryModel::UserPtr) => a.length,
                    (PlaneSource::DmaBuf(buf), MemoryModel::DmaBuf) if a.length == 0 => buf.size(),
                    (PlaneSource::DmaBuf(_), MemoryModel::DmaBuf) => a.length,
                    _ => {
                        return Err(QueueError::InvalidArgument(format!(
                            "plane {p} source does not match {} memory",
                            buffer.memory
                        )));
                    }
                };

                let (bytes_used, data_offset) = if self.is_output {
                    let bytes_used = if a.bytes_used == 0 { length } else { a.bytes_used };
                    if bytes_used > length {
                        return Err(QueueError::InvalidArgument(format!(
                            "plane {p} bytes used {bytes_used} exceeds length {length}"
                        )));
                    }
                    if a.data_offset > 0 && a.data_offset >= bytes_used {
                        return Err(QueueError::InvalidArgument(format!(
                            "plane {p} data offset {} not below bytes used {bytes_used}",
                            a.data_offset
                        )));
                    }
                    (bytes_used, a.data_offset)
                } else {
                    (0, 0)
                };

                Ok(PlaneArgs {
                    source: a.source.clone(),
                    length,
                    bytes_used,
                    data_offset,
                })
            })
            .collect()
    }

    /// Copies the staged caller information into the planes.
    fn apply(&mut self, index: usize, planes: &[PlaneArgs]) {
        let buffer = &mut self.bufs[index];
        let bind = buffer.memory != MemoryModel::Mmap;
        for (plane, a) in buffer.planes.iter_mut().zip(planes) {
            plane.bytes_used = a.bytes_used;
            plane.data_offset = a.data_offset;
            if bind {
                plane.length = a.length;
                if let PlaneSource::UserPtr(addr) = a.source {
                    plane.userptr = addr;
                }
            }
        }
    }

    fn call_buf_prepare(&mut self, index: usize) -> Result<()> {
        self.ops.buf_prepare(&self.bufs[index])?;
        self.record(Op::BufPrepare, Some(index));
        Ok(())
    }

    fn call_buf_init(&mut self, index: usize) -> Result<()> {
        self.ops.buf_init(&self.bufs[index]).inspect_err(|e| {
            tracing::debug!(queue = &*self.name, index, "buffer initialization failed: {e}");
        })?;
        self.record(Op::BufInit, Some(index));
        Ok(())
    }

    fn call_buf_cleanup(&mut self, index: usize) {
        self.ops.buf_cleanup(&self.bufs[index]);
        self.record(Op::BufCleanup, Some(index));
    }

    fn prepare_mmap(&mut self, index: usize, planes: &[PlaneArgs]) -> Result<()> {
        self.apply(index, planes);
        self.call_buf_prepare(index)
    }

    /// Runs init (for new memory) and the consumer's prepare on a buffer
    /// with freshly bound planes.
    fn finish_binding(&mut self, index: usize, planes: &[PlaneArgs], reacquired: bool) -> Result<()> {
        self.apply(index, planes);
        if reacquired {
            self.call_buf_init(index)?;
        }
        if let Err(e) = self.call_buf_prepare(index) {
            self.call_buf_cleanup(index);
            return Err(e);
        }
        Ok(())
    }

    /// Releases every plane of buffer `index` after a failed bind.
    fn unbind_planes(&mut self, index: usize) {
        let instrumentation = &*self.done.instrumentation;
        for plane in &mut self.bufs[index].planes {
            put_plane(instrumentation, index, plane);
            plane.clear();
        }
    }

    fn prepare_userptr(&mut self, index: usize, planes: &[PlaneArgs]) -> Result<()> {
        let Some(ops) = self.mem_ops.userptr.clone() else {
            return Err(QueueError::Unsupported("userptr memory"));
        };
        let mut reacquired = !self.bufs[index].planes[0].has_memory();

        let result = self
            .acquire_userptr(index, planes, &ops, &mut reacquired)
            .and_then(|()| self.finish_binding(index, planes, reacquired));
        if result.is_err() {
            self.unbind_planes(index);
        }
        result
    }

    fn acquire_userptr(
        &mut self,
        index: usize,
        planes: &[PlaneArgs],
        ops: &Arc<dyn UserPtrOps>,
        reacquired: &mut bool,
    ) -> Result<()> {
        for (p, a) in planes.iter().enumerate() {
            let PlaneSource::UserPtr(addr) = a.source else {
                return Err(QueueError::InvalidArgument(format!("plane {p} is not a user pointer")));
            };
            let plane = &self.bufs[index].planes[p];
            if plane.userptr != 0 && plane.userptr == addr && plane.length == a.length {
                continue;
            }

            tracing::trace!(
                queue = &*self.name,
                index,
                "userspace address for plane {p} changed, reacquiring memory"
            );
            if a.length < plane.min_length {
                tracing::debug!(
                    queue = &*self.name,
                    index,
                    "provided buffer size {} is less than setup size {} for plane {p}",
                    a.length,
                    plane.min_length
                );
                return Err(QueueError::InvalidArgument(format!(
                    "plane {p} length {} below minimum {}",
                    a.length, plane.min_length
                )));
            }

            if plane.has_memory() && !*reacquired {
                *reacquired = true;
                self.call_buf_cleanup(index);
            }
            let plane = &mut self.bufs[index].planes[p];
            put_plane(&*self.done.instrumentation, index, plane);
            plane.clear();

            let memory = ops.get_userptr(addr, a.length, self.dma_dir).map_err(|e| {
                tracing::debug!(
                    queue = &*self.name,
                    index,
                    "failed acquiring userspace memory for plane {p}: {e}"
                );
                QueueError::allocation(p, e)
            })?;
            self.record(Op::MemGetUserptr, Some(index));
            self.bufs[index].planes[p].mem = Some(PlaneMem::UserPtr(memory));
        }
        Ok(())
    }

    fn prepare_dmabuf(&mut self, index: usize, planes: &[PlaneArgs]) -> Result<()> {
        let Some(ops) = self.mem_ops.dmabuf.clone() else {
            return Err(QueueError::Unsupported("dmabuf memory"));
        };
        let mut reacquired = !self.bufs[index].planes[0].has_memory();

        let result = self
            .acquire_dmabuf(index, planes, &ops, &mut reacquired)
            .and_then(|()| self.map_dmabuf(index))
            .and_then(|()| self.finish_binding(index, planes, reacquired));
        if result.is_err() {
            self.unbind_planes(index);
        }
        result
    }

    fn acquire_dmabuf(
        &mut self,
        index: usize,
        planes: &[PlaneArgs],
        ops: &Arc<dyn DmaBufOps>,
        reacquired: &mut bool,
    ) -> Result<()> {
        for (p, a) in planes.iter().enumerate() {
            let PlaneSource::DmaBuf(buf) = &a.source else {
                return Err(QueueError::InvalidArgument(format!("invalid dmabuf for plane {p}")));
            };
            let plane = &self.bufs[index].planes[p];
            if a.length < plane.min_length {
                tracing::debug!(
                    queue = &*self.name,
                    index,
                    "invalid dmabuf length {} for plane {p}, minimum length {}",
                    a.length,
                    plane.min_length
                );
                return Err(QueueError::InvalidArgument(format!(
                    "plane {p} length {} below minimum {}",
                    a.length, plane.min_length
                )));
            }
            if let Some(PlaneMem::DmaBuf { buf: current, .. }) = &plane.mem
                && current.same_as(buf)
                && plane.length == a.length
            {
                continue;
            }

            tracing::trace!(queue = &*self.name, index, "buffer for plane {p} changed");
            if !*reacquired {
                *reacquired = true;
                self.call_buf_cleanup(index);
            }
            let plane = &mut self.bufs[index].planes[p];
            put_plane(&*self.done.instrumentation, index, plane);
            plane.clear();

            let attachment = ops.attach(buf, a.length, self.dma_dir).map_err(|e| {
                tracing::debug!(queue = &*self.name, index, "failed to attach dmabuf: {e}");
                QueueError::allocation(p, e)
            })?;
            self.record(Op::MemAttach, Some(index));
            self.bufs[index].planes[p].mem = Some(PlaneMem::DmaBuf {
                attachment,
                buf: buf.clone(),
                mapped: false,
            });
        }
        Ok(())
    }

    /// Pins every attached plane that is not mapped yet.
    fn map_dmabuf(&mut self, index: usize) -> Result<()> {
        for p in 0..self.bufs[index].planes.len() {
            if let Some(PlaneMem::DmaBuf {
                attachment, mapped, ..
            }) = &mut self.bufs[index].planes[p].mem
                && !*mapped
            {
                attachment.map().map_err(|e| {
                    tracing::debug!(
                        queue = &*self.name,
                        index,
                        "failed to map dmabuf for plane {p}: {e}"
                    );
                    QueueError::allocation(p, e)
                })?;
                *mapped = true;
                self.record(Op::MemMap, Some(index));
            }
        }
        Ok(())
    }

    /// Syncs the buffer for the device.
    fn mem_prepare(&mut self, index: usize) {
        let buffer = &mut self.bufs[index];
        if buffer.synced {
            return;
        }
        buffer.synced = true;
        if buffer.need_cache_sync {
            for mem in buffer.planes.iter().filter_map(|p| p.mem.as_ref()) {
                mem.prepare();
            }
        }
        self.record(Op::MemPrepare, Some(index));
    }

    /// Syncs the buffer back for the caller.
    pub(crate) fn mem_finish(&mut self, index: usize) {
        let buffer = &mut self.bufs[index];
        if !buffer.synced {
            return;
        }
        buffer.synced = false;
        if buffer.need_cache_sync {
            for mem in buffer.planes.iter().filter_map(|p| p.mem.as_ref()) {
                mem.finish();
            }
        }
        self.record(Op::MemFinish, Some(index));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::allocator::HeapAllocator;
    use crate::buffer::PlaneLocation;
    use crate::dmabuf::DmaBuf;
    use crate::instrument::OpCounters;
    use crate::memory::{DmaDirection, MmapMemory, MmapOps, PAGE_SIZE};
    use crate::queue::BufferQueue;
    use crate::testing::{Probe, TestOps, builder, queue};

    fn handle(size: usize) -> DmaBuf {
        HeapAllocator::new()
            .alloc(size, DmaDirection::Bidirectional)
            .unwrap()
            .export()
            .unwrap()
    }

    fn counted(probe: &Probe, output: bool) -> (BufferQueue, Arc<OpCounters>) {
        let counters = Arc::new(OpCounters::new());
        let queue = builder()
            .output(output)
            .instrumentation(counters.clone())
            .build(TestOps::new(probe.clone()))
            .unwrap();
        (queue, counters)
    }

    #[test]
    fn test_prepare_mmap() {
        let probe = Probe::default();
        let queue = queue(&probe);
        queue.request_buffers(MemoryModel::Mmap, 2).unwrap();

        let info = queue.prepare_buffer(0, &BufferArgs::mmap(1)).unwrap();
        assert!(info.prepared);
        assert_eq!(info.state, BufferState::Dequeued);
        assert_eq!(probe.count("buf_prepare"), 1);

        let err = queue.prepare_buffer(0, &BufferArgs::mmap(1)).unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
        assert!(matches!(
            queue.prepare_buffer(5, &BufferArgs::mmap(1)),
            Err(QueueError::IndexOutOfRange { index: 5, count: 2 })
        ));
    }

    #[test]
    fn test_prepare_wrong_args() {
        let probe = Probe::default();
        let queue = queue(&probe);
        queue.request_buffers(MemoryModel::Mmap, 1).unwrap();

        assert!(matches!(
            queue.prepare_buffer(0, &BufferArgs::mmap(2)),
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(matches!(
            queue.prepare_buffer(0, &BufferArgs::userptr(&[(0x1000, 4096)])),
            Err(QueueError::InvalidArgument(_))
        ));
        assert!(!queue.query_buffer(0).unwrap().prepared);
    }

    #[test]
    fn test_prepare_rejected_keeps_state() {
        let probe = Probe::with_script(|s| s.fail_prepare = Some(0));
        let queue = queue(&probe);
        queue.request_buffers(MemoryModel::Mmap, 1).unwrap();

        assert!(matches!(
            queue.prepare_buffer(0, &BufferArgs::mmap(1)),
            Err(QueueError::Rejected(_))
        ));
        let info = queue.query_buffer(0).unwrap();
        assert_eq!(info.state, BufferState::Dequeued);
        assert!(!info.prepared);
    }

    #[test]
    fn test_prepare_errored_queue() {
        let probe = Probe::default();
        let queue = queue(&probe);
        queue.request_buffers(MemoryModel::Mmap, 1).unwrap();
        queue.set_error();
        assert!(matches!(
            queue.prepare_buffer(0, &BufferArgs::mmap(1)),
            Err(QueueError::QueueErrored)
        ));
    }

    #[test]
    fn test_output_payload() {
        let probe = Probe::default();
        let (queue, _) = counted(&probe, true);
        queue.request_buffers(MemoryModel::Mmap, 3).unwrap();

        // Zero bytes used means the whole plane
        let info = queue.prepare_buffer(0, &BufferArgs::mmap(1)).unwrap();
        assert_eq!(info.planes[0].bytes_used, 4096);
        assert_eq!(probe.count("buf_out_validate"), 1);

        let args = BufferArgs::mmap(1)
            .with_bytes_used(0, 100)
            .with_data_offset(0, 10);
        let info = queue.prepare_buffer(1, &args).unwrap();
        assert_eq!(info.planes[0].bytes_used, 100);
        assert_eq!(info.planes[0].data_offset, 10);

        let too_long = BufferArgs::mmap(1).with_bytes_used(0, 4097);
        assert!(queue.prepare_buffer(2, &too_long).is_err());
        let bad_offset = BufferArgs::mmap(1)
            .with_bytes_used(0, 100)
            .with_data_offset(0, 100);
        assert!(queue.prepare_buffer(2, &bad_offset).is_err());
    }

    #[test]
    fn test_output_validation_refused() {
        let probe = Probe::with_script(|s| s.fail_out_validate = true);
        let (queue, _) = counted(&probe, true);
        queue.request_buffers(MemoryModel::Mmap, 1).unwrap();
        assert!(queue.prepare_buffer(0, &BufferArgs::mmap(1)).is_err());
        assert_eq!(probe.count("buf_prepare"), 0);
    }

    #[test]
    fn test_capture_ignores_payload() {
        let probe = Probe::default();
        let queue = queue(&probe);
        queue.request_buffers(MemoryModel::Mmap, 1).unwrap();
        let args = BufferArgs::mmap(1).with_bytes_used(0, 99_999);
        let info = queue.prepare_buffer(0, &args).unwrap();
        assert_eq!(info.planes[0].bytes_used, 0);
    }

    #[test]
    fn test_prepare_userptr() {
        let probe = Probe::default();
        let (queue, counters) = counted(&probe, false);
        queue.request_buffers(MemoryModel::UserPtr, 2).unwrap();
        let mut backing = vec![0u8; 2 * 4096];
        let addr = backing.as_mut_ptr() as usize;

        let info = queue
            .prepare_buffer(0, &BufferArgs::userptr(&[(addr, 4096)]))
            .unwrap();
        assert_eq!(info.planes[0].location, PlaneLocation::UserPtr(addr));
        assert_eq!(info.planes[0].length, 4096);
        assert_eq!(probe.count("buf_init"), 1);
        assert_eq!(counters.count(Op::MemGetUserptr), 1);
        assert_eq!(counters.count(Op::MemPrepare), 1);

        // Too short for the negotiated plane
        assert!(matches!(
            queue.prepare_buffer(1, &BufferArgs::userptr(&[(addr, 100)])),
            Err(QueueError::InvalidArgument(_))
        ));
        assert_eq!(
            queue.query_buffer(1).unwrap().planes[0].location,
            PlaneLocation::Unbound
        );
    }

    #[test]
    fn test_userptr_revalidation_is_idempotent() {
        let probe = Probe::default();
        let (queue, counters) = counted(&probe, false);
        queue.request_buffers(MemoryModel::UserPtr, 1).unwrap();
        queue.stream_on().unwrap();
        let mut backing = vec![0u8; 2 * 4096];
        let addr = backing.as_mut_ptr() as usize;
        let args = BufferArgs::userptr(&[(addr, 4096)]);
        let completer = queue.completer();

        for _ in 0..2 {
            queue.enqueue(0, &args, None).unwrap();
            for index in probe.take_active() {
                completer.buffer_done(index, BufferState::Done);
            }
            queue.dequeue(true).unwrap();
        }
        assert_eq!(probe.count("buf_init"), 1);
        assert_eq!(probe.count("buf_cleanup"), 0);
        assert_eq!(probe.count("buf_prepare"), 2);
        assert_eq!(counters.count(Op::MemGetUserptr), 1);

        // A new address reacquires the memory
        let moved = BufferArgs::userptr(&[(addr + 4096, 4096)]);
        queue.enqueue(0, &moved, None).unwrap();
        assert_eq!(probe.count("buf_cleanup"), 1);
        assert_eq!(probe.count("buf_init"), 2);
        assert_eq!(counters.count(Op::MemPutUserptr), 1);
        assert_eq!(counters.count(Op::MemGetUserptr), 2);
    }

    #[test]
    fn test_userptr_prepare_failure_releases() {
        let probe = Probe::with_script(|s| s.fail_prepare = Some(0));
        let (queue, counters) = counted(&probe, false);
        queue.request_buffers(MemoryModel::UserPtr, 1).unwrap();
        let mut backing = vec![0u8; 4096];
        let addr = backing.as_mut_ptr() as usize;

        assert!(
            queue
                .prepare_buffer(0, &BufferArgs::userptr(&[(addr, 4096)]))
                .is_err()
        );
        assert_eq!(probe.count("buf_init"), 1);
        assert_eq!(probe.count("buf_cleanup"), 1);
        assert_eq!(counters.count(Op::MemPutUserptr), 1);
        assert_eq!(
            queue.query_buffer(0).unwrap().planes[0].location,
            PlaneLocation::Unbound
        );
    }

    #[test]
    fn test_prepare_dmabuf() {
        let probe = Probe::default();
        let (queue, counters) = counted(&probe, false);
        queue.request_buffers(MemoryModel::DmaBuf, 2).unwrap();
        let buf = handle(8192);

        // Zero length takes the handle size
        let info = queue
            .prepare_buffer(0, &BufferArgs::dmabuf(vec![(buf.clone(), 0)]))
            .unwrap();
        assert_eq!(info.planes[0].length, 8192);
        assert_eq!(info.planes[0].location, PlaneLocation::DmaBuf(buf.clone()));
        assert_eq!(counters.count(Op::MemAttach), 1);
        assert_eq!(counters.count(Op::MemMap), 1);
        // Shared handles skip cache sync but are still tracked
        assert_eq!(counters.count(Op::MemPrepare), 1);

        let small = handle(PAGE_SIZE / 2);
        assert!(matches!(
            queue.prepare_buffer(1, &BufferArgs::dmabuf(vec![(small, 0)])),
            Err(QueueError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_dmabuf_reuse_and_replace() {
        let probe = Probe::default();
        let (queue, counters) = counted(&probe, false);
        queue.request_buffers(MemoryModel::DmaBuf, 1).unwrap();
        queue.stream_on().unwrap();
        let completer = queue.completer();
        let first = handle(PAGE_SIZE);

        let submit = |buf: &DmaBuf| {
            queue
                .enqueue(0, &BufferArgs::dmabuf(vec![(buf.clone(), PAGE_SIZE)]), None)
                .unwrap();
            for index in probe.take_active() {
                completer.buffer_done(index, BufferState::Done);
            }
            queue.dequeue(true).unwrap();
        };
        submit(&first);
        submit(&first);
        assert_eq!(counters.count(Op::MemAttach), 1);
        assert_eq!(probe.count("buf_init"), 1);

        let second = handle(PAGE_SIZE);
        submit(&second);
        assert_eq!(counters.count(Op::MemAttach), 2);
        assert_eq!(counters.count(Op::MemDetach), 1);
        assert_eq!(counters.count(Op::MemUnmap), 1);
        assert_eq!(probe.count("buf_cleanup"), 1);
        assert_eq!(probe.count("buf_init"), 2);

        queue.stream_off().unwrap();
        queue.request_buffers(MemoryModel::DmaBuf, 0).unwrap();
        assert!(counters.is_balanced(), "{:?}", counters.unbalanced());
    }

    #[test]
    fn test_userptr_multi_plane_change_cleans_up_once() {
        let probe = Probe::with_script(|s| s.planes = vec![4096, 4096]);
        let (queue, counters) = counted(&probe, false);
        queue.request_buffers(MemoryModel::UserPtr, 1).unwrap();
        queue.stream_on().unwrap();
        let mut backing = vec![0u8; 4 * 4096];
        let addr = backing.as_mut_ptr() as usize;
        let completer = queue.completer();

        let cycle = |args: &BufferArgs| {
            queue.enqueue(0, args, None).unwrap();
            for index in probe.take_active() {
                completer.buffer_done(index, BufferState::Done);
            }
            queue.dequeue(true).unwrap();
        };
        cycle(&BufferArgs::userptr(&[(addr, 4096), (addr + 4096, 4096)]));
        assert_eq!(probe.count("buf_init"), 1);
        assert_eq!(counters.count(Op::MemGetUserptr), 2);

        // Both planes move
        cycle(&BufferArgs::userptr(&[
            (addr + 2 * 4096, 4096),
            (addr + 3 * 4096, 4096),
        ]));
        assert_eq!(probe.count("buf_cleanup"), 1);
        assert_eq!(probe.count("buf_init"), 2);
        assert_eq!(counters.count(Op::MemPutUserptr), 2);
        assert_eq!(counters.count(Op::MemGetUserptr), 4);

        let planes = queue.query_buffer(0).unwrap().planes;
        assert_eq!(planes[0].location, PlaneLocation::UserPtr(addr + 2 * 4096));
        assert_eq!(planes[1].location, PlaneLocation::UserPtr(addr + 3 * 4096));

        queue.stream_off().unwrap();
        queue.request_buffers(MemoryModel::UserPtr, 0).unwrap();
        assert!(counters.is_balanced(), "{:?}", counters.unbalanced());
    }

    #[test]
    fn test_dmabuf_multi_plane_change_cleans_up_once() {
        let probe = Probe::with_script(|s| s.planes = vec![PAGE_SIZE, PAGE_SIZE]);
        let (queue, counters) = counted(&probe, false);
        queue.request_buffers(MemoryModel::DmaBuf, 1).unwrap();
        queue.stream_on().unwrap();
        let completer = queue.completer();

        let cycle = |bufs: [&DmaBuf; 2]| {
            let planes = bufs.iter().map(|&b| (b.clone(), PAGE_SIZE)).collect();
            queue.enqueue(0, &BufferArgs::dmabuf(planes), None).unwrap();
            for index in probe.take_active() {
                completer.buffer_done(index, BufferState::Done);
            }
            queue.dequeue(true).unwrap();
        };
        let (first, second) = (handle(PAGE_SIZE), handle(PAGE_SIZE));
        cycle([&first, &second]);
        assert_eq!(counters.count(Op::MemAttach), 2);
        assert_eq!(probe.count("buf_init"), 1);

        let (third, fourth) = (handle(PAGE_SIZE), handle(PAGE_SIZE));
        cycle([&third, &fourth]);
        assert_eq!(probe.count("buf_cleanup"), 1);
        assert_eq!(probe.count("buf_init"), 2);
        assert_eq!(counters.count(Op::MemAttach), 4);
        assert_eq!(counters.count(Op::MemUnmap), 2);
        assert_eq!(counters.count(Op::MemDetach), 2);

        let planes = queue.query_buffer(0).unwrap().planes;
        assert_eq!(planes[0].location, PlaneLocation::DmaBuf(third.clone()));
        assert_eq!(planes[1].location, PlaneLocation::DmaBuf(fourth.clone()));

        queue.stream_off().unwrap();
        queue.request_buffers(MemoryModel::DmaBuf, 0).unwrap();
        assert!(counters.is_balanced(), "{:?}", counters.unbalanced());
    }

    #[test]
    fn test_pending_args_used_by_request() {
        let probe = Probe::default();
        let queue = builder()
            .supports_requests(true)
            .build(TestOps::new(probe.clone()))
            .unwrap();
        queue.request_buffers(MemoryModel::UserPtr, 1).unwrap();
        let mut backing = vec![0u8; 4096];
        let addr = backing.as_mut_ptr() as usize;

        let request = queue.new_request().unwrap();
        queue
            .enqueue(0, &BufferArgs::userptr(&[(addr, 4096)]), Some(request))
            .unwrap();
        queue.submit_request(request).unwrap();
        assert_eq!(
            queue.query_buffer(0).unwrap().planes[0].location,
            PlaneLocation::UserPtr(addr)
        );
    }
}
