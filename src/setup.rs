//! Pool allocation and teardown.

use std::sync::Arc;

use crate::buffer::{Buffer, BufferState, MAX_PLANES, Plane};
use crate::error::{QueueError, Result};
use crate::instrument::{Instrumentation, Op};
use crate::memory::{MemoryModel, PAGE_SIZE, PlaneMem, page_align};
use crate::mmap::{MmapEntry, retain_below};
use crate::ops::QueueSetup;
use crate::queue::QueueInner;

/// Releases whatever memory is bound to `plane`.
pub(crate) fn put_plane(instrumentation: &dyn Instrumentation, index: usize, plane: &mut Plane) {
    match plane.mem.take() {
        Some(PlaneMem::Mmap(_)) => instrumentation.record(Op::MemPut, Some(index)),
        Some(PlaneMem::UserPtr(_)) => instrumentation.record(Op::MemPutUserptr, Some(index)),
        Some(PlaneMem::DmaBuf {
            mut attachment,
            mapped,
            ..
        }) => {
            if mapped {
                attachment.unmap();
                instrumentation.record(Op::MemUnmap, Some(index));
            }
            instrumentation.record(Op::MemDetach, Some(index));
        }
        None => {}
    }
}

/// First mmap offset after a plane at `offset` of `length` bytes.
fn next_offset(offset: u64, length: usize) -> u64 {
    let page = PAGE_SIZE as u64;
    (offset + length as u64).div_ceil(page) * page
}

fn check_layout(setup: &QueueSetup) -> Result<()> {
    if setup.num_planes == 0 || setup.num_planes > MAX_PLANES {
        tracing::warn!("consumer proposed {} planes", setup.num_planes);
        return Err(QueueError::InvalidArgument(format!(
            "invalid plane count {}",
            setup.num_planes
        )));
    }
    if let Some(plane) = setup.plane_sizes().iter().position(|&s| s == 0) {
        tracing::warn!("consumer proposed empty plane {plane}");
        return Err(QueueError::InvalidArgument(format!("plane {plane} has size 0")));
    }
    Ok(())
}

impl QueueInner {
    fn verify_memory(&self, memory: MemoryModel) -> Result<()> {
        if self.mem_ops.supports(memory) {
            Ok(())
        } else {
            tracing::debug!(queue = &*self.name, "unsupported memory type {memory}");
            Err(QueueError::InvalidArgument(format!(
                "{memory} memory not supported by queue"
            )))
        }
    }

    fn negotiate(&mut self, setup: &mut QueueSetup) -> Result<()> {
        self.ops.queue_setup(setup).inspect_err(|e| {
            tracing::debug!(queue = &*self.name, "queue setup refused: {e}");
        })?;
        self.record(Op::QueueSetup, None);
        Ok(())
    }

    fn forget_memory_if_empty(&mut self) {
        if self.bufs.is_empty() {
            self.memory = None;
        }
    }

    pub(crate) fn request_buffers(&mut self, memory: MemoryModel, count: usize) -> Result<usize> {
        self.verify_memory(memory)?;
        if self.done.is_streaming() {
            tracing::debug!(queue = &*self.name, "streaming active");
            return Err(QueueError::Busy("streaming active"));
        }
        if self.done.is_waiting() && count > 0 {
            tracing::debug!(queue = &*self.name, "another dequeue is waiting for a buffer");
            return Err(QueueError::Busy("another dequeue is waiting for a buffer"));
        }

        if count == 0 || !self.bufs.is_empty() || self.memory.is_some_and(|m| m != memory) {
            let mmap = Arc::clone(&self.mmap);
            let mut entries = mmap.lock();
            if self.memory == Some(MemoryModel::Mmap) && self.buffers_in_use() {
                tracing::debug!(queue = &*self.name, "memory in use, cannot free buffers");
                return Err(QueueError::Busy("buffers are mapped or exported"));
            }
            // Buffers may be queued without ever streaming.
            self.cancel();
            self.free_buffers(self.bufs.len(), &mut entries)?;
            drop(entries);

            if count == 0 {
                return Ok(0);
            }
        }

        let num_buffers = count.max(self.min_buffers).min(self.max_buffers);
        self.memory = Some(memory);

        let mut setup = QueueSetup {
            num_buffers,
            ..QueueSetup::default()
        };
        if let Err(e) = self.negotiate(&mut setup).and_then(|()| check_layout(&setup)) {
            self.forget_memory_if_empty();
            return Err(e);
        }

        let sizes = setup.plane_sizes().to_vec();
        let allocated = self.alloc_buffers(memory, setup.num_buffers, &sizes);
        if allocated == 0 {
            tracing::debug!(queue = &*self.name, "memory allocation failed");
            self.forget_memory_if_empty();
            return Err(QueueError::OutOfMemory("memory allocation failed".into()));
        }

        let mut result = if allocated < self.min_buffers {
            Err(QueueError::OutOfMemory(format!(
                "allocated {allocated} buffers, need at least {}",
                self.min_buffers
            )))
        } else {
            Ok(())
        };

        if result.is_ok() && allocated < setup.num_buffers {
            // Zero planes tells the consumer this is not an explicit layout.
            let mut retry = QueueSetup {
                num_buffers: allocated,
                ..QueueSetup::default()
            };
            result = self.negotiate(&mut retry).and_then(|()| {
                if allocated < retry.num_buffers {
                    Err(QueueError::OutOfMemory(format!(
                        "consumer needs {} buffers, allocated {allocated}",
                        retry.num_buffers
                    )))
                } else {
                    Ok(())
                }
            });
        }

        if let Err(e) = result {
            let mmap = Arc::clone(&self.mmap);
            let mut entries = mmap.lock();
            if let Err(free_err) = self.free_buffers(allocated, &mut entries) {
                tracing::warn!(queue = &*self.name, "failed to free new buffers: {free_err}");
            }
            return Err(e);
        }

        self.publish_offsets(self.bufs.len() - allocated);
        tracing::debug!(queue = &*self.name, "allocated {allocated} {memory} buffers");
        Ok(allocated)
    }

    pub(crate) fn create_buffers(
        &mut self,
        memory: MemoryModel,
        count: usize,
        sizes: &[usize],
    ) -> Result<usize> {
        self.verify_memory(memory)?;
        if sizes.len() > MAX_PLANES {
            return Err(QueueError::InvalidArgument(format!(
                "{} planes requested, at most {MAX_PLANES} supported",
                sizes.len()
            )));
        }
        if self.bufs.len() >= self.max_buffers {
            tracing::debug!(queue = &*self.name, "maximum number of buffers already allocated");
            return Err(QueueError::NoBufferSlots);
        }

        match self.memory {
            Some(current) if !self.bufs.is_empty() && current != memory => {
                tracing::debug!(queue = &*self.name, "memory model mismatch");
                return Err(QueueError::MemoryMismatch {
                    current,
                    requested: memory,
                });
            }
            _ if self.bufs.is_empty() => {
                if self.done.is_waiting() && count > 0 {
                    return Err(QueueError::Busy("another dequeue is waiting for a buffer"));
                }
            }
            _ => {}
        }
        if count == 0 {
            return Ok(0);
        }
        self.memory = Some(memory);

        let mut setup = QueueSetup {
            num_buffers: count.min(self.max_buffers - self.bufs.len()),
            existing: self.bufs.len(),
            ..QueueSetup::default()
        };
        if !sizes.is_empty() {
            setup.set_planes(sizes);
        }
        if let Err(e) = self.negotiate(&mut setup).and_then(|()| check_layout(&setup)) {
            self.forget_memory_if_empty();
            return Err(e);
        }

        let plane_sizes = setup.plane_sizes().to_vec();
        let allocated = self.alloc_buffers(memory, setup.num_buffers, &plane_sizes);
        if allocated == 0 {
            tracing::debug!(queue = &*self.name, "memory allocation failed");
            self.forget_memory_if_empty();
            return Err(QueueError::OutOfMemory("memory allocation failed".into()));
        }

        let mut result = Ok(());
        if allocated < setup.num_buffers {
            setup.num_buffers = allocated;
            setup.existing = self.bufs.len() - allocated;
            result = self.negotiate(&mut setup).and_then(|()| {
                if allocated < setup.num_buffers {
                    Err(QueueError::OutOfMemory(format!(
                        "consumer needs {} buffers, allocated {allocated}",
                        setup.num_buffers
                    )))
                } else {
                    Ok(())
                }
            });
        }

        if let Err(e) = result {
            let mmap = Arc::clone(&self.mmap);
            let mut entries = mmap.lock();
            if let Err(free_err) = self.free_buffers(allocated, &mut entries) {
                tracing::warn!(queue = &*self.name, "failed to free new buffers: {free_err}");
            }
            return Err(QueueError::OutOfMemory(e.to_string()));
        }

        self.publish_offsets(self.bufs.len() - allocated);
        tracing::debug!(queue = &*self.name, "created {allocated} {memory} buffers");
        Ok(allocated)
    }

    /// Appends up to `count` buffers. Returns how many were created.
    fn alloc_buffers(&mut self, memory: MemoryModel, count: usize, sizes: &[usize]) -> usize {
        let count = count.min(self.max_buffers.saturating_sub(self.bufs.len()));

        for created in 0..count {
            let index = self.bufs.len();
            let mut buffer = Buffer::new(index, memory, sizes);

            if memory == MemoryModel::Mmap {
                if let Err(e) = self.alloc_planes(&mut buffer) {
                    tracing::debug!(
                        queue = &*self.name,
                        "failed allocating memory for buffer {index}: {e}"
                    );
                    return created;
                }
                self.setup_offsets(&mut buffer);

                if let Err(e) = self.ops.buf_init(&buffer) {
                    tracing::debug!(queue = &*self.name, "buffer {index} initialization failed: {e}");
                    for plane in &mut buffer.planes {
                        put_plane(&*self.done.instrumentation, index, plane);
                    }
                    return created;
                }
                self.record(Op::BufInit, Some(index));
            }

            self.bufs.push(buffer);
            self.done.lock_held(self).resize(self.bufs.len());
        }

        count
    }

    /// Makes the planes of buffers from `first` on mappable, all under one
    /// hold of the pool-resize lock.
    fn publish_offsets(&self, first: usize) {
        let mut entries = self.mmap.lock();
        for buffer in &self.bufs[first..] {
            for (p, plane) in buffer.planes.iter().enumerate() {
                if let Some(PlaneMem::Mmap(memory)) = &plane.mem {
                    entries.push(MmapEntry {
                        offset: plane.mem_offset,
                        index: buffer.index,
                        plane: p,
                        length: plane.length,
                        memory: Arc::clone(memory),
                    });
                }
            }
        }
    }

    /// Allocates every plane of an mmap buffer, releasing all of them if
    /// any allocation fails.
    fn alloc_planes(&self, buffer: &mut Buffer) -> Result<()> {
        let Some(ops) = self.mem_ops.mmap.as_ref() else {
            return Err(QueueError::Unsupported("mmap memory"));
        };
        let index = buffer.index;

        let mut result = Ok(());
        for (p, plane) in buffer.planes.iter_mut().enumerate() {
            let Some(size) = page_align(plane.length) else {
                result = Err(QueueError::allocation(p, "plane size overflows"));
                break;
            };
            match ops.alloc(size, self.dma_dir) {
                Ok(memory) => {
                    plane.mem = Some(PlaneMem::Mmap(memory));
                    self.record(Op::MemAlloc, Some(index));
                }
                Err(e) => {
                    result = Err(QueueError::allocation(p, e));
                    break;
                }
            }
        }

        if result.is_err() {
            for plane in &mut buffer.planes {
                put_plane(&*self.done.instrumentation, index, plane);
            }
        }
        result
    }

    /// Gives each plane the next free page-aligned mmap offset.
    fn setup_offsets(&self, buffer: &mut Buffer) {
        let mut offset = self
            .bufs
            .last()
            .and_then(|prev| prev.planes.last())
            .map_or(0, |p| next_offset(p.mem_offset, p.length));

        for plane in &mut buffer.planes {
            plane.mem_offset = offset;
            offset = next_offset(offset, plane.length);
            tracing::trace!(
                queue = &*self.name,
                index = buffer.index,
                "plane offset {:#x}",
                plane.mem_offset
            );
        }
    }

    /// Frees the last `count` buffers.
    ///
    /// `entries` is the held pool-resize lock.
    pub(crate) fn free_buffers(&mut self, count: usize, entries: &mut Vec<MmapEntry>) -> Result<()> {
        let len = self.bufs.len();
        let first = len - count.min(len);

        if self.done.lock_held(self).states[first..].contains(&BufferState::Preparing) {
            tracing::debug!(queue = &*self.name, "preparing buffers, cannot free");
            return Err(QueueError::TryAgain("buffers are being prepared"));
        }

        for buffer in &self.bufs[first..] {
            if buffer.planes.first().is_some_and(Plane::has_memory) {
                self.ops.buf_cleanup(buffer);
                self.done
                    .instrumentation
                    .record(Op::BufCleanup, Some(buffer.index));
            }
        }

        let instrumentation = &*self.done.instrumentation;
        for mut buffer in self.bufs.drain(first..) {
            for plane in &mut buffer.planes {
                put_plane(instrumentation, buffer.index, plane);
            }
        }
        retain_below(entries, first);
        self.queued_list.retain(|&i| i < first);
        self.done.lock_held(self).resize(first);

        if self.bufs.is_empty() {
            self.memory = None;
            self.queued_list.clear();
            if len > 0 {
                self.done.instrumentation.pool_freed(&self.name);
            }
        }
        if len > first {
            tracing::debug!(queue = &*self.name, "freed {} buffers", len - first);
        }
        Ok(())
    }

    /// Returns `true` if any plane is referenced outside the pool.
    pub(crate) fn buffers_in_use(&self) -> bool {
        self.bufs.iter().any(|b| {
            b.planes
                .iter()
                .filter_map(|p| p.mem.as_ref())
                .any(|m| m.num_users() > 1)
        })
    }

    /// Error recovery: stops everything and frees the pool, ignoring
    /// outside references.
    pub(crate) fn reset(&mut self) -> Result<()> {
        let mmap = Arc::clone(&self.mmap);
        let mut entries = mmap.lock();
        if self.buffers_in_use() {
            tracing::debug!(queue = &*self.name, "memory in use, orphaning buffers");
        }
        self.cancel();
        self.free_buffers(self.bufs.len(), &mut entries)
    }

    /// Teardown: stops streaming and frees every buffer.
    pub(crate) fn release(&mut self) {
        self.cancel();
        let mmap = Arc::clone(&self.mmap);
        let mut entries = mmap.lock();
        if let Err(e) = self.free_buffers(self.bufs.len(), &mut entries) {
            tracing::warn!(queue = &*self.name, "failed to free buffers on release: {e}");
        }
    }
}
