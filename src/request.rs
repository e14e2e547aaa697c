//! Deferred requests.
//!
//! A request groups buffers so they reach the consumer together. Requests
//! live in a [`RequestRegistry`] arena: a buffer refers to its request by
//! [`RequestId`] and the request keeps the indices of its buffers, so neither
//! side owns the other.

use std::fmt;

use crate::error::{QueueError, Result};

/// Handle to a request in the queue's registry.
///
/// Handles carry a generation, so a handle kept after
/// [`release_request`](crate::BufferQueue::release_request) is rejected
/// instead of aliasing a newer request in the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId {
    slot: u32,
    generation: u32,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}.{}", self.slot, self.generation)
    }
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Collecting buffers.
    Idle,
    /// Submitted; its buffers are with the queue or the consumer.
    Queued,
    /// Every bound buffer finished.
    Complete,
}

#[derive(Debug)]
struct Entry {
    state: RequestState,
    buffers: Vec<usize>,
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Arena of live requests.
#[derive(Debug, Default)]
pub(crate) struct RequestRegistry {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl RequestRegistry {
    pub(crate) fn create(&mut self) -> Result<RequestId> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(self.slots.len())
                    .map_err(|_| QueueError::OutOfMemory("request registry full".into()))?;
                self.slots.push(Slot::default());
                slot
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.entry = Some(Entry {
            state: RequestState::Idle,
            buffers: Vec::new(),
        });
        Ok(RequestId {
            slot,
            generation: entry.generation,
        })
    }

    fn entry(&self, id: RequestId) -> Result<&Entry> {
        self.slots
            .get(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_ref())
            .ok_or_else(|| QueueError::InvalidArgument(format!("unknown request {id}")))
    }

    fn entry_mut(&mut self, id: RequestId) -> Result<&mut Entry> {
        self.slots
            .get_mut(id.slot as usize)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.entry.as_mut())
            .ok_or_else(|| QueueError::InvalidArgument(format!("unknown request {id}")))
    }

    pub(crate) fn state(&self, id: RequestId) -> Result<RequestState> {
        self.entry(id).map(|e| e.state)
    }

    pub(crate) fn buffers(&self, id: RequestId) -> Result<&[usize]> {
        self.entry(id).map(|e| e.buffers.as_slice())
    }

    /// Checks that buffers can still be added to `id`.
    pub(crate) fn check_idle(&self, id: RequestId) -> Result<()> {
        match self.entry(id)?.state {
            RequestState::Idle => Ok(()),
            _ => Err(QueueError::Busy("request already submitted")),
        }
    }

    pub(crate) fn bind(&mut self, id: RequestId, index: usize) -> Result<()> {
        self.check_idle(id)?;
        let entry = self.entry_mut(id)?;
        if !entry.buffers.contains(&index) {
            entry.buffers.push(index);
        }
        Ok(())
    }

    /// Drops the link from `id` to `index`. A submitted request completes
    /// once its last buffer is unbound.
    pub(crate) fn unbind(&mut self, id: RequestId, index: usize) {
        if let Ok(entry) = self.entry_mut(id) {
            entry.buffers.retain(|&i| i != index);
            if entry.state == RequestState::Queued && entry.buffers.is_empty() {
                entry.state = RequestState::Complete;
            }
        }
    }

    pub(crate) fn mark_queued(&mut self, id: RequestId) -> Result<()> {
        let entry = self.entry_mut(id)?;
        if entry.state != RequestState::Idle {
            return Err(QueueError::Busy("request already submitted"));
        }
        if entry.buffers.is_empty() {
            return Err(QueueError::InvalidArgument(format!(
                "request {id} has no buffers"
            )));
        }
        entry.state = RequestState::Queued;
        Ok(())
    }

    pub(crate) fn release(&mut self, id: RequestId) -> Result<Vec<usize>> {
        let entry = self.entry(id)?;
        if entry.state == RequestState::Queued {
            return Err(QueueError::Busy("request in flight"));
        }
        let slot = &mut self.slots[id.slot as usize];
        let buffers = slot.entry.take().map(|e| e.buffers).unwrap_or_default();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.slot);
        Ok(buffers)
    }
}
