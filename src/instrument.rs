//! Operation and transition instrumentation.
//!
//! The queue reports every consumer hook, memory adapter call and buffer
//! state change to an [`Instrumentation`] sink. Production queues use
//! [`NoopInstrumentation`]; [`OpCounters`] counts calls and checks that
//! paired operations balance when the pool is freed.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::buffer::BufferState;

/// Operations reported to [`Instrumentation::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Op {
    QueueSetup,
    WaitPrepare,
    WaitFinish,
    StartStreaming,
    StopStreaming,
    BufInit,
    BufCleanup,
    BufPrepare,
    BufFinish,
    BufQueue,
    BufDone,
    BufRequestComplete,
    MemAlloc,
    MemPut,
    MemGetUserptr,
    MemPutUserptr,
    MemAttach,
    MemDetach,
    MemMap,
    MemUnmap,
    MemPrepare,
    MemFinish,
}

impl Op {
    const COUNT: usize = Self::MemFinish as usize + 1;

    /// Operations that must be called equally often over a pool's lifetime.
    pub const PAIRS: [(Self, Self); 9] = [
        (Self::WaitPrepare, Self::WaitFinish),
        (Self::StartStreaming, Self::StopStreaming),
        (Self::BufInit, Self::BufCleanup),
        (Self::BufPrepare, Self::BufFinish),
        (Self::BufQueue, Self::BufDone),
        (Self::MemAlloc, Self::MemPut),
        (Self::MemGetUserptr, Self::MemPutUserptr),
        (Self::MemAttach, Self::MemDetach),
        (Self::MemMap, Self::MemUnmap),
    ];
}

/// Sink for queue events.
///
/// Every method has an empty default, so implementations only override
/// what they need. Calls may arrive from the consumer's completion context
/// and must not block.
pub trait Instrumentation: Send + Sync {
    /// Called after `op` ran, with the buffer index for per-buffer ops.
    fn record(&self, _op: Op, _index: Option<usize>) {}

    /// Called when buffer `index` moves from `from` to `to`.
    fn transition(&self, _index: usize, _from: BufferState, _to: BufferState) {}

    /// Called after the whole pool was freed.
    fn pool_freed(&self, _queue: &str) {}
}

/// Instrumentation that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInstrumentation;

impl Instrumentation for NoopInstrumentation {}

/// Counts operations and checks pairs for balance.
#[derive(Debug)]
pub struct OpCounters {
    counts: [AtomicU64; Op::COUNT],
}

impl Default for OpCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl OpCounters {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Number of times `op` was recorded.
    #[must_use]
    pub fn count(&self, op: Op) -> u64 {
        self.counts[op as usize].load(Ordering::Relaxed)
    }

    /// Pairs whose counts differ, with both counts.
    #[must_use]
    pub fn unbalanced(&self) -> Vec<(Op, u64, Op, u64)> {
        Op::PAIRS
            .iter()
            .filter_map(|&(a, b)| {
                let (ca, cb) = (self.count(a), self.count(b));
                (ca != cb).then_some((a, ca, b, cb))
            })
            .collect()
    }

    /// Returns `true` if every pair balances.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.unbalanced().is_empty()
    }
}

impl Instrumentation for OpCounters {
    fn record(&self, op: Op, _index: Option<usize>) {
        self.counts[op as usize].fetch_add(1, Ordering::Relaxed);
    }

    fn pool_freed(&self, queue: &str) {
        for (a, ca, b, cb) in self.unbalanced() {
            tracing::warn!(queue, "unbalanced ops: {a:?}: {ca} {b:?}: {cb}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_balance() {
        let counters = OpCounters::new();
        assert!(counters.is_balanced());

        counters.record(Op::MemAlloc, Some(0));
        counters.record(Op::MemAlloc, Some(1));
        counters.record(Op::MemPut, Some(0));
        assert_eq!(counters.count(Op::MemAlloc), 2);
        assert!(!counters.is_balanced());
        assert_eq!(
            counters.unbalanced(),
            vec![(Op::MemAlloc, 2, Op::MemPut, 1)]
        );

        counters.record(Op::MemPut, Some(1));
        assert!(counters.is_balanced());

        // Unpaired ops never unbalance
        counters.record(Op::QueueSetup, None);
        assert!(counters.is_balanced());
        counters.pool_freed("test");
    }

    #[test]
    fn test_noop() {
        let sink: &dyn Instrumentation = &NoopInstrumentation;
        sink.record(Op::BufQueue, Some(0));
        sink.transition(0, BufferState::Queued, BufferState::Active);
        sink.pool_freed("test");
    }
}
