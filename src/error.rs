//! Error type shared by every queue operation.
//!
//! [`QueueError`] keeps the distinctions callers need (busy vs. retry vs.
//! latched failure) and converts into [`std::io::Error`] for code written
//! against io-style results.

use std::io::ErrorKind;

use thiserror::Error;

use crate::buffer::BufferState;
use crate::memory::MemoryModel;

/// Errors reported by the buffer queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An argument was malformed or inconsistent with the queue setup.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The buffer is not in a state that allows the requested transition.
    #[error("buffer {index} is {state}, cannot {op}")]
    InvalidState {
        /// Buffer index.
        index: usize,
        /// State the buffer was found in.
        state: BufferState,
        /// Operation that was attempted.
        op: &'static str,
    },

    /// Buffer index does not name an allocated buffer.
    #[error("buffer index {index} out of range ({count} buffers allocated)")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Number of allocated buffers.
        count: usize,
    },

    /// The queue is set up for a different memory model.
    #[error("memory model mismatch: queue uses {current}, requested {requested}")]
    MemoryMismatch {
        /// Model the queue is currently using.
        current: MemoryModel,
        /// Model the caller asked for.
        requested: MemoryModel,
    },

    /// The queue has no capability for the requested operation.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),

    /// The queue only accepts buffers through deferred requests.
    #[error("enqueue requires a request")]
    RequestRequired,

    /// Direct enqueue and request-based enqueue were mixed.
    #[error("queue in wrong mode (direct enqueue vs requests)")]
    WrongMode,

    /// Memory could not be allocated, or too few buffers were obtained.
    #[error("out of memory: {0}")]
    OutOfMemory(String),

    /// The fixed maximum number of buffers is already allocated.
    #[error("maximum number of buffers already allocated")]
    NoBufferSlots,

    /// A memory adapter failed to acquire, wrap or map plane memory.
    #[error("memory adapter failed for plane {plane}: {reason}")]
    Allocation {
        /// Plane index.
        plane: usize,
        /// Adapter supplied reason.
        reason: String,
    },

    /// The resource is in use by someone else.
    #[error("resource busy: {0}")]
    Busy(&'static str),

    /// Transient condition, retry later without changes.
    #[error("try again: {0}")]
    TryAgain(&'static str),

    /// Non-blocking dequeue found nothing to return.
    #[error("no buffer ready to dequeue")]
    WouldBlock,

    /// The consumer rejected a buffer or stream start.
    #[error("consumer rejected: {0}")]
    Rejected(String),

    /// The queue latched a fatal error.
    #[error("fatal error occurred on queue")]
    QueueErrored,

    /// Dequeue attempted while streaming is off.
    #[error("streaming off, will not wait for buffers")]
    StreamingOff,

    /// A blocked wait was interrupted.
    #[error("wait interrupted")]
    Interrupted,
}

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

impl QueueError {
    /// Builds a [`QueueError::Rejected`] from any displayable reason.
    pub fn rejected(reason: impl std::fmt::Display) -> Self {
        Self::Rejected(reason.to_string())
    }

    /// Builds a [`QueueError::Allocation`] for the given plane.
    pub fn allocation(plane: usize, reason: impl std::fmt::Display) -> Self {
        Self::Allocation {
            plane,
            reason: reason.to_string(),
        }
    }

    /// Returns the closest [`ErrorKind`] for this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_)
            | Self::InvalidState { .. }
            | Self::IndexOutOfRange { .. }
            | Self::MemoryMismatch { .. }
            | Self::StreamingOff => ErrorKind::InvalidInput,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::RequestRequired | Self::Rejected(_) | Self::QueueErrored => ErrorKind::Other,
            Self::WrongMode | Self::Busy(_) => ErrorKind::ResourceBusy,
            Self::OutOfMemory(_) | Self::NoBufferSlots | Self::Allocation { .. } => {
                ErrorKind::OutOfMemory
            }
            Self::TryAgain(_) | Self::WouldBlock => ErrorKind::WouldBlock,
            Self::Interrupted => ErrorKind::Interrupted,
        }
    }
}

impl From<QueueError> for std::io::Error {
    fn from(err: QueueError) -> Self {
        Self::new(err.kind(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(QueueError::Busy("x").kind(), ErrorKind::ResourceBusy);
        assert_eq!(QueueError::WouldBlock.kind(), ErrorKind::WouldBlock);
        assert_eq!(
            QueueError::OutOfMemory("x".into()).kind(),
            ErrorKind::OutOfMemory
        );
        assert_eq!(QueueError::Interrupted.kind(), ErrorKind::Interrupted);
    }

    #[test]
    fn test_into_io_error() {
        let err: std::io::Error = QueueError::QueueErrored.into();
        assert_eq!(err.kind(), ErrorKind::Other);
        assert!(err.to_string().contains("fatal error"));
    }

    #[test]
    fn test_invalid_state_display() {
        let err = QueueError::InvalidState {
            index: 3,
            state: BufferState::Active,
            op: "enqueue",
        };
        assert_eq!(err.to_string(), "buffer 3 is active, cannot enqueue");
    }
}
