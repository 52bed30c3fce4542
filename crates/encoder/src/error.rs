//! Encoder-specific error types.
//!
//! Session-level failures use the common `EncodeError`. The types here cover
//! hardware slot bookkeeping, which is strict: handing back a slot twice is a
//! programming error and must fail loudly.

use ck_common::EncodeError;
use thiserror::Error;

/// Misuse of a hardware input or output slot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    #[error("Output slot {0} is not held by the client")]
    NotOutstanding(usize),

    #[error("Input slot {0} was not handed out")]
    InputNotDequeued(usize),

    #[error("Slot index {index} out of range (codec has {count} slots)")]
    OutOfRange { index: usize, count: usize },

    #[error("Input of {len} bytes exceeds slot capacity of {capacity} bytes")]
    Overflow { len: usize, capacity: usize },
}

impl From<SlotError> for EncodeError {
    fn from(err: SlotError) -> Self {
        EncodeError::Hardware(err.to_string())
    }
}
