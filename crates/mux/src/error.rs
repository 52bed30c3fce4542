//! Muxer error types.

use ck_common::SinkError;
use thiserror::Error;

/// Errors that can occur while muxing.
///
/// Container invariant violations (`InvalidParameterSets`, `TrackNotReady`)
/// fail only the write that caused them; the muxer stays usable.
#[derive(Error, Debug)]
pub enum MuxError {
    /// I/O error while serializing.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid muxer or stream configuration.
    #[error("Invalid muxer config: {0}")]
    InvalidConfig(String),

    /// Track-related error (e.g. unknown stream id).
    #[error("Track error: {0}")]
    TrackError(String),

    /// Parameter sets that cannot describe the track.
    #[error("Invalid parameter sets: {0}")]
    InvalidParameterSets(String),

    /// The track has no sample description yet and cannot hold more frames.
    #[error("Track not ready: {0}")]
    TrackNotReady(String),

    /// Internal buffer exceeded capacity.
    #[error("Buffer full: {0}")]
    BufferFull(String),

    /// Operation not valid in the muxer's current lifecycle state.
    #[error("Cannot {op} while {state}")]
    IllegalState { op: &'static str, state: &'static str },

    /// The output sink failed.
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),
}

/// Convenience Result type for mux operations.
pub type MuxResult<T> = Result<T, MuxError>;
