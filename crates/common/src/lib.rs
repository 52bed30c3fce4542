//! `ck-common` -- Shared types, traits, and errors for the castkit pipeline.
//!
//! This crate is the foundation the encoder and muxer crates depend on.
//! It defines the core abstractions:
//!
//! - **Types**: `Timestamp`, `Resolution`, `Rational`, `StreamId` (newtypes for safety)
//! - **Annex-B**: NAL unit splitting and length-prefix rewriting
//! - **Codecs**: `VideoCodec`, `AudioCodec`, `Codec` with parameter-set thresholds
//! - **Frames**: `RawFrame` (producer side) and `EncodedFrame` (access unit)
//! - **Pool**: `FramePool`, a typed free list for reusable frame wrappers
//! - **Traits**: `FrameSource`, `Encoder`, `Muxer`, `Sink`, `HwCodec`, `FrameListener`
//! - **Sinks**: `FileSink`, `MemorySink`
//! - **Errors**: `EncodeError`, `PoolError`, `SinkError`, `ConfigError` (thiserror-based)
//! - **Config**: `SessionConfig`, `MuxerConfig`, `PipelineConfig`

pub mod annexb;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod pool;
pub mod sink;
pub mod traits;
pub mod types;

// Re-export commonly used items at crate root
pub use codec::{AudioCodec, Codec, ContainerFormat, MediaKind, VideoCodec};
pub use config::{
    AudioEncoderConfig, InputMode, MediaConfig, MuxerConfig, PendingFramePolicy, PipelineConfig,
    SessionConfig, VideoEncoderConfig,
};
pub use error::{ConfigError, EncodeError, EncodeResult, PoolError, SinkError};
pub use frame::{EncodedFrame, FrameFormat, RawFrame, ReleaseFn};
pub use pool::{FramePool, PoolStats};
pub use sink::{FileSink, MemorySink};
pub use traits::{
    CodecCallbacks, CodecEvent, Encoder, FrameListener, FrameSource, HwCodec, Muxer,
    OutputInfo, Sink, SurfaceHandle,
};
pub use types::{Rational, Resolution, StreamId, Timestamp};
