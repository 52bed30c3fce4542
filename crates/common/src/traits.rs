//! Capability traits connecting the pipeline stages.
//!
//! Each stage programs against one narrow trait; the pipeline is wired up
//! explicitly by whoever owns the stages:
//!
//! ```text
//! FrameSource ──> Encoder (session over an HwCodec) ──> FrameListener
//!                                                          │
//!                                              Muxer::write ┘──> Sink
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::config::SessionConfig;
use crate::error::{EncodeError, EncodeResult, SinkError};
use crate::frame::{EncodedFrame, FrameFormat, RawFrame};
use crate::types::{StreamId, Timestamp};

/// Opaque handle to a hardware input surface (zero-copy input mode).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SurfaceHandle(pub u64);

/// Metadata the hardware reports alongside an output slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputInfo {
    /// Presentation timestamp in microseconds, as reported (not yet repaired).
    pub pts_us: i64,
    /// Decode timestamp, when the codec reorders frames.
    pub dts_us: Option<i64>,
    /// Payload size in bytes.
    pub size: usize,
    pub is_key_frame: bool,
    /// The slot carries codec configuration (parameter sets), not a frame.
    pub is_codec_config: bool,
    pub is_end_of_stream: bool,
}

/// An event raised by the hardware on its own thread.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecEvent {
    /// An input slot is free and waiting for data.
    InputAvailable(usize),
    /// An output slot holds encoded data.
    OutputAvailable { index: usize, info: OutputInfo },
    /// The codec hit an internal fault.
    Error(EncodeError),
}

/// Sink for hardware events, handed to the codec at configure time.
///
/// Posting must never block the hardware thread.
#[derive(Clone)]
pub struct CodecCallbacks {
    post: Arc<dyn Fn(CodecEvent) + Send + Sync>,
}

impl CodecCallbacks {
    pub fn new(post: impl Fn(CodecEvent) + Send + Sync + 'static) -> Self {
        Self {
            post: Arc::new(post),
        }
    }

    pub fn post(&self, event: CodecEvent) {
        (self.post)(event)
    }

    pub fn input_available(&self, index: usize) {
        self.post(CodecEvent::InputAvailable(index));
    }

    pub fn output_available(&self, index: usize, info: OutputInfo) {
        self.post(CodecEvent::OutputAvailable { index, info });
    }

    pub fn error(&self, error: EncodeError) {
        self.post(CodecEvent::Error(error));
    }
}

impl fmt::Debug for CodecCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecCallbacks").finish_non_exhaustive()
    }
}

/// Hardware codec adapter.
///
/// Methods take `&self`: the hardware is driven from the session actor while
/// its callbacks fire from a hardware-owned thread, so implementations keep
/// their own internal synchronization.
pub trait HwCodec: Send + Sync {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Bind the instance to an output format.
    ///
    /// `callbacks` is `Some` for asynchronous operation; `None` selects
    /// synchronous mode, where the caller polls `dequeue_input`/`dequeue_output`.
    fn configure(&self, config: &SessionConfig, callbacks: Option<CodecCallbacks>)
        -> EncodeResult<()>;

    /// Create the input surface for `InputMode::Surface`.
    fn create_input_surface(&self) -> EncodeResult<SurfaceHandle>;

    /// Return a surface created by `create_input_surface`.
    fn release_surface(&self, surface: SurfaceHandle);

    fn start(&self) -> EncodeResult<()>;

    /// Stop and return to the un-started (configured) hardware state.
    fn stop(&self) -> EncodeResult<()>;

    /// Discard queued work but keep the hardware running.
    fn flush(&self) -> EncodeResult<()>;

    /// Return to the unconfigured state.
    fn reset(&self) -> EncodeResult<()>;

    /// Free every hardware resource. Must be safe to call more than once.
    fn release(&self);

    /// Byte capacity of one input slot.
    fn input_capacity(&self) -> usize;

    /// Copy `data` into input slot `index` and submit it. An empty `data`
    /// submits the slot without payload.
    fn queue_input(
        &self,
        index: usize,
        data: &[u8],
        pts: Timestamp,
        end_of_stream: bool,
    ) -> EncodeResult<()>;

    /// Zero-copy view of output slot `index`.
    fn output_buffer(&self, index: usize) -> EncodeResult<Bytes>;

    /// Hand output slot `index` back to the hardware.
    fn release_output(&self, index: usize) -> EncodeResult<()>;

    /// Synchronous mode: take a free input slot, if any.
    fn dequeue_input(&self) -> EncodeResult<Option<usize>>;

    /// Synchronous mode: take a filled output slot, if any.
    fn dequeue_output(&self) -> EncodeResult<Option<(usize, OutputInfo)>>;

    fn request_key_frame(&self) -> EncodeResult<()>;

    fn set_bitrate(&self, bitrate: u32) -> EncodeResult<()>;
}

/// Producer of raw frames for buffer-backed encoding.
pub trait FrameSource: Send {
    /// Fill `frame` with the next sample for an input slot of `capacity` bytes.
    ///
    /// Returns `false` when no frame is ready; the slot is then submitted empty.
    fn fill_frame(&mut self, frame: &mut RawFrame, capacity: usize) -> bool;
}

/// The single downstream consumer of an encoder session.
pub trait FrameListener: Send {
    /// Take ownership of an encoded frame. Closing (or dropping) it releases
    /// the hardware slot.
    fn on_frame(&mut self, frame: EncodedFrame);

    /// Called once per failure episode.
    fn on_error(&mut self, error: &EncodeError);
}

/// The encoder session surface.
pub trait Encoder: Send + Sync {
    fn configure(&self, config: SessionConfig) -> EncodeResult<()>;
    fn start_stream(&self) -> EncodeResult<()>;
    fn stop_stream(&self) -> EncodeResult<()>;
    fn reset(&self) -> EncodeResult<()>;
    fn release(&self) -> EncodeResult<()>;
    fn request_key_frame(&self) -> EncodeResult<()>;
    fn set_bitrate(&self, bitrate: u32) -> EncodeResult<()>;
}

/// Container writer.
pub trait Muxer: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Register a stream and return its id.
    fn add_stream(&self, format: &FrameFormat) -> Result<StreamId, Self::Error>;

    /// Ingest one access unit for `stream`.
    fn write(&self, frame: &EncodedFrame, stream: StreamId) -> Result<(), Self::Error>;

    fn start_stream(&self) -> Result<(), Self::Error>;

    /// Flush everything and finish the container.
    fn stop_stream(&self) -> Result<(), Self::Error>;
}

/// Byte destination for a muxer.
pub trait Sink: Send {
    fn open(&mut self) -> Result<(), SinkError>;
    fn write(&mut self, data: &[u8]) -> Result<(), SinkError>;
    fn close(&mut self) -> Result<(), SinkError>;
    fn bytes_written(&self) -> u64;
}
