//! `ck-encoder` -- Hardware encoder session management.
//!
//! Wraps a hardware codec (anything implementing [`ck_common::HwCodec`]) in
//! a session that owns the lifecycle, feeds input slots, and turns output
//! slots into [`ck_common::EncodedFrame`]s for a single listener.
//!
//! # Architecture
//!
//! - [`state`] -- Lifecycle states and the pure transition table
//! - [`session`] -- `EncoderSession`: actor thread, output protocol, fault recovery
//! - [`timestamp`] -- Monotonic timestamp repair
//! - [`listener`] -- Channel-backed `FrameListener`
//! - [`loopback`] -- `LoopbackCodec`, a software `HwCodec`
//! - [`error`] -- Slot bookkeeping errors
//!
//! # Encode Pipeline
//!
//! ```text
//! FrameSource --fill_frame--> input slot
//!   --> HwCodec (hardware thread)
//!     --> output slot event --> session actor
//!       --> parameter sets captured, timestamps repaired
//!         --> EncodedFrame --> FrameListener (e.g. a muxer stream)
//!           --> close() hands the slot back
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use ck_encoder::{EncoderSession, LoopbackCodec};
//! use ck_common::{Encoder, SessionConfig};
//!
//! let session = EncoderSession::builder(Arc::new(LoopbackCodec::default()), Box::new(listener))
//!     .source(Box::new(source))
//!     .config(SessionConfig::video(video_config))
//!     .build()?;
//! session.start_stream()?;
//! ```

pub mod error;
pub mod listener;
pub mod loopback;
pub mod session;
pub mod state;
pub mod timestamp;

pub use error::SlotError;
pub use listener::{ChannelListener, SessionOutput};
pub use loopback::{LoopbackCodec, LoopbackOptions, LoopbackStats};
pub use session::{DriveMode, EncoderSession, SessionBuilder, SessionStats};
pub use state::SessionState;
pub use timestamp::MonotonicTimestamps;
