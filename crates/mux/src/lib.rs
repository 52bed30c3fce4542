//! `ck-mux` -- Container muxers for the castkit pipeline.
//!
//! This crate combines encoded access units from one or more encoder
//! sessions into a playable container written to a [`ck_common::Sink`].
//!
//! # Architecture
//!
//! - **Pure Rust box writing**: every MP4 box is an [`Mp4Box`] variant that
//!   knows its own size, so parents are sized before anything is written
//! - **Track validity**: a track is described only after it has seen the
//!   codec's parameter sets (SPS/PPS/VPS, AV1 sequence header, ASC, OpusHead)
//! - **Fast start**: flat MP4 writes `moov` ahead of `mdat`
//! - **Fragmented MP4**: init segment, then `moof`/`mdat` pairs cut at key frames
//! - **FLV**: legacy AVC tags, enhanced `hvc1`/`av01` tags, AAC audio
//!
//! # Usage
//!
//! ```ignore
//! use ck_common::{ContainerFormat, FileSink, Muxer, MuxerConfig};
//! use ck_mux::{ContainerMuxer, MuxListener};
//!
//! let muxer = Arc::new(ContainerMuxer::new(
//!     FileSink::new("capture.mp4"),
//!     MuxerConfig::new(ContainerFormat::Mp4),
//! )?);
//! let video = muxer.add_stream(&video_format)?;
//! muxer.start_stream()?;
//!
//! // Hand the listener to an encoder session; frames flow straight in.
//! let listener = MuxListener::new(muxer.clone(), video);
//!
//! // ... after the sessions stop:
//! muxer.stop_stream()?;
//! ```

pub mod amf;
pub mod atoms;
pub mod boxes;
pub mod chunk;
pub mod container;
pub mod error;
pub mod flv;
pub mod listener;
pub mod mp4;
pub mod records;
pub mod tables;
pub mod track;

// Re-export primary API types
pub use boxes::Mp4Box;
pub use container::ContainerMuxer;
pub use error::{MuxError, MuxResult};
pub use flv::FlvMuxer;
pub use listener::MuxListener;
pub use mp4::{Mp4Muxer, MuxState};
pub use track::Track;
