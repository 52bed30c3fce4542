//! Frames flowing through the pipeline.
//!
//! - [`RawFrame`]: audio/video data before encoding, owned by the producer
//!   until handed to the encoder session.
//! - [`EncodedFrame`]: one access unit emitted by the encoder, owned by the
//!   single downstream consumer until it calls [`EncodedFrame::close`].
//!
//! Both carry a release closure. The closure runs exactly once: explicitly
//! (`release` / `close`) or, failing that, on drop.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::Codec;
use crate::types::{Rational, Resolution, Timestamp};

/// Callback run when a frame's backing buffer may be reused.
pub type ReleaseFn = Box<dyn FnOnce() + Send>;

/// A raw (unencoded) audio/video sample.
///
/// `RawFrame` is `Default` so it can live in a [`crate::FramePool`]; a pooled
/// wrapper must be [`refill`](Self::refill)ed before reuse.
#[derive(Default)]
pub struct RawFrame {
    data: Bytes,
    pts: Timestamp,
    on_release: Option<ReleaseFn>,
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>, pts: Timestamp) -> Self {
        Self {
            data: data.into(),
            pts,
            on_release: None,
        }
    }

    /// Attach the callback run once the consumer is done with the buffer.
    pub fn with_release(mut self, on_release: ReleaseFn) -> Self {
        self.on_release = Some(on_release);
        self
    }

    /// Reassign every field of a (possibly recycled) wrapper.
    ///
    /// A pending release callback from the previous use is run first so it
    /// can never leak into the new frame.
    pub fn refill(&mut self, data: Bytes, pts: Timestamp, on_release: Option<ReleaseFn>) {
        self.release();
        self.data = data;
        self.pts = pts;
        self.on_release = on_release;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn pts(&self) -> Timestamp {
        self.pts
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether a release callback is still pending.
    pub fn has_pending_release(&self) -> bool {
        self.on_release.is_some()
    }

    /// Run the release callback (once) and drop the buffer view.
    pub fn release(&mut self) {
        self.data = Bytes::new();
        self.pts = Timestamp::ZERO;
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("len", &self.data.len())
            .field("pts", &self.pts)
            .field("pending_release", &self.on_release.is_some())
            .finish()
    }
}

/// Format metadata valid at the time a frame was encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameFormat {
    pub codec: Codec,
    /// Video only.
    pub resolution: Option<Resolution>,
    /// Video only.
    pub frame_rate: Option<Rational>,
    /// Audio only.
    pub sample_rate: Option<u32>,
    /// Audio only.
    pub channels: Option<u16>,
    /// Target bitrate in bits/sec at encode time.
    pub bitrate: u32,
}

impl FrameFormat {
    pub fn video(codec: crate::VideoCodec, resolution: Resolution, frame_rate: Rational) -> Self {
        Self {
            codec: Codec::Video(codec),
            resolution: Some(resolution),
            frame_rate: Some(frame_rate),
            sample_rate: None,
            channels: None,
            bitrate: 0,
        }
    }

    pub fn audio(codec: crate::AudioCodec, sample_rate: u32, channels: u16) -> Self {
        Self {
            codec: Codec::Audio(codec),
            resolution: None,
            frame_rate: None,
            sample_rate: Some(sample_rate),
            channels: Some(channels),
            bitrate: 0,
        }
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }
}

/// One encoded access unit.
///
/// The buffer is a zero-copy view of a hardware output slot. The slot is
/// handed back to the hardware when the frame is closed (or dropped), so a
/// consumer that needs the bytes afterwards must copy them first.
pub struct EncodedFrame {
    data: Bytes,
    pts: Timestamp,
    dts: Option<Timestamp>,
    is_key_frame: bool,
    extras: Option<Arc<[Bytes]>>,
    format: Arc<FrameFormat>,
    on_close: Option<ReleaseFn>,
}

impl EncodedFrame {
    pub fn new(data: impl Into<Bytes>, pts: Timestamp, format: Arc<FrameFormat>) -> Self {
        Self {
            data: data.into(),
            pts,
            dts: None,
            is_key_frame: false,
            extras: None,
            format,
            on_close: None,
        }
    }

    pub fn with_dts(mut self, dts: Timestamp) -> Self {
        self.dts = Some(dts);
        self
    }

    pub fn with_key_frame(mut self, is_key_frame: bool) -> Self {
        self.is_key_frame = is_key_frame;
        self
    }

    /// Attach codec parameter sets, one buffer per set (e.g. SPS, PPS).
    pub fn with_extras(mut self, extras: Arc<[Bytes]>) -> Self {
        self.extras = Some(extras);
        self
    }

    pub fn with_release(mut self, on_close: ReleaseFn) -> Self {
        self.on_close = Some(on_close);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn pts(&self) -> Timestamp {
        self.pts
    }

    pub fn dts(&self) -> Option<Timestamp> {
        self.dts
    }

    /// Decode timestamp, falling back to the presentation timestamp.
    pub fn decode_ts(&self) -> Timestamp {
        self.dts.unwrap_or(self.pts)
    }

    pub fn is_key_frame(&self) -> bool {
        self.is_key_frame
    }

    pub fn extras(&self) -> Option<&[Bytes]> {
        self.extras.as_deref()
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn format_arc(&self) -> Arc<FrameFormat> {
        self.format.clone()
    }

    /// Signal that the consumer is done; releases the hardware slot.
    pub fn close(mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl Drop for EncodedFrame {
    fn drop(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
    }
}

impl fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("codec", &self.format.codec)
            .field("len", &self.data.len())
            .field("pts", &self.pts)
            .field("dts", &self.dts)
            .field("key", &self.is_key_frame)
            .field("extras", &self.extras.as_ref().map(|e| e.len()))
            .finish()
    }
}
