//! Samples, chunks, and how sample bytes are stored in a container.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;
use ck_common::{annexb, Codec, EncodedFrame};

use crate::error::MuxResult;

/// How a codec's access units are laid out inside `mdat` (or an FLV tag).
///
/// Both the size pass and the write pass go through this type, so a chunk
/// offset can never disagree with the bytes actually written.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StorageForm {
    /// Bytes are copied unchanged.
    Raw,
    /// Annex-B NAL units are rewritten with 4-byte length prefixes.
    LengthPrefixed,
}

impl StorageForm {
    pub fn for_codec(codec: Codec) -> Self {
        if codec.is_annex_b() {
            Self::LengthPrefixed
        } else {
            Self::Raw
        }
    }

    /// Stored size of `data`.
    pub fn stored_size(self, data: &[u8]) -> u64 {
        match self {
            Self::Raw => data.len() as u64,
            Self::LengthPrefixed => annexb::length_prefixed_size(data) as u64,
        }
    }

    /// Write `data` in this form.
    pub fn write<W: Write>(self, data: &[u8], writer: &mut W) -> MuxResult<()> {
        match self {
            Self::Raw => writer.write_all(data)?,
            Self::LengthPrefixed => {
                for nal in annexb::nal_units(data) {
                    writer.write_u32::<BigEndian>(nal.len() as u32)?;
                    writer.write_all(nal)?;
                }
            }
        }
        Ok(())
    }
}

/// One access unit owned by the muxer.
///
/// The frame's bytes are copied at ingestion, so the hardware slot can be
/// released as soon as `write` returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub data: Bytes,
    pub form: StorageForm,
    /// Size once stored, see [`StorageForm::stored_size`].
    pub size: u32,
    pub pts_us: i64,
    pub dts_us: i64,
    pub is_sync: bool,
}

impl Sample {
    pub fn from_frame(frame: &EncodedFrame) -> Self {
        let form = StorageForm::for_codec(frame.format().codec);
        let data = Bytes::copy_from_slice(frame.data());
        let size = form.stored_size(&data).min(u32::MAX as u64) as u32;
        Self {
            data,
            form,
            size,
            pts_us: frame.pts().as_micros(),
            dts_us: frame.decode_ts().as_micros(),
            is_sync: frame.is_key_frame() || !frame.format().codec.is_video(),
        }
    }
}

/// A contiguous run of samples within a track, written as one block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Chunk {
    samples: Vec<Sample>,
    size: u64,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: Sample) {
        self.size += sample.size as u64;
        self.samples.push(sample);
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<Sample> {
        self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Stored byte size of all samples.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Decode-time span from the first to the last sample.
    pub fn span_us(&self) -> i64 {
        match (self.samples.first(), self.samples.last()) {
            (Some(first), Some(last)) => last.dts_us - first.dts_us,
            _ => 0,
        }
    }
}
