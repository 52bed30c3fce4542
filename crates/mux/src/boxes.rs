//! MP4 box tree (ISO Base Media File Format, ISO 14496-12).
//!
//! Every box kind is a variant of [`Mp4Box`]. A node knows its own size
//! before anything is written: `size()` is header + own fields + children,
//! and `write()` emits exactly that many bytes. Parents therefore never
//! seek back to patch a size, and the whole tree can stream to a sink.
//!
//! ```text
//! ftyp
//! moov ─ mvhd
//!      ├ mvex ─ trex            (fragmented only)
//!      └ trak ─ tkhd
//!             └ mdia ─ mdhd, hdlr
//!                    └ minf ─ vmhd | smhd
//!                           ├ dinf ─ dref ─ url
//!                           └ stbl ─ stsd ─ avc1|hvc1|av01|mp4a|Opus ─ config
//!                                  ├ stts, ctts, stsc, stsz, stco|co64, stss
//! moof ─ mfhd
//!      └ traf ─ tfhd, tfdt, trun (fragmented only)
//! mdat
//! ```

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;

use crate::atoms::{
    encode_language, header_len_for, mp4_creation_time, write_fixed_point_16_16,
    write_fixed_point_8_8, write_header, write_unity_matrix, write_version_flags, write_zeros,
    CountingWriter, FourCC,
};
use crate::chunk::StorageForm;
use crate::error::MuxResult;
use crate::tables::{CttsEntry, StscEntry, SttsEntry, TrunSample};

/// `tkhd` flags: track_enabled | track_in_movie.
const TKHD_FLAGS: u32 = 0x000003;

/// `tfhd` flags: default-base-is-moof.
const TFHD_DEFAULT_BASE_IS_MOOF: u32 = 0x020000;

/// `trun` flags: data offset + per-sample duration, size, flags, composition offset.
const TRUN_FLAGS: u32 = 0x000001 | 0x000100 | 0x000200 | 0x000400 | 0x000800;

/// A box and, for container kinds, its children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mp4Box {
    Ftyp {
        major_brand: FourCC,
        minor_version: u32,
        compatible_brands: Vec<FourCC>,
    },
    Moov(Vec<Mp4Box>),
    Mvhd {
        timescale: u32,
        duration: u64,
        next_track_id: u32,
    },
    Trak(Vec<Mp4Box>),
    Tkhd {
        track_id: u32,
        duration: u64,
        width: u32,
        height: u32,
        is_audio: bool,
    },
    Mdia(Vec<Mp4Box>),
    Mdhd {
        timescale: u32,
        duration: u64,
        language: &'static str,
    },
    Hdlr {
        handler_type: FourCC,
        name: &'static str,
    },
    Minf(Vec<Mp4Box>),
    Vmhd,
    Smhd,
    Dinf(Vec<Mp4Box>),
    Dref(Vec<Mp4Box>),
    /// Self-contained data reference.
    Url,
    Stbl(Vec<Mp4Box>),
    Stsd(Vec<Mp4Box>),
    VisualSampleEntry {
        format: FourCC,
        width: u16,
        height: u16,
        children: Vec<Mp4Box>,
    },
    AudioSampleEntry {
        format: FourCC,
        channels: u16,
        sample_rate: u32,
        children: Vec<Mp4Box>,
    },
    /// Opaque configuration record (`avcC`, `hvcC`, `av1C`, `dOps`).
    Record { box_type: FourCC, payload: Vec<u8> },
    /// Elementary stream descriptor; a full box around the descriptor bytes.
    Esds(Vec<u8>),
    Stts(Vec<SttsEntry>),
    Ctts(Vec<CttsEntry>),
    Stsc(Vec<StscEntry>),
    /// `sample_size != 0` means every sample has that size and `sizes` is empty.
    Stsz {
        sample_size: u32,
        sample_count: u32,
        sizes: Vec<u32>,
    },
    Stco(Vec<u32>),
    Co64(Vec<u64>),
    Stss(Vec<u32>),
    Mvex(Vec<Mp4Box>),
    Trex { track_id: u32 },
    Moof(Vec<Mp4Box>),
    Mfhd { sequence_number: u32 },
    Traf(Vec<Mp4Box>),
    Tfhd { track_id: u32 },
    Tfdt { base_media_decode_time: u64 },
    Trun {
        data_offset: i32,
        samples: Vec<TrunSample>,
    },
    Mdat(MdatPayload),
}

impl Mp4Box {
    pub fn box_type(&self) -> FourCC {
        match self {
            Self::Ftyp { .. } => *b"ftyp",
            Self::Moov(_) => *b"moov",
            Self::Mvhd { .. } => *b"mvhd",
            Self::Trak(_) => *b"trak",
            Self::Tkhd { .. } => *b"tkhd",
            Self::Mdia(_) => *b"mdia",
            Self::Mdhd { .. } => *b"mdhd",
            Self::Hdlr { .. } => *b"hdlr",
            Self::Minf(_) => *b"minf",
            Self::Vmhd => *b"vmhd",
            Self::Smhd => *b"smhd",
            Self::Dinf(_) => *b"dinf",
            Self::Dref(_) => *b"dref",
            Self::Url => *b"url ",
            Self::Stbl(_) => *b"stbl",
            Self::Stsd(_) => *b"stsd",
            Self::VisualSampleEntry { format, .. } | Self::AudioSampleEntry { format, .. } => {
                *format
            }
            Self::Record { box_type, .. } => *box_type,
            Self::Esds(_) => *b"esds",
            Self::Stts(_) => *b"stts",
            Self::Ctts(_) => *b"ctts",
            Self::Stsc(_) => *b"stsc",
            Self::Stsz { .. } => *b"stsz",
            Self::Stco(_) => *b"stco",
            Self::Co64(_) => *b"co64",
            Self::Stss(_) => *b"stss",
            Self::Mvex(_) => *b"mvex",
            Self::Trex { .. } => *b"trex",
            Self::Moof(_) => *b"moof",
            Self::Mfhd { .. } => *b"mfhd",
            Self::Traf(_) => *b"traf",
            Self::Tfhd { .. } => *b"tfhd",
            Self::Tfdt { .. } => *b"tfdt",
            Self::Trun { .. } => *b"trun",
            Self::Mdat(_) => *b"mdat",
        }
    }

    /// `(version, flags)` for full boxes.
    fn full_box(&self) -> Option<(u8, u32)> {
        let wide = |duration: u64| u8::from(duration > u32::MAX as u64);
        match self {
            Self::Mvhd { duration, .. } | Self::Mdhd { duration, .. } => Some((wide(*duration), 0)),
            Self::Tkhd { duration, .. } => Some((wide(*duration), TKHD_FLAGS)),
            Self::Hdlr { .. }
            | Self::Smhd
            | Self::Dref(_)
            | Self::Stsd(_)
            | Self::Esds(_)
            | Self::Stts(_)
            | Self::Stsc(_)
            | Self::Stsz { .. }
            | Self::Stco(_)
            | Self::Co64(_)
            | Self::Stss(_)
            | Self::Trex { .. }
            | Self::Mfhd { .. } => Some((0, 0)),
            Self::Vmhd | Self::Url => Some((0, 1)),
            Self::Ctts(_) | Self::Tfdt { .. } => Some((1, 0)),
            Self::Tfhd { .. } => Some((0, TFHD_DEFAULT_BASE_IS_MOOF)),
            Self::Trun { .. } => Some((1, TRUN_FLAGS)),
            _ => None,
        }
    }

    pub fn children(&self) -> &[Mp4Box] {
        match self {
            Self::Moov(c)
            | Self::Trak(c)
            | Self::Mdia(c)
            | Self::Minf(c)
            | Self::Dinf(c)
            | Self::Dref(c)
            | Self::Stbl(c)
            | Self::Stsd(c)
            | Self::Mvex(c)
            | Self::Moof(c)
            | Self::Traf(c) => c,
            Self::VisualSampleEntry { children, .. } | Self::AudioSampleEntry { children, .. } => {
                children
            }
            _ => &[],
        }
    }

    /// Size of the fields between the (full) box header and the children.
    fn body_size(&self) -> u64 {
        let wide = |duration: u64| duration > u32::MAX as u64;
        match self {
            Self::Ftyp {
                compatible_brands, ..
            } => 8 + 4 * compatible_brands.len() as u64,
            Self::Mvhd { duration, .. } => {
                if wide(*duration) {
                    108
                } else {
                    96
                }
            }
            Self::Tkhd { duration, .. } => {
                if wide(*duration) {
                    92
                } else {
                    80
                }
            }
            Self::Mdhd { duration, .. } => {
                if wide(*duration) {
                    32
                } else {
                    20
                }
            }
            Self::Hdlr { name, .. } => 20 + name.len() as u64 + 1,
            Self::Vmhd => 8,
            Self::Smhd => 4,
            Self::Dref(_) | Self::Stsd(_) => 4,
            Self::VisualSampleEntry { .. } => 78,
            Self::AudioSampleEntry { .. } => 28,
            Self::Record { payload, .. } => payload.len() as u64,
            Self::Esds(descriptor) => descriptor.len() as u64,
            Self::Stts(entries) => 4 + 8 * entries.len() as u64,
            Self::Ctts(entries) => 4 + 8 * entries.len() as u64,
            Self::Stsc(entries) => 4 + 12 * entries.len() as u64,
            Self::Stsz {
                sample_size, sizes, ..
            } => {
                if *sample_size == 0 {
                    8 + 4 * sizes.len() as u64
                } else {
                    8
                }
            }
            Self::Stco(offsets) => 4 + 4 * offsets.len() as u64,
            Self::Co64(offsets) => 4 + 8 * offsets.len() as u64,
            Self::Stss(samples) => 4 + 4 * samples.len() as u64,
            Self::Trex { .. } => 20,
            Self::Mfhd { .. } | Self::Tfhd { .. } => 4,
            Self::Tfdt { .. } => 8,
            Self::Trun { samples, .. } => 8 + 16 * samples.len() as u64,
            Self::Mdat(payload) => payload.len(),
            Self::Moov(_)
            | Self::Trak(_)
            | Self::Mdia(_)
            | Self::Minf(_)
            | Self::Dinf(_)
            | Self::Url
            | Self::Stbl(_)
            | Self::Mvex(_)
            | Self::Moof(_)
            | Self::Traf(_) => 0,
        }
    }

    /// Total size including header and children.
    pub fn size(&self) -> u64 {
        let content = self.full_box().map_or(0, |_| 4)
            + self.body_size()
            + self.children().iter().map(Mp4Box::size).sum::<u64>();
        header_len_for(content) + content
    }

    /// Serialize the box and its children.
    pub fn write<W: Write + ?Sized>(&self, writer: &mut W) -> MuxResult<()> {
        let size = self.size();
        let mut w = CountingWriter::new(writer);
        write_header(&mut w, &self.box_type(), size)?;
        if let Some((version, flags)) = self.full_box() {
            write_version_flags(&mut w, version, flags)?;
        }
        self.write_body(&mut w)?;
        for child in self.children() {
            // Recurse through `dyn Write` so the writer type stays bounded.
            let dw: &mut dyn Write = &mut w;
            child.write(dw)?;
        }
        debug_assert_eq!(
            w.count(),
            size,
            "{} wrote a different size than it declared",
            String::from_utf8_lossy(&self.box_type())
        );
        Ok(())
    }

    fn write_body<W: Write>(&self, w: &mut W) -> MuxResult<()> {
        match self {
            Self::Ftyp {
                major_brand,
                minor_version,
                compatible_brands,
            } => {
                w.write_all(major_brand)?;
                w.write_u32::<BigEndian>(*minor_version)?;
                for brand in compatible_brands {
                    w.write_all(brand)?;
                }
            }
            Self::Mvhd {
                timescale,
                duration,
                next_track_id,
            } => {
                write_times(w, *duration, *timescale, None)?;
                write_fixed_point_16_16(w, 1.0)?; // rate
                write_fixed_point_8_8(w, 1.0)?; // volume
                write_zeros(w, 10)?; // reserved
                write_unity_matrix(w)?;
                write_zeros(w, 24)?; // pre_defined
                w.write_u32::<BigEndian>(*next_track_id)?;
            }
            Self::Tkhd {
                track_id,
                duration,
                width,
                height,
                is_audio,
            } => {
                write_times(w, *duration, 0, Some(*track_id))?;
                write_zeros(w, 8)?; // reserved
                w.write_u16::<BigEndian>(0)?; // layer
                w.write_u16::<BigEndian>(0)?; // alternate_group
                w.write_u16::<BigEndian>(if *is_audio { 0x0100 } else { 0 })?; // volume
                w.write_u16::<BigEndian>(0)?; // reserved
                write_unity_matrix(w)?;
                w.write_u32::<BigEndian>((*width).min(0xFFFF) << 16)?;
                w.write_u32::<BigEndian>((*height).min(0xFFFF) << 16)?;
            }
            Self::Mdhd {
                timescale,
                duration,
                language,
            } => {
                write_times(w, *duration, *timescale, None)?;
                w.write_u16::<BigEndian>(encode_language(language))?;
                w.write_u16::<BigEndian>(0)?; // pre_defined
            }
            Self::Hdlr { handler_type, name } => {
                w.write_u32::<BigEndian>(0)?; // pre_defined
                w.write_all(handler_type)?;
                write_zeros(w, 12)?; // reserved
                w.write_all(name.as_bytes())?;
                w.write_u8(0)?;
            }
            Self::Vmhd => write_zeros(w, 8)?, // graphicsmode + opcolor
            Self::Smhd => write_zeros(w, 4)?, // balance + reserved
            Self::Dref(entries) | Self::Stsd(entries) => {
                w.write_u32::<BigEndian>(entries.len() as u32)?;
            }
            Self::VisualSampleEntry { width, height, .. } => {
                write_zeros(w, 6)?; // reserved
                w.write_u16::<BigEndian>(1)?; // data_reference_index
                write_zeros(w, 16)?; // pre_defined + reserved
                w.write_u16::<BigEndian>(*width)?;
                w.write_u16::<BigEndian>(*height)?;
                w.write_u32::<BigEndian>(0x0048_0000)?; // horizresolution 72 dpi
                w.write_u32::<BigEndian>(0x0048_0000)?; // vertresolution 72 dpi
                write_zeros(w, 4)?; // reserved
                w.write_u16::<BigEndian>(1)?; // frame_count
                write_zeros(w, 32)?; // compressorname
                w.write_u16::<BigEndian>(0x0018)?; // depth
                w.write_i16::<BigEndian>(-1)?; // pre_defined
            }
            Self::AudioSampleEntry {
                channels,
                sample_rate,
                ..
            } => {
                write_zeros(w, 6)?; // reserved
                w.write_u16::<BigEndian>(1)?; // data_reference_index
                write_zeros(w, 8)?; // reserved
                w.write_u16::<BigEndian>(*channels)?;
                w.write_u16::<BigEndian>(16)?; // samplesize
                write_zeros(w, 4)?; // pre_defined + reserved
                // 16.16 field; tracks reject rates above 0xFFFF.
                w.write_u32::<BigEndian>((*sample_rate).min(0xFFFF) << 16)?;
            }
            Self::Record { payload, .. } => w.write_all(payload)?,
            Self::Esds(descriptor) => w.write_all(descriptor)?,
            Self::Stts(entries) => {
                w.write_u32::<BigEndian>(entries.len() as u32)?;
                for entry in entries {
                    w.write_u32::<BigEndian>(entry.count)?;
                    w.write_u32::<BigEndian>(entry.delta)?;
                }
            }
            Self::Ctts(entries) => {
                w.write_u32::<BigEndian>(entries.len() as u32)?;
                for entry in entries {
                    w.write_u32::<BigEndian>(entry.count)?;
                    w.write_i32::<BigEndian>(entry.offset)?;
                }
            }
            Self::Stsc(entries) => {
                w.write_u32::<BigEndian>(entries.len() as u32)?;
                for entry in entries {
                    w.write_u32::<BigEndian>(entry.first_chunk)?;
                    w.write_u32::<BigEndian>(entry.samples_per_chunk)?;
                    w.write_u32::<BigEndian>(entry.sample_description_index)?;
                }
            }
            Self::Stsz {
                sample_size,
                sample_count,
                sizes,
            } => {
                w.write_u32::<BigEndian>(*sample_size)?;
                w.write_u32::<BigEndian>(*sample_count)?;
                if *sample_size == 0 {
                    for size in sizes {
                        w.write_u32::<BigEndian>(*size)?;
                    }
                }
            }
            Self::Stco(offsets) => {
                w.write_u32::<BigEndian>(offsets.len() as u32)?;
                for offset in offsets {
                    w.write_u32::<BigEndian>(*offset)?;
                }
            }
            Self::Co64(offsets) => {
                w.write_u32::<BigEndian>(offsets.len() as u32)?;
                for offset in offsets {
                    w.write_u64::<BigEndian>(*offset)?;
                }
            }
            Self::Stss(samples) => {
                w.write_u32::<BigEndian>(samples.len() as u32)?;
                for sample in samples {
                    w.write_u32::<BigEndian>(*sample)?;
                }
            }
            Self::Trex { track_id } => {
                w.write_u32::<BigEndian>(*track_id)?;
                w.write_u32::<BigEndian>(1)?; // default_sample_description_index
                write_zeros(w, 12)?; // default duration, size, flags
            }
            Self::Mfhd { sequence_number } => w.write_u32::<BigEndian>(*sequence_number)?,
            Self::Tfhd { track_id } => w.write_u32::<BigEndian>(*track_id)?,
            Self::Tfdt {
                base_media_decode_time,
            } => w.write_u64::<BigEndian>(*base_media_decode_time)?,
            Self::Trun {
                data_offset,
                samples,
            } => {
                w.write_u32::<BigEndian>(samples.len() as u32)?;
                w.write_i32::<BigEndian>(*data_offset)?;
                for sample in samples {
                    w.write_u32::<BigEndian>(sample.duration)?;
                    w.write_u32::<BigEndian>(sample.size)?;
                    w.write_u32::<BigEndian>(sample.flags)?;
                    w.write_i32::<BigEndian>(sample.composition_offset)?;
                }
            }
            Self::Mdat(payload) => payload.write(w)?,
            Self::Moov(_)
            | Self::Trak(_)
            | Self::Mdia(_)
            | Self::Minf(_)
            | Self::Dinf(_)
            | Self::Url
            | Self::Stbl(_)
            | Self::Mvex(_)
            | Self::Moof(_)
            | Self::Traf(_) => {}
        }
        Ok(())
    }
}

/// creation/modification time, then either `track_id + reserved` (tkhd) or
/// `timescale`, then the duration; 32- or 64-bit by duration.
fn write_times<W: Write>(
    w: &mut W,
    duration: u64,
    timescale: u32,
    track_id: Option<u32>,
) -> MuxResult<()> {
    let now = mp4_creation_time();
    let wide = duration > u32::MAX as u64;
    for _ in 0..2 {
        if wide {
            w.write_u64::<BigEndian>(now)?;
        } else {
            w.write_u32::<BigEndian>(now.min(u32::MAX as u64) as u32)?;
        }
    }
    match track_id {
        Some(id) => {
            w.write_u32::<BigEndian>(id)?;
            w.write_u32::<BigEndian>(0)?; // reserved
        }
        None => w.write_u32::<BigEndian>(timescale)?,
    }
    if wide {
        w.write_u64::<BigEndian>(duration)?;
    } else {
        w.write_u32::<BigEndian>(duration as u32)?;
    }
    Ok(())
}

/// Sample bytes of an `mdat`, held as shared views and rewritten into their
/// storage form only while writing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MdatPayload {
    segments: Vec<(Bytes, StorageForm)>,
    len: u64,
}

impl MdatPayload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: Bytes, form: StorageForm) {
        self.len += form.stored_size(&data);
        self.segments.push((data, form));
    }

    /// Stored byte length.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn write<W: Write>(&self, w: &mut W) -> MuxResult<()> {
        for (data, form) in &self.segments {
            form.write(data, w)?;
        }
        Ok(())
    }
}

/// `ftyp` for a progressive (flat) file.
pub fn flat_ftyp() -> Mp4Box {
    Mp4Box::Ftyp {
        major_brand: *b"isom",
        minor_version: 0x200,
        compatible_brands: vec![*b"isom", *b"iso6", *b"mp41"],
    }
}

/// `ftyp` for a fragmented file.
pub fn fragmented_ftyp() -> Mp4Box {
    Mp4Box::Ftyp {
        major_brand: *b"iso6",
        minor_version: 0,
        compatible_brands: vec![*b"iso6", *b"mp41", *b"dash"],
    }
}

/// `dinf` with a single self-contained `url ` reference.
pub fn self_contained_dinf() -> Mp4Box {
    Mp4Box::Dinf(vec![Mp4Box::Dref(vec![Mp4Box::Url])])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    fn box_type_at(buf: &[u8], offset: usize) -> &[u8] {
        &buf[offset + 4..offset + 8]
    }

    fn box_size_at(buf: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
    }

    fn serialize(b: &Mp4Box) -> Vec<u8> {
        let mut buf = Vec::new();
        b.write(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_write_ftyp() {
        let buf = serialize(&flat_ftyp());
        assert_eq!(buf.len(), 28);
        assert_eq!(box_size_at(&buf, 0), 28);
        assert_eq!(box_type_at(&buf, 0), b"ftyp");
        assert_eq!(&buf[8..12], b"isom");
        assert_eq!(&buf[12..16], &[0x00, 0x00, 0x02, 0x00]);
        assert_eq!(&buf[16..20], b"isom");
    }

    #[test]
    fn test_mvhd_versions() {
        let short = Mp4Box::Mvhd {
            timescale: 1000,
            duration: 10_000,
            next_track_id: 3,
        };
        let buf = serialize(&short);
        assert_eq!(buf.len(), 108);
        assert_eq!(buf[8], 0); // version
        assert_eq!(&buf[104..108], &[0, 0, 0, 3]);

        let long = Mp4Box::Mvhd {
            timescale: 1000,
            duration: u32::MAX as u64 + 1,
            next_track_id: 2,
        };
        let buf = serialize(&long);
        assert_eq!(buf.len(), 120);
        assert_eq!(buf[8], 1);
    }

    #[test]
    fn test_tkhd_flags_and_dimensions() {
        let buf = serialize(&Mp4Box::Tkhd {
            track_id: 1,
            duration: 5000,
            width: 1920,
            height: 1080,
            is_audio: false,
        });
        assert_eq!(buf.len(), 92);
        assert_eq!(&buf[8..12], &[0, 0, 0, 3]);
        assert_eq!(&buf[20..24], &[0, 0, 0, 1]); // track_id
        assert_eq!(&buf[84..88], &(1920u32 << 16).to_be_bytes());
    }

    #[test]
    fn test_hdlr_handler_type() {
        let buf = serialize(&Mp4Box::Hdlr {
            handler_type: *b"soun",
            name: "SoundHandler",
        });
        // 8 header + 4 version/flags + 4 pre_defined
        assert_eq!(&buf[16..20], b"soun");
        assert_eq!(*buf.last().unwrap(), 0);
    }

    #[test]
    fn test_stsz_constant_size_omits_table() {
        let constant = Mp4Box::Stsz {
            sample_size: 512,
            sample_count: 20,
            sizes: vec![],
        };
        assert_eq!(serialize(&constant).len(), 20);

        let variable = Mp4Box::Stsz {
            sample_size: 0,
            sample_count: 3,
            sizes: vec![10, 20, 30],
        };
        let buf = serialize(&variable);
        assert_eq!(buf.len(), 32);
        assert_eq!(&buf[28..32], &[0, 0, 0, 30]);
    }

    #[test]
    fn test_ctts_is_version_one() {
        let buf = serialize(&Mp4Box::Ctts(vec![CttsEntry {
            count: 1,
            offset: -3000,
        }]));
        assert_eq!(buf[8], 1);
        assert_eq!(&buf[20..24], &(-3000i32).to_be_bytes());
    }

    #[test]
    fn test_nested_sample_entry_sizes() {
        let entry = Mp4Box::VisualSampleEntry {
            format: *b"avc1",
            width: 1280,
            height: 720,
            children: vec![Mp4Box::Record {
                box_type: *b"avcC",
                payload: vec![1, 2, 3, 4, 5],
            }],
        };
        let stsd = Mp4Box::Stsd(vec![entry]);
        let buf = serialize(&stsd);
        assert_eq!(box_type_at(&buf, 0), b"stsd");
        assert_eq!(&buf[12..16], &[0, 0, 0, 1]); // entry_count
        assert_eq!(box_type_at(&buf, 16), b"avc1");
        assert_eq!(box_size_at(&buf, 16) as usize, 8 + 78 + 13);
        assert_eq!(box_type_at(&buf, 16 + 86), b"avcC");
    }

    #[test]
    fn test_mdat_rewrites_annex_b() {
        let mut payload = MdatPayload::new();
        payload.push(
            Bytes::from_static(&[0, 0, 0, 1, 0x65, 0xAA, 0xBB]),
            StorageForm::LengthPrefixed,
        );
        payload.push(Bytes::from_static(&[7, 7]), StorageForm::Raw);
        assert_eq!(payload.len(), 7 + 2);

        let buf = serialize(&Mp4Box::Mdat(payload));
        assert_eq!(box_size_at(&buf, 0), 8 + 9);
        assert_eq!(&buf[8..12], &[0, 0, 0, 3]);
        assert_eq!(&buf[12..15], &[0x65, 0xAA, 0xBB]);
        assert_eq!(&buf[15..17], &[7, 7]);
    }

    #[test]
    fn test_deep_tree_writes_declared_sizes() {
        let moov = Mp4Box::Moov(vec![Mp4Box::Trak(vec![Mp4Box::Mdia(vec![Mp4Box::Minf(
            vec![self_contained_dinf(), Mp4Box::Stbl(vec![Mp4Box::Stss(vec![1, 5])])],
        )])])]);
        let buf = serialize(&moov);
        assert_eq!(buf.len() as u64, moov.size());
        assert_eq!(box_size_at(&buf, 0) as usize, buf.len());
        assert_eq!(box_type_at(&buf, 8), b"trak");
        assert_eq!(box_type_at(&buf, 16), b"mdia");
        assert_eq!(box_type_at(&buf, 24), b"minf");
        assert_eq!(box_type_at(&buf, 32), b"dinf");

        // Same bytes through an unsized writer.
        let mut out = Vec::new();
        let dw: &mut dyn Write = &mut out;
        moov.write(dw).unwrap();
        assert_eq!(out, buf);
    }

    #[test]
    fn test_dinf_tree() {
        let buf = serialize(&self_contained_dinf());
        assert_eq!(buf.len(), 8 + 8 + 4 + 4 + 12);
        assert_eq!(box_type_at(&buf, 8), b"dref");
        assert_eq!(box_type_at(&buf, 24), b"url ");
        assert_eq!(&buf[32..36], &[0, 0, 0, 1]);
    }

    fn header_leaf() -> impl Strategy<Value = Mp4Box> {
        prop_oneof![
            (any::<u32>(), any::<u64>()).prop_map(|(timescale, duration)| Mp4Box::Mvhd {
                timescale,
                duration,
                next_track_id: 2,
            }),
            (any::<u32>(), any::<u64>(), any::<bool>()).prop_map(|(track_id, duration, is_audio)| {
                Mp4Box::Tkhd {
                    track_id,
                    duration,
                    width: 640,
                    height: 480,
                    is_audio,
                }
            }),
            any::<u64>().prop_map(|duration| Mp4Box::Mdhd {
                timescale: 90_000,
                duration,
                language: "und",
            }),
            Just(Mp4Box::Hdlr {
                handler_type: *b"vide",
                name: "VideoHandler",
            }),
            Just(Mp4Box::Vmhd),
            Just(Mp4Box::Smhd),
            Just(Mp4Box::Url),
            vec(any::<u8>(), 0..64).prop_map(|payload| Mp4Box::Record {
                box_type: *b"hvcC",
                payload,
            }),
            vec(any::<u8>(), 0..64).prop_map(Mp4Box::Esds),
            any::<u64>().prop_map(|t| Mp4Box::Tfdt {
                base_media_decode_time: t
            }),
        ]
    }

    fn table_leaf() -> impl Strategy<Value = Mp4Box> {
        prop_oneof![
            vec((1u32..100, any::<u32>()), 0..16).prop_map(|runs| Mp4Box::Stts(
                runs.into_iter()
                    .map(|(count, delta)| SttsEntry { count, delta })
                    .collect()
            )),
            vec(any::<i32>(), 0..16).prop_map(|offsets| Mp4Box::Ctts(
                offsets
                    .into_iter()
                    .map(|offset| CttsEntry { count: 1, offset })
                    .collect()
            )),
            vec(1u32..50, 0..16).prop_map(|counts| Mp4Box::Stsc(
                crate::tables::sample_to_chunk(&counts)
            )),
            vec(any::<u32>(), 0..32).prop_map(|sizes| {
                let (sample_size, sizes_table) = crate::tables::sample_sizes(&sizes);
                Mp4Box::Stsz {
                    sample_size,
                    sample_count: sizes.len() as u32,
                    sizes: sizes_table,
                }
            }),
            vec(any::<u32>(), 0..16).prop_map(Mp4Box::Stco),
            vec(any::<u64>(), 0..16).prop_map(Mp4Box::Co64),
            vec(any::<u32>(), 0..16).prop_map(Mp4Box::Stss),
            (any::<i32>(), vec((any::<u32>(), any::<u32>(), any::<i32>()), 0..8)).prop_map(
                |(data_offset, samples)| Mp4Box::Trun {
                    data_offset,
                    samples: samples
                        .into_iter()
                        .map(|(duration, size, composition_offset)| TrunSample {
                            duration,
                            size,
                            flags: crate::tables::SYNC_SAMPLE_FLAGS,
                            composition_offset,
                        })
                        .collect(),
                }
            ),
            (vec(any::<u8>(), 0..128), any::<bool>()).prop_map(|(data, prefixed)| {
                let mut payload = MdatPayload::new();
                let form = if prefixed {
                    StorageForm::LengthPrefixed
                } else {
                    StorageForm::Raw
                };
                payload.push(Bytes::from(data), form);
                Mp4Box::Mdat(payload)
            }),
        ]
    }

    fn tree() -> impl Strategy<Value = Mp4Box> {
        prop_oneof![header_leaf(), table_leaf()].prop_recursive(4, 48, 6, |inner| {
            prop_oneof![
                vec(inner.clone(), 0..6).prop_map(Mp4Box::Trak),
                vec(inner.clone(), 0..6).prop_map(Mp4Box::Minf),
                vec(inner.clone(), 0..6).prop_map(Mp4Box::Stbl),
                vec(inner.clone(), 0..6).prop_map(Mp4Box::Traf),
                vec(inner.clone(), 0..4).prop_map(Mp4Box::Stsd),
                vec(inner.clone(), 0..4).prop_map(|children| Mp4Box::VisualSampleEntry {
                    format: *b"avc1",
                    width: 320,
                    height: 240,
                    children,
                }),
                vec(inner, 0..4).prop_map(|children| Mp4Box::AudioSampleEntry {
                    format: *b"mp4a",
                    channels: 2,
                    sample_rate: 48_000,
                    children,
                }),
            ]
        })
    }

    proptest! {
        #[test]
        fn size_equals_bytes_written(root in tree()) {
            // Always at least three levels deep.
            let tree = Mp4Box::Moov(vec![Mp4Box::Trak(vec![Mp4Box::Mdia(vec![root])])]);
            let buf = serialize(&tree);
            prop_assert_eq!(buf.len() as u64, tree.size());
            prop_assert_eq!(box_size_at(&buf, 0) as usize, buf.len());
        }
    }
}
