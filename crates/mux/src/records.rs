//! Decoder configuration records built from a track's parameter sets.
//!
//! The same record bodies go into an MP4 sample entry (`avcC`, `hvcC`,
//! `av1C`, `esds`, `dOps`) and into an FLV sequence-start tag.

use bytes::Bytes;
use ck_common::annexb;
use ck_common::{AudioCodec, Codec, VideoCodec};

use crate::atoms::{descr_length_size, write_descr_length, FourCC};
use crate::error::{MuxError, MuxResult};

/// A codec's decoder configuration, ready to wrap in a box or a tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderConfig {
    /// MP4 sample entry format (`avc1`, `hvc1`, `av01`, `mp4a`, `Opus`).
    pub sample_entry: FourCC,
    /// Configuration box type (`avcC`, `hvcC`, `av1C`, `esds`, `dOps`).
    pub box_type: FourCC,
    /// Box payload. For `esds` this is the descriptor that follows the
    /// version/flags word.
    pub payload: Vec<u8>,
}

/// Build the decoder configuration for `codec` from its parameter sets.
///
/// # Errors
/// `MuxError::InvalidParameterSets` if a required parameter set is missing
/// or malformed; `MuxError::InvalidConfig` for codecs no container here carries.
pub fn decoder_config(codec: Codec, extras: &[Bytes], bitrate: u32) -> MuxResult<DecoderConfig> {
    let (sample_entry, box_type, payload) = match codec {
        Codec::Video(VideoCodec::H264) => (*b"avc1", *b"avcC", avc_decoder_config(extras)?),
        Codec::Video(VideoCodec::H265) => (*b"hvc1", *b"hvcC", hevc_decoder_config(extras)?),
        Codec::Video(VideoCodec::Av1) => (*b"av01", *b"av1C", av1_codec_config(extras)?),
        Codec::Audio(AudioCodec::Aac) => (*b"mp4a", *b"esds", es_descriptor(first(extras)?, bitrate)),
        Codec::Audio(AudioCodec::Opus) => (*b"Opus", *b"dOps", opus_specific(first(extras)?)?),
        Codec::Video(VideoCodec::Vp9) | Codec::Audio(AudioCodec::Mp3) => {
            return Err(MuxError::InvalidConfig(format!(
                "{} has no decoder configuration record",
                codec.display_name()
            )));
        }
    };
    Ok(DecoderConfig {
        sample_entry,
        box_type,
        payload,
    })
}

fn first(extras: &[Bytes]) -> MuxResult<&[u8]> {
    extras
        .first()
        .map(|b| &b[..])
        .filter(|b| !b.is_empty())
        .ok_or_else(|| MuxError::InvalidParameterSets("empty codec configuration".into()))
}

/// Parameter sets may arrive bare or still carrying a start code.
fn bare_nal(data: &[u8]) -> &[u8] {
    annexb::nal_units(data).next().unwrap_or(data)
}

fn find_nal<'a>(
    extras: &'a [Bytes],
    nal_type: impl Fn(&[u8]) -> Option<u8>,
    wanted: u8,
    name: &str,
) -> MuxResult<&'a [u8]> {
    extras
        .iter()
        .map(|e| bare_nal(e))
        .find(|nal| nal_type(nal) == Some(wanted))
        .ok_or_else(|| MuxError::InvalidParameterSets(format!("missing {name}")))
}

fn push_u16_prefixed(out: &mut Vec<u8>, nal: &[u8]) -> MuxResult<()> {
    let len = u16::try_from(nal.len()).map_err(|_| {
        MuxError::InvalidParameterSets(format!("parameter set of {} bytes", nal.len()))
    })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(nal);
    Ok(())
}

/// AVCDecoderConfigurationRecord (ISO 14496-15 §5.3.3).
pub fn avc_decoder_config(extras: &[Bytes]) -> MuxResult<Vec<u8>> {
    let sps = find_nal(extras, annexb::h264_nal_type, 7, "SPS")?;
    let pps = find_nal(extras, annexb::h264_nal_type, 8, "PPS")?;
    if sps.len() < 4 {
        return Err(MuxError::InvalidParameterSets(format!(
            "SPS of {} bytes",
            sps.len()
        )));
    }
    let profile = sps[1];

    let mut out = Vec::with_capacity(16 + sps.len() + pps.len());
    out.push(1); // configurationVersion
    out.push(profile); // AVCProfileIndication
    out.push(sps[2]); // profile_compatibility
    out.push(sps[3]); // AVCLevelIndication
    out.push(0xFF); // lengthSizeMinusOne = 3
    out.push(0xE1); // one SPS
    push_u16_prefixed(&mut out, sps)?;
    out.push(1); // one PPS
    push_u16_prefixed(&mut out, pps)?;
    if matches!(profile, 100 | 110 | 122 | 144) {
        // 4:2:0, 8-bit, no SPS extensions.
        out.extend_from_slice(&[0xFD, 0xF8, 0xF8, 0x00]);
    }
    Ok(out)
}

/// HEVCDecoderConfigurationRecord (ISO 14496-15 §8.3.3) with one VPS, SPS
/// and PPS array. Profile, tier and level are copied from the SPS.
pub fn hevc_decoder_config(extras: &[Bytes]) -> MuxResult<Vec<u8>> {
    let vps = find_nal(extras, annexb::h265_nal_type, 32, "VPS")?;
    let sps = find_nal(extras, annexb::h265_nal_type, 33, "SPS")?;
    let pps = find_nal(extras, annexb::h265_nal_type, 34, "PPS")?;

    let rbsp = annexb::unescape_rbsp(sps);
    // NAL header (2) + sub-layer byte (1) + general profile_tier_level (12).
    if rbsp.len() < 15 {
        return Err(MuxError::InvalidParameterSets(format!(
            "SPS of {} bytes",
            rbsp.len()
        )));
    }
    let max_sub_layers = ((rbsp[2] >> 1) & 0x07) + 1;
    let temporal_id_nested = rbsp[2] & 0x01;
    let ptl = &rbsp[3..15];

    let mut out = Vec::with_capacity(40 + vps.len() + sps.len() + pps.len());
    out.push(1); // configurationVersion
    out.extend_from_slice(ptl);
    out.extend_from_slice(&0xF000u16.to_be_bytes()); // min_spatial_segmentation_idc
    out.push(0xFC); // parallelismType
    out.push(0xFD); // chromaFormat 4:2:0
    out.push(0xF8); // bitDepthLumaMinus8
    out.push(0xF8); // bitDepthChromaMinus8
    out.extend_from_slice(&0u16.to_be_bytes()); // avgFrameRate
    out.push((max_sub_layers << 3) | (temporal_id_nested << 2) | 0x03);
    out.push(3); // numOfArrays
    for (nal_type, nal) in [(32u8, vps), (33, sps), (34, pps)] {
        out.push(0x80 | nal_type); // array_completeness = 1
        out.extend_from_slice(&1u16.to_be_bytes());
        push_u16_prefixed(&mut out, nal)?;
    }
    Ok(out)
}

/// AV1CodecConfigurationRecord followed by the sequence header OBU.
pub fn av1_codec_config(extras: &[Bytes]) -> MuxResult<Vec<u8>> {
    let obu = first(extras)?;
    let header = parse_av1_sequence_header(obu)?;
    let (subsampling_x, subsampling_y) = match header.profile {
        0 => (1, 1),
        1 => (0, 0),
        _ => (1, 0),
    };

    let mut out = Vec::with_capacity(4 + obu.len());
    out.push(0x81); // marker + version 1
    out.push((header.profile << 5) | header.level);
    out.push((header.tier << 7) | (subsampling_x << 3) | (subsampling_y << 2));
    out.push(0); // no initial_presentation_delay
    out.extend_from_slice(obu);
    Ok(out)
}

/// Profile, level and tier of operating point 0.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Av1SequenceInfo {
    pub profile: u8,
    pub level: u8,
    pub tier: u8,
}

/// Read the fields `av1C` needs from a sequence header OBU.
pub fn parse_av1_sequence_header(obu: &[u8]) -> MuxResult<Av1SequenceInfo> {
    let invalid = |what: &str| MuxError::InvalidParameterSets(format!("AV1 sequence header: {what}"));

    let &obu_header = obu.first().ok_or_else(|| invalid("empty"))?;
    if (obu_header >> 3) & 0x0F != 1 {
        return Err(invalid("not a sequence header OBU"));
    }
    let mut pos = 1 + usize::from(obu_header & 0x04 != 0);
    if obu_header & 0x02 != 0 {
        let (_, len) = read_leb128(obu.get(pos..).unwrap_or_default()).ok_or_else(|| invalid("bad size"))?;
        pos += len;
    }
    let payload = obu.get(pos..).ok_or_else(|| invalid("truncated"))?;
    let mut bits = BitReader::new(payload);
    let truncated = || invalid("truncated");

    let profile = bits.read(3).ok_or_else(truncated)? as u8;
    let _still_picture = bits.read(1).ok_or_else(truncated)?;
    let reduced_still_picture_header = bits.read(1).ok_or_else(truncated)? == 1;
    if reduced_still_picture_header {
        let level = bits.read(5).ok_or_else(truncated)? as u8;
        return Ok(Av1SequenceInfo {
            profile,
            level,
            tier: 0,
        });
    }

    if bits.read(1).ok_or_else(truncated)? == 1 {
        // timing_info
        bits.skip(64).ok_or_else(truncated)?;
        if bits.read(1).ok_or_else(truncated)? == 1 {
            bits.read_uvlc().ok_or_else(truncated)?;
        }
        if bits.read(1).ok_or_else(truncated)? == 1 {
            // decoder_model_info
            bits.skip(5 + 32 + 5 + 5).ok_or_else(truncated)?;
        }
    }
    let _initial_display_delay_present = bits.read(1).ok_or_else(truncated)?;
    let _operating_points = bits.read(5).ok_or_else(truncated)?;
    let _idc = bits.read(12).ok_or_else(truncated)?;
    let level = bits.read(5).ok_or_else(truncated)? as u8;
    let tier = if level > 7 {
        bits.read(1).ok_or_else(truncated)? as u8
    } else {
        0
    };
    Ok(Av1SequenceInfo {
        profile,
        level,
        tier,
    })
}

/// Decode an unsigned LEB128 value; returns (value, bytes consumed).
fn read_leb128(data: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in data.iter().take(8).enumerate() {
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read(&mut self, count: u32) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            let byte = *self.data.get(self.pos / 8)?;
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            value = (value << 1) | u32::from(bit);
            self.pos += 1;
        }
        Some(value)
    }

    fn skip(&mut self, count: usize) -> Option<()> {
        if self.pos + count > self.data.len() * 8 {
            return None;
        }
        self.pos += count;
        Some(())
    }

    fn read_uvlc(&mut self) -> Option<u32> {
        let mut leading_zeros = 0;
        while self.read(1)? == 0 {
            leading_zeros += 1;
            if leading_zeros >= 32 {
                return Some(u32::MAX);
            }
        }
        Some(self.read(leading_zeros)? + ((1u32 << leading_zeros) - 1))
    }
}

/// ES_Descriptor carrying an AudioSpecificConfig (ISO 14496-1 §7.2.6.5).
pub fn es_descriptor(audio_specific_config: &[u8], bitrate: u32) -> Vec<u8> {
    let dsi_len = audio_specific_config.len();
    let dsi_total = 1 + descr_length_size(dsi_len) + dsi_len;
    let dcd_len = 13 + dsi_total;
    let dcd_total = 1 + descr_length_size(dcd_len) + dcd_len;
    let sl_total = 3;
    let es_len = 3 + dcd_total + sl_total;

    let mut out = Vec::with_capacity(1 + descr_length_size(es_len) + es_len);
    out.push(0x03); // ES_DescrTag
    write_descr_length(&mut out, es_len);
    out.extend_from_slice(&1u16.to_be_bytes()); // ES_ID
    out.push(0); // flags + stream priority

    out.push(0x04); // DecoderConfigDescrTag
    write_descr_length(&mut out, dcd_len);
    out.push(0x40); // Audio ISO/IEC 14496-3
    out.push(0x15); // AudioStream, upstream = 0, reserved = 1
    out.extend_from_slice(&[0, 0, 0]); // bufferSizeDB
    out.extend_from_slice(&bitrate.to_be_bytes()); // maxBitrate
    out.extend_from_slice(&bitrate.to_be_bytes()); // avgBitrate

    out.push(0x05); // DecSpecificInfoTag
    write_descr_length(&mut out, dsi_len);
    out.extend_from_slice(audio_specific_config);

    out.push(0x06); // SLConfigDescrTag
    write_descr_length(&mut out, 1);
    out.push(0x02); // predefined = MP4
    out
}

/// OpusSpecificBox payload converted from an `OpusHead` packet.
pub fn opus_specific(head: &[u8]) -> MuxResult<Vec<u8>> {
    if head.len() < 19 || &head[..8] != b"OpusHead" {
        return Err(MuxError::InvalidParameterSets(
            "codec configuration is not an OpusHead".into(),
        ));
    }
    let channels = head[9];
    let pre_skip = u16::from_le_bytes([head[10], head[11]]);
    let input_rate = u32::from_le_bytes([head[12], head[13], head[14], head[15]]);
    let gain = i16::from_le_bytes([head[16], head[17]]);
    let mapping_family = head[18];

    let mut out = Vec::with_capacity(11 + 2 + channels as usize);
    out.push(0); // Version
    out.push(channels);
    out.extend_from_slice(&pre_skip.to_be_bytes());
    out.extend_from_slice(&input_rate.to_be_bytes());
    out.extend_from_slice(&gain.to_be_bytes());
    out.push(mapping_family);
    if mapping_family != 0 {
        let table = head
            .get(19..21 + channels as usize)
            .ok_or_else(|| MuxError::InvalidParameterSets("OpusHead mapping table truncated".into()))?;
        out.extend_from_slice(table);
    }
    Ok(out)
}
