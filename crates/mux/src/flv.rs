//! FLV muxer.
//!
//! Layout: 9-byte file header, `PreviousTagSize0`, an `onMetaData` script
//! tag, then audio/video tags each followed by its previous-tag-size field.
//!
//! AVC uses legacy FLV video tags (codec id 7). HEVC and AV1 use the
//! enhanced-FLV ex-header with FourCCs `hvc1` / `av01`. AAC uses sound
//! format 10. Every stream sends its codec configuration (sequence start)
//! exactly once, ahead of its first frame; video frames before the first key
//! frame are dropped.

use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use bytes::Bytes;
use ck_common::{
    AudioCodec, Codec, ContainerFormat, EncodedFrame, FrameFormat, Muxer, MuxerConfig, Sink,
    StreamId, VideoCodec,
};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::amf::Amf0Value;
use crate::chunk::StorageForm;
use crate::error::{MuxError, MuxResult};
use crate::mp4::MuxState;
use crate::records::{av1_codec_config, avc_decoder_config, hevc_decoder_config};

pub const FLV_HEADER_LEN: u32 = 9;
/// Tag header: type, data size, timestamp, timestamp extension, stream id.
pub const TAG_HEADER_LEN: u64 = 11;
/// Largest body the 24-bit data-size field can describe.
pub const MAX_TAG_BODY_LEN: usize = 0x00FF_FFFF;

const SOUND_FORMAT_AAC: u8 = 10;
/// AAC, 44 kHz, 16-bit, stereo. FLV readers ignore the rate bits for AAC.
const AAC_SOUND_HEADER: u8 = SOUND_FORMAT_AAC << 4 | 0x0F;
const AVC_CODEC_ID: u8 = 7;

const FRAME_TYPE_KEY: u8 = 1;
const FRAME_TYPE_INTER: u8 = 2;

const AVC_SEQUENCE_HEADER: u8 = 0;
const AVC_NALU: u8 = 1;
const AVC_END_OF_SEQUENCE: u8 = 2;

const EX_HEADER: u8 = 0x80;
const PACKET_SEQUENCE_START: u8 = 0;
const PACKET_CODED_FRAMES: u8 = 1;
const PACKET_SEQUENCE_END: u8 = 2;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FlvTagType {
    Audio = 8,
    Video = 9,
    Script = 18,
}

/// One FLV tag. [`FlvTag::write`] appends the trailing previous-tag-size.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlvTag {
    pub tag_type: FlvTagType,
    pub timestamp_ms: u32,
    pub body: Vec<u8>,
}

impl FlvTag {
    /// Bytes written by [`FlvTag::write`].
    pub fn size(&self) -> u64 {
        TAG_HEADER_LEN + self.body.len() as u64 + 4
    }

    /// # Errors
    /// `MuxError::BufferFull` if the body exceeds [`MAX_TAG_BODY_LEN`].
    pub fn write<W: Write>(&self, writer: &mut W) -> MuxResult<()> {
        check_body_len(self.body.len())?;
        writer.write_u8(self.tag_type as u8)?;
        writer.write_u24::<BigEndian>(self.body.len() as u32)?;
        writer.write_u24::<BigEndian>(self.timestamp_ms & 0x00FF_FFFF)?;
        writer.write_u8((self.timestamp_ms >> 24) as u8)?;
        writer.write_u24::<BigEndian>(0)?;
        writer.write_all(&self.body)?;
        writer.write_u32::<BigEndian>((TAG_HEADER_LEN + self.body.len() as u64) as u32)?;
        Ok(())
    }
}

fn check_body_len(len: usize) -> MuxResult<()> {
    if len > MAX_TAG_BODY_LEN {
        return Err(MuxError::BufferFull(format!(
            "FLV tag body of {len} bytes exceeds {MAX_TAG_BODY_LEN}"
        )));
    }
    Ok(())
}

/// File header plus `PreviousTagSize0`.
pub fn file_header(has_audio: bool, has_video: bool) -> [u8; 13] {
    let flags = (if has_audio { 0x04 } else { 0 }) | (if has_video { 0x01 } else { 0 });
    [
        b'F', b'L', b'V', 0x01, flags, 0x00, 0x00, 0x00, 0x09, 0x00, 0x00, 0x00, 0x00,
    ]
}

fn fourcc(codec: VideoCodec) -> Option<&'static [u8; 4]> {
    match codec {
        VideoCodec::H265 => Some(b"hvc1"),
        VideoCodec::Av1 => Some(b"av01"),
        _ => None,
    }
}

/// Body of the video sequence-start tag.
pub fn video_sequence_body(codec: VideoCodec, extras: &[Bytes]) -> MuxResult<Vec<u8>> {
    let mut body = Vec::new();
    match codec {
        VideoCodec::H264 => {
            body.extend_from_slice(&[FRAME_TYPE_KEY << 4 | AVC_CODEC_ID, AVC_SEQUENCE_HEADER, 0, 0, 0]);
            body.extend_from_slice(&avc_decoder_config(extras)?);
        }
        VideoCodec::H265 | VideoCodec::Av1 => {
            body.push(EX_HEADER | FRAME_TYPE_KEY << 4 | PACKET_SEQUENCE_START);
            body.extend_from_slice(fourcc(codec).ok_or_else(|| unsupported(codec.into()))?);
            let record = if codec == VideoCodec::H265 {
                hevc_decoder_config(extras)?
            } else {
                av1_codec_config(extras)?
            };
            body.extend_from_slice(&record);
        }
        other => return Err(unsupported(other.into())),
    }
    Ok(body)
}

/// Body of a coded video frame tag.
pub fn video_frame_body(
    codec: VideoCodec,
    data: &[u8],
    is_key_frame: bool,
    composition_ms: i32,
) -> MuxResult<Vec<u8>> {
    let frame_type = if is_key_frame {
        FRAME_TYPE_KEY
    } else {
        FRAME_TYPE_INTER
    };
    let form = StorageForm::for_codec(codec.into());
    let mut body = Vec::with_capacity(data.len() + 8);
    match codec {
        VideoCodec::H264 => {
            body.extend_from_slice(&[frame_type << 4 | AVC_CODEC_ID, AVC_NALU]);
            body.write_i24::<BigEndian>(composition_ms)?;
        }
        VideoCodec::H265 => {
            body.push(EX_HEADER | frame_type << 4 | PACKET_CODED_FRAMES);
            body.extend_from_slice(b"hvc1");
            body.write_i24::<BigEndian>(composition_ms)?;
        }
        VideoCodec::Av1 => {
            body.push(EX_HEADER | frame_type << 4 | PACKET_CODED_FRAMES);
            body.extend_from_slice(b"av01");
        }
        other => return Err(unsupported(other.into())),
    }
    form.write(data, &mut body)?;
    Ok(body)
}

/// Body of the video end-of-sequence tag.
pub fn video_end_body(codec: VideoCodec) -> Vec<u8> {
    match fourcc(codec) {
        Some(fourcc) => {
            let mut body = vec![EX_HEADER | FRAME_TYPE_KEY << 4 | PACKET_SEQUENCE_END];
            body.extend_from_slice(fourcc);
            body
        }
        None => vec![FRAME_TYPE_KEY << 4 | AVC_CODEC_ID, AVC_END_OF_SEQUENCE, 0, 0, 0],
    }
}

pub fn aac_sequence_body(audio_specific_config: &[u8]) -> Vec<u8> {
    let mut body = vec![AAC_SOUND_HEADER, 0];
    body.extend_from_slice(audio_specific_config);
    body
}

pub fn aac_frame_body(data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 2);
    body.extend_from_slice(&[AAC_SOUND_HEADER, 1]);
    body.extend_from_slice(data);
    body
}

fn unsupported(codec: Codec) -> MuxError {
    MuxError::InvalidConfig(format!(
        "{} cannot be carried in FLV",
        codec.display_name()
    ))
}

fn video_codec_id(codec: VideoCodec) -> f64 {
    match fourcc(codec) {
        Some(fourcc) => u32::from_be_bytes(*fourcc) as f64,
        None => AVC_CODEC_ID as f64,
    }
}

/// `onMetaData` script tag body for the registered streams.
pub fn metadata_body(streams: &[FrameFormat]) -> MuxResult<Vec<u8>> {
    let mut entries = vec![("duration".to_string(), Amf0Value::Number(0.0))];
    for format in streams {
        match format.codec {
            Codec::Video(codec) => {
                if let Some(resolution) = format.resolution {
                    entries.push(("width".into(), Amf0Value::Number(resolution.width as f64)));
                    entries.push(("height".into(), Amf0Value::Number(resolution.height as f64)));
                }
                if let Some(rate) = format.frame_rate.filter(|r| r.den > 0) {
                    entries.push((
                        "framerate".into(),
                        Amf0Value::Number(rate.num as f64 / rate.den as f64),
                    ));
                }
                entries.push(("videocodecid".into(), Amf0Value::Number(video_codec_id(codec))));
                entries.push((
                    "videodatarate".into(),
                    Amf0Value::Number(format.bitrate as f64 / 1000.0),
                ));
            }
            Codec::Audio(_) => {
                entries.push((
                    "audiocodecid".into(),
                    Amf0Value::Number(SOUND_FORMAT_AAC as f64),
                ));
                entries.push((
                    "audiodatarate".into(),
                    Amf0Value::Number(format.bitrate as f64 / 1000.0),
                ));
                if let Some(rate) = format.sample_rate {
                    entries.push(("audiosamplerate".into(), Amf0Value::Number(rate as f64)));
                }
                entries.push(("audiosamplesize".into(), Amf0Value::Number(16.0)));
                entries.push((
                    "stereo".into(),
                    Amf0Value::Boolean(format.channels.unwrap_or(2) > 1),
                ));
            }
        }
    }
    entries.push(("encoder".into(), Amf0Value::String("castkit".into())));

    let mut body = Amf0Value::String("onMetaData".into()).to_bytes()?;
    Amf0Value::EcmaArray(entries).write(&mut body)?;
    Ok(body)
}

#[derive(Debug)]
struct FlvStream {
    format: FrameFormat,
    sequence_started: bool,
    dropped: u64,
}

struct Inner<S> {
    sink: S,
    streams: Vec<FlvStream>,
    state: MuxState,
    base_dts_us: Option<i64>,
    last_ms: u32,
    tags_written: u64,
}

impl<S: Sink> Inner<S> {
    fn require(&self, op: &'static str, state: MuxState) -> MuxResult<()> {
        if self.state != state {
            return Err(MuxError::IllegalState {
                op,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn emit(&mut self, tag: &FlvTag) -> MuxResult<()> {
        let mut buf = Vec::with_capacity(tag.size() as usize);
        tag.write(&mut buf)?;
        self.sink.write(&buf)?;
        self.tags_written += 1;
        Ok(())
    }

    fn relative_ms(&mut self, dts_us: i64) -> u32 {
        let base = *self.base_dts_us.get_or_insert(dts_us);
        let ms = ((dts_us - base).max(0) / 1000).min(u32::MAX as i64) as u32;
        self.last_ms = self.last_ms.max(ms);
        ms
    }

    fn write_frame(&mut self, frame: &EncodedFrame, stream: StreamId) -> MuxResult<()> {
        self.require("write", MuxState::Started)?;
        let index = stream.0 as usize;
        let entry = self
            .streams
            .get_mut(index)
            .ok_or_else(|| MuxError::TrackError(format!("Unknown stream {stream}")))?;
        let codec = entry.format.codec;

        if codec.is_video() && !entry.sequence_started && !frame.is_key_frame() {
            entry.dropped += 1;
            debug!(stream = index, pts = %frame.pts(), "Dropping frame before first key frame");
            return Ok(());
        }

        let sequence_body = if entry.sequence_started {
            None
        } else {
            let extras = frame.extras().filter(|e| !e.is_empty()).ok_or_else(|| {
                MuxError::TrackNotReady(format!(
                    "stream {index} has no parameter sets on its first frame"
                ))
            })?;
            let expected = codec.parameter_set_count().unwrap_or(0);
            if extras.len() != expected {
                return Err(MuxError::InvalidParameterSets(format!(
                    "{} stream {index} expects {expected} parameter sets, got {}",
                    codec.display_name(),
                    extras.len()
                )));
            }
            Some(match codec {
                Codec::Video(video) => video_sequence_body(video, extras)?,
                Codec::Audio(_) => aac_sequence_body(&extras[0]),
            })
        };

        let dts_us = frame.decode_ts().as_micros();
        let frame_tag = match codec {
            Codec::Video(video) => {
                let composition_ms = ((frame.pts().as_micros() - dts_us) / 1000) as i32;
                FlvTag {
                    tag_type: FlvTagType::Video,
                    timestamp_ms: 0,
                    body: video_frame_body(video, frame.data(), frame.is_key_frame(), composition_ms)?,
                }
            }
            Codec::Audio(_) => FlvTag {
                tag_type: FlvTagType::Audio,
                timestamp_ms: 0,
                body: aac_frame_body(frame.data()),
            },
        };
        check_body_len(frame_tag.body.len())?;
        let timestamp_ms = self.relative_ms(dts_us);

        if let Some(body) = sequence_body {
            self.emit(&FlvTag {
                tag_type: frame_tag.tag_type,
                timestamp_ms,
                body,
            })?;
            self.streams[index].sequence_started = true;
            info!(
                stream = index,
                codec = codec.display_name(),
                "Sequence start written"
            );
        }
        self.emit(&FlvTag {
            timestamp_ms,
            ..frame_tag
        })
    }

    fn finish(&mut self) -> MuxResult<()> {
        let ends: Vec<(usize, VideoCodec)> = self
            .streams
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sequence_started)
            .filter_map(|(i, s)| match s.format.codec {
                Codec::Video(codec) => Some((i, codec)),
                Codec::Audio(_) => None,
            })
            .collect();
        for (index, codec) in ends {
            self.emit(&FlvTag {
                tag_type: FlvTagType::Video,
                timestamp_ms: self.last_ms,
                body: video_end_body(codec),
            })?;
            debug!(stream = index, "End of sequence written");
        }
        for (index, stream) in self.streams.iter().enumerate() {
            if stream.dropped > 0 {
                debug!(stream = index, dropped = stream.dropped, "Frames dropped before key frame");
            }
        }
        Ok(())
    }
}

/// FLV muxer over any [`Sink`]. Carries at most one video and one audio
/// stream.
pub struct FlvMuxer<S: Sink> {
    inner: Mutex<Inner<S>>,
}

impl<S: Sink> FlvMuxer<S> {
    pub fn new(sink: S, config: MuxerConfig) -> MuxResult<Self> {
        if config.format != ContainerFormat::Flv {
            return Err(MuxError::InvalidConfig(format!(
                "FlvMuxer cannot write {:?}",
                config.format
            )));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                sink,
                streams: Vec::new(),
                state: MuxState::Idle,
                base_dts_us: None,
                last_ms: 0,
                tags_written: 0,
            }),
        })
    }

    pub fn state(&self) -> MuxState {
        self.inner.lock().state
    }

    /// Tags written so far, the `onMetaData` tag included.
    pub fn tags_written(&self) -> u64 {
        self.inner.lock().tags_written
    }
}

impl<S: Sink> Muxer for FlvMuxer<S> {
    type Error = MuxError;

    fn add_stream(&self, format: &FrameFormat) -> MuxResult<StreamId> {
        let mut inner = self.inner.lock();
        inner.require("add a stream", MuxState::Idle)?;
        match format.codec {
            Codec::Video(VideoCodec::H264 | VideoCodec::H265 | VideoCodec::Av1)
            | Codec::Audio(AudioCodec::Aac) => {}
            other => return Err(unsupported(other)),
        }
        let kind = format.codec.kind();
        if inner.streams.iter().any(|s| s.format.codec.kind() == kind) {
            return Err(MuxError::InvalidConfig(format!(
                "FLV carries a single {kind:?} stream"
            )));
        }
        let index = inner.streams.len() as u32;
        inner.streams.push(FlvStream {
            format: format.clone(),
            sequence_started: false,
            dropped: 0,
        });
        info!(
            stream = index,
            codec = format.codec.display_name(),
            "Added FLV stream"
        );
        Ok(StreamId(index))
    }

    fn write(&self, frame: &EncodedFrame, stream: StreamId) -> MuxResult<()> {
        self.inner.lock().write_frame(frame, stream)
    }

    fn start_stream(&self) -> MuxResult<()> {
        let mut inner = self.inner.lock();
        inner.require("start", MuxState::Idle)?;
        if inner.streams.is_empty() {
            return Err(MuxError::InvalidConfig(
                "Add at least one stream before starting".into(),
            ));
        }
        let has_video = inner.streams.iter().any(|s| s.format.codec.is_video());
        let has_audio = inner.streams.iter().any(|s| !s.format.codec.is_video());
        let formats: Vec<FrameFormat> = inner.streams.iter().map(|s| s.format.clone()).collect();
        let metadata = FlvTag {
            tag_type: FlvTagType::Script,
            timestamp_ms: 0,
            body: metadata_body(&formats)?,
        };

        inner.sink.open()?;
        inner.sink.write(&file_header(has_audio, has_video))?;
        inner.emit(&metadata)?;
        inner.state = MuxState::Started;
        info!(has_audio, has_video, "FLV muxer started");
        Ok(())
    }

    fn stop_stream(&self) -> MuxResult<()> {
        let mut inner = self.inner.lock();
        inner.require("stop", MuxState::Started)?;
        inner.state = MuxState::Stopped;
        let finished = inner.finish();
        let closed = inner.sink.close();
        finished?;
        closed?;
        info!(
            tags = inner.tags_written,
            bytes = inner.sink.bytes_written(),
            "FLV muxer stopped"
        );
        Ok(())
    }
}
