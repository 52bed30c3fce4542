//! Container track model.
//!
//! A track becomes *valid* once it has seen exactly the codec's number of
//! parameter sets (2 for AVC, 3 for HEVC, 1 for AV1/AAC/Opus); only then can
//! its sample description be written. Frames that arrive earlier follow the
//! muxer's [`PendingFramePolicy`].

use std::collections::VecDeque;

use bytes::Bytes;
use ck_common::{
    AudioCodec, Codec, EncodedFrame, FrameFormat, MuxerConfig, PendingFramePolicy, Timestamp,
};
use tracing::{debug, info};

use crate::atoms::{rescale, MOVIE_TIMESCALE, VIDEO_TIMESCALE};
use crate::boxes::{self_contained_dinf, MdatPayload, Mp4Box};
use crate::chunk::{Chunk, Sample};
use crate::error::{MuxError, MuxResult};
use crate::records::{decoder_config, DecoderConfig};
use crate::tables::{
    chunk_offsets, composition_offsets, needs_co64, sample_durations, sample_sizes,
    sample_to_chunk, sync_samples, time_to_sample, LastDelta, TrunSample, NON_SYNC_SAMPLE_FLAGS,
    SYNC_SAMPLE_FLAGS,
};

/// Outcome of [`Track::ingest`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Ingest {
    /// The sample (and any held frames before it) joined the track.
    Appended,
    /// Held until the track becomes valid.
    Pending,
    /// Discarded because the track is not valid yet.
    Dropped,
}

/// One stream inside a container.
#[derive(Debug)]
pub struct Track {
    track_id: u32,
    format: FrameFormat,
    timescale: u32,
    threshold: usize,
    policy: PendingFramePolicy,
    chunk_duration_us: i64,
    description: Option<Mp4Box>,
    pending: VecDeque<Sample>,
    chunks: Vec<Chunk>,
    open: Option<Chunk>,
    dropped: u64,
}

impl Track {
    /// Create a track for `format`.
    ///
    /// # Errors
    /// `MuxError::InvalidConfig` if the codec cannot be described or the
    /// format lacks the fields its media kind needs.
    pub fn new(track_id: u32, format: &FrameFormat, config: &MuxerConfig) -> MuxResult<Self> {
        let codec = format.codec;
        let threshold = codec.parameter_set_count().ok_or_else(|| {
            MuxError::InvalidConfig(format!(
                "{} cannot be carried in an MP4 track",
                codec.display_name()
            ))
        })?;
        let timescale = if codec.is_video() {
            if format.resolution.is_none() {
                return Err(MuxError::InvalidConfig(
                    "Video stream needs a resolution".into(),
                ));
            }
            VIDEO_TIMESCALE
        } else {
            match (format.sample_rate, format.channels) {
                (Some(rate), _) if rate > u16::MAX as u32 => {
                    return Err(MuxError::InvalidConfig(format!(
                        "Audio sample rate {rate} Hz does not fit an MP4 sample entry"
                    )));
                }
                (Some(rate), Some(channels)) if rate > 0 && channels > 0 => rate,
                _ => {
                    return Err(MuxError::InvalidConfig(
                        "Audio stream needs a sample rate and channel count".into(),
                    ));
                }
            }
        };
        Ok(Self {
            track_id,
            format: format.clone(),
            timescale,
            threshold,
            policy: config.pending_policy,
            chunk_duration_us: config.chunk_duration_us,
            description: None,
            pending: VecDeque::new(),
            chunks: Vec::new(),
            open: None,
            dropped: 0,
        })
    }

    pub fn track_id(&self) -> u32 {
        self.track_id
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn timescale(&self) -> u32 {
        self.timescale
    }

    pub fn is_video(&self) -> bool {
        self.format.codec.is_video()
    }

    /// Whether the sample description is known.
    pub fn is_valid(&self) -> bool {
        self.description.is_some()
    }

    /// Frames held while the track is not yet valid.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Frames discarded under [`PendingFramePolicy::Drop`].
    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    /// Samples in the track (closed and open chunks).
    pub fn sample_count(&self) -> usize {
        self.chunks.iter().map(Chunk::len).sum::<usize>() + self.open.as_ref().map_or(0, Chunk::len)
    }

    /// Closed chunks.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Ingest one access unit.
    ///
    /// # Errors
    /// - `MuxError::InvalidParameterSets` if the frame carries a parameter
    ///   set count other than the codec's threshold, or sets that cannot be
    ///   parsed. The track is left untouched.
    /// - `MuxError::TrackNotReady` if the pending buffer is full.
    pub fn ingest(&mut self, frame: &EncodedFrame) -> MuxResult<Ingest> {
        self.validate(frame)?;
        if let Some(extras) = frame.extras().filter(|e| !e.is_empty()) {
            self.accept_parameter_sets(extras)?;
        }

        let sample = Sample::from_frame(frame);
        if !self.is_valid() {
            return match self.policy {
                PendingFramePolicy::Buffer { max_frames } => {
                    if self.pending.len() >= max_frames {
                        return Err(MuxError::TrackNotReady(format!(
                            "track {} has held {} frames without parameter sets",
                            self.track_id, max_frames
                        )));
                    }
                    self.pending.push_back(sample);
                    debug!(
                        track = self.track_id,
                        pending = self.pending.len(),
                        "Holding frame until parameter sets arrive"
                    );
                    Ok(Ingest::Pending)
                }
                PendingFramePolicy::Drop => {
                    self.dropped += 1;
                    debug!(
                        track = self.track_id,
                        pts = %frame.pts(),
                        "Dropping frame before parameter sets"
                    );
                    Ok(Ingest::Dropped)
                }
            };
        }

        while let Some(held) = self.pending.pop_front() {
            self.append(held);
        }
        self.append(sample);
        Ok(Ingest::Appended)
    }

    /// Reject a frame whose parameter-set count does not match the codec.
    /// Does not touch the track.
    pub fn validate(&self, frame: &EncodedFrame) -> MuxResult<()> {
        match frame.extras().filter(|e| !e.is_empty()) {
            Some(extras) if extras.len() != self.threshold => {
                Err(MuxError::InvalidParameterSets(format!(
                    "{} track {} expects {} parameter sets, got {}",
                    self.format.codec.display_name(),
                    self.track_id,
                    self.threshold,
                    extras.len()
                )))
            }
            _ => Ok(()),
        }
    }

    fn accept_parameter_sets(&mut self, extras: &[Bytes]) -> MuxResult<()> {
        if self.description.is_some() {
            // Only the first valid set describes the track.
            return Ok(());
        }
        let config = decoder_config(self.format.codec, extras, self.format.bitrate)?;
        self.description = Some(self.sample_entry(config));
        info!(
            track = self.track_id,
            codec = self.format.codec.display_name(),
            held = self.pending.len(),
            "Track has a sample description"
        );
        Ok(())
    }

    fn sample_entry(&self, config: DecoderConfig) -> Mp4Box {
        let record = if &config.box_type == b"esds" {
            Mp4Box::Esds(config.payload)
        } else {
            Mp4Box::Record {
                box_type: config.box_type,
                payload: config.payload,
            }
        };
        match self.format.resolution {
            Some(resolution) if self.is_video() => Mp4Box::VisualSampleEntry {
                format: config.sample_entry,
                width: resolution.width.min(u16::MAX as u32) as u16,
                height: resolution.height.min(u16::MAX as u32) as u16,
                children: vec![record],
            },
            _ => Mp4Box::AudioSampleEntry {
                format: config.sample_entry,
                channels: self.format.channels.unwrap_or(2),
                sample_rate: self.timescale,
                children: vec![record],
            },
        }
    }

    fn append(&mut self, sample: Sample) {
        let chunk = self.open.get_or_insert_with(Chunk::new);
        chunk.push(sample);
        // First-to-last decode time; the last sample's own duration is not counted.
        if chunk.span_us() >= self.chunk_duration_us {
            self.close_chunk();
        }
    }

    /// Close the open chunk, if any.
    pub fn close_chunk(&mut self) {
        if let Some(chunk) = self.open.take() {
            if !chunk.is_empty() {
                self.chunks.push(chunk);
            }
        }
    }

    /// Stored byte size of all closed chunks.
    pub fn data_size(&self) -> u64 {
        self.chunks.iter().map(Chunk::size).sum()
    }

    /// Queue every closed chunk's bytes into `payload`, in order.
    pub fn append_to_mdat(&self, payload: &mut MdatPayload) {
        for sample in self.chunks.iter().flat_map(Chunk::samples) {
            payload.push(sample.data.clone(), sample.form);
        }
    }

    /// Drain every sample for a fragment.
    pub fn take_samples(&mut self) -> Vec<Sample> {
        self.close_chunk();
        self.chunks
            .drain(..)
            .flat_map(Chunk::into_samples)
            .collect()
    }

    /// Nominal duration of one sample in track ticks, if the format gives
    /// one. Video without a frame rate has none.
    pub fn nominal_duration(&self) -> Option<u32> {
        match (self.format.frame_rate, self.format.sample_rate) {
            (Some(rate), _) if rate.num > 0 => Some(
                (VIDEO_TIMESCALE as u64 * rate.den as u64 / rate.num as u64) as u32,
            ),
            (_, Some(sample_rate)) if !self.is_video() => match self.format.codec {
                Codec::Audio(AudioCodec::Opus) => Some(sample_rate / 50),
                _ => Some(1024),
            },
            _ => None,
        }
    }

    /// How the last sample's duration is chosen.
    fn last_delta(&self, sample_count: usize) -> LastDelta {
        if sample_count > 1 {
            return LastDelta::RepeatPrevious;
        }
        match self.nominal_duration() {
            Some(delta) => LastDelta::Known(delta),
            None => LastDelta::Unknown,
        }
    }

    fn ticks(&self, us: i64) -> i64 {
        Timestamp::from_micros(us).to_ticks(self.timescale)
    }

    fn durations(&self, samples: &[&Sample]) -> Vec<u32> {
        let dts: Vec<i64> = samples.iter().map(|s| self.ticks(s.dts_us)).collect();
        sample_durations(&dts, self.last_delta(samples.len()))
    }

    /// Total duration of the closed chunks in track ticks.
    pub fn duration_ticks(&self) -> u64 {
        let samples: Vec<&Sample> = self.chunks.iter().flat_map(Chunk::samples).collect();
        self.durations(&samples).iter().map(|&d| d as u64).sum()
    }

    /// `trak` for a flat file whose first chunk starts at `first_chunk_offset`.
    pub fn trak(&self, first_chunk_offset: u64) -> Mp4Box {
        let samples: Vec<&Sample> = self.chunks.iter().flat_map(Chunk::samples).collect();
        let dts: Vec<i64> = samples.iter().map(|s| self.ticks(s.dts_us)).collect();
        let pts: Vec<i64> = samples.iter().map(|s| self.ticks(s.pts_us)).collect();
        let durations = self.durations(&samples);
        let duration = durations.iter().map(|&d| d as u64).sum();

        let mut tables = vec![Mp4Box::Stts(time_to_sample(&durations))];
        if let Some(offsets) = composition_offsets(&dts, &pts) {
            tables.push(Mp4Box::Ctts(offsets));
        }
        if self.is_video() {
            let flags: Vec<bool> = samples.iter().map(|s| s.is_sync).collect();
            if let Some(sync) = sync_samples(&flags) {
                tables.push(Mp4Box::Stss(sync));
            }
        }
        let counts: Vec<u32> = self.chunks.iter().map(|c| c.len() as u32).collect();
        tables.push(Mp4Box::Stsc(sample_to_chunk(&counts)));

        let sizes: Vec<u32> = samples.iter().map(|s| s.size).collect();
        let (sample_size, table) = sample_sizes(&sizes);
        tables.push(Mp4Box::Stsz {
            sample_size,
            sample_count: sizes.len() as u32,
            sizes: table,
        });

        let chunk_sizes: Vec<u64> = self.chunks.iter().map(Chunk::size).collect();
        let offsets = chunk_offsets(first_chunk_offset, &chunk_sizes);
        tables.push(if needs_co64(&offsets) {
            Mp4Box::Co64(offsets)
        } else {
            Mp4Box::Stco(offsets.into_iter().map(|o| o as u32).collect())
        });

        self.trak_with(tables, duration)
    }

    /// `trak` for a fragmented file's init segment: empty sample tables.
    pub fn init_trak(&self) -> Mp4Box {
        let tables = vec![
            Mp4Box::Stts(Vec::new()),
            Mp4Box::Stsc(Vec::new()),
            Mp4Box::Stsz {
                sample_size: 0,
                sample_count: 0,
                sizes: Vec::new(),
            },
            Mp4Box::Stco(Vec::new()),
        ];
        self.trak_with(tables, 0)
    }

    fn trak_with(&self, tables: Vec<Mp4Box>, duration: u64) -> Mp4Box {
        let mut stbl = vec![Mp4Box::Stsd(self.description.iter().cloned().collect())];
        stbl.extend(tables);

        let (handler_type, name, media_header) = if self.is_video() {
            (*b"vide", "VideoHandler", Mp4Box::Vmhd)
        } else {
            (*b"soun", "SoundHandler", Mp4Box::Smhd)
        };
        let (width, height) = self
            .format
            .resolution
            .map_or((0, 0), |r| (r.width, r.height));

        Mp4Box::Trak(vec![
            Mp4Box::Tkhd {
                track_id: self.track_id,
                duration: rescale(duration, self.timescale, MOVIE_TIMESCALE),
                width,
                height,
                is_audio: !self.is_video(),
            },
            Mp4Box::Mdia(vec![
                Mp4Box::Mdhd {
                    timescale: self.timescale,
                    duration,
                    language: "und",
                },
                Mp4Box::Hdlr { handler_type, name },
                Mp4Box::Minf(vec![media_header, self_contained_dinf(), Mp4Box::Stbl(stbl)]),
            ]),
        ])
    }

    pub fn trex(&self) -> Mp4Box {
        Mp4Box::Trex {
            track_id: self.track_id,
        }
    }

    /// `traf` describing `samples`, whose bytes start `data_offset` bytes
    /// after the enclosing `moof`.
    pub fn traf(&self, samples: &[Sample], data_offset: i32) -> Mp4Box {
        let refs: Vec<&Sample> = samples.iter().collect();
        let durations = self.durations(&refs);
        let base = samples.first().map_or(0, |s| self.ticks(s.dts_us).max(0) as u64);
        let run = samples
            .iter()
            .zip(durations)
            .map(|(sample, duration)| TrunSample {
                duration,
                size: sample.size,
                flags: if sample.is_sync {
                    SYNC_SAMPLE_FLAGS
                } else {
                    NON_SYNC_SAMPLE_FLAGS
                },
                composition_offset: (self.ticks(sample.pts_us) - self.ticks(sample.dts_us))
                    .clamp(i32::MIN as i64, i32::MAX as i64)
                    as i32,
            })
            .collect();
        Mp4Box::Traf(vec![
            Mp4Box::Tfhd {
                track_id: self.track_id,
            },
            Mp4Box::Tfdt {
                base_media_decode_time: base,
            },
            Mp4Box::Trun {
                data_offset,
                samples: run,
            },
        ])
    }
}
