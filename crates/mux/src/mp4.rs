//! MP4 muxer.
//!
//! Two layouts share one track model:
//!
//! - **Flat**: samples are buffered per track until `stop_stream`, which
//!   writes `ftyp`, `moov`, `mdat` in that order (fast start). Chunk offsets
//!   are resolved by iterating the `moov` size to a fixed point, since a
//!   larger `moov` pushes every chunk further out (and may flip `stco` to
//!   `co64`).
//! - **Fragmented**: once every track is valid an init segment (`ftyp` +
//!   `moov` with `mvex`) is written, followed by `moof` + `mdat` pairs cut at
//!   key frames after `fragment_duration_us`.
//!
//! Usage:
//! ```ignore
//! let muxer = Mp4Muxer::new(FileSink::new("out.mp4"), MuxerConfig::new(ContainerFormat::Mp4))?;
//! let video = muxer.add_stream(&video_format)?;
//! muxer.start_stream()?;
//! muxer.write(&frame, video)?;
//! muxer.stop_stream()?;
//! ```

use std::io::{self, BufWriter, Write};
use std::iter;

use ck_common::{ContainerFormat, EncodedFrame, FrameFormat, Muxer, MuxerConfig, Sink, StreamId};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::atoms::{header_len_for, rescale, MOVIE_TIMESCALE};
use crate::boxes::{flat_ftyp, fragmented_ftyp, MdatPayload, Mp4Box};
use crate::chunk::Sample;
use crate::error::{MuxError, MuxResult};
use crate::track::{Ingest, Track};

/// Lifecycle of a muxer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MuxState {
    Idle,
    Started,
    Stopped,
}

impl MuxState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

/// Write-through adapter so boxes can serialize straight into a [`Sink`].
pub(crate) struct SinkWriter<'a, S: Sink>(pub(crate) &'a mut S);

impl<S: Sink> Write for SinkWriter<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn emit<S: Sink>(sink: &mut S, boxes: &[&Mp4Box]) -> MuxResult<()> {
    let mut writer = BufWriter::with_capacity(64 * 1024, SinkWriter(sink));
    for b in boxes {
        b.write(&mut writer)?;
    }
    writer.flush()?;
    Ok(())
}

struct Inner<S> {
    sink: S,
    config: MuxerConfig,
    tracks: Vec<Track>,
    state: MuxState,
    init_written: bool,
    sequence: u32,
    fragment_start_us: Option<i64>,
}

/// MP4 / fragmented MP4 muxer over any [`Sink`].
///
/// Concurrent `write` calls from several encoder sessions are serialized by
/// an internal lock.
pub struct Mp4Muxer<S: Sink> {
    inner: Mutex<Inner<S>>,
}

impl<S: Sink> Mp4Muxer<S> {
    /// Create a muxer. `config.format` must be `Mp4` or `FragmentedMp4`.
    pub fn new(sink: S, config: MuxerConfig) -> MuxResult<Self> {
        if config.format == ContainerFormat::Flv {
            return Err(MuxError::InvalidConfig(
                "Mp4Muxer cannot write FLV".into(),
            ));
        }
        if config.chunk_duration_us <= 0 || config.fragment_duration_us <= 0 {
            return Err(MuxError::InvalidConfig(
                "Chunk and fragment durations must be positive".into(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                sink,
                config,
                tracks: Vec::new(),
                state: MuxState::Idle,
                init_written: false,
                sequence: 0,
                fragment_start_us: None,
            }),
        })
    }

    pub fn state(&self) -> MuxState {
        self.inner.lock().state
    }

    pub fn is_fragmented(&self) -> bool {
        self.inner.lock().config.format == ContainerFormat::FragmentedMp4
    }

    /// Samples accepted so far on `stream` (not counting held frames).
    pub fn sample_count(&self, stream: StreamId) -> MuxResult<usize> {
        let inner = self.inner.lock();
        Ok(inner.track(stream)?.sample_count())
    }

    /// Whether `stream` has seen its parameter sets.
    pub fn is_track_valid(&self, stream: StreamId) -> MuxResult<bool> {
        let inner = self.inner.lock();
        Ok(inner.track(stream)?.is_valid())
    }

    /// Fragments written so far (fragmented layout only).
    pub fn fragment_count(&self) -> u32 {
        self.inner.lock().sequence
    }
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

    fn track(&self, stream: StreamId) -> MuxResult<&Track> {
        self.tracks
            .get(stream.0 as usize)
            .ok_or_else(|| MuxError::TrackError(format!("Unknown stream {stream}")))
    }

    fn fragmented(&self) -> bool {
        self.config.format == ContainerFormat::FragmentedMp4
    }

    fn write_frame(&mut self, frame: &EncodedFrame, stream: StreamId) -> MuxResult<()> {
        self.require("write", MuxState::Started)?;
        let index = stream.0 as usize;
        if index >= self.tracks.len() {
            return Err(MuxError::TrackError(format!("Unknown stream {stream}")));
        }

        // A rejected frame must not cut the fragment in progress.
        self.tracks[index].validate(frame)?;
        if self.fragmented() && self.init_written && self.is_fragment_boundary(frame, index) {
            self.flush_fragment()?;
        }

        let outcome = self.tracks[index].ingest(frame)?;

        if self.fragmented() {
            if outcome == Ingest::Appended && self.fragment_start_us.is_none() {
                self.fragment_start_us = Some(frame.decode_ts().as_micros());
            }
            if !self.init_written && self.tracks.iter().all(Track::is_valid) {
                self.write_init_segment()?;
            }
        }
        Ok(())
    }

    /// A fragment is cut before a sync point once the current one is long
    /// enough. With a video track only video key frames are sync points.
    fn is_fragment_boundary(&self, frame: &EncodedFrame, index: usize) -> bool {
        let Some(start) = self.fragment_start_us else {
            return false;
        };
        let has_video = self.tracks.iter().any(Track::is_video);
        let at_sync_point = if has_video {
            self.tracks[index].is_video() && frame.is_key_frame()
        } else {
            true
        };
        at_sync_point
            && frame.decode_ts().as_micros() - start >= self.config.fragment_duration_us
    }

    fn mvhd(tracks: &[&Track], duration: u64) -> Mp4Box {
        Mp4Box::Mvhd {
            timescale: MOVIE_TIMESCALE,
            duration,
            next_track_id: tracks.iter().map(|t| t.track_id()).max().unwrap_or(0) + 1,
        }
    }

    fn write_init_segment(&mut self) -> MuxResult<()> {
        let tracks: Vec<&Track> = self.tracks.iter().filter(|t| t.is_valid()).collect();
        let mut children = vec![Self::mvhd(&tracks, 0)];
        children.extend(tracks.iter().map(|t| t.init_trak()));
        children.push(Mp4Box::Mvex(tracks.iter().map(|t| t.trex()).collect()));
        let moov = Mp4Box::Moov(children);
        let track_count = tracks.len();

        emit(&mut self.sink, &[&fragmented_ftyp(), &moov])?;
        self.init_written = true;
        info!(
            tracks = track_count,
            bytes = self.sink.bytes_written(),
            "Init segment written"
        );
        Ok(())
    }

    fn flush_fragment(&mut self) -> MuxResult<()> {
        self.fragment_start_us = None;
        let parts: Vec<(usize, Vec<Sample>)> = self
            .tracks
            .iter_mut()
            .enumerate()
            .filter(|(_, t)| t.is_valid())
            .map(|(i, t)| (i, t.take_samples()))
            .filter(|(_, samples)| !samples.is_empty())
            .collect();
        if parts.is_empty() {
            return Ok(());
        }
        self.sequence += 1;
        let sequence_number = self.sequence;

        let tracks = &self.tracks;
        let build_moof = |offsets: &[i32]| {
            Mp4Box::Moof(
                iter::once(Mp4Box::Mfhd { sequence_number })
                    .chain(
                        parts
                            .iter()
                            .zip(offsets)
                            .map(|((i, samples), &offset)| tracks[*i].traf(samples, offset)),
                    )
                    .collect(),
            )
        };

        // The moof size does not depend on the offset values, so measure it
        // with placeholders and then fill in the real offsets.
        let moof_size = build_moof(&vec![0; parts.len()]).size();

        let mut mdat = MdatPayload::new();
        for sample in parts.iter().flat_map(|(_, samples)| samples) {
            mdat.push(sample.data.clone(), sample.form);
        }
        let mut cursor = moof_size + header_len_for(mdat.len());
        let mut offsets = Vec::with_capacity(parts.len());
        for (_, samples) in &parts {
            offsets.push(i32::try_from(cursor).map_err(|_| {
                MuxError::BufferFull(format!(
                    "fragment {sequence_number} exceeds the 32-bit data offset"
                ))
            })?);
            cursor += samples.iter().map(|s| s.size as u64).sum::<u64>();
        }
        let moof = build_moof(&offsets);
        let sample_count: usize = parts.iter().map(|(_, s)| s.len()).sum();
        let mdat = Mp4Box::Mdat(mdat);

        emit(&mut self.sink, &[&moof, &mdat])?;
        debug!(
            sequence = sequence_number,
            samples = sample_count,
            bytes = moof.size() + mdat.size(),
            "Fragment written"
        );
        Ok(())
    }

    fn build_flat_moov(tracks: &[&Track], payload_start: u64) -> Mp4Box {
        let duration = tracks
            .iter()
            .map(|t| rescale(t.duration_ticks(), t.timescale(), MOVIE_TIMESCALE))
            .max()
            .unwrap_or(0);
        let mut children = vec![Self::mvhd(tracks, duration)];
        let mut offset = payload_start;
        for track in tracks {
            children.push(track.trak(offset));
            offset += track.data_size();
        }
        Mp4Box::Moov(children)
    }

    fn finish_flat(&mut self) -> MuxResult<()> {
        let tracks: Vec<&Track> = self.tracks.iter().filter(|t| t.is_valid()).collect();
        if tracks.is_empty() {
            warn!("No track received parameter sets; writing an empty movie");
        }

        let ftyp = flat_ftyp();
        let data_size: u64 = tracks.iter().map(|t| t.data_size()).sum();
        let mdat_header = header_len_for(data_size);

        let mut moov_size = Self::build_flat_moov(&tracks, 0).size();
        let moov = loop {
            let payload_start = ftyp.size() + moov_size + mdat_header;
            let moov = Self::build_flat_moov(&tracks, payload_start);
            if moov.size() == moov_size {
                break moov;
            }
            moov_size = moov.size();
        };

        let mut payload = MdatPayload::new();
        for track in &tracks {
            track.append_to_mdat(&mut payload);
        }
        let mdat = Mp4Box::Mdat(payload);
        let track_count = tracks.len();

        emit(&mut self.sink, &[&ftyp, &moov, &mdat])?;
        info!(
            tracks = track_count,
            moov_bytes = moov_size,
            mdat_bytes = data_size,
            "MP4 written"
        );
        Ok(())
    }

    fn finish(&mut self) -> MuxResult<()> {
        for track in &mut self.tracks {
            track.close_chunk();
            if !track.is_valid() {
                warn!(
                    track = track.track_id(),
                    held = track.pending_len(),
                    "Track never received parameter sets; omitting it"
                );
            }
        }

        if self.fragmented() {
            if !self.init_written && self.tracks.iter().any(Track::is_valid) {
                self.write_init_segment()?;
            }
            if self.init_written {
                self.flush_fragment()?;
            } else {
                warn!("No track received parameter sets; nothing was written");
            }
            Ok(())
        } else {
            self.finish_flat()
        }
    }
}

impl<S: Sink> Muxer for Mp4Muxer<S> {
    type Error = MuxError;

    fn add_stream(&self, format: &FrameFormat) -> MuxResult<StreamId> {
        let mut inner = self.inner.lock();
        inner.require("add a stream", MuxState::Idle)?;
        let index = inner.tracks.len() as u32;
        let track = Track::new(index + 1, format, &inner.config)?;
        inner.tracks.push(track);
        info!(
            stream = index,
            codec = format.codec.display_name(),
            "Added stream"
        );
        Ok(StreamId(index))
    }

    fn write(&self, frame: &EncodedFrame, stream: StreamId) -> MuxResult<()> {
        self.inner.lock().write_frame(frame, stream)
    }

    fn start_stream(&self) -> MuxResult<()> {
        let mut inner = self.inner.lock();
        inner.require("start", MuxState::Idle)?;
        if inner.tracks.is_empty() {
            return Err(MuxError::InvalidConfig(
                "Add at least one stream before starting".into(),
            ));
        }
        inner.sink.open()?;
        inner.state = MuxState::Started;
        info!(
            streams = inner.tracks.len(),
            fragmented = inner.fragmented(),
            "Muxer started"
        );
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
        info!(bytes = inner.sink.bytes_written(), "Muxer stopped");
        Ok(())
    }
}
