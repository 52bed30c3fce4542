//! Container choice by [`ContainerFormat`].

use ck_common::{ContainerFormat, EncodedFrame, FrameFormat, Muxer, MuxerConfig, Sink, StreamId};

use crate::error::MuxResult;
use crate::flv::FlvMuxer;
use crate::mp4::{Mp4Muxer, MuxState};

/// Either muxer, picked from `config.format`.
pub enum ContainerMuxer<S: Sink> {
    Mp4(Mp4Muxer<S>),
    Flv(FlvMuxer<S>),
}

impl<S: Sink> ContainerMuxer<S> {
    pub fn new(sink: S, config: MuxerConfig) -> MuxResult<Self> {
        Ok(match config.format {
            ContainerFormat::Mp4 | ContainerFormat::FragmentedMp4 => {
                Self::Mp4(Mp4Muxer::new(sink, config)?)
            }
            ContainerFormat::Flv => Self::Flv(FlvMuxer::new(sink, config)?),
        })
    }

    pub fn state(&self) -> MuxState {
        match self {
            Self::Mp4(m) => m.state(),
            Self::Flv(m) => m.state(),
        }
    }
}

impl<S: Sink> Muxer for ContainerMuxer<S> {
    type Error = crate::MuxError;

    fn add_stream(&self, format: &FrameFormat) -> MuxResult<StreamId> {
        match self {
            Self::Mp4(m) => m.add_stream(format),
            Self::Flv(m) => m.add_stream(format),
        }
    }

    fn write(&self, frame: &EncodedFrame, stream: StreamId) -> MuxResult<()> {
        match self {
            Self::Mp4(m) => m.write(frame, stream),
            Self::Flv(m) => m.write(frame, stream),
        }
    }

    fn start_stream(&self) -> MuxResult<()> {
        match self {
            Self::Mp4(m) => m.start_stream(),
            Self::Flv(m) => m.start_stream(),
        }
    }

    fn stop_stream(&self) -> MuxResult<()> {
        match self {
            Self::Mp4(m) => m.stop_stream(),
            Self::Flv(m) => m.stop_stream(),
        }
    }
}
