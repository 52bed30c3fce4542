//! Video/audio codec and container format enums.

use serde::{Deserialize, Serialize};

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    H265,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// Human-readable codec name (for display/logging).
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "H.264/AVC",
            Self::H265 => "H.265/HEVC",
            Self::Vp9 => "VP9",
            Self::Av1 => "AV1",
        }
    }

    /// Number of parameter-set buffers needed before a decoder config can be built.
    ///
    /// `None` means the codec cannot be described by this crate's containers.
    pub fn parameter_set_count(self) -> Option<usize> {
        match self {
            Self::H264 => Some(2), // SPS + PPS
            Self::H265 => Some(3), // VPS + SPS + PPS
            Self::Av1 => Some(1),  // sequence header OBU
            Self::Vp9 => None,
        }
    }

    /// Whether the hardware emits this codec as Annex-B (start-code delimited) NAL units.
    pub fn is_annex_b(self) -> bool {
        matches!(self, Self::H264 | Self::H265)
    }
}

/// Audio codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AudioCodec {
    Aac,
    Opus,
    Mp3,
}

impl AudioCodec {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Aac => "AAC",
            Self::Opus => "Opus",
            Self::Mp3 => "MP3",
        }
    }

    /// Number of parameter-set buffers (AudioSpecificConfig, OpusHead).
    pub fn parameter_set_count(self) -> Option<usize> {
        match self {
            Self::Aac | Self::Opus => Some(1),
            Self::Mp3 => None,
        }
    }
}

/// Audio or video.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaKind {
    Video,
    Audio,
}

/// Any codec the pipeline can carry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    Video(VideoCodec),
    Audio(AudioCodec),
}

impl Codec {
    pub fn kind(self) -> MediaKind {
        match self {
            Self::Video(_) => MediaKind::Video,
            Self::Audio(_) => MediaKind::Audio,
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, Self::Video(_))
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Video(v) => v.display_name(),
            Self::Audio(a) => a.display_name(),
        }
    }

    pub fn parameter_set_count(self) -> Option<usize> {
        match self {
            Self::Video(v) => v.parameter_set_count(),
            Self::Audio(a) => a.parameter_set_count(),
        }
    }

    pub fn is_annex_b(self) -> bool {
        matches!(self, Self::Video(v) if v.is_annex_b())
    }
}

impl From<VideoCodec> for Codec {
    fn from(codec: VideoCodec) -> Self {
        Self::Video(codec)
    }
}

impl From<AudioCodec> for Codec {
    fn from(codec: AudioCodec) -> Self {
        Self::Audio(codec)
    }
}

/// Container format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerFormat {
    /// ISO BMFF with a single moov + mdat.
    Mp4,
    /// ISO BMFF split into moof + mdat fragments.
    FragmentedMp4,
    /// Flash Video tag stream.
    Flv,
}

impl ContainerFormat {
    pub fn file_extensions(self) -> &'static [&'static str] {
        match self {
            Self::Mp4 => &["mp4", "m4v", "m4a"],
            Self::FragmentedMp4 => &["mp4", "m4s"],
            Self::Flv => &["flv"],
        }
    }
}
