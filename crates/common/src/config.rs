//! Configuration structs for encoder sessions, muxers, and whole pipelines.
//!
//! Everything is `serde`-derived; a [`PipelineConfig`] can be loaded from a
//! JSON file and is validated after parsing.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::{AudioCodec, ContainerFormat, VideoCodec};
use crate::error::{ConfigError, EncodeError};
use crate::frame::FrameFormat;
use crate::types::{Rational, Resolution};

/// How raw frames reach the hardware encoder.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputMode {
    /// The session pulls frames and copies them into hardware input slots.
    #[default]
    Buffer,
    /// The producer renders straight into a hardware-owned surface.
    Surface,
}

/// Video encoder settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VideoEncoderConfig {
    pub codec: VideoCodec,
    pub resolution: Resolution,
    pub frame_rate: Rational,
    /// Target bitrate in bits/sec.
    pub bitrate: u32,
    /// Key frame interval in seconds.
    #[serde(default = "default_gop_secs")]
    pub gop_secs: f32,
}

fn default_gop_secs() -> f32 {
    1.0
}

impl VideoEncoderConfig {
    /// Key frame interval expressed in frames (at least 1).
    pub fn gop_frames(&self) -> u32 {
        ((self.gop_secs as f64 * self.frame_rate.as_f64()).round() as u32).max(1)
    }
}

/// Audio encoder settings. The bitrate is fixed for the life of a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioEncoderConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    /// Bitrate in bits/sec.
    pub bitrate: u32,
}

impl AudioEncoderConfig {
    /// Samples per channel carried by one encoded frame.
    pub fn samples_per_frame(&self) -> u32 {
        match self.codec {
            AudioCodec::Aac => 1024,
            AudioCodec::Opus => self.sample_rate / 50, // 20 ms
            AudioCodec::Mp3 => 1152,
        }
    }
}

/// Media-specific part of a session config.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MediaConfig {
    Video(VideoEncoderConfig),
    Audio(AudioEncoderConfig),
}

/// Encoder session configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub media: MediaConfig,
    #[serde(default)]
    pub input_mode: InputMode,
    /// Consecutive empty output polls before a synchronous drain gives up.
    #[serde(default = "default_max_drain_retries")]
    pub max_drain_retries: u32,
    /// Depth of the command queue in front of the session actor.
    #[serde(default = "default_command_queue_depth")]
    pub command_queue_depth: usize,
}

fn default_max_drain_retries() -> u32 {
    5
}

fn default_command_queue_depth() -> usize {
    16
}

impl SessionConfig {
    pub fn video(config: VideoEncoderConfig) -> Self {
        Self {
            media: MediaConfig::Video(config),
            input_mode: InputMode::Buffer,
            max_drain_retries: default_max_drain_retries(),
            command_queue_depth: default_command_queue_depth(),
        }
    }

    pub fn audio(config: AudioEncoderConfig) -> Self {
        Self {
            media: MediaConfig::Audio(config),
            input_mode: InputMode::Buffer,
            max_drain_retries: default_max_drain_retries(),
            command_queue_depth: default_command_queue_depth(),
        }
    }

    pub fn with_input_mode(mut self, input_mode: InputMode) -> Self {
        self.input_mode = input_mode;
        self
    }

    pub fn is_video(&self) -> bool {
        matches!(self.media, MediaConfig::Video(_))
    }

    /// Format metadata for frames produced under this config.
    pub fn output_format(&self) -> FrameFormat {
        match &self.media {
            MediaConfig::Video(v) => {
                FrameFormat::video(v.codec, v.resolution, v.frame_rate).with_bitrate(v.bitrate)
            }
            MediaConfig::Audio(a) => {
                FrameFormat::audio(a.codec, a.sample_rate, a.channels).with_bitrate(a.bitrate)
            }
        }
    }

    /// Check that the parameters describe something an encoder can produce.
    ///
    /// # Errors
    /// Returns `EncodeError::InvalidConfig` describing the first problem found.
    pub fn validate(&self) -> Result<(), EncodeError> {
        match &self.media {
            MediaConfig::Video(v) => {
                if v.resolution.is_empty() {
                    return Err(EncodeError::InvalidConfig(
                        "Resolution must be > 0".to_string(),
                    ));
                }
                if !v.resolution.width.is_multiple_of(2) || !v.resolution.height.is_multiple_of(2)
                {
                    return Err(EncodeError::InvalidConfig(
                        "Resolution width and height must be even".to_string(),
                    ));
                }
                if v.frame_rate.num == 0 || v.frame_rate.den == 0 {
                    return Err(EncodeError::InvalidConfig(
                        "Frame rate must be > 0".to_string(),
                    ));
                }
                if v.bitrate == 0 {
                    return Err(EncodeError::InvalidConfig("Bitrate must be > 0".to_string()));
                }
                if v.codec.parameter_set_count().is_none() {
                    return Err(EncodeError::InvalidConfig(format!(
                        "Codec {} is not supported for encoding",
                        v.codec.display_name()
                    )));
                }
            }
            MediaConfig::Audio(a) => {
                if a.sample_rate == 0 || a.channels == 0 {
                    return Err(EncodeError::InvalidConfig(
                        "Sample rate and channel count must be > 0".to_string(),
                    ));
                }
                if a.bitrate == 0 {
                    return Err(EncodeError::InvalidConfig("Bitrate must be > 0".to_string()));
                }
                if a.codec.parameter_set_count().is_none() {
                    return Err(EncodeError::InvalidConfig(format!(
                        "Codec {} is not supported for encoding",
                        a.codec.display_name()
                    )));
                }
            }
        }
        if self.command_queue_depth == 0 {
            return Err(EncodeError::InvalidConfig(
                "Command queue depth must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// What a track does with frames that arrive before its parameter sets.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PendingFramePolicy {
    /// Hold up to `max_frames` and flush them once the track becomes valid.
    Buffer { max_frames: usize },
    /// Discard them.
    Drop,
}

impl Default for PendingFramePolicy {
    fn default() -> Self {
        Self::Buffer { max_frames: 64 }
    }
}

/// Muxer configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MuxerConfig {
    pub format: ContainerFormat,
    /// A chunk closes once it spans this many microseconds.
    #[serde(default = "default_chunk_duration_us")]
    pub chunk_duration_us: i64,
    /// Target fragment length for fragmented MP4.
    #[serde(default = "default_fragment_duration_us")]
    pub fragment_duration_us: i64,
    #[serde(default)]
    pub pending_policy: PendingFramePolicy,
}

fn default_chunk_duration_us() -> i64 {
    1_000_000
}

fn default_fragment_duration_us() -> i64 {
    2_000_000
}

impl MuxerConfig {
    pub fn new(format: ContainerFormat) -> Self {
        Self {
            format,
            chunk_duration_us: default_chunk_duration_us(),
            fragment_duration_us: default_fragment_duration_us(),
            pending_policy: PendingFramePolicy::default(),
        }
    }
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self::new(ContainerFormat::Mp4)
    }
}

/// A complete capture → encode → mux pipeline description.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub output_path: PathBuf,
    #[serde(default)]
    pub video: Option<SessionConfig>,
    #[serde(default)]
    pub audio: Option<SessionConfig>,
    #[serde(default)]
    pub muxer: MuxerConfig,
}

impl PipelineConfig {
    /// Parse and validate a pipeline config from a JSON string.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        debug!(
            output = %config.output_path.display(),
            video = config.video.is_some(),
            audio = config.audio.is_some(),
            format = ?config.muxer.format,
            "Parsed pipeline config"
        );
        config.validate()?;
        Ok(config)
    }

    /// Load a pipeline config from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read pipeline config");
            ConfigError::Io(e)
        })?;
        let config = Self::from_json_str(&json)?;
        info!(path = %path.display(), "Pipeline config loaded");
        Ok(config)
    }

    /// Validate structural requirements.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("Output path must not be empty".into()));
        }
        if self.video.is_none() && self.audio.is_none() {
            return Err(ConfigError::Invalid(
                "At least one of video or audio must be configured".into(),
            ));
        }
        if let Some(video) = &self.video {
            if !video.is_video() {
                return Err(ConfigError::Invalid("`video` holds an audio config".into()));
            }
            video
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if let Some(audio) = &self.audio {
            if audio.is_video() {
                return Err(ConfigError::Invalid("`audio` holds a video config".into()));
            }
            audio
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if self.muxer.chunk_duration_us <= 0 || self.muxer.fragment_duration_us <= 0 {
            return Err(ConfigError::Invalid(
                "Chunk and fragment durations must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video() -> VideoEncoderConfig {
        VideoEncoderConfig {
            codec: VideoCodec::H264,
            resolution: Resolution::HD,
            frame_rate: Rational::FPS_30,
            bitrate: 2_000_000,
            gop_secs: 1.0,
        }
    }

    #[test]
    fn gop_frames_from_seconds() {
        let mut cfg = video();
        assert_eq!(cfg.gop_frames(), 30);
        cfg.gop_secs = 0.0;
        assert_eq!(cfg.gop_frames(), 1);
    }

    #[test]
    fn validate_rejects_odd_resolution() {
        let mut cfg = video();
        cfg.resolution = Resolution::new(1279, 720);
        assert!(SessionConfig::video(cfg).validate().is_err());
    }

    #[test]
    fn validate_rejects_vp9() {
        let mut cfg = video();
        cfg.codec = VideoCodec::Vp9;
        let err = SessionConfig::video(cfg).validate().unwrap_err();
        assert!(err.to_string().contains("VP9"));
    }

    #[test]
    fn validate_rejects_silent_audio() {
        let cfg = AudioEncoderConfig {
            codec: AudioCodec::Aac,
            sample_rate: 0,
            channels: 2,
            bitrate: 128_000,
        };
        assert!(SessionConfig::audio(cfg).validate().is_err());
    }

    #[test]
    fn output_format_carries_bitrate() {
        let format = SessionConfig::video(video()).output_format();
        assert_eq!(format.bitrate, 2_000_000);
        assert_eq!(format.resolution, Some(Resolution::HD));
    }

    #[test]
    fn pipeline_from_json_applies_defaults() {
        let json = r#"{
            "output_path": "out.mp4",
            "video": {
                "media": { "Video": {
                    "codec": "H264",
                    "resolution": { "width": 1280, "height": 720 },
                    "frame_rate": { "num": 30, "den": 1 },
                    "bitrate": 2000000
                } }
            },
            "muxer": { "format": "FragmentedMp4" }
        }"#;
        let config = PipelineConfig::from_json_str(json).unwrap();
        let video = config.video.unwrap();
        assert_eq!(video.input_mode, InputMode::Buffer);
        assert_eq!(video.max_drain_retries, 5);
        assert_eq!(config.muxer.chunk_duration_us, 1_000_000);
        assert_eq!(
            config.muxer.pending_policy,
            PendingFramePolicy::Buffer { max_frames: 64 }
        );
    }

    #[test]
    fn pipeline_requires_a_stream() {
        let json = r#"{ "output_path": "out.mp4" }"#;
        assert!(matches!(
            PipelineConfig::from_json_str(json),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn pipeline_rejects_swapped_media() {
        let mut config = PipelineConfig {
            output_path: "out.flv".into(),
            video: None,
            audio: Some(SessionConfig::video(video())),
            muxer: MuxerConfig::new(ContainerFormat::Flv),
        };
        assert!(config.validate().is_err());
        config.video = config.audio.take();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let path = std::env::temp_dir().join("ck_common_missing_config.json");
        assert!(matches!(PipelineConfig::load(&path), Err(ConfigError::Io(_))));
    }
}
