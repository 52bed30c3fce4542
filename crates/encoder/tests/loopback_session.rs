//! End-to-end session tests against the software loopback codec.
//!
//! These run the real actor and the loopback's callback thread, so they
//! exercise the same event ordering a hardware encoder produces.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ck_common::{
    AudioCodec, AudioEncoderConfig, EncodeError, EncodedFrame, Encoder, FrameSource, InputMode,
    Rational, RawFrame, Resolution, SessionConfig, Timestamp, VideoCodec, VideoEncoderConfig,
};
use ck_encoder::{
    ChannelListener, DriveMode, EncoderSession, LoopbackCodec, SessionOutput, SessionState,
};
use crossbeam::channel::Receiver;

const TIMEOUT: Duration = Duration::from_secs(5);

/// Produces `limit` frames of 33 ms each, then nothing.
struct CountingSource {
    next: u32,
    limit: u32,
}

impl CountingSource {
    fn new(limit: u32) -> Self {
        Self { next: 0, limit }
    }
}

impl FrameSource for CountingSource {
    fn fill_frame(&mut self, frame: &mut RawFrame, capacity: usize) -> bool {
        if self.next >= self.limit {
            return false;
        }
        let payload = vec![(self.next % 251) as u8 + 1; 64.min(capacity)];
        frame.refill(
            Bytes::from(payload),
            Timestamp::from_micros(i64::from(self.next) * 33_333),
            None,
        );
        self.next += 1;
        true
    }
}

fn video_config(codec: VideoCodec) -> SessionConfig {
    SessionConfig::video(VideoEncoderConfig {
        codec,
        resolution: Resolution::HD,
        frame_rate: Rational::FPS_30,
        bitrate: 3_000_000,
        gop_secs: 1.0,
    })
}

fn aac_config() -> SessionConfig {
    SessionConfig::audio(AudioEncoderConfig {
        codec: AudioCodec::Aac,
        sample_rate: 48_000,
        channels: 2,
        bitrate: 128_000,
    })
}

fn next_frame(rx: &Receiver<SessionOutput>) -> EncodedFrame {
    match rx.recv_timeout(TIMEOUT).expect("session output") {
        SessionOutput::Frame(frame) => frame,
        SessionOutput::Error(e) => panic!("unexpected error: {e}"),
    }
}

/// What a test keeps of a frame after handing its slot back.
#[derive(Debug)]
struct Seen {
    pts: i64,
    key: bool,
    extras: Option<Vec<Bytes>>,
}

/// Receive `count` frames, closing each one so the codec never runs out of
/// output slots.
fn drain_frames(rx: &Receiver<SessionOutput>, count: usize) -> Vec<Seen> {
    (0..count)
        .map(|_| {
            let frame = next_frame(rx);
            let seen = Seen {
                pts: frame.pts().as_micros(),
                key: frame.is_key_frame(),
                extras: frame.extras().map(<[Bytes]>::to_vec),
            };
            frame.close();
            seen
        })
        .collect()
}

fn wait_for_state(session: &EncoderSession, state: SessionState) {
    let deadline = std::time::Instant::now() + TIMEOUT;
    while session.state() != state {
        assert!(std::time::Instant::now() < deadline, "never reached {state}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn h264_session_emits_frames_with_parameter_sets() {
    let codec = Arc::new(LoopbackCodec::default());
    let (listener, rx) = ChannelListener::new();
    let session = EncoderSession::builder(codec.clone(), Box::new(listener))
        .name("h264")
        .source(Box::new(CountingSource::new(10)))
        .config(video_config(VideoCodec::H264))
        .build()
        .unwrap();
    session.start_stream().unwrap();

    let frames = drain_frames(&rx, 10);
    assert!(frames[0].key);
    assert_eq!(frames[0].extras.as_ref().map(Vec::len), Some(2));
    assert!(frames[1..].iter().all(|f| !f.key));
    for pair in frames.windows(2) {
        assert!(pair[1].pts > pair[0].pts);
    }
    assert_eq!(frames[3].pts, 3 * 33_333);
    assert_eq!(codec.held_outputs(), 0);

    session.stop_stream().unwrap();
    assert_eq!(session.state(), SessionState::Stopped);
    session.release().unwrap();
    assert_eq!(session.stats().frames_emitted, 10);
}

#[test]
fn h265_key_frames_carry_three_parameter_sets() {
    let codec = Arc::new(LoopbackCodec::default());
    let (listener, rx) = ChannelListener::new();
    let session = EncoderSession::builder(codec, Box::new(listener))
        .source(Box::new(CountingSource::new(2)))
        .config(video_config(VideoCodec::H265))
        .build()
        .unwrap();
    session.start_stream().unwrap();

    let first = next_frame(&rx);
    assert_eq!(first.extras().map(<[Bytes]>::len), Some(3));
    session.release().unwrap();
}

#[test]
fn aac_session_attaches_audio_specific_config() {
    let codec = Arc::new(LoopbackCodec::default());
    let (listener, rx) = ChannelListener::new();
    let session = EncoderSession::builder(codec, Box::new(listener))
        .source(Box::new(CountingSource::new(3)))
        .config(aac_config())
        .build()
        .unwrap();
    session.start_stream().unwrap();

    let frames = drain_frames(&rx, 3);
    assert!(frames.iter().all(|f| f.key));
    let extras = frames[0].extras.as_ref().unwrap();
    assert_eq!(&extras[0][..], &[0x11, 0x90]);
    assert!(matches!(
        session.request_key_frame(),
        Err(EncodeError::Unsupported(_))
    ));
}

#[test]
fn sync_session_encodes_pushed_frames() {
    let codec = Arc::new(LoopbackCodec::default());
    let (listener, rx) = ChannelListener::new();
    let session = EncoderSession::builder(codec, Box::new(listener))
        .mode(DriveMode::Sync)
        .config(video_config(VideoCodec::H264))
        .build()
        .unwrap();
    session.start_stream().unwrap();

    let mut frames = Vec::new();
    for i in 0..5 {
        let frame = RawFrame::new(vec![7u8; 32], Timestamp::from_micros(i * 33_333));
        let emitted = session.encode_sync(frame).unwrap();
        assert_eq!(emitted, 1);
        frames.extend(drain_frames(&rx, emitted));
    }
    assert!(frames[0].extras.is_some());
    assert!(frames[1].extras.is_none());
}

#[test]
fn hardware_fault_moves_session_to_error_until_reset() {
    let codec = Arc::new(LoopbackCodec::default());
    let (listener, rx) = ChannelListener::new();
    let session = EncoderSession::builder(codec.clone(), Box::new(listener))
        .source(Box::new(CountingSource::new(u32::MAX)))
        .config(video_config(VideoCodec::H264))
        .build()
        .unwrap();
    session.start_stream().unwrap();
    next_frame(&rx).close();

    codec.inject_error(EncodeError::Hardware("encoder hang".into()));
    wait_for_state(&session, SessionState::Error);

    let errors = rx
        .try_iter()
        .filter(|out| matches!(out, SessionOutput::Error(_)))
        .count();
    assert_eq!(errors, 1);
    assert!(codec.stats().stops >= 1);

    // Start is a no-op while in error; reset recovers.
    session.start_stream().unwrap();
    assert_eq!(session.state(), SessionState::Error);
    session.reset().unwrap();
    session.start_stream().unwrap();
    let frame = next_frame(&rx);
    assert!(frame.is_key_frame());
    session.release().unwrap();
}

#[test]
fn surface_session_discards_frames_for_retired_surface() {
    let codec = Arc::new(LoopbackCodec::default());
    let (listener, rx) = ChannelListener::new();
    let session = EncoderSession::builder(codec.clone(), Box::new(listener))
        .config(video_config(VideoCodec::H264).with_input_mode(InputMode::Surface))
        .build()
        .unwrap();
    let first = session.input_surface().unwrap();
    session.start_stream().unwrap();
    assert!(codec
        .render_to_surface(first, &[1, 2, 3], Timestamp::ZERO)
        .unwrap());
    next_frame(&rx).close();

    session.stop_stream().unwrap();
    assert_eq!(codec.stats().flushes, 1);
    session.reset().unwrap();
    let second = session.input_surface().unwrap();
    assert_ne!(first, second);

    session.start_stream().unwrap();
    assert!(!codec
        .render_to_surface(first, &[4], Timestamp::from_micros(10))
        .unwrap());

    session.release().unwrap();
    assert_eq!(codec.stats().surfaces_released, 2);
}

#[test]
fn end_of_stream_stops_a_surface_session() {
    let codec = Arc::new(LoopbackCodec::default());
    let (listener, _rx) = ChannelListener::new();
    let session = EncoderSession::builder(codec.clone(), Box::new(listener))
        .config(video_config(VideoCodec::H264).with_input_mode(InputMode::Surface))
        .build()
        .unwrap();
    session.start_stream().unwrap();
    codec.signal_end_of_stream(Timestamp::ZERO).unwrap();
    wait_for_state(&session, SessionState::Stopped);
}

#[test]
fn released_session_rejects_work_and_drop_is_quiet() {
    let codec = Arc::new(LoopbackCodec::default());
    let (listener, _rx) = ChannelListener::new();
    let session = EncoderSession::builder(codec, Box::new(listener))
        .config(video_config(VideoCodec::Av1))
        .build()
        .unwrap();
    session.release().unwrap();
    assert_eq!(session.configure(video_config(VideoCodec::Av1)), Err(EncodeError::Released));
    assert_eq!(session.set_bitrate(1), Err(EncodeError::Released));
    drop(session);
}
