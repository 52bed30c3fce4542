//! A [`FrameListener`] that forwards everything into a channel.
//!
//! Useful when the consumer lives on its own thread, and in tests.

use ck_common::{EncodeError, EncodedFrame, FrameListener};
use crossbeam::channel::{self, Receiver, Sender};
use tracing::debug;

/// What a session delivered.
#[derive(Debug)]
pub enum SessionOutput {
    Frame(EncodedFrame),
    Error(EncodeError),
}

/// Forwards frames and errors to an unbounded channel.
///
/// Frames that cannot be delivered (receiver gone) are closed immediately,
/// which hands their slot back to the hardware.
#[derive(Clone, Debug)]
pub struct ChannelListener {
    tx: Sender<SessionOutput>,
}

impl ChannelListener {
    pub fn new() -> (Self, Receiver<SessionOutput>) {
        let (tx, rx) = channel::unbounded();
        (Self { tx }, rx)
    }
}

impl FrameListener for ChannelListener {
    fn on_frame(&mut self, frame: EncodedFrame) {
        if let Err(channel::SendError(SessionOutput::Frame(frame))) =
            self.tx.send(SessionOutput::Frame(frame))
        {
            debug!("Listener receiver gone, closing frame");
            frame.close();
        }
    }

    fn on_error(&mut self, error: &EncodeError) {
        let _ = self.tx.send(SessionOutput::Error(error.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_common::{FrameFormat, Resolution, Rational, Timestamp, VideoCodec};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn frame() -> EncodedFrame {
        let format = Arc::new(FrameFormat::video(
            VideoCodec::H264,
            Resolution::HD,
            Rational::FPS_30,
        ));
        EncodedFrame::new(vec![1u8, 2, 3], Timestamp::ZERO, format)
    }

    #[test]
    fn forwards_frames_and_errors() {
        let (mut listener, rx) = ChannelListener::new();
        listener.on_frame(frame());
        listener.on_error(&EncodeError::Hardware("x".into()));
        assert!(matches!(rx.recv().unwrap(), SessionOutput::Frame(_)));
        assert!(matches!(rx.recv().unwrap(), SessionOutput::Error(_)));
    }

    #[test]
    fn closes_frame_when_receiver_is_gone() {
        let (mut listener, rx) = ChannelListener::new();
        drop(rx);
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();
        listener.on_frame(frame().with_release(Box::new(move || flag.store(true, Ordering::SeqCst))));
        assert!(closed.load(Ordering::SeqCst));
    }
}
