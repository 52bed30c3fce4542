//! Bridge from an encoder session's listener callbacks into a muxer stream.

use std::sync::Arc;

use ck_common::{EncodeError, EncodedFrame, FrameListener, Muxer, StreamId};
use tracing::{error, warn};

/// Forwards every encoded frame to one stream of a shared muxer, then closes
/// the frame so its hardware slot is returned.
///
/// Write failures are logged and do not stop the session; only the failing
/// frame is lost.
pub struct MuxListener<M: Muxer> {
    muxer: Arc<M>,
    stream: StreamId,
    failed_writes: u64,
}

impl<M: Muxer> MuxListener<M> {
    pub fn new(muxer: Arc<M>, stream: StreamId) -> Self {
        Self {
            muxer,
            stream,
            failed_writes: 0,
        }
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes
    }
}

impl<M: Muxer> FrameListener for MuxListener<M> {
    fn on_frame(&mut self, frame: EncodedFrame) {
        if let Err(e) = self.muxer.write(&frame, self.stream) {
            self.failed_writes += 1;
            warn!(
                stream = %self.stream,
                pts = %frame.pts(),
                error = %e,
                "Muxer rejected frame"
            );
        }
        frame.close();
    }

    fn on_error(&mut self, error: &EncodeError) {
        error!(stream = %self.stream, error = %error, "Encoder session failed");
    }
}
