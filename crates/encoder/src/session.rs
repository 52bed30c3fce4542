//! Encoder session management.
//!
//! `EncoderSession` wraps an [`HwCodec`] and owns everything around it: the
//! lifecycle state machine, input feeding, the output protocol (parameter set
//! capture, timestamp repair, slot ownership) and fault recovery.
//!
//! All mutable state lives on a single actor thread. Public calls become
//! commands on a bounded queue and block until the actor replies; hardware
//! callbacks become events on a separate queue that never blocks the
//! hardware thread. The actor handles one message at a time, so no lifecycle
//! operation can interleave with an output callback.
//!
//! Frames reach the [`FrameListener`] on the actor thread. The listener must
//! not call back into the session it listens to.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use bytes::Bytes;
use ck_common::annexb;
use ck_common::{
    Codec, CodecCallbacks, CodecEvent, EncodeError, EncodeResult, EncodedFrame, Encoder,
    FrameFormat, FrameListener, FramePool, FrameSource, HwCodec, InputMode, MediaConfig,
    OutputInfo, RawFrame, SessionConfig, SurfaceHandle, Timestamp,
};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::state::{fault_action, plan, FaultAction, Op, SessionState, Transition};
use crate::timestamp::MonotonicTimestamps;

/// Command queue depth used until a config says otherwise.
pub const DEFAULT_COMMAND_QUEUE_DEPTH: usize = 16;

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters published by the session actor.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames handed to the listener.
    pub frames_emitted: u64,
    pub key_frames: u64,
    /// Payload bytes handed to the listener.
    pub bytes_emitted: u64,
    /// Input slots submitted with a frame.
    pub inputs_submitted: u64,
    /// Input slots submitted without payload.
    pub empty_inputs: u64,
    /// Output slots returned unseen because the session was not started.
    pub dropped_outputs: u64,
    pub repaired_timestamps: u64,
    /// Hardware faults observed.
    pub errors: u64,
}

/// How the session drives the hardware.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum DriveMode {
    /// The hardware posts slot events; the session reacts.
    #[default]
    Async,
    /// The caller pushes frames with [`EncoderSession::encode_sync`] and the
    /// session polls the hardware for output.
    Sync,
}

// ---------------------------------------------------------------------------
// Slot ledger
// ---------------------------------------------------------------------------

/// Output slots currently held by frames downstream.
///
/// The generation advances whenever the hardware reclaims every slot (stop,
/// reset, release). A frame closed after that carries a stale generation and
/// its close is a no-op.
#[derive(Debug, Default)]
struct SlotLedger {
    generation: u64,
    outstanding: HashSet<usize>,
}

impl SlotLedger {
    fn checkout(&mut self, index: usize) -> u64 {
        self.outstanding.insert(index);
        self.generation
    }
}

fn return_slot(ledger: &Mutex<SlotLedger>, codec: &dyn HwCodec, generation: u64, index: usize) {
    let mut ledger = ledger.lock();
    if ledger.generation != generation || !ledger.outstanding.remove(&index) {
        debug!(index, "Output slot already reclaimed");
        return;
    }
    if let Err(e) = codec.release_output(index) {
        warn!(index, error = %e, "Failed to return output slot");
    }
}

/// Split codec configuration output into individual parameter sets.
fn split_parameter_sets(codec: Codec, data: Bytes) -> Arc<[Bytes]> {
    if codec.is_annex_b() {
        annexb::nal_units(&data)
            .map(|nal| data.slice_ref(nal))
            .collect()
    } else {
        Arc::from(vec![data])
    }
}

// ---------------------------------------------------------------------------
// Actor messages
// ---------------------------------------------------------------------------

type Reply<T> = Sender<EncodeResult<T>>;

enum Command {
    Configure(SessionConfig, Reply<()>),
    Start(Reply<()>),
    Stop(Reply<()>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    Reset(Reply<()>),
    Release(Reply<()>),
    RequestKeyFrame(Reply<()>),
    SetBitrate(u32, Reply<()>),
    /// Sync mode: submit a frame (or pull one from the source) and drain.
    EncodeSync(Option<RawFrame>, Reply<usize>),
}

/// A hardware event tagged with the output epoch it was raised in.
struct Event {
    epoch: u64,
    event: CodecEvent,
}

#[derive(Debug, Default)]
struct Snapshot {
    state: SessionState,
    stats: SessionStats,
    surface: Option<SurfaceHandle>,
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Assembles an [`EncoderSession`] and spawns its actor thread.
pub struct SessionBuilder {
    name: String,
    codec: Arc<dyn HwCodec>,
    listener: Box<dyn FrameListener>,
    source: Option<Box<dyn FrameSource>>,
    pool: Option<Arc<FramePool<RawFrame>>>,
    mode: DriveMode,
    config: Option<SessionConfig>,
}

impl SessionBuilder {
    /// Name used for the actor thread and in log fields.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Producer for buffer-mode input slots.
    pub fn source(mut self, source: Box<dyn FrameSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Share a frame wrapper pool with other sessions. Defaults to a private pool.
    pub fn pool(mut self, pool: Arc<FramePool<RawFrame>>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn mode(mut self, mode: DriveMode) -> Self {
        self.mode = mode;
        self
    }

    /// Configure the session as part of `build`. Also sizes the command queue.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Spawn the actor and return the session handle.
    ///
    /// # Errors
    /// Returns `EncodeError::Hardware` if the actor thread cannot be spawned,
    /// or any error from the initial `configure`.
    pub fn build(self) -> EncodeResult<EncoderSession> {
        let SessionBuilder {
            name,
            codec,
            listener,
            source,
            pool,
            mode,
            config,
        } = self;

        let depth = config
            .as_ref()
            .map_or(DEFAULT_COMMAND_QUEUE_DEPTH, |c| c.command_queue_depth)
            .max(1);
        let (command_tx, command_rx) = channel::bounded(depth);
        let (event_tx, event_rx) = channel::unbounded();
        let snapshot = Arc::new(Mutex::new(Snapshot::default()));

        let actor = Actor {
            name: name.clone(),
            codec,
            mode,
            listener,
            source,
            pool: pool.unwrap_or_else(|| Arc::new(FramePool::new())),
            commands: command_rx,
            events: event_rx,
            event_tx,
            epoch: Arc::new(AtomicU64::new(0)),
            slots: Arc::new(Mutex::new(SlotLedger::default())),
            snapshot: snapshot.clone(),
            state: SessionState::Idle,
            config: None,
            format: None,
            extras: None,
            pts: MonotonicTimestamps::new(),
            dts: MonotonicTimestamps::new(),
            surface: None,
            retired_surfaces: Vec::new(),
            stop_requested: false,
            stats: SessionStats::default(),
        };

        let worker = thread::Builder::new()
            .name(format!("encoder-{name}"))
            .spawn(move || actor.run())
            .map_err(|e| EncodeError::Hardware(format!("Failed to spawn session thread: {e}")))?;

        info!(session = %name, mode = ?mode, queue_depth = depth, "Encoder session created");

        let session = EncoderSession {
            name,
            commands: command_tx,
            snapshot,
            actor_thread: worker.thread().id(),
            worker: Mutex::new(Some(worker)),
        };
        if let Some(config) = config {
            session.configure(config)?;
        }
        Ok(session)
    }
}

// ---------------------------------------------------------------------------
// EncoderSession
// ---------------------------------------------------------------------------

/// Handle to an encoder session actor.
///
/// # Usage
///
/// ```ignore
/// let session = EncoderSession::builder(codec, Box::new(listener))
///     .source(Box::new(camera))
///     .config(SessionConfig::video(video_config))
///     .build()?;
///
/// session.start_stream()?;
/// // ... frames arrive at the listener ...
/// session.stop_stream()?;
/// session.release()?;
/// ```
pub struct EncoderSession {
    name: String,
    commands: Sender<Command>,
    snapshot: Arc<Mutex<Snapshot>>,
    actor_thread: ThreadId,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for EncoderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snapshot = self.snapshot.lock();
        f.debug_struct("EncoderSession")
            .field("name", &self.name)
            .field("state", &snapshot.state)
            .field("frames_emitted", &snapshot.stats.frames_emitted)
            .field("surface", &snapshot.surface)
            .finish()
    }
}

impl EncoderSession {
    pub fn builder(codec: Arc<dyn HwCodec>, listener: Box<dyn FrameListener>) -> SessionBuilder {
        SessionBuilder {
            name: "session".to_string(),
            codec,
            listener,
            source: None,
            pool: None,
            mode: DriveMode::Async,
            config: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// State as of the last message the actor finished.
    pub fn state(&self) -> SessionState {
        self.snapshot.lock().state
    }

    pub fn stats(&self) -> SessionStats {
        self.snapshot.lock().stats.clone()
    }

    /// Current input surface in `InputMode::Surface`.
    pub fn input_surface(&self) -> Option<SurfaceHandle> {
        self.snapshot.lock().surface
    }

    /// Keep the hardware running but stop feeding it and drop its output.
    pub fn pause(&self) -> EncodeResult<()> {
        self.call(Command::Pause)
    }

    pub fn resume(&self) -> EncodeResult<()> {
        self.call(Command::Resume)
    }

    /// Sync mode: submit `frame` and drain whatever output is ready.
    ///
    /// Returns the number of frames handed to the listener.
    pub fn encode_sync(&self, frame: RawFrame) -> EncodeResult<usize> {
        self.call(|reply| Command::EncodeSync(Some(frame), reply))
    }

    /// Sync mode: pull the next frame from the source, submit it and drain.
    pub fn pump_sync(&self) -> EncodeResult<usize> {
        self.call(|reply| Command::EncodeSync(None, reply))
    }

    fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> EncodeResult<T> {
        if thread::current().id() == self.actor_thread {
            return Err(EncodeError::IllegalState {
                op: "call into the session",
                state: "inside its own listener".to_string(),
            });
        }
        let (reply_tx, reply_rx) = channel::bounded(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| EncodeError::Released)?;
        reply_rx.recv().map_err(|_| EncodeError::Released)?
    }
}

impl Encoder for EncoderSession {
    fn configure(&self, config: SessionConfig) -> EncodeResult<()> {
        self.call(|reply| Command::Configure(config, reply))
    }

    fn start_stream(&self) -> EncodeResult<()> {
        self.call(Command::Start)
    }

    fn stop_stream(&self) -> EncodeResult<()> {
        self.call(Command::Stop)
    }

    fn reset(&self) -> EncodeResult<()> {
        self.call(Command::Reset)
    }

    fn release(&self) -> EncodeResult<()> {
        let result = match self.call(Command::Release) {
            Err(EncodeError::Released) => Ok(()),
            other => other,
        };
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                error!(session = %self.name, "Session actor panicked");
            }
        }
        result
    }

    fn request_key_frame(&self) -> EncodeResult<()> {
        self.call(Command::RequestKeyFrame)
    }

    fn set_bitrate(&self, bitrate: u32) -> EncodeResult<()> {
        self.call(|reply| Command::SetBitrate(bitrate, reply))
    }
}

impl Drop for EncoderSession {
    fn drop(&mut self) {
        if let Err(e) = Encoder::release(self) {
            warn!(session = %self.name, error = %e, "Release on drop failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    name: String,
    codec: Arc<dyn HwCodec>,
    mode: DriveMode,
    listener: Box<dyn FrameListener>,
    source: Option<Box<dyn FrameSource>>,
    pool: Arc<FramePool<RawFrame>>,
    commands: Receiver<Command>,
    events: Receiver<Event>,
    event_tx: Sender<Event>,
    /// Bumped whenever queued hardware events become meaningless.
    epoch: Arc<AtomicU64>,
    slots: Arc<Mutex<SlotLedger>>,
    snapshot: Arc<Mutex<Snapshot>>,

    state: SessionState,
    config: Option<SessionConfig>,
    format: Option<Arc<FrameFormat>>,
    /// Parameter sets from the last codec-config output.
    extras: Option<Arc<[Bytes]>>,
    pts: MonotonicTimestamps,
    dts: MonotonicTimestamps,
    surface: Option<SurfaceHandle>,
    /// Surfaces replaced by a reset; kept alive until release.
    retired_surfaces: Vec<SurfaceHandle>,
    /// Set by an end-of-stream output; the stop runs after the current message.
    stop_requested: bool,
    stats: SessionStats,
}

impl Actor {
    fn run(mut self) {
        debug!(session = %self.name, "Session actor running");
        let commands = self.commands.clone();
        let events = self.events.clone();
        loop {
            crossbeam::channel::select! {
                recv(commands) -> msg => match msg {
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        debug!(session = %self.name, "All session handles dropped");
                        if let Err(e) = self.release() {
                            warn!(session = %self.name, error = %e, "Release failed");
                        }
                    }
                },
                recv(events) -> msg => {
                    if let Ok(event) = msg {
                        self.handle_event(event);
                    }
                }
            }

            if self.stop_requested {
                self.stop_requested = false;
                if let Err(e) = self.stop() {
                    warn!(session = %self.name, error = %e, "Stop after end of stream failed");
                }
            }
            self.publish();
            if self.state == SessionState::Released {
                break;
            }
        }
        debug!(session = %self.name, "Session actor exited");
    }

    fn handle_command(&mut self, command: Command) {
        // A dropped reply receiver only means the caller gave up waiting.
        match command {
            Command::Configure(config, reply) => {
                let _ = reply.send(self.configure(config));
            }
            Command::Start(reply) => {
                let _ = reply.send(self.start());
            }
            Command::Stop(reply) => {
                let _ = reply.send(self.stop());
            }
            Command::Pause(reply) => {
                let _ = reply.send(self.pause());
            }
            Command::Resume(reply) => {
                let _ = reply.send(self.resume());
            }
            Command::Reset(reply) => {
                let _ = reply.send(self.reset());
            }
            Command::Release(reply) => {
                let _ = reply.send(self.release());
            }
            Command::RequestKeyFrame(reply) => {
                let _ = reply.send(self.request_key_frame());
            }
            Command::SetBitrate(bitrate, reply) => {
                let _ = reply.send(self.set_bitrate(bitrate));
            }
            Command::EncodeSync(frame, reply) => {
                let _ = reply.send(self.encode_sync(frame));
            }
        }
    }

    fn publish(&self) {
        let mut snapshot = self.snapshot.lock();
        snapshot.state = self.state;
        snapshot.stats = self.stats.clone();
        snapshot.surface = self.surface;
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(session = %self.name, from = %self.state, to = %state, "State change");
            self.state = state;
            self.snapshot.lock().state = state;
        }
    }

    /// `Ok(true)` to proceed, `Ok(false)` for a quiet no-op.
    fn check(&self, op: Op) -> EncodeResult<bool> {
        match plan(self.state, op) {
            Transition::Proceed => Ok(true),
            Transition::NoOp => {
                debug!(session = %self.name, op = op.as_str(), state = %self.state, "No-op");
                Ok(false)
            }
            Transition::Reject(e) => Err(e),
        }
    }

    fn surface_mode(&self) -> bool {
        self.config
            .as_ref()
            .is_some_and(|c| c.input_mode == InputMode::Surface)
    }

    fn callbacks(&self) -> CodecCallbacks {
        let tx = self.event_tx.clone();
        let epoch = self.epoch.clone();
        CodecCallbacks::new(move |event| {
            // Unbounded: never blocks the hardware thread. Fails only once the
            // actor is gone, when the event no longer matters.
            let _ = tx.send(Event {
                epoch: epoch.load(Ordering::Acquire),
                event,
            });
        })
    }

    /// The hardware has taken every output slot back: forget the ones held
    /// downstream and ignore events already queued.
    fn invalidate_outputs(&self, hand_back: bool) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let mut ledger = self.slots.lock();
        let outstanding = ledger.outstanding.len();
        if hand_back {
            for index in ledger.outstanding.drain() {
                if let Err(e) = self.codec.release_output(index) {
                    debug!(index, error = %e, "Output slot already gone");
                }
            }
        } else {
            ledger.outstanding.clear();
        }
        ledger.generation += 1;
        if outstanding > 0 {
            debug!(session = %self.name, outstanding, "Reclaimed output slots");
        }
    }

    // -- lifecycle ----------------------------------------------------------

    fn configure(&mut self, config: SessionConfig) -> EncodeResult<()> {
        if !self.check(Op::Configure)? {
            return Ok(());
        }
        config.validate()?;
        if self.state == SessionState::Error {
            self.hw_reset()?;
        }
        self.apply_config(config)
    }

    fn apply_config(&mut self, config: SessionConfig) -> EncodeResult<()> {
        self.invalidate_outputs(false);
        let callbacks = match self.mode {
            DriveMode::Async => Some(self.callbacks()),
            DriveMode::Sync => None,
        };

        if let Err(e) = self.codec.configure(&config, callbacks) {
            warn!(session = %self.name, error = %e, "Codec configure failed, tearing down");
            self.teardown();
            return Err(e);
        }
        if config.input_mode == InputMode::Surface {
            match self.codec.create_input_surface() {
                Ok(surface) => {
                    if let Some(old) = self.surface.replace(surface) {
                        self.retired_surfaces.push(old);
                    }
                }
                Err(e) => {
                    warn!(session = %self.name, error = %e, "Input surface creation failed");
                    self.teardown();
                    return Err(e);
                }
            }
        }

        let format = Arc::new(config.output_format());
        info!(
            session = %self.name,
            codec = format.codec.display_name(),
            input_mode = ?config.input_mode,
            bitrate = format.bitrate,
            "Session configured"
        );
        self.format = Some(format);
        self.extras = None;
        self.pts.reset();
        self.dts.reset();
        self.config = Some(config);
        self.set_state(SessionState::Configured);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Err(e) = self.codec.reset() {
            debug!(session = %self.name, error = %e, "Reset during teardown failed");
        }
        self.set_state(SessionState::Idle);
    }

    /// Reset the hardware, tolerating an instance that is already reset.
    fn hw_reset(&mut self) -> EncodeResult<()> {
        let result = self.codec.reset();
        self.invalidate_outputs(false);
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_reset() => {
                debug!(session = %self.name, "Codec already reset");
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Error);
                Err(e)
            }
        }
    }

    fn start(&mut self) -> EncodeResult<()> {
        if !self.check(Op::Start)? {
            return Ok(());
        }
        self.set_state(SessionState::PendingStart);
        if let Err(e) = self.codec.start() {
            error!(session = %self.name, error = %e, "Codec start failed");
            self.stats.errors += 1;
            self.set_state(SessionState::Error);
            return Err(e);
        }
        self.set_state(SessionState::Started);
        info!(session = %self.name, "Session started");
        Ok(())
    }

    fn halt_hardware(&self) -> EncodeResult<()> {
        // A surface keeps producing after a stop, so only flush it.
        if self.surface_mode() {
            self.codec.flush()
        } else {
            self.codec.stop()
        }
    }

    fn stop(&mut self) -> EncodeResult<()> {
        if !self.check(Op::Stop)? {
            return Ok(());
        }
        self.set_state(SessionState::PendingStop);
        let result = self.halt_hardware();
        self.invalidate_outputs(false);
        match result {
            Ok(()) => {
                self.set_state(SessionState::Stopped);
                info!(
                    session = %self.name,
                    frames = self.stats.frames_emitted,
                    bytes = self.stats.bytes_emitted,
                    "Session stopped"
                );
                Ok(())
            }
            Err(e) => {
                error!(session = %self.name, error = %e, "Codec stop failed");
                self.set_state(SessionState::Error);
                Err(e)
            }
        }
    }

    fn pause(&mut self) -> EncodeResult<()> {
        if self.check(Op::Pause)? {
            self.set_state(SessionState::Paused);
            info!(session = %self.name, "Session paused");
        }
        Ok(())
    }

    fn resume(&mut self) -> EncodeResult<()> {
        if self.check(Op::Resume)? {
            self.set_state(SessionState::Started);
            info!(session = %self.name, "Session resumed");
        }
        Ok(())
    }

    fn reset(&mut self) -> EncodeResult<()> {
        if !self.check(Op::Reset)? {
            return Ok(());
        }
        let Some(config) = self.config.clone() else {
            return Err(EncodeError::IllegalState {
                op: Op::Reset.as_str(),
                state: self.state.to_string(),
            });
        };
        self.hw_reset()?;
        self.apply_config(config)
    }

    fn release(&mut self) -> EncodeResult<()> {
        if !self.check(Op::Release)? {
            return Ok(());
        }
        self.set_state(SessionState::PendingRelease);
        self.invalidate_outputs(true);
        for surface in self
            .surface
            .take()
            .into_iter()
            .chain(self.retired_surfaces.drain(..))
        {
            self.codec.release_surface(surface);
        }
        self.codec.release();
        self.set_state(SessionState::Released);
        info!(
            session = %self.name,
            frames = self.stats.frames_emitted,
            errors = self.stats.errors,
            "Session released"
        );
        Ok(())
    }

    fn require_started_video(&self, op: &'static str) -> EncodeResult<()> {
        if self.state.is_released() {
            return Err(EncodeError::Released);
        }
        if let Some(config) = &self.config {
            if !config.is_video() {
                return Err(EncodeError::Unsupported(format!(
                    "Cannot {op} on an audio session"
                )));
            }
        }
        if self.state != SessionState::Started {
            return Err(EncodeError::IllegalState {
                op,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    fn request_key_frame(&mut self) -> EncodeResult<()> {
        self.require_started_video("request a key frame")?;
        self.codec.request_key_frame()?;
        debug!(session = %self.name, "Key frame requested");
        Ok(())
    }

    fn set_bitrate(&mut self, bitrate: u32) -> EncodeResult<()> {
        self.require_started_video("change bitrate")?;
        if bitrate == 0 {
            return Err(EncodeError::InvalidConfig("Bitrate must be > 0".to_string()));
        }
        self.codec.set_bitrate(bitrate)?;

        if let Some(config) = self.config.as_mut() {
            if let MediaConfig::Video(video) = &mut config.media {
                video.bitrate = bitrate;
            }
        }
        if let Some(format) = self.format.as_mut() {
            let mut updated = (**format).clone();
            updated.bitrate = bitrate;
            *format = Arc::new(updated);
        }
        info!(session = %self.name, bitrate, "Bitrate changed");
        Ok(())
    }

    // -- hardware events ----------------------------------------------------

    fn handle_event(&mut self, event: Event) {
        if event.epoch != self.epoch.load(Ordering::Acquire) {
            debug!(session = %self.name, "Dropping stale hardware event");
            return;
        }
        match event.event {
            CodecEvent::InputAvailable(index) => {
                if let Err(e) = self.fill_and_queue(index) {
                    self.on_fault(e);
                }
            }
            CodecEvent::OutputAvailable { index, info } => self.on_output(index, info),
            CodecEvent::Error(e) => self.on_fault(e),
        }
    }

    /// Feed input slot `index` from the source, or submit it empty.
    fn fill_and_queue(&mut self, index: usize) -> EncodeResult<()> {
        let capacity = self.codec.input_capacity();
        let mut frame = self.pool.get();
        let filled = self.state.accepts_output()
            && !self.surface_mode()
            && self
                .source
                .as_mut()
                .is_some_and(|source| source.fill_frame(&mut frame, capacity));
        let result = if filled {
            self.queue_frame(index, &frame, capacity)
        } else {
            self.queue_empty(index)
        };
        frame.release();
        if self.pool.put(frame).is_err() {
            debug!(session = %self.name, "Frame pool closed, dropping wrapper");
        }
        result
    }

    fn queue_frame(&mut self, index: usize, frame: &RawFrame, capacity: usize) -> EncodeResult<()> {
        if frame.len() > capacity {
            warn!(
                session = %self.name,
                len = frame.len(),
                capacity,
                "Frame larger than input slot, submitting empty"
            );
            return self.queue_empty(index);
        }
        self.stats.inputs_submitted += 1;
        self.codec.queue_input(index, frame.data(), frame.pts(), false)
    }

    fn queue_empty(&mut self, index: usize) -> EncodeResult<()> {
        self.stats.empty_inputs += 1;
        self.codec.queue_input(index, &[], Timestamp::ZERO, false)
    }

    fn on_output(&mut self, index: usize, info: OutputInfo) {
        if !self.state.accepts_output() {
            self.stats.dropped_outputs += 1;
            debug!(session = %self.name, index, state = %self.state, "Dropping output");
            if let Err(e) = self.codec.release_output(index) {
                warn!(session = %self.name, index, error = %e, "Failed to return dropped output");
            }
            return;
        }
        if let Err(e) = self.emit_output(index, info) {
            self.on_fault(e);
        }
    }

    fn emit_output(&mut self, index: usize, info: OutputInfo) -> EncodeResult<()> {
        let Some(format) = self.format.clone() else {
            return self.codec.release_output(index);
        };

        if info.is_codec_config {
            let data = self.codec.output_buffer(index);
            self.codec.release_output(index)?;
            let extras = split_parameter_sets(format.codec, data?);
            debug!(session = %self.name, count = extras.len(), "Captured parameter sets");
            self.extras = Some(extras);
            return Ok(());
        }

        if info.size == 0 {
            self.codec.release_output(index)?;
            if info.is_end_of_stream {
                info!(session = %self.name, "End of stream");
                self.stop_requested = true;
            }
            return Ok(());
        }

        let data = match self.codec.output_buffer(index) {
            Ok(data) => data,
            Err(e) => {
                if let Err(release_err) = self.codec.release_output(index) {
                    debug!(index, error = %release_err, "Release after failed read");
                }
                return Err(e);
            }
        };

        let pts = self.pts.repair(info.pts_us);
        let dts = info.dts_us.map(|d| self.dts.repair(d));
        self.stats.repaired_timestamps = self.pts.repaired_count() + self.dts.repaired_count();

        let generation = self.slots.lock().checkout(index);
        let ledger = self.slots.clone();
        let codec = self.codec.clone();
        let len = data.len();

        let mut frame = EncodedFrame::new(data, Timestamp::from_micros(pts), format)
            .with_key_frame(info.is_key_frame)
            .with_release(Box::new(move || {
                return_slot(&ledger, codec.as_ref(), generation, index)
            }));
        if let Some(dts) = dts {
            frame = frame.with_dts(Timestamp::from_micros(dts));
        }
        if info.is_key_frame {
            if let Some(extras) = &self.extras {
                frame = frame.with_extras(extras.clone());
            }
            self.stats.key_frames += 1;
        }
        self.stats.frames_emitted += 1;
        self.stats.bytes_emitted += len as u64;

        self.listener.on_frame(frame);

        if info.is_end_of_stream {
            info!(session = %self.name, "End of stream");
            self.stop_requested = true;
        }
        Ok(())
    }

    fn on_fault(&mut self, err: EncodeError) {
        self.stats.errors += 1;
        match fault_action(self.state) {
            FaultAction::NotifyAndReset => {
                error!(session = %self.name, error = %err, "Codec fault before start, resetting");
                self.listener.on_error(&err);
                if let Some(config) = self.config.clone() {
                    if let Err(e) = self.hw_reset().and_then(|()| self.apply_config(config)) {
                        error!(session = %self.name, error = %e, "Recovery reset failed");
                        self.set_state(SessionState::Error);
                    }
                }
            }
            FaultAction::StopAndNotify => {
                error!(session = %self.name, state = %self.state, error = %err, "Codec fault, stopping");
                if let Err(e) = self.halt_hardware() {
                    debug!(session = %self.name, error = %e, "Best-effort stop failed");
                }
                self.invalidate_outputs(false);
                self.set_state(SessionState::Error);
                self.listener.on_error(&err);
            }
            FaultAction::LogOnly => {
                warn!(session = %self.name, state = %self.state, error = %err, "Codec fault ignored");
            }
        }
    }

    // -- synchronous mode ---------------------------------------------------

    fn encode_sync(&mut self, frame: Option<RawFrame>) -> EncodeResult<usize> {
        if self.mode != DriveMode::Sync {
            return Err(EncodeError::Unsupported(
                "Synchronous encoding on an asynchronous session".to_string(),
            ));
        }
        if self.state.is_released() {
            return Err(EncodeError::Released);
        }
        if self.state != SessionState::Started {
            return Err(EncodeError::IllegalState {
                op: "encode",
                state: self.state.to_string(),
            });
        }

        let emitted_before = self.stats.frames_emitted;
        if !self.surface_mode() {
            let queued = match self.codec.dequeue_input() {
                Ok(Some(index)) => match frame {
                    Some(mut frame) => {
                        let capacity = self.codec.input_capacity();
                        let result = self.queue_frame(index, &frame, capacity);
                        frame.release();
                        result
                    }
                    None => self.fill_and_queue(index),
                },
                Ok(None) => {
                    debug!(session = %self.name, "No input slot free, draining only");
                    Ok(())
                }
                Err(e) => Err(e),
            };
            if let Err(e) = queued {
                self.on_fault(e.clone());
                return Err(e);
            }
        }

        self.drain_sync()?;
        Ok((self.stats.frames_emitted - emitted_before) as usize)
    }

    /// Poll for output until `max_drain_retries` consecutive polls come back empty.
    fn drain_sync(&mut self) -> EncodeResult<()> {
        let max_retries = self
            .config
            .as_ref()
            .map_or(0, |c| c.max_drain_retries);
        let mut empty_polls = 0;
        while empty_polls < max_retries && self.state == SessionState::Started {
            match self.codec.dequeue_output() {
                Ok(Some((index, info))) => {
                    empty_polls = 0;
                    self.on_output(index, info);
                }
                Ok(None) => empty_polls += 1,
                Err(e) => {
                    self.on_fault(e.clone());
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}
