//! Software stand-in for a hardware encoder.
//!
//! `LoopbackCodec` implements the full [`HwCodec`] slot protocol without any
//! hardware: input slots are offered from a dedicated thread, every submitted
//! frame is wrapped in the codec's bitstream framing and lands in an output
//! slot, and slots must be handed back exactly once. A codec-config output is
//! emitted before the first frame after each start, carrying synthetic but
//! well-formed parameter sets so containers can build their sample entries.
//!
//! It backs the integration tests and lets a pipeline run end to end on
//! machines without an encoder.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use ck_common::annexb;
use ck_common::{
    AudioCodec, Codec, CodecCallbacks, EncodeError, EncodeResult, HwCodec, MediaConfig,
    OutputInfo, SessionConfig, SurfaceHandle, Timestamp, VideoCodec,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::error::SlotError;

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Slot counts and pacing.
#[derive(Clone, Debug)]
pub struct LoopbackOptions {
    pub input_slots: usize,
    pub output_slots: usize,
    /// Byte capacity of one input slot.
    pub input_capacity: usize,
    /// Pause before re-offering input after an empty submission.
    pub idle_backoff: Duration,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            input_slots: 4,
            output_slots: 4,
            input_capacity: 1 << 20,
            idle_backoff: Duration::from_millis(2),
        }
    }
}

/// Call counters, for tests and diagnostics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopbackStats {
    pub configures: u32,
    pub starts: u32,
    pub stops: u32,
    pub flushes: u32,
    pub resets: u32,
    pub frames_encoded: u64,
    pub empty_inputs: u64,
    pub key_frame_requests: u32,
    pub surfaces_created: u32,
    pub surfaces_released: u32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Phase {
    Unconfigured,
    Configured,
    Running,
    Released,
}

struct Hw {
    phase: Phase,
    codec: Option<Codec>,
    /// Sample rate and channel count of an audio configuration.
    audio: Option<(u32, u16)>,
    gop_frames: u64,
    bitrate: u32,
    callbacks: Option<CodecCallbacks>,

    free_inputs: VecDeque<usize>,
    /// Input slots handed out and not yet queued.
    offered_inputs: HashSet<usize>,
    free_outputs: VecDeque<usize>,
    /// Payload of every output slot the client currently holds.
    held_outputs: Vec<Option<Bytes>>,
    /// Filled slots not yet delivered.
    ready: VecDeque<(usize, OutputInfo)>,
    /// Encoded output waiting for a free slot.
    backlog: VecDeque<(Bytes, OutputInfo)>,

    frame_index: u64,
    config_emitted: bool,
    key_frame_requested: bool,
    idle_until: Option<Instant>,
    surface: Option<SurfaceHandle>,
    next_surface: u64,
    pending_error: Option<EncodeError>,
    fail_next_configure: Option<String>,

    shutdown: bool,
    worker: Option<JoinHandle<()>>,
    stats: LoopbackStats,
}

impl Hw {
    fn new(options: &LoopbackOptions) -> Self {
        let mut hw = Self {
            phase: Phase::Unconfigured,
            codec: None,
            audio: None,
            gop_frames: 1,
            bitrate: 0,
            callbacks: None,
            free_inputs: VecDeque::new(),
            offered_inputs: HashSet::new(),
            free_outputs: VecDeque::new(),
            held_outputs: Vec::new(),
            ready: VecDeque::new(),
            backlog: VecDeque::new(),
            frame_index: 0,
            config_emitted: false,
            key_frame_requested: false,
            idle_until: None,
            surface: None,
            next_surface: 1,
            pending_error: None,
            fail_next_configure: None,
            shutdown: false,
            worker: None,
            stats: LoopbackStats::default(),
        };
        hw.clear_in_flight(options);
        hw
    }

    /// Return every slot to the hardware and drop queued work.
    fn clear_in_flight(&mut self, options: &LoopbackOptions) {
        self.free_inputs = (0..options.input_slots).collect();
        self.offered_inputs.clear();
        self.free_outputs = (0..options.output_slots).collect();
        self.held_outputs = vec![None; options.output_slots];
        self.ready.clear();
        self.backlog.clear();
        self.frame_index = 0;
        self.key_frame_requested = false;
        self.idle_until = None;
    }

    fn require(&self, phase: Phase, op: &str) -> EncodeResult<()> {
        if self.phase == phase {
            Ok(())
        } else {
            Err(EncodeError::Hardware(format!(
                "{op} in phase {:?}",
                self.phase
            )))
        }
    }

    fn enqueue(&mut self, data: Bytes, info: OutputInfo) {
        self.backlog.push_back((data, info));
        self.assign_outputs();
    }

    fn assign_outputs(&mut self) {
        while !self.backlog.is_empty() {
            let Some(slot) = self.free_outputs.pop_front() else {
                break;
            };
            if let Some((data, info)) = self.backlog.pop_front() {
                self.held_outputs[slot] = Some(data);
                self.ready.push_back((slot, info));
            }
        }
    }

    /// Turn one submitted input into output slots.
    fn encode(&mut self, data: &[u8], pts: Timestamp, end_of_stream: bool) {
        let Some(codec) = self.codec else {
            return;
        };
        let pts_us = pts.as_micros();

        if !self.config_emitted {
            let csd = codec_config(codec, self.audio);
            self.enqueue(
                csd.clone(),
                OutputInfo {
                    pts_us,
                    size: csd.len(),
                    is_codec_config: true,
                    ..OutputInfo::default()
                },
            );
            self.config_emitted = true;
        }

        if !data.is_empty() {
            let is_key_frame = !codec.is_video()
                || self.key_frame_requested
                || self.frame_index.is_multiple_of(self.gop_frames);
            self.key_frame_requested = false;
            let payload = frame_payload(codec, is_key_frame, data);
            self.enqueue(
                payload.clone(),
                OutputInfo {
                    pts_us,
                    size: payload.len(),
                    is_key_frame,
                    is_end_of_stream: end_of_stream,
                    ..OutputInfo::default()
                },
            );
            self.frame_index += 1;
            self.stats.frames_encoded += 1;
        } else if end_of_stream {
            self.enqueue(
                Bytes::new(),
                OutputInfo {
                    pts_us,
                    is_end_of_stream: true,
                    ..OutputInfo::default()
                },
            );
        }
    }
}

struct Shared {
    options: LoopbackOptions,
    hw: Mutex<Hw>,
    wake: Condvar,
}

/// Software [`HwCodec`].
pub struct LoopbackCodec {
    shared: Arc<Shared>,
}

impl fmt::Debug for LoopbackCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hw = self.shared.hw.lock();
        f.debug_struct("LoopbackCodec")
            .field("phase", &hw.phase)
            .field("codec", &hw.codec)
            .field("frames_encoded", &hw.stats.frames_encoded)
            .finish()
    }
}

impl Default for LoopbackCodec {
    fn default() -> Self {
        Self::new(LoopbackOptions::default())
    }
}

impl LoopbackCodec {
    pub fn new(options: LoopbackOptions) -> Self {
        let hw = Hw::new(&options);
        Self {
            shared: Arc::new(Shared {
                options,
                hw: Mutex::new(hw),
                wake: Condvar::new(),
            }),
        }
    }

    pub fn stats(&self) -> LoopbackStats {
        self.shared.hw.lock().stats.clone()
    }

    /// Current bitrate target.
    pub fn bitrate(&self) -> u32 {
        self.shared.hw.lock().bitrate
    }

    /// Output slots held by the client (delivered or waiting for delivery).
    pub fn held_outputs(&self) -> usize {
        self.shared
            .hw
            .lock()
            .held_outputs
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Make the next `configure` fail with `reason`.
    pub fn fail_next_configure(&self, reason: impl Into<String>) {
        self.shared.hw.lock().fail_next_configure = Some(reason.into());
    }

    /// Raise an internal fault: posted as an event in asynchronous mode,
    /// returned by the next `dequeue_output` in synchronous mode.
    pub fn inject_error(&self, error: EncodeError) {
        self.shared.hw.lock().pending_error = Some(error);
        self.shared.wake.notify_all();
    }

    /// Render a frame into the input surface. Returns `false` when the
    /// surface is not the live one (a retired surface), in which case the
    /// frame is discarded.
    pub fn render_to_surface(
        &self,
        surface: SurfaceHandle,
        data: &[u8],
        pts: Timestamp,
    ) -> EncodeResult<bool> {
        let mut hw = self.shared.hw.lock();
        if hw.surface != Some(surface) || hw.phase != Phase::Running {
            debug!(surface = surface.0, "Discarding frame rendered to inactive surface");
            return Ok(false);
        }
        hw.encode(data, pts, false);
        drop(hw);
        self.shared.wake.notify_all();
        Ok(true)
    }

    /// Surface-mode end of stream.
    pub fn signal_end_of_stream(&self, pts: Timestamp) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        hw.require(Phase::Running, "end of stream")?;
        hw.encode(&[], pts, true);
        drop(hw);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn spawn_worker(&self, hw: &mut Hw) -> EncodeResult<()> {
        hw.shutdown = false;
        let shared = self.shared.clone();
        let worker = thread::Builder::new()
            .name("loopback-codec".to_string())
            .spawn(move || worker_loop(shared))
            .map_err(|e| EncodeError::Hardware(format!("Failed to spawn codec thread: {e}")))?;
        hw.worker = Some(worker);
        Ok(())
    }

    /// Stop the callback thread. Takes the guard so the lock is not held
    /// while joining.
    fn stop_worker(&self, mut hw: MutexGuard<'_, Hw>) {
        hw.shutdown = true;
        let worker = hw.worker.take();
        drop(hw);
        self.shared.wake.notify_all();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("Loopback codec thread panicked");
            }
        }
    }
}

impl Drop for LoopbackCodec {
    fn drop(&mut self) {
        HwCodec::release(self);
    }
}

/// Delivers ready outputs, pending faults and free input slots to the callbacks.
fn worker_loop(shared: Arc<Shared>) {
    let mut hw = shared.hw.lock();
    loop {
        if hw.shutdown {
            break;
        }
        let Some(callbacks) = hw.callbacks.clone() else {
            shared.wake.wait(&mut hw);
            continue;
        };

        if let Some(error) = hw.pending_error.take() {
            MutexGuard::unlocked(&mut hw, || callbacks.error(error));
            continue;
        }
        if let Some((index, info)) = hw.ready.pop_front() {
            MutexGuard::unlocked(&mut hw, || callbacks.output_available(index, info));
            continue;
        }

        // Backpressure: no new input while encoded output has nowhere to go.
        let can_offer = hw.phase == Phase::Running
            && hw.surface.is_none()
            && !hw.free_inputs.is_empty()
            && hw.backlog.len() < shared.options.output_slots;
        if can_offer {
            if let Some(deadline) = hw.idle_until {
                if Instant::now() < deadline {
                    shared.wake.wait_until(&mut hw, deadline);
                    continue;
                }
                hw.idle_until = None;
            }
            if let Some(index) = hw.free_inputs.pop_front() {
                hw.offered_inputs.insert(index);
                MutexGuard::unlocked(&mut hw, || callbacks.input_available(index));
            }
            continue;
        }

        shared.wake.wait(&mut hw);
    }
}

impl HwCodec for LoopbackCodec {
    fn name(&self) -> &str {
        "loopback"
    }

    fn configure(
        &self,
        config: &SessionConfig,
        callbacks: Option<CodecCallbacks>,
    ) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        hw.require(Phase::Unconfigured, "configure")?;
        if let Some(reason) = hw.fail_next_configure.take() {
            return Err(EncodeError::InvalidConfig(reason));
        }

        let (codec, gop_frames, bitrate, audio) = match &config.media {
            MediaConfig::Video(v) => (
                Codec::Video(v.codec),
                v.gop_frames() as u64,
                v.bitrate,
                None,
            ),
            MediaConfig::Audio(a) => (
                Codec::Audio(a.codec),
                1,
                a.bitrate,
                Some((a.sample_rate, a.channels)),
            ),
        };
        if matches!(
            codec,
            Codec::Video(VideoCodec::Vp9) | Codec::Audio(AudioCodec::Mp3)
        ) {
            return Err(EncodeError::InvalidConfig(format!(
                "Loopback cannot encode {}",
                codec.display_name()
            )));
        }

        hw.codec = Some(codec);
        hw.audio = audio;
        hw.gop_frames = gop_frames.max(1);
        hw.bitrate = bitrate;
        hw.config_emitted = false;
        hw.pending_error = None;
        hw.clear_in_flight(&self.shared.options);
        hw.phase = Phase::Configured;
        hw.stats.configures += 1;
        let asynchronous = callbacks.is_some();
        hw.callbacks = callbacks;
        if asynchronous {
            self.spawn_worker(&mut hw)?;
        }

        debug!(
            codec = codec.display_name(),
            asynchronous,
            gop = hw.gop_frames,
            "Loopback codec configured"
        );
        Ok(())
    }

    fn create_input_surface(&self) -> EncodeResult<SurfaceHandle> {
        let mut hw = self.shared.hw.lock();
        hw.require(Phase::Configured, "create input surface")?;
        let surface = SurfaceHandle(hw.next_surface);
        hw.next_surface += 1;
        hw.surface = Some(surface);
        hw.stats.surfaces_created += 1;
        Ok(surface)
    }

    fn release_surface(&self, surface: SurfaceHandle) {
        let mut hw = self.shared.hw.lock();
        if hw.surface == Some(surface) {
            hw.surface = None;
        }
        hw.stats.surfaces_released += 1;
    }

    fn start(&self) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        hw.require(Phase::Configured, "start")?;
        hw.phase = Phase::Running;
        hw.stats.starts += 1;
        drop(hw);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn stop(&self) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        if !matches!(hw.phase, Phase::Running | Phase::Configured) {
            return Err(EncodeError::Hardware(format!("stop in phase {:?}", hw.phase)));
        }
        hw.phase = Phase::Configured;
        hw.config_emitted = false;
        hw.clear_in_flight(&self.shared.options);
        hw.stats.stops += 1;
        Ok(())
    }

    fn flush(&self) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        hw.require(Phase::Running, "flush")?;
        hw.clear_in_flight(&self.shared.options);
        hw.stats.flushes += 1;
        drop(hw);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn reset(&self) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        match hw.phase {
            Phase::Unconfigured => {
                return Err(EncodeError::Hardware("codec already reset".to_string()))
            }
            Phase::Released => return Err(EncodeError::Hardware("codec released".to_string())),
            Phase::Configured | Phase::Running => {}
        }
        hw.phase = Phase::Unconfigured;
        hw.codec = None;
        hw.audio = None;
        hw.callbacks = None;
        hw.surface = None;
        hw.clear_in_flight(&self.shared.options);
        hw.stats.resets += 1;
        self.stop_worker(hw);
        Ok(())
    }

    fn release(&self) {
        let mut hw = self.shared.hw.lock();
        if hw.phase == Phase::Released {
            return;
        }
        hw.phase = Phase::Released;
        hw.callbacks = None;
        hw.surface = None;
        hw.clear_in_flight(&self.shared.options);
        info!(frames = hw.stats.frames_encoded, "Loopback codec released");
        self.stop_worker(hw);
    }

    fn input_capacity(&self) -> usize {
        self.shared.options.input_capacity
    }

    fn queue_input(
        &self,
        index: usize,
        data: &[u8],
        pts: Timestamp,
        end_of_stream: bool,
    ) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        hw.require(Phase::Running, "queue input")?;
        if data.len() > self.shared.options.input_capacity {
            return Err(SlotError::Overflow {
                len: data.len(),
                capacity: self.shared.options.input_capacity,
            }
            .into());
        }
        if !hw.offered_inputs.remove(&index) {
            return Err(SlotError::InputNotDequeued(index).into());
        }
        hw.free_inputs.push_back(index);

        if data.is_empty() && !end_of_stream {
            hw.stats.empty_inputs += 1;
            hw.idle_until = Some(Instant::now() + self.shared.options.idle_backoff);
        } else {
            hw.encode(data, pts, end_of_stream);
        }
        drop(hw);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn output_buffer(&self, index: usize) -> EncodeResult<Bytes> {
        let hw = self.shared.hw.lock();
        match hw.held_outputs.get(index) {
            Some(Some(data)) => Ok(data.clone()),
            Some(None) => Err(SlotError::NotOutstanding(index).into()),
            None => Err(SlotError::OutOfRange {
                index,
                count: hw.held_outputs.len(),
            }
            .into()),
        }
    }

    fn release_output(&self, index: usize) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        let count = hw.held_outputs.len();
        let slot = hw
            .held_outputs
            .get_mut(index)
            .ok_or(SlotError::OutOfRange { index, count })?;
        if slot.take().is_none() {
            return Err(SlotError::NotOutstanding(index).into());
        }
        hw.free_outputs.push_back(index);
        hw.assign_outputs();
        drop(hw);
        self.shared.wake.notify_all();
        Ok(())
    }

    fn dequeue_input(&self) -> EncodeResult<Option<usize>> {
        let mut hw = self.shared.hw.lock();
        hw.require(Phase::Running, "dequeue input")?;
        let index = hw.free_inputs.pop_front();
        if let Some(index) = index {
            hw.offered_inputs.insert(index);
        }
        Ok(index)
    }

    fn dequeue_output(&self) -> EncodeResult<Option<(usize, OutputInfo)>> {
        let mut hw = self.shared.hw.lock();
        if let Some(error) = hw.pending_error.take() {
            return Err(error);
        }
        hw.require(Phase::Running, "dequeue output")?;
        Ok(hw.ready.pop_front())
    }

    fn request_key_frame(&self) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        hw.require(Phase::Running, "request key frame")?;
        hw.key_frame_requested = true;
        hw.stats.key_frame_requests += 1;
        Ok(())
    }

    fn set_bitrate(&self, bitrate: u32) -> EncodeResult<()> {
        let mut hw = self.shared.hw.lock();
        hw.require(Phase::Running, "set bitrate")?;
        hw.bitrate = bitrate;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Synthetic bitstream
// ---------------------------------------------------------------------------

/// H.264 High profile, level 3.1.
const H264_SPS: [u8; 12] = [
    0x67, 0x64, 0x00, 0x1F, 0xAC, 0xD9, 0x40, 0x50, 0x05, 0xBB, 0x01, 0x10,
];
const H264_PPS: [u8; 6] = [0x68, 0xEB, 0xE3, 0xCB, 0x22, 0xC0];

const H265_VPS: [u8; 8] = [0x40, 0x01, 0x0C, 0x01, 0xFF, 0xFF, 0x01, 0x60];
/// H.265 Main profile, main tier, level 3.1 (before emulation prevention).
const H265_SPS_RBSP: [u8; 26] = [
    0x42, 0x01, // NAL header
    0x01, // vps id 0, max_sub_layers_minus1 0, temporal_id_nesting 1
    0x01, // profile_space 0, tier 0, profile_idc 1
    0x60, 0x00, 0x00, 0x00, // compatibility flags
    0x90, 0x00, 0x00, 0x00, 0x00, 0x00, // constraint flags
    0x5D, // level_idc 93
    0xA0, 0x02, 0x80, 0x80, 0x2D, 0x16, 0x59, 0x59, 0xA4, 0x93, 0x2B,
];
const H265_PPS: [u8; 7] = [0x44, 0x01, 0xC1, 0x72, 0xB4, 0x62, 0x40];

/// AV1 sequence header OBU: profile 0, level 4.0, main tier.
const AV1_SEQUENCE_HEADER: [u8; 12] = [
    0x0A, 0x0A, 0x00, 0x00, 0x00, 0x40, 0x9F, 0xFB, 0xFF, 0xF3, 0x00, 0x80,
];

const AAC_SAMPLE_RATES: [u32; 13] = [
    96_000, 88_200, 64_000, 48_000, 44_100, 32_000, 24_000, 22_050, 16_000, 12_000, 11_025,
    8_000, 7_350,
];

fn codec_config(codec: Codec, audio: Option<(u32, u16)>) -> Bytes {
    let (sample_rate, channels) = audio.unwrap_or((48_000, 2));
    match codec {
        Codec::Video(VideoCodec::H264) => annex_b(&[&H264_SPS, &H264_PPS]),
        Codec::Video(VideoCodec::H265) => {
            let sps = annexb::escape_rbsp(&H265_SPS_RBSP);
            annex_b(&[&H265_VPS, &sps, &H265_PPS])
        }
        Codec::Video(VideoCodec::Av1) => Bytes::from_static(&AV1_SEQUENCE_HEADER),
        Codec::Audio(AudioCodec::Aac) => aac_audio_specific_config(sample_rate, channels),
        Codec::Audio(AudioCodec::Opus) => opus_head(sample_rate, channels),
        Codec::Video(VideoCodec::Vp9) | Codec::Audio(AudioCodec::Mp3) => Bytes::new(),
    }
}

fn annex_b(nals: &[&[u8]]) -> Bytes {
    let mut out = Vec::new();
    for nal in nals {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }
    Bytes::from(out)
}

/// MPEG-4 AudioSpecificConfig for AAC-LC.
pub fn aac_audio_specific_config(sample_rate: u32, channels: u16) -> Bytes {
    let object_type: u64 = 2;
    let channels = u64::from(channels.min(7));
    match AAC_SAMPLE_RATES.iter().position(|&r| r == sample_rate) {
        Some(index) => {
            let bits = (object_type << 11) | ((index as u64) << 7) | (channels << 3);
            Bytes::copy_from_slice(&(bits as u16).to_be_bytes())
        }
        None => {
            // Escape index 15 followed by the explicit 24-bit rate: 40 bits.
            let bits = (object_type << 35)
                | (0xF << 31)
                | (u64::from(sample_rate & 0xFF_FFFF) << 7)
                | (channels << 3);
            Bytes::copy_from_slice(&bits.to_be_bytes()[3..])
        }
    }
}

/// Opus identification header (RFC 7845 §5.1), channel mapping family 0.
pub fn opus_head(sample_rate: u32, channels: u16) -> Bytes {
    let mut out = Vec::with_capacity(19);
    out.extend_from_slice(b"OpusHead");
    out.push(1);
    out.push(channels.min(2) as u8);
    out.extend_from_slice(&312u16.to_le_bytes());
    out.extend_from_slice(&sample_rate.to_le_bytes());
    out.extend_from_slice(&0i16.to_le_bytes());
    out.push(0);
    Bytes::from(out)
}

fn frame_payload(codec: Codec, is_key_frame: bool, data: &[u8]) -> Bytes {
    match codec {
        Codec::Video(VideoCodec::H264) => {
            let header: u8 = if is_key_frame { 0x65 } else { 0x41 };
            nal_with_header(&[header], data)
        }
        Codec::Video(VideoCodec::H265) => {
            // IDR_W_RADL (19) or TRAIL_R (1).
            let header: [u8; 2] = if is_key_frame { [0x26, 0x01] } else { [0x02, 0x01] };
            nal_with_header(&header, data)
        }
        Codec::Video(VideoCodec::Av1) => {
            let mut out = vec![0x12, 0x00]; // temporal delimiter
            out.push(0x32); // frame OBU with size field
            write_leb128(&mut out, data.len() as u64);
            out.extend_from_slice(data);
            Bytes::from(out)
        }
        _ => Bytes::copy_from_slice(data),
    }
}

fn nal_with_header(header: &[u8], payload: &[u8]) -> Bytes {
    let mut nal = header.to_vec();
    nal.extend_from_slice(payload);
    let mut out = START_CODE.to_vec();
    out.extend_from_slice(&annexb::escape_rbsp(&nal));
    Bytes::from(out)
}

fn write_leb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ck_common::{AudioEncoderConfig, CodecEvent, Rational, Resolution, VideoEncoderConfig};

    fn video(codec: VideoCodec) -> SessionConfig {
        SessionConfig::video(VideoEncoderConfig {
            codec,
            resolution: Resolution::HD,
            frame_rate: Rational::FPS_30,
            bitrate: 2_000_000,
            gop_secs: 0.1,
        })
    }

    fn sync_codec(config: &SessionConfig) -> LoopbackCodec {
        let codec = LoopbackCodec::default();
        codec.configure(config, None).unwrap();
        codec.start().unwrap();
        codec
    }

    #[test]
    fn codec_config_precedes_first_frame() {
        let codec = sync_codec(&video(VideoCodec::H264));
        let index = codec.dequeue_input().unwrap().unwrap();
        codec
            .queue_input(index, &[1, 2, 3], Timestamp::ZERO, false)
            .unwrap();

        let (csd, info) = codec.dequeue_output().unwrap().unwrap();
        assert!(info.is_codec_config);
        let data = codec.output_buffer(csd).unwrap();
        assert_eq!(annexb::nal_units(&data).count(), 2);
        codec.release_output(csd).unwrap();

        let (frame, info) = codec.dequeue_output().unwrap().unwrap();
        assert!(info.is_key_frame);
        let data = codec.output_buffer(frame).unwrap();
        let nal = annexb::nal_units(&data).next().unwrap();
        assert_eq!(annexb::h264_nal_type(nal), Some(5));
        codec.release_output(frame).unwrap();
    }

    #[test]
    fn double_release_fails() {
        let codec = sync_codec(&video(VideoCodec::H264));
        let index = codec.dequeue_input().unwrap().unwrap();
        codec.queue_input(index, &[1], Timestamp::ZERO, false).unwrap();
        let (slot, _) = codec.dequeue_output().unwrap().unwrap();
        codec.release_output(slot).unwrap();
        assert!(codec.release_output(slot).is_err());
        assert!(codec.release_output(99).is_err());
    }

    #[test]
    fn queue_requires_a_dequeued_slot() {
        let codec = sync_codec(&video(VideoCodec::H264));
        assert!(codec.queue_input(0, &[1], Timestamp::ZERO, false).is_err());
    }

    #[test]
    fn output_slots_exhaust_and_recover() {
        let codec = LoopbackCodec::new(LoopbackOptions {
            output_slots: 2,
            ..LoopbackOptions::default()
        });
        let config = SessionConfig::audio(AudioEncoderConfig {
            codec: AudioCodec::Aac,
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
        });
        codec.configure(&config, None).unwrap();
        codec.start().unwrap();

        for pts in 0..3 {
            let index = codec.dequeue_input().unwrap().unwrap();
            codec
                .queue_input(index, &[pts as u8], Timestamp(pts), false)
                .unwrap();
        }
        // codec config + 3 frames, only 2 slots
        let a = codec.dequeue_output().unwrap().unwrap();
        let b = codec.dequeue_output().unwrap().unwrap();
        assert!(codec.dequeue_output().unwrap().is_none());
        assert_eq!(codec.held_outputs(), 2);

        codec.release_output(a.0).unwrap();
        codec.release_output(b.0).unwrap();
        assert!(codec.dequeue_output().unwrap().is_some());
        assert!(codec.dequeue_output().unwrap().is_some());
    }

    #[test]
    fn key_frames_follow_gop_and_requests() {
        let codec = sync_codec(&video(VideoCodec::H264)); // gop of 3 frames
        let mut keys = Vec::new();
        for pts in 0..7 {
            if pts == 4 {
                codec.request_key_frame().unwrap();
            }
            let index = codec.dequeue_input().unwrap().unwrap();
            codec.queue_input(index, &[9], Timestamp(pts), false).unwrap();
            while let Some((slot, info)) = codec.dequeue_output().unwrap() {
                if !info.is_codec_config {
                    keys.push(info.is_key_frame);
                }
                codec.release_output(slot).unwrap();
            }
        }
        assert_eq!(keys, vec![true, false, false, true, true, false, true]);
    }

    #[test]
    fn reset_twice_reports_already_reset() {
        let codec = sync_codec(&video(VideoCodec::H265));
        codec.reset().unwrap();
        let err = codec.reset().unwrap_err();
        assert!(err.is_already_reset());
    }

    #[test]
    fn configure_failure_is_injectable() {
        let codec = LoopbackCodec::default();
        codec.fail_next_configure("no such profile");
        assert!(codec.configure(&video(VideoCodec::H264), None).is_err());
        assert!(codec.configure(&video(VideoCodec::H264), None).is_ok());
    }

    #[test]
    fn vp9_is_rejected() {
        let codec = LoopbackCodec::default();
        assert!(matches!(
            codec.configure(&video(VideoCodec::Vp9), None),
            Err(EncodeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn async_mode_offers_inputs_from_its_thread() {
        let codec = LoopbackCodec::default();
        let (tx, rx) = crossbeam::channel::unbounded();
        let callbacks = CodecCallbacks::new(move |event| {
            let _ = tx.send(event);
        });
        codec.configure(&video(VideoCodec::H264), Some(callbacks)).unwrap();
        codec.start().unwrap();

        let event = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let CodecEvent::InputAvailable(index) = event else {
            panic!("expected an input slot, got {event:?}");
        };
        codec.queue_input(index, &[5; 10], Timestamp(0), false).unwrap();

        let mut saw_frame = false;
        while let Ok(event) = rx.recv_timeout(Duration::from_secs(5)) {
            if let CodecEvent::OutputAvailable { index, info } = event {
                codec.release_output(index).unwrap();
                if !info.is_codec_config {
                    saw_frame = true;
                    break;
                }
            }
        }
        assert!(saw_frame);
        codec.release();
    }

    #[test]
    fn surface_frames_only_reach_the_live_surface() {
        let codec = LoopbackCodec::default();
        codec.configure(&video(VideoCodec::H264), None).unwrap();
        let surface = codec.create_input_surface().unwrap();
        codec.start().unwrap();

        assert!(codec.render_to_surface(surface, &[1], Timestamp(0)).unwrap());
        assert!(!codec
            .render_to_surface(SurfaceHandle(surface.0 + 7), &[1], Timestamp(1))
            .unwrap());
        assert_eq!(codec.stats().frames_encoded, 1);
    }

    #[test]
    fn aac_config_for_common_rates() {
        assert_eq!(&aac_audio_specific_config(48_000, 2)[..], &[0x11, 0x90]);
        assert_eq!(&aac_audio_specific_config(44_100, 2)[..], &[0x12, 0x10]);
        assert_eq!(aac_audio_specific_config(50_000, 1).len(), 5);
    }

    #[test]
    fn opus_head_layout() {
        let head = opus_head(48_000, 2);
        assert_eq!(head.len(), 19);
        assert_eq!(&head[..8], b"OpusHead");
        assert_eq!(head[9], 2);
    }

    #[test]
    fn h265_sps_is_escaped() {
        let csd = codec_config(Codec::Video(VideoCodec::H265), None);
        let nals: Vec<&[u8]> = annexb::nal_units(&csd).collect();
        assert_eq!(nals.len(), 3);
        assert_eq!(annexb::unescape_rbsp(nals[1]), H265_SPS_RBSP);
    }
}
