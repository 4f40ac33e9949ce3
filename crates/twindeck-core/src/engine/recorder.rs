//! Recording capture state machine
//!
//! Turns an imprecise "record" request into a capture that starts exactly
//! on a loop boundary of the monitored deck:
//!
//! ```text
//! idle --arm--> armed --monitored deck playing--> rehearsal
//! rehearsal --first crossing--> (phase locked) --second crossing--> recording
//!                                     \--> counting-in (N crossings) --> recording
//! recording --target bars reached / stop--> idle + CapturedAudio
//! any pending state --cancel--> idle (nothing captured)
//! ```
//!
//! The first captured frame is the first frame of the loop cycle that ends
//! rehearsal. Bars are counted from clock frames, never from wall time, and
//! the capture stops on the exact frame where the target bar count ends.
//!
//! Capture memory is allocated before the request reaches the audio thread
//! ([`CaptureLayout::buffer`]) and finished captures leave on their own
//! channel, apart from state and progress notifications.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use basedrop::{Handle, Owned};
use crossbeam::channel::{Sender, TrySendError};
use thiserror::Error;

use crate::config::RecordingConfig;
use crate::types::{seconds_per_bar, DeckId, StereoSample, NUM_DECKS};

use super::deck::Deck;
use super::events::{LoopEventBus, Subscription};
use super::looper::LoopRegion;
use super::sync::{MAX_BPM, MIN_BPM};

/// Queue depth for finished captures
pub const CAPTURE_QUEUE_CAPACITY: usize = 16;

/// Recording lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordingState {
    #[default]
    Idle,
    /// Requested; waiting for the monitored deck to play
    Armed,
    /// Waiting out one full loop cycle so the bar grid can be trusted
    Rehearsal,
    /// Extra loop cycles before capture
    CountingIn,
    /// Capturing the master output
    Recording,
}

impl RecordingState {
    fn as_u8(self) -> u8 {
        match self {
            RecordingState::Idle => 0,
            RecordingState::Armed => 1,
            RecordingState::Rehearsal => 2,
            RecordingState::CountingIn => 3,
            RecordingState::Recording => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => RecordingState::Armed,
            2 => RecordingState::Rehearsal,
            3 => RecordingState::CountingIn,
            4 => RecordingState::Recording,
            _ => RecordingState::Idle,
        }
    }

    /// Armed, rehearsing or counting in
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            RecordingState::Armed | RecordingState::Rehearsal | RecordingState::CountingIn
        )
    }
}

impl std::fmt::Display for RecordingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            RecordingState::Idle => "idle",
            RecordingState::Armed => "armed",
            RecordingState::Rehearsal => "rehearsal",
            RecordingState::CountingIn => "counting-in",
            RecordingState::Recording => "recording",
        })
    }
}

/// Rejections of a record request
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("a recording is already {0}")]
    Busy(RecordingState),

    #[error("invalid recording tempo {0}")]
    InvalidBpm(f64),

    #[error("deck {0} has no track loaded")]
    DeckNotLoaded(DeckId),

    #[error("capture buffer holds {reserved} frames, {needed} needed")]
    BufferTooSmall { needed: u64, reserved: u64 },
}

/// Failures of the capture path
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture sink rejected audio: {0}")]
    Sink(String),

    #[error("capture buffer is full")]
    BufferFull,

    #[error("no capture buffer was reserved")]
    NotReserved,

    #[error("no audio was captured")]
    Empty,

    #[error("finished capture could not be delivered")]
    Undelivered,

    #[error("failed to write WAV: {0}")]
    Wav(#[from] hound::Error),
}

fn check_bpm(bpm: f64) -> Result<(), RecordError> {
    if (MIN_BPM..=MAX_BPM).contains(&bpm) {
        Ok(())
    } else {
        Err(RecordError::InvalidBpm(bpm))
    }
}

/// Capture sizing, shared by the recorder and whoever allocates its buffers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptureLayout {
    pub sample_rate: u32,
    /// Bar ceiling
    pub max_bars: u32,
    pub chunk_frames: usize,
}

impl CaptureLayout {
    pub fn new(config: &RecordingConfig, sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            max_bars: config.max_bars.max(1),
            chunk_frames: config.chunk_frames.max(1),
        }
    }

    /// Bars a request records; `None` means the ceiling
    pub fn target_bars(&self, requested: Option<u32>) -> u32 {
        requested.unwrap_or(self.max_bars).clamp(1, self.max_bars)
    }

    /// Exact length of a `target_bars` capture at `bpm`
    pub fn capture_frames(&self, bpm: f64, target_bars: u32) -> u64 {
        (target_bars as f64 * seconds_per_bar(bpm) * self.sample_rate as f64).round() as u64
    }

    /// Allocate storage for a whole capture request
    ///
    /// Call this off the audio thread.
    pub fn buffer(&self, bpm: f64, requested: Option<u32>) -> Result<CaptureBuffer, RecordError> {
        check_bpm(bpm)?;
        let frames = self.capture_frames(bpm, self.target_bars(requested));
        Ok(CaptureBuffer::new(frames, self.chunk_frames))
    }
}

/// Pre-allocated chunk storage for one capture
///
/// Every chunk exists before recording starts. Writing copies into spare
/// capacity and finishing moves the filled chunks out.
pub struct CaptureBuffer {
    filled: Vec<Vec<StereoSample>>,
    spare: Vec<Vec<StereoSample>>,
    chunk_frames: usize,
}

impl CaptureBuffer {
    pub fn new(frames: u64, chunk_frames: usize) -> Self {
        let chunk_frames = chunk_frames.max(1);
        let count = (frames.div_ceil(chunk_frames as u64) as usize).max(1);
        let mut spare = Vec::with_capacity(count);
        spare.resize_with(count, || Vec::with_capacity(chunk_frames));
        Self {
            filled: Vec::with_capacity(count),
            spare,
            chunk_frames,
        }
    }

    /// Frames that fit without allocating
    pub fn capacity_frames(&self) -> u64 {
        ((self.filled.len() + self.spare.len()) * self.chunk_frames) as u64
    }

    pub fn len_frames(&self) -> u64 {
        self.filled.iter().map(|chunk| chunk.len() as u64).sum()
    }

    pub fn chunk_count(&self) -> usize {
        self.filled.len()
    }

    pub fn write(&mut self, mut frames: &[StereoSample]) -> Result<(), CaptureError> {
        while !frames.is_empty() {
            if self.filled.last().map_or(true, |c| c.len() == self.chunk_frames) {
                let chunk = self.spare.pop().ok_or(CaptureError::BufferFull)?;
                self.filled.push(chunk);
            }
            let Some(chunk) = self.filled.last_mut() else {
                return Err(CaptureError::BufferFull);
            };
            let take = (self.chunk_frames - chunk.len()).min(frames.len());
            chunk.extend_from_slice(&frames[..take]);
            frames = &frames[take..];
        }
        Ok(())
    }

    /// Empty every chunk back into the spare pool
    pub fn reset(&mut self) {
        for mut chunk in self.filled.drain(..) {
            chunk.clear();
            self.spare.push(chunk);
        }
    }

    /// Move the filled chunks out, in recording order
    pub fn take_chunks(&mut self) -> Vec<Vec<StereoSample>> {
        std::mem::take(&mut self.filled)
    }
}

impl fmt::Debug for CaptureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureBuffer")
            .field("filled", &self.filled.len())
            .field("spare", &self.spare.len())
            .field("chunk_frames", &self.chunk_frames)
            .finish()
    }
}

/// A [`CaptureBuffer`] on its way to the audio thread
///
/// Wherever it is dropped, the storage is freed on the reclaimer thread.
pub struct CaptureReservation(Owned<CaptureBuffer>);

impl CaptureReservation {
    pub fn new(handle: &Handle, buffer: CaptureBuffer) -> Self {
        Self(Owned::new(handle, buffer))
    }
}

impl Deref for CaptureReservation {
    type Target = CaptureBuffer;

    fn deref(&self) -> &CaptureBuffer {
        &self.0
    }
}

impl DerefMut for CaptureReservation {
    fn deref_mut(&mut self) -> &mut CaptureBuffer {
        &mut self.0
    }
}

impl fmt::Debug for CaptureReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// Destination for captured frames
///
/// Every method runs on the audio thread.
pub trait CaptureSink: Send {
    /// Storage for the next capture; sinks that keep nothing in memory drop it
    fn reserve(&mut self, buffer: CaptureReservation) {
        drop(buffer);
    }

    /// Prepare for a new capture, dropping anything left from the last one
    fn begin(&mut self, sample_rate: u32) -> Result<(), CaptureError>;

    fn write(&mut self, frames: &[StereoSample]) -> Result<(), CaptureError>;

    /// Hand over the chunks written since `begin`
    fn finish(&mut self) -> Result<Vec<Vec<StereoSample>>, CaptureError>;

    /// Throw away everything written since `begin`
    fn discard(&mut self);

    /// Chunks held since `begin`
    fn chunk_count(&self) -> usize;
}

/// In-memory sink filling a reserved [`CaptureBuffer`]
#[derive(Debug, Default)]
pub struct MemorySink {
    buffer: Option<CaptureReservation>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureSink for MemorySink {
    fn reserve(&mut self, buffer: CaptureReservation) {
        self.buffer = Some(buffer);
    }

    fn begin(&mut self, _sample_rate: u32) -> Result<(), CaptureError> {
        let buffer = self.buffer.as_mut().ok_or(CaptureError::NotReserved)?;
        buffer.reset();
        Ok(())
    }

    fn write(&mut self, frames: &[StereoSample]) -> Result<(), CaptureError> {
        self.buffer
            .as_mut()
            .ok_or(CaptureError::NotReserved)?
            .write(frames)
    }

    fn finish(&mut self) -> Result<Vec<Vec<StereoSample>>, CaptureError> {
        let mut buffer = self.buffer.take().ok_or(CaptureError::NotReserved)?;
        Ok(buffer.take_chunks())
    }

    fn discard(&mut self) {
        self.buffer = None;
    }

    fn chunk_count(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.chunk_count())
    }
}

/// A finished bar-aligned capture
///
/// Frames stay in the chunks they were recorded into; [`frames`](Self::frames)
/// joins them.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedAudio {
    chunks: Vec<Vec<StereoSample>>,
    pub sample_rate: u32,
    /// Tempo the bar math was done at
    pub bpm: f64,
    /// Clock frame of the first captured frame
    pub start_clock_frame: u64,
    pub start_clock_time: f64,
    /// Duration measured from the captured frames
    pub duration_seconds: f64,
    pub bars_recorded: f64,
}

impl CapturedAudio {
    pub fn chunks(&self) -> &[Vec<StereoSample>] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn frame_count(&self) -> usize {
        self.chunks.iter().map(Vec::len).sum()
    }

    pub fn iter_frames(&self) -> impl Iterator<Item = &StereoSample> + '_ {
        self.chunks.iter().flatten()
    }

    /// The capture as one contiguous buffer
    pub fn frames(&self) -> Vec<StereoSample> {
        self.chunks.concat()
    }

    /// Write as 32-bit float stereo WAV
    pub fn write_wav(&self, path: &Path) -> Result<(), CaptureError> {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: self.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for frame in self.iter_frames() {
            writer.write_sample(frame.left)?;
            writer.write_sample(frame.right)?;
        }
        writer.finalize()?;
        log::info!(
            "Wrote {:.2} bars ({:.2}s) to {:?}",
            self.bars_recorded,
            self.duration_seconds,
            path
        );
        Ok(())
    }
}

/// Notifications for the UI
///
/// These may be dropped when nobody drains them. The audio of a finished
/// capture travels on the capture channel instead.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordingEvent {
    StateChanged(RecordingState),
    /// A whole bar was completed
    Progress { bars: u32, target_bars: u32 },
    /// The capture was queued on the capture channel
    Finished { bars_recorded: f64, duration_seconds: f64 },
    Failed { reason: String },
    Cancelled,
}

/// Lock-free recorder state, plus the cancellation flag
pub struct RecorderAtomics {
    state: AtomicU8,
    bars_recorded: AtomicU64,
    cancel_requested: AtomicBool,
}

impl RecorderAtomics {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(RecordingState::Idle.as_u8()),
            bars_recorded: AtomicU64::new(0f64.to_bits()),
            cancel_requested: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> RecordingState {
        RecordingState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn bars_recorded(&self) -> f64 {
        f64::from_bits(self.bars_recorded.load(Ordering::Relaxed))
    }

    /// Flag the pending recording for cancellation
    ///
    /// Takes effect before the recorder acts on any further loop crossing,
    /// even if the matching command is still queued.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
    }
}

/// Session bookkeeping for one record request
#[derive(Debug, Clone)]
pub struct RecordingSession {
    pub monitored: DeckId,
    pub bpm: f64,
    pub target_bars: u32,
    pub start_clock_frame: Option<u64>,
    pub frames_captured: u64,
    end_clock_frame: u64,
    region: LoopRegion,
    /// Loop change already queued on the deck when the session was armed
    pending: Option<LoopRegion>,
    loop_enabled: bool,
    crossings: u32,
    count_in_remaining: u32,
    last_cycle: u64,
    reported_bars: u32,
}

impl RecordingSession {
    /// Whether the monitored loop is still the one the session was armed on
    ///
    /// A loop change queued before arming may take over at its boundary; the
    /// session then follows the new region.
    fn follow_loop(&mut self, deck: &Deck) -> bool {
        let looper = deck.looper();
        if !deck.has_track() || looper.is_enabled() != self.loop_enabled {
            return false;
        }
        let region = looper.region();
        let pending = looper.pending_region();
        if region == self.region && pending == self.pending {
            return true;
        }
        if pending.is_none() && self.pending == Some(region) {
            log::debug!("Deck {}: queued loop change took over", self.monitored);
            self.region = region;
            self.pending = None;
            return true;
        }
        false
    }
}

/// The capture state machine
pub struct Recorder {
    state: RecordingState,
    session: Option<RecordingSession>,
    sink: Box<dyn CaptureSink>,
    restarts: Option<Subscription>,
    events: Sender<RecordingEvent>,
    captures: Sender<CapturedAudio>,
    /// Frees captures that cannot be delivered
    handle: Handle,
    atomics: Arc<RecorderAtomics>,
    layout: CaptureLayout,
    count_in_cycles: u32,
}

impl Recorder {
    pub fn new(
        config: &RecordingConfig,
        sample_rate: u32,
        sink: Box<dyn CaptureSink>,
        events: Sender<RecordingEvent>,
        captures: Sender<CapturedAudio>,
        handle: Handle,
    ) -> Self {
        Self {
            state: RecordingState::Idle,
            session: None,
            sink,
            restarts: None,
            events,
            captures,
            handle,
            atomics: Arc::new(RecorderAtomics::new()),
            layout: CaptureLayout::new(config, sample_rate),
            count_in_cycles: config.count_in_cycles,
        }
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn session(&self) -> Option<&RecordingSession> {
        self.session.as_ref()
    }

    pub fn atomics(&self) -> Arc<RecorderAtomics> {
        Arc::clone(&self.atomics)
    }

    pub fn layout(&self) -> CaptureLayout {
        self.layout
    }

    /// Replace the capture sink; only while idle
    pub fn set_sink(&mut self, sink: Box<dyn CaptureSink>) -> bool {
        if self.state != RecordingState::Idle {
            return false;
        }
        self.sink = sink;
        true
    }

    /// Chunks currently held by the sink
    pub fn chunk_count(&self) -> usize {
        self.sink.chunk_count()
    }

    /// Arm a recording of `target_bars` (capped at the ceiling) at `bpm`
    ///
    /// `buffer` must hold the whole capture; see [`CaptureLayout::buffer`].
    pub fn arm(
        &mut self,
        deck: &Deck,
        bpm: f64,
        target_bars: Option<u32>,
        buffer: CaptureReservation,
        bus: &mut LoopEventBus,
    ) -> Result<(), RecordError> {
        self.apply_pending_cancel(bus);

        if self.state != RecordingState::Idle {
            log::warn!("Record request rejected: already {}", self.state);
            return Err(RecordError::Busy(self.state));
        }
        check_bpm(bpm)?;
        if !deck.has_track() {
            log::warn!("Record request rejected: deck {} is empty", deck.id());
            return Err(RecordError::DeckNotLoaded(deck.id()));
        }

        let target_bars = self.layout.target_bars(target_bars);
        let needed = self.layout.capture_frames(bpm, target_bars);
        let reserved = buffer.capacity_frames();
        if reserved < needed {
            log::warn!("Record request rejected: {} frames reserved, {} needed", reserved, needed);
            return Err(RecordError::BufferTooSmall { needed, reserved });
        }
        self.sink.reserve(buffer);

        let looper = deck.looper();
        self.restarts = Some(bus.subscribe(Some(deck.id())));
        self.session = Some(RecordingSession {
            monitored: deck.id(),
            bpm,
            target_bars,
            start_clock_frame: None,
            frames_captured: 0,
            end_clock_frame: u64::MAX,
            region: looper.region(),
            pending: looper.pending_region(),
            loop_enabled: looper.is_enabled(),
            crossings: 0,
            count_in_remaining: self.count_in_cycles,
            last_cycle: looper.cycle(),
            reported_bars: 0,
        });
        self.atomics.bars_recorded.store(0f64.to_bits(), Ordering::Relaxed);
        log::info!(
            "Recording armed on deck {}: {} bars at {:.2} BPM",
            deck.id(),
            target_bars,
            bpm
        );
        self.transition(RecordingState::Armed);
        Ok(())
    }

    /// Abandon a pending or running recording without output
    pub fn cancel(&mut self, bus: &mut LoopEventBus) -> bool {
        self.atomics.cancel_requested.store(false, Ordering::Release);
        if self.session.is_none() {
            return false;
        }
        log::info!("Recording cancelled while {}", self.state);
        self.end_session(bus);
        self.emit(RecordingEvent::Cancelled);
        self.transition(RecordingState::Idle);
        true
    }

    /// User stop: finalize a running capture, or cancel a pending one
    pub fn stop(&mut self, bus: &mut LoopEventBus) -> bool {
        match self.state {
            RecordingState::Idle => false,
            RecordingState::Recording => {
                self.finalize(bus);
                true
            }
            _ => self.cancel(bus),
        }
    }

    /// Advance the state machine by one tick
    ///
    /// `master` is the mixed output of the tick that starts at clock frame
    /// `tick_start`. Must run after the decks have published this tick's
    /// restarts.
    pub fn on_tick(
        &mut self,
        tick_start: u64,
        master: &[StereoSample],
        decks: &[Deck; NUM_DECKS],
        bus: &mut LoopEventBus,
    ) {
        if self.apply_pending_cancel(bus) {
            return;
        }
        let pending = self.state.is_pending();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let monitored = session.monitored;
        let deck = &decks[monitored.index()];

        if pending && !session.follow_loop(deck) {
            log::info!("Loop on deck {} changed before capture started", monitored);
            self.cancel(bus);
            return;
        }

        if self.state == RecordingState::Armed && deck.is_playing() {
            self.transition(RecordingState::Rehearsal);
        }

        self.handle_crossings(bus);
        if self.state == RecordingState::Recording {
            self.capture(tick_start, master, bus);
        }
    }

    fn handle_crossings(&mut self, bus: &mut LoopEventBus) {
        let Some(restarts) = self.restarts.take() else {
            return;
        };

        for restart in restarts.drain() {
            if self.atomics.cancel_requested.load(Ordering::Acquire) {
                self.cancel(bus);
                bus.unsubscribe(restarts.id());
                return;
            }
            let Some(session) = self.session.as_mut() else {
                break;
            };
            if restart.cycle <= session.last_cycle {
                continue;
            }
            session.last_cycle = restart.cycle;

            match self.state {
                RecordingState::Rehearsal => {
                    session.crossings += 1;
                    if session.crossings == 1 {
                        log::info!("Rehearsal: phase locked at cycle {}", restart.cycle);
                    } else if session.count_in_remaining > 0 {
                        self.transition(RecordingState::CountingIn);
                    } else {
                        self.start_capture(restart.clock_frame, bus);
                    }
                }
                RecordingState::CountingIn => {
                    session.count_in_remaining = session.count_in_remaining.saturating_sub(1);
                    if session.count_in_remaining == 0 {
                        self.start_capture(restart.clock_frame, bus);
                    }
                }
                _ => {}
            }
        }

        if self.session.is_some() {
            self.restarts = Some(restarts);
        } else {
            bus.unsubscribe(restarts.id());
        }
    }

    fn start_capture(&mut self, clock_frame: u64, bus: &mut LoopEventBus) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let length = self.layout.capture_frames(session.bpm, session.target_bars);
        session.start_clock_frame = Some(clock_frame);
        session.end_clock_frame = clock_frame + length;

        if let Err(e) = self.sink.begin(self.layout.sample_rate) {
            self.fail(e.to_string(), bus);
            return;
        }
        log::info!(
            "Recording started at clock {:.4}s for {} bars",
            clock_frame as f64 / self.layout.sample_rate as f64,
            session.target_bars
        );
        self.transition(RecordingState::Recording);
    }

    fn capture(&mut self, tick_start: u64, master: &[StereoSample], bus: &mut LoopEventBus) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(start) = session.start_clock_frame else {
            return;
        };
        let tick_end = tick_start + master.len() as u64;
        let from = start.max(tick_start);
        let to = session.end_clock_frame.min(tick_end);

        if to > from {
            let slice = &master[(from - tick_start) as usize..(to - tick_start) as usize];
            if let Err(e) = self.sink.write(slice) {
                self.fail(e.to_string(), bus);
                return;
            }
            session.frames_captured += to - from;
        }

        let elapsed = (to.max(start) - start) as f64 / self.layout.sample_rate as f64;
        let bars = elapsed / seconds_per_bar(session.bpm);
        self.atomics.bars_recorded.store(bars.to_bits(), Ordering::Relaxed);

        let whole = (bars + 1e-9).floor() as u32;
        let progress = (whole > session.reported_bars).then(|| {
            session.reported_bars = whole;
            RecordingEvent::Progress {
                bars: whole,
                target_bars: session.target_bars,
            }
        });
        let reached_target = tick_end >= session.end_clock_frame;

        if let Some(progress) = progress {
            self.emit(progress);
        }
        if reached_target {
            log::info!("Recording reached its bar target");
            self.finalize(bus);
        }
    }

    fn finalize(&mut self, bus: &mut LoopEventBus) {
        let Some(session) = self.session.clone() else {
            return;
        };
        let chunks = match self.sink.finish() {
            Ok(chunks) if chunks.iter().all(Vec::is_empty) => {
                self.fail(CaptureError::Empty.to_string(), bus);
                return;
            }
            Ok(chunks) => chunks,
            Err(e) => {
                self.fail(e.to_string(), bus);
                return;
            }
        };

        let sample_rate = self.layout.sample_rate;
        let start_clock_frame = session.start_clock_frame.unwrap_or_default();
        let frame_count: usize = chunks.iter().map(Vec::len).sum();
        let duration_seconds = frame_count as f64 / sample_rate as f64;
        let bars_recorded = duration_seconds / seconds_per_bar(session.bpm);
        let captured = CapturedAudio {
            chunks,
            sample_rate,
            bpm: session.bpm,
            start_clock_frame,
            start_clock_time: start_clock_frame as f64 / sample_rate as f64,
            duration_seconds,
            bars_recorded,
        };
        log::info!(
            "Recording finished: {:.3} bars, {:.3}s",
            bars_recorded,
            duration_seconds
        );

        self.end_session(bus);
        if self.deliver(captured) {
            self.emit(RecordingEvent::Finished {
                bars_recorded,
                duration_seconds,
            });
        } else {
            self.emit(RecordingEvent::Failed {
                reason: CaptureError::Undelivered.to_string(),
            });
        }
        self.transition(RecordingState::Idle);
    }

    /// Queue a capture for the control side
    ///
    /// A capture that cannot be queued is freed on the reclaimer thread.
    fn deliver(&self, captured: CapturedAudio) -> bool {
        let rejected = match self.captures.try_send(captured) {
            Ok(()) => return true,
            Err(TrySendError::Full(captured)) => {
                log::error!("Capture queue full, capture dropped");
                captured
            }
            Err(TrySendError::Disconnected(captured)) => {
                log::error!("Nobody receives captures, capture dropped");
                captured
            }
        };
        drop(Owned::new(&self.handle, rejected));
        false
    }

    fn fail(&mut self, reason: String, bus: &mut LoopEventBus) {
        log::warn!("Recording failed: {}", reason);
        self.end_session(bus);
        self.emit(RecordingEvent::Failed { reason });
        self.transition(RecordingState::Idle);
    }

    fn end_session(&mut self, bus: &mut LoopEventBus) {
        self.sink.discard();
        if let Some(restarts) = self.restarts.take() {
            bus.unsubscribe(restarts.id());
        }
        self.session = None;
    }

    /// Cancel if the flag is set; returns whether it was
    fn apply_pending_cancel(&mut self, bus: &mut LoopEventBus) -> bool {
        if self.atomics.cancel_requested.load(Ordering::Acquire) {
            self.cancel(bus);
            return true;
        }
        false
    }

    fn transition(&mut self, state: RecordingState) {
        if self.state == state {
            return;
        }
        log::info!("Recording: {} -> {}", self.state, state);
        self.state = state;
        self.atomics.state.store(state.as_u8(), Ordering::Relaxed);
        self.emit(RecordingEvent::StateChanged(state));
    }

    fn emit(&self, event: RecordingEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => log::debug!("Recording event queue full, event dropped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::{LoopRestart, Reclaimer};
    use crate::track::{Track, TrackData, TrackKind};
    use crossbeam::channel::{self, Receiver};

    const SR: u32 = 8000;

    struct Rig {
        decks: [Deck; NUM_DECKS],
        bus: LoopEventBus,
        recorder: Recorder,
        events: Receiver<RecordingEvent>,
        captures: Receiver<CapturedAudio>,
        /// Last, so its final sweep sees everything above dropped
        reclaimer: Reclaimer,
    }

    fn rig(config: RecordingConfig) -> Rig {
        rig_with(config, 256)
    }

    fn rig_with(config: RecordingConfig, event_capacity: usize) -> Rig {
        let config = RecordingConfig {
            chunk_frames: 4096,
            ..config
        };
        let reclaimer = Reclaimer::start().unwrap();
        let engine_config = EngineConfig::default();
        let mut decks = [Deck::new(DeckId::A, &engine_config, SR), Deck::new(DeckId::B, &engine_config, SR)];
        let frames = (8.0 * crate::types::frames_per_bar(120.0, SR)) as usize;
        let data = TrackData::new("a", vec![StereoSample::mono(0.5); frames], SR, 120.0, TrackKind::Loop);
        decks[0].load_track(Track::new(&reclaimer.handle(), data));
        decks[0].set_loop_enabled(true);

        let (tx, rx) = channel::bounded(event_capacity);
        let (capture_tx, capture_rx) = channel::bounded(CAPTURE_QUEUE_CAPACITY);
        let recorder = Recorder::new(
            &config,
            SR,
            Box::new(MemorySink::new()),
            tx,
            capture_tx,
            reclaimer.handle(),
        );
        Rig {
            decks,
            bus: LoopEventBus::new(),
            recorder,
            events: rx,
            captures: capture_rx,
            reclaimer,
        }
    }

    fn reservation(rig: &Rig, target_bars: Option<u32>) -> CaptureReservation {
        let buffer = rig.recorder.layout().buffer(120.0, target_bars).unwrap();
        CaptureReservation::new(&rig.reclaimer.handle(), buffer)
    }

    /// Arm on deck A at 120 BPM with a correctly sized buffer
    fn arm(rig: &mut Rig, target_bars: Option<u32>) -> Result<(), RecordError> {
        let buffer = reservation(rig, target_bars);
        rig.recorder.arm(&rig.decks[0], 120.0, target_bars, buffer, &mut rig.bus)
    }

    fn crossing(rig: &mut Rig, cycle: u64, clock_frame: u64) {
        rig.bus.publish(LoopRestart {
            deck: DeckId::A,
            cycle,
            clock_frame,
            clock_time: clock_frame as f64 / SR as f64,
            late_frames: 0,
        });
    }

    fn tick(rig: &mut Rig, tick_start: u64, master: &[StereoSample]) {
        rig.recorder.on_tick(tick_start, master, &rig.decks, &mut rig.bus);
    }

    fn ramp(start: u64, len: usize) -> Vec<StereoSample> {
        (0..len).map(|i| StereoSample::mono((start + i as u64) as f32)).collect()
    }

    /// Record one bar starting at clock 700, ticking until the recorder is idle
    fn record_one_bar(rig: &mut Rig) {
        arm(rig, Some(1)).unwrap();
        rig.decks[0].play();
        tick(rig, 0, &ramp(0, 500));
        crossing(rig, 1, 600);
        crossing(rig, 2, 700);

        let mut clock = 500;
        while rig.recorder.state() != RecordingState::Idle {
            tick(rig, clock, &ramp(clock, 500));
            clock += 500;
            assert!(clock < 100_000);
        }
    }

    #[test]
    fn test_memory_sink_chunks() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut sink = MemorySink::new();
        assert!(matches!(sink.begin(SR), Err(CaptureError::NotReserved)));

        sink.reserve(CaptureReservation::new(&reclaimer.handle(), CaptureBuffer::new(12, 4)));
        sink.begin(SR).unwrap();
        sink.write(&ramp(0, 3)).unwrap();
        sink.write(&ramp(3, 6)).unwrap();
        assert_eq!(sink.chunk_count(), 3);
        let chunks = sink.finish().unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), ramp(0, 9));
        assert_eq!(sink.chunk_count(), 0);
    }

    #[test]
    fn test_capture_buffer_writes_into_reserved_chunks() {
        let mut buffer = CaptureBuffer::new(10, 4);
        assert_eq!(buffer.capacity_frames(), 12);
        // Chunks are handed out from the back of the pool
        let reserved: Vec<*const StereoSample> = buffer.spare.iter().rev().map(|c| c.as_ptr()).collect();

        buffer.write(&ramp(0, 12)).unwrap();
        assert_eq!(buffer.len_frames(), 12);
        assert!(matches!(buffer.write(&ramp(12, 1)), Err(CaptureError::BufferFull)));
        assert_eq!(buffer.capacity_frames(), 12);

        let chunks = buffer.take_chunks();
        let used: Vec<*const StereoSample> = chunks.iter().map(|c| c.as_ptr()).collect();
        assert_eq!(used, reserved);
        assert_eq!(chunks.concat(), ramp(0, 12));
    }

    #[test]
    fn test_capture_buffer_reset_keeps_chunks() {
        let mut buffer = CaptureBuffer::new(8, 4);
        buffer.write(&ramp(0, 6)).unwrap();
        buffer.reset();
        assert_eq!(buffer.chunk_count(), 0);
        assert_eq!(buffer.capacity_frames(), 8);
        buffer.write(&ramp(0, 8)).unwrap();
        assert_eq!(buffer.chunk_count(), 2);
    }

    #[test]
    fn test_layout_sizes_whole_capture() {
        let layout = CaptureLayout::new(
            &RecordingConfig {
                chunk_frames: 4096,
                ..RecordingConfig::default()
            },
            SR,
        );
        // One bar at 120 BPM and 8 kHz is 16000 frames
        assert_eq!(layout.capture_frames(120.0, 1), 16000);
        let buffer = layout.buffer(120.0, Some(1)).unwrap();
        assert_eq!(buffer.capacity_frames(), 4 * 4096);

        // Requests above the ceiling are sized for the ceiling
        let buffer = layout.buffer(120.0, Some(1000)).unwrap();
        assert!(buffer.capacity_frames() >= 120 * 16000);
        assert!(buffer.capacity_frames() < 120 * 16000 + 4096);

        assert_eq!(layout.buffer(0.0, None).unwrap_err(), RecordError::InvalidBpm(0.0));
        assert!(layout.buffer(f64::NAN, None).is_err());
        assert!(layout.buffer(MAX_BPM * 2.0, None).is_err());
    }

    #[test]
    fn test_undersized_buffer_is_rejected() {
        let mut rig = rig(RecordingConfig::default());
        let buffer = CaptureReservation::new(&rig.reclaimer.handle(), CaptureBuffer::new(100, 64));
        assert_eq!(
            rig.recorder.arm(&rig.decks[0], 120.0, Some(1), buffer, &mut rig.bus),
            Err(RecordError::BufferTooSmall {
                needed: 16000,
                reserved: 128
            })
        );
        assert_eq!(rig.recorder.state(), RecordingState::Idle);
        assert_eq!(rig.bus.subscriber_count(), 0);
    }

    #[test]
    fn test_arm_while_stopped_is_armed() {
        let mut rig = rig(RecordingConfig::default());
        arm(&mut rig, None).unwrap();
        tick(&mut rig, 0, &ramp(0, 256));
        assert_eq!(rig.recorder.state(), RecordingState::Armed);
        assert_eq!(rig.recorder.atomics().state(), RecordingState::Armed);
    }

    #[test]
    fn test_arm_twice_is_rejected() {
        let mut rig = rig(RecordingConfig::default());
        arm(&mut rig, Some(1)).unwrap();
        assert_eq!(arm(&mut rig, Some(1)), Err(RecordError::Busy(RecordingState::Armed)));

        let buffer = reservation(&rig, Some(1));
        assert_eq!(
            rig.recorder.arm(&rig.decks[1], 120.0, Some(1), buffer, &mut rig.bus),
            Err(RecordError::Busy(RecordingState::Armed))
        );
    }

    #[test]
    fn test_capture_starts_on_second_crossing() {
        let mut rig = rig(RecordingConfig::default());
        arm(&mut rig, Some(1)).unwrap();
        rig.decks[0].play();

        tick(&mut rig, 0, &ramp(0, 100));
        assert_eq!(rig.recorder.state(), RecordingState::Rehearsal);

        crossing(&mut rig, 1, 150);
        tick(&mut rig, 100, &ramp(100, 100));
        assert_eq!(rig.recorder.state(), RecordingState::Rehearsal);

        crossing(&mut rig, 2, 250);
        tick(&mut rig, 200, &ramp(200, 100));
        assert_eq!(rig.recorder.state(), RecordingState::Recording);
        assert_eq!(rig.recorder.session().unwrap().start_clock_frame, Some(250));
        assert_eq!(rig.recorder.session().unwrap().frames_captured, 50);
    }

    #[test]
    fn test_duplicate_cycle_is_ignored() {
        let mut rig = rig(RecordingConfig::default());
        arm(&mut rig, Some(1)).unwrap();
        rig.decks[0].play();
        tick(&mut rig, 0, &ramp(0, 100));

        crossing(&mut rig, 1, 150);
        crossing(&mut rig, 1, 150);
        tick(&mut rig, 100, &ramp(100, 100));
        assert_eq!(rig.recorder.state(), RecordingState::Rehearsal);
    }

    #[test]
    fn test_target_bars_stop_on_exact_frame() {
        let mut rig = rig(RecordingConfig::default());
        record_one_bar(&mut rig);

        let summary = rig.events.try_iter().find_map(|e| match e {
            RecordingEvent::Finished { bars_recorded, .. } => Some(bars_recorded),
            _ => None,
        });
        assert!((summary.unwrap() - 1.0).abs() < 1e-9);

        let captured = rig.captures.try_recv().unwrap();
        assert_eq!(captured.frame_count(), 16000);
        let frames = captured.frames();
        assert_eq!(frames[0].left, 700.0);
        assert_eq!(frames[15999].left, 16699.0);
        assert_eq!(captured.start_clock_frame, 700);
        assert!((captured.bars_recorded - 1.0).abs() < 1e-9);
        assert!((captured.duration_seconds - 2.0).abs() < 1e-9);
        assert_eq!(captured.chunk_count(), 4);
        assert_eq!(captured.chunks()[3].len(), 16000 - 3 * 4096);
    }

    #[test]
    fn test_capture_delivered_when_event_queue_is_full() {
        // Room for one notification: everything after the first is dropped
        let mut rig = rig_with(RecordingConfig::default(), 1);
        record_one_bar(&mut rig);

        assert_eq!(rig.events.len(), 1);
        assert_eq!(rig.events.try_recv().unwrap(), RecordingEvent::StateChanged(RecordingState::Armed));

        let captured = rig.captures.try_recv().unwrap();
        assert_eq!(captured.frame_count(), 16000);
        assert_eq!(captured.frames()[0].left, 700.0);
    }

    #[test]
    fn test_capture_without_receiver_reports_failure() {
        let mut rig = rig(RecordingConfig::default());
        drop(std::mem::replace(&mut rig.captures, channel::never()));
        record_one_bar(&mut rig);

        let received: Vec<RecordingEvent> = rig.events.try_iter().collect();
        assert!(!received.iter().any(|e| matches!(e, RecordingEvent::Finished { .. })));
        assert!(received.iter().any(|e| matches!(
            e,
            RecordingEvent::Failed { reason } if reason.contains("could not be delivered")
        )));
        assert_eq!(rig.recorder.state(), RecordingState::Idle);
    }

    #[test]
    fn test_cancel_in_rehearsal_leaves_nothing() {
        let mut rig = rig(RecordingConfig::default());
        arm(&mut rig, None).unwrap();
        rig.decks[0].play();
        tick(&mut rig, 0, &ramp(0, 100));
        assert_eq!(rig.recorder.state(), RecordingState::Rehearsal);

        assert!(rig.recorder.cancel(&mut rig.bus));
        assert_eq!(rig.recorder.state(), RecordingState::Idle);
        assert_eq!(rig.recorder.chunk_count(), 0);
        assert_eq!(rig.bus.subscriber_count(), 0);

        // A late crossing cannot start anything
        crossing(&mut rig, 1, 150);
        crossing(&mut rig, 2, 160);
        tick(&mut rig, 100, &ramp(100, 100));
        assert_eq!(rig.recorder.state(), RecordingState::Idle);
        assert!(rig.events.try_iter().any(|e| e == RecordingEvent::Cancelled));
        assert!(rig.captures.try_recv().is_err());
    }

    #[test]
    fn test_cancel_flag_beats_queued_crossings() {
        let mut rig = rig(RecordingConfig::default());
        arm(&mut rig, None).unwrap();
        rig.decks[0].play();
        tick(&mut rig, 0, &ramp(0, 100));
        crossing(&mut rig, 1, 120);

        rig.recorder.atomics().request_cancel();
        crossing(&mut rig, 2, 180);
        tick(&mut rig, 100, &ramp(100, 100));
        assert_eq!(rig.recorder.state(), RecordingState::Idle);
        assert!(rig.recorder.session().is_none());
    }

    #[test]
    fn test_loop_change_cancels_pending_recording() {
        let mut rig = rig(RecordingConfig::default());
        arm(&mut rig, None).unwrap();
        rig.decks[0].set_loop(0.0, 2.0);
        tick(&mut rig, 0, &ramp(0, 100));
        assert_eq!(rig.recorder.state(), RecordingState::Idle);
    }

    #[test]
    fn test_count_in_cycles() {
        let config = RecordingConfig {
            count_in_cycles: 2,
            ..RecordingConfig::default()
        };
        let mut rig = rig(config);
        arm(&mut rig, None).unwrap();
        rig.decks[0].play();
        tick(&mut rig, 0, &ramp(0, 100));

        crossing(&mut rig, 1, 110);
        crossing(&mut rig, 2, 120);
        tick(&mut rig, 100, &ramp(100, 100));
        assert_eq!(rig.recorder.state(), RecordingState::CountingIn);

        crossing(&mut rig, 3, 230);
        tick(&mut rig, 200, &ramp(200, 100));
        assert_eq!(rig.recorder.state(), RecordingState::CountingIn);

        crossing(&mut rig, 4, 340);
        tick(&mut rig, 300, &ramp(300, 100));
        assert_eq!(rig.recorder.state(), RecordingState::Recording);
        assert_eq!(rig.recorder.session().unwrap().start_clock_frame, Some(340));
    }

    struct BrokenSink;

    impl CaptureSink for BrokenSink {
        fn begin(&mut self, _sample_rate: u32) -> Result<(), CaptureError> {
            Ok(())
        }
        fn write(&mut self, _frames: &[StereoSample]) -> Result<(), CaptureError> {
            Err(CaptureError::Sink("disk full".to_string()))
        }
        fn finish(&mut self) -> Result<Vec<Vec<StereoSample>>, CaptureError> {
            Ok(Vec::new())
        }
        fn discard(&mut self) {}
        fn chunk_count(&self) -> usize {
            0
        }
    }

    #[test]
    fn test_sink_failure_returns_to_idle_with_reason() {
        let mut rig = rig(RecordingConfig::default());
        assert!(rig.recorder.set_sink(Box::new(BrokenSink)));
        arm(&mut rig, None).unwrap();
        rig.decks[0].play();
        tick(&mut rig, 0, &ramp(0, 100));
        crossing(&mut rig, 1, 110);
        crossing(&mut rig, 2, 120);
        tick(&mut rig, 100, &ramp(100, 100));

        assert_eq!(rig.recorder.state(), RecordingState::Idle);
        let reason = rig.events.try_iter().find_map(|e| match e {
            RecordingEvent::Failed { reason } => Some(reason),
            _ => None,
        });
        assert!(reason.unwrap().contains("disk full"));
        assert!(rig.decks[0].is_playing());
    }

    #[test]
    fn test_write_wav_round_trip() {
        let captured = CapturedAudio {
            chunks: vec![vec![StereoSample::new(0.25, -0.5); 20], vec![StereoSample::new(0.5, 0.75); 12]],
            sample_rate: SR,
            bpm: 120.0,
            start_clock_frame: 0,
            start_clock_time: 0.0,
            duration_seconds: 32.0 / SR as f64,
            bars_recorded: 32.0 / 16000.0,
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        captured.write_wav(&path).unwrap();

        let mut reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, SR);
        let samples: Vec<f32> = reader.samples::<f32>().map(Result::unwrap).collect();
        assert_eq!(samples.len(), 64);
        assert_eq!(samples[0], 0.25);
        assert_eq!(samples[1], -0.5);
        // Chunk boundary
        assert_eq!(samples[40], 0.5);
        assert_eq!(samples[41], 0.75);
    }
}
