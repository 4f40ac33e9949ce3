//! Audio engine - decks, loop sync, gate, mixer and capture
//!
//! - Deck: varispeed track player with its precise looper and gate
//! - LoopEventBus: loop restart publish/subscribe
//! - SyncEngine: master/slave tempo and phase lock
//! - Mixer: channel gains and the equal-power crossfader
//! - Recorder: bar-aligned capture of the master output
//! - AudioEngine: the context object tying everything together

mod command;
mod deck;
mod engine;
mod events;
mod gate;
mod gc;
mod looper;
mod mixer;
mod recorder;
mod resample;
mod sync;

pub use command::{command_channel, EngineCommand, COMMAND_QUEUE_CAPACITY};
pub use deck::{Deck, DeckAtomics, DeckSnapshot, MAX_PLAYBACK_RATE, MIN_PLAYBACK_RATE};
pub use engine::{AudioEngine, EngineEvent, EVENT_QUEUE_CAPACITY};
pub use events::{LoopEventBus, LoopRestart, Subscription, SubscriptionId, SUBSCRIPTION_CAPACITY};
pub use gate::{GateEffect, GatePattern, GATE_PATTERNS};
pub use gc::Reclaimer;
pub use looper::{LoopBoundaries, LoopRegion, PreciseLooper, Wrap};
pub use mixer::{equal_power_gains, ChannelStrip, Crossfader, Mixer};
pub use recorder::{
    CaptureBuffer, CaptureError, CaptureLayout, CaptureReservation, CaptureSink, CapturedAudio,
    MemorySink, RecordError, Recorder, RecorderAtomics, RecordingEvent, RecordingSession,
    RecordingState, CAPTURE_QUEUE_CAPACITY,
};
pub use resample::{read_interpolated, InterpolationMethod};
pub use sync::{SyncAtomics, SyncEngine, SyncError, SyncRelationship, MAX_BPM, MIN_BPM};
