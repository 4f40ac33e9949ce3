//! Loop sync engine
//!
//! Locks a slave deck's loop to a master deck's by varispeed: the slave's
//! playback rate is set to `master_effective_bpm / slave_native_bpm`, so its
//! pitch moves with its tempo. After every master restart the slave's bar
//! phase is measured and the rate is nudged (at most `max_correction`) so
//! residual drift is pulled back over the next master cycle.
//!
//! Relationship changes (enable, disable, master switch) are only accepted
//! while both decks are paused; doing them during playback would be an
//! audible jump.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use thiserror::Error;

use crate::config::SyncConfig;
use crate::types::{DeckId, NUM_DECKS};

use super::deck::{Deck, MAX_PLAYBACK_RATE, MIN_PLAYBACK_RATE};
use super::events::{LoopEventBus, Subscription};

/// Lowest master tempo `update_master_bpm` accepts
pub const MIN_BPM: f64 = 30.0;
/// Highest master tempo `update_master_bpm` accepts
pub const MAX_BPM: f64 = 300.0;

/// Why a sync request was rejected
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
    #[error("deck {0} has no track loaded")]
    DeckNotLoaded(DeckId),

    #[error("deck {0} is not loop-quantized material with a known tempo")]
    IncompatibleSource(DeckId),

    #[error("playback is active; pause both decks first")]
    PlaybackActive,

    #[error("sync is not active")]
    NotActive,

    #[error("tempo ratio {0:.3} is outside the supported playback range")]
    RatioOutOfRange(f64),

    #[error("deck {0} is slaved to the sync master; change the master tempo instead")]
    RateLocked(DeckId),
}

/// An active master/slave pairing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncRelationship {
    pub master: DeckId,
    pub slave: DeckId,
    /// Slave native tempo over master native tempo
    pub tempo_ratio: f64,
    /// Slave rate that matches the master tempo, before phase correction
    pub target_rate: f64,
    /// Rate actually on the slave deck
    pub applied_rate: f64,
}

/// Lock-free view of the sync relationship for control threads
pub struct SyncAtomics {
    active: AtomicBool,
    master: AtomicU8,
}

impl SyncAtomics {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            master: AtomicU8::new(0),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn master(&self) -> Option<DeckId> {
        if !self.is_active() {
            return None;
        }
        DeckId::from_index(self.master.load(Ordering::Relaxed) as usize)
    }

    /// Deck whose rate is driven by sync
    pub fn slave(&self) -> Option<DeckId> {
        self.master().map(DeckId::other)
    }

    pub(crate) fn store(&self, relationship: Option<SyncRelationship>) {
        if let Some(relationship) = relationship {
            self.master.store(relationship.master.index() as u8, Ordering::Relaxed);
        }
        self.active.store(relationship.is_some(), Ordering::Relaxed);
    }
}

impl Default for SyncAtomics {
    fn default() -> Self {
        Self::new()
    }
}

/// Cross-deck coordinator
pub struct SyncEngine {
    relationship: Option<SyncRelationship>,
    master_restarts: Option<Subscription>,
    last_master_cycle: u64,
    settle_frames: usize,
    settle_remaining: usize,
    drift_tolerance_bars: f64,
    max_correction: f64,
}

impl SyncEngine {
    pub fn new(config: &SyncConfig, sample_rate: u32) -> Self {
        Self {
            relationship: None,
            master_restarts: None,
            last_master_cycle: 0,
            settle_frames: (config.settle_ms * sample_rate as f64 / 1000.0).round() as usize,
            settle_remaining: 0,
            drift_tolerance_bars: config.drift_tolerance_bars,
            max_correction: config.max_correction,
        }
    }

    pub fn is_active(&self) -> bool {
        self.relationship.is_some()
    }

    pub fn relationship(&self) -> Option<SyncRelationship> {
        self.relationship
    }

    pub fn master(&self) -> Option<DeckId> {
        self.relationship.map(|r| r.master)
    }

    /// Lock the other deck to `master`
    ///
    /// Both transports are reset to 0 and held for the settle time so they
    /// start from a common phase origin.
    pub fn enable(
        &mut self,
        master: DeckId,
        decks: &mut [Deck; NUM_DECKS],
        bus: &mut LoopEventBus,
    ) -> Result<SyncRelationship, SyncError> {
        let slave = master.other();
        check_pairing(decks, master, slave)?;

        let master_bpm = decks[master.index()].effective_bpm();
        let slave_native = decks[slave.index()].native_bpm();
        let rate = master_bpm / slave_native;
        if !(MIN_PLAYBACK_RATE..=MAX_PLAYBACK_RATE).contains(&rate) {
            log::warn!("Sync rejected: deck {} would need rate {:.3}", slave, rate);
            return Err(SyncError::RatioOutOfRange(rate));
        }

        self.release(bus);
        let applied = decks[slave.index()].set_playback_rate(rate);
        for deck in decks.iter_mut() {
            deck.seek(0.0);
        }
        self.settle_remaining = self.settle_frames;

        let relationship = SyncRelationship {
            master,
            slave,
            tempo_ratio: slave_native / decks[master.index()].native_bpm(),
            target_rate: rate,
            applied_rate: applied,
        };
        self.relationship = Some(relationship);
        self.master_restarts = Some(bus.subscribe(Some(master)));
        self.last_master_cycle = 0;

        log::info!(
            "Sync enabled: master {} at {:.2} BPM, slave {} rate {:.4}",
            master,
            master_bpm,
            slave,
            applied
        );
        Ok(relationship)
    }

    /// End sync and return the slave to its native rate
    pub fn disable(&mut self, decks: &mut [Deck; NUM_DECKS], bus: &mut LoopEventBus) -> Result<(), SyncError> {
        let Some(relationship) = self.relationship else {
            return Err(SyncError::NotActive);
        };
        if decks.iter().any(Deck::is_playing) {
            log::warn!("Sync disable rejected: playback is active");
            return Err(SyncError::PlaybackActive);
        }
        decks[relationship.slave.index()].set_playback_rate(1.0);
        self.release(bus);
        log::info!("Sync disabled, deck {} back at rate 1.0", relationship.slave);
        Ok(())
    }

    /// Swap roles so `master` becomes the tempo authority
    ///
    /// The new master returns to its native tempo and the other deck is
    /// re-stretched to it. Only allowed while both decks are paused.
    pub fn switch_master(
        &mut self,
        master: DeckId,
        decks: &mut [Deck; NUM_DECKS],
        bus: &mut LoopEventBus,
    ) -> Result<SyncRelationship, SyncError> {
        let Some(current) = self.relationship else {
            return Err(SyncError::NotActive);
        };
        if decks.iter().any(Deck::is_playing) {
            log::warn!("Master switch to deck {} rejected: playback is active", master);
            return Err(SyncError::PlaybackActive);
        }
        if current.master == master {
            return Ok(current);
        }
        let slave = master.other();
        check_pairing(decks, master, slave)?;

        let rate = decks[master.index()].native_bpm() / decks[slave.index()].native_bpm();
        if !(MIN_PLAYBACK_RATE..=MAX_PLAYBACK_RATE).contains(&rate) {
            return Err(SyncError::RatioOutOfRange(rate));
        }

        self.release(bus);
        decks[master.index()].set_playback_rate(1.0);
        let applied = decks[slave.index()].set_playback_rate(rate);

        let relationship = SyncRelationship {
            master,
            slave,
            tempo_ratio: decks[slave.index()].native_bpm() / decks[master.index()].native_bpm(),
            target_rate: rate,
            applied_rate: applied,
        };
        self.relationship = Some(relationship);
        self.master_restarts = Some(bus.subscribe(Some(master)));
        self.last_master_cycle = 0;

        log::info!("Sync master switched to deck {}, slave rate {:.4}", master, applied);
        Ok(relationship)
    }

    /// Move the master to `bpm` and re-stretch the slave to follow
    ///
    /// Transport positions are untouched. Returns the slave's new rate.
    pub fn update_master_bpm(&mut self, bpm: f64, decks: &mut [Deck; NUM_DECKS]) -> Result<f64, SyncError> {
        let Some(mut relationship) = self.relationship else {
            return Err(SyncError::NotActive);
        };
        if !bpm.is_finite() {
            return Err(SyncError::RatioOutOfRange(bpm));
        }
        let bpm = bpm.clamp(MIN_BPM, MAX_BPM);

        let master_rate = bpm / decks[relationship.master.index()].native_bpm();
        let target = bpm / decks[relationship.slave.index()].native_bpm();
        for rate in [master_rate, target] {
            if !(MIN_PLAYBACK_RATE..=MAX_PLAYBACK_RATE).contains(&rate) {
                log::warn!("Master tempo {:.2} BPM rejected: needs rate {:.3}", bpm, rate);
                return Err(SyncError::RatioOutOfRange(rate));
            }
        }

        decks[relationship.master.index()].set_playback_rate(master_rate);
        relationship.target_rate = target;
        relationship.applied_rate = decks[relationship.slave.index()].set_playback_rate(target);
        self.relationship = Some(relationship);

        log::info!(
            "Master tempo {:.2} BPM, deck {} rate {:.4}",
            bpm,
            relationship.slave,
            relationship.applied_rate
        );
        Ok(relationship.applied_rate)
    }

    /// Drop sync without preconditions, e.g. when a deck gets a new track
    pub fn teardown(&mut self, decks: &mut [Deck; NUM_DECKS], bus: &mut LoopEventBus) {
        if let Some(relationship) = self.relationship {
            decks[relationship.slave.index()].set_playback_rate(1.0);
            self.release(bus);
            log::info!("Sync torn down, deck {} back at rate 1.0", relationship.slave);
        }
    }

    /// Whether transports are held this tick; counts the settle window down
    pub fn hold_transport(&mut self, frames: usize) -> bool {
        if self.settle_remaining == 0 {
            return false;
        }
        self.settle_remaining = self.settle_remaining.saturating_sub(frames);
        true
    }

    /// Phase correction after a tick; `tick_end` is the clock frame after the tick
    pub fn on_tick(&mut self, decks: &mut [Deck; NUM_DECKS], tick_end: u64) {
        let (Some(mut relationship), Some(restarts)) = (self.relationship, &self.master_restarts) else {
            return;
        };

        let mut latest = None;
        for restart in restarts.drain() {
            if restart.cycle > self.last_master_cycle {
                self.last_master_cycle = restart.cycle;
                latest = Some(restart);
            }
        }
        let Some(restart) = latest else {
            return;
        };

        let master = &decks[relationship.master.index()];
        let slave = &decks[relationship.slave.index()];
        if !slave.looper().is_enabled() || !slave.is_playing() {
            return;
        }
        let (Some(slave_bars), Some(fpb)) = (slave.position_bars(), slave.track().and_then(|t| t.frames_per_bar()))
        else {
            return;
        };

        let master_len = master.looper().region().length_bars;
        let slave_region = slave.looper().region();
        let Some(period) = common_period(master_len, slave_region.length_bars) else {
            return;
        };

        // Rewind the slave to where it was at the master restart
        let frames_since = tick_end.saturating_sub(restart.clock_frame) as f64;
        let at_restart = slave_bars - frames_since * slave.step() / fpb;
        let phase = (at_restart - slave_region.start_bar).rem_euclid(period);
        let error = if phase > period / 2.0 { phase - period } else { phase };

        let factor = if error.abs() <= self.drift_tolerance_bars {
            1.0
        } else {
            ((master_len - error) / master_len).clamp(1.0 - self.max_correction, 1.0 + self.max_correction)
        };
        if factor != 1.0 {
            log::debug!(
                "Deck {} is {:+.4} bars off master cycle {}, rate factor {:.5}",
                relationship.slave,
                error,
                restart.cycle,
                factor
            );
        }

        let applied = decks[relationship.slave.index()].set_playback_rate(relationship.target_rate * factor);
        relationship.applied_rate = applied;
        self.relationship = Some(relationship);
    }

    fn release(&mut self, bus: &mut LoopEventBus) {
        if let Some(restarts) = self.master_restarts.take() {
            bus.unsubscribe(restarts.id());
        }
        self.relationship = None;
        self.settle_remaining = 0;
        self.last_master_cycle = 0;
    }
}

fn check_pairing(decks: &[Deck; NUM_DECKS], master: DeckId, slave: DeckId) -> Result<(), SyncError> {
    for id in [master, slave] {
        let deck = &decks[id.index()];
        if !deck.has_track() {
            log::warn!("Sync rejected: deck {} has no track loaded", id);
            return Err(SyncError::DeckNotLoaded(id));
        }
        if !deck.is_loop_source() {
            log::warn!("Sync rejected: deck {} has no loop-quantized tempo", id);
            return Err(SyncError::IncompatibleSource(id));
        }
    }
    if decks.iter().any(Deck::is_playing) {
        log::warn!("Sync rejected: playback is active");
        return Err(SyncError::PlaybackActive);
    }
    Ok(())
}

/// Shorter loop length when one length is a whole multiple of the other
fn common_period(a: f64, b: f64) -> Option<f64> {
    let (short, long) = if a <= b { (a, b) } else { (b, a) };
    if short <= 0.0 {
        return None;
    }
    let ratio = long / short;
    ((ratio - ratio.round()).abs() < 1e-6).then_some(short)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::engine::Reclaimer;
    use crate::track::{Track, TrackData, TrackKind};
    use crate::types::StereoSample;

    const SR: u32 = 8000;

    fn track(reclaimer: &Reclaimer, bpm: f64, kind: TrackKind) -> Track {
        let frames = (8.0 * crate::types::frames_per_bar(bpm, SR)) as usize;
        let data = TrackData::new("t", vec![StereoSample::mono(0.1); frames], SR, bpm, kind);
        Track::new(&reclaimer.handle(), data)
    }

    fn decks_with(reclaimer: &Reclaimer, a_bpm: f64, b_bpm: f64) -> [Deck; NUM_DECKS] {
        let config = EngineConfig::default();
        let mut decks = [Deck::new(DeckId::A, &config, SR), Deck::new(DeckId::B, &config, SR)];
        decks[0].load_track(track(reclaimer, a_bpm, TrackKind::Loop));
        decks[1].load_track(track(reclaimer, b_bpm, TrackKind::Loop));
        decks
    }

    fn engine() -> SyncEngine {
        SyncEngine::new(&SyncConfig::default(), SR)
    }

    #[test]
    fn test_slave_rate_matches_master_tempo() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut decks = decks_with(&reclaimer, 120.0, 100.0);
        let mut bus = LoopEventBus::new();
        let mut sync = engine();

        let relationship = sync.enable(DeckId::A, &mut decks, &mut bus).unwrap();
        assert_eq!(relationship.slave, DeckId::B);
        assert!((decks[1].playback_rate() - 1.2).abs() < 1e-6);
        assert!((relationship.tempo_ratio - 100.0 / 120.0).abs() < 1e-12);
        assert_eq!(decks[0].playback_rate(), 1.0);
    }

    #[test]
    fn test_enable_resets_positions_and_settles() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut decks = decks_with(&reclaimer, 120.0, 100.0);
        decks[0].seek(5000.0);
        decks[1].seek(7000.0);
        let mut bus = LoopEventBus::new();
        let mut sync = engine();

        sync.enable(DeckId::A, &mut decks, &mut bus).unwrap();
        assert_eq!(decks[0].position(), 0.0);
        assert_eq!(decks[1].position(), 0.0);
        // 20 ms at 8 kHz = 160 frames
        assert!(sync.hold_transport(128));
        assert!(sync.hold_transport(128));
        assert!(!sync.hold_transport(128));
    }

    #[test]
    fn test_disable_restores_unity_rate() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut decks = decks_with(&reclaimer, 128.0, 93.0);
        let mut bus = LoopEventBus::new();
        let mut sync = engine();

        sync.enable(DeckId::A, &mut decks, &mut bus).unwrap();
        sync.disable(&mut decks, &mut bus).unwrap();
        assert_eq!(decks[1].playback_rate(), 1.0);
        assert!(!sync.is_active());
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_update_master_bpm_without_transport_reset() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut decks = decks_with(&reclaimer, 120.0, 100.0);
        let mut bus = LoopEventBus::new();
        let mut sync = engine();
        sync.enable(DeckId::A, &mut decks, &mut bus).unwrap();

        decks[0].seek(3000.0);
        decks[1].seek(2500.0);
        let rate = sync.update_master_bpm(130.0, &mut decks).unwrap();
        assert!((rate - 1.3).abs() < 1e-6);
        assert!((decks[0].effective_bpm() - 130.0).abs() < 1e-9);
        assert_eq!(decks[0].position(), 3000.0);
        assert_eq!(decks[1].position(), 2500.0);
    }

    #[test]
    fn test_update_master_bpm_out_of_range_leaves_rates() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut decks = decks_with(&reclaimer, 120.0, 60.0);
        let mut bus = LoopEventBus::new();
        let mut sync = engine();
        sync.enable(DeckId::A, &mut decks, &mut bus).unwrap();
        assert!((decks[1].playback_rate() - 2.0).abs() < 1e-9);

        // 300 BPM would need the 60 BPM slave at rate 5.0
        assert_eq!(
            sync.update_master_bpm(300.0, &mut decks),
            Err(SyncError::RatioOutOfRange(5.0))
        );
        assert_eq!(decks[0].playback_rate(), 1.0);
        assert!((decks[1].playback_rate() - 2.0).abs() < 1e-9);
        assert!(sync.is_active());

        assert!(sync.update_master_bpm(f64::NAN, &mut decks).is_err());
        assert!((sync.update_master_bpm(200.0, &mut decks).unwrap() - 200.0 / 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_enable_requires_both_tracks() {
        let reclaimer = Reclaimer::start().unwrap();
        let config = EngineConfig::default();
        let mut decks = [Deck::new(DeckId::A, &config, SR), Deck::new(DeckId::B, &config, SR)];
        decks[0].load_track(track(&reclaimer, 120.0, TrackKind::Loop));
        let mut bus = LoopEventBus::new();
        let mut sync = engine();

        assert_eq!(
            sync.enable(DeckId::A, &mut decks, &mut bus),
            Err(SyncError::DeckNotLoaded(DeckId::B))
        );
        assert!(!sync.is_active());
    }

    #[test]
    fn test_stream_source_blocks_sync() {
        let reclaimer = Reclaimer::start().unwrap();
        let config = EngineConfig::default();
        let mut decks = [Deck::new(DeckId::A, &config, SR), Deck::new(DeckId::B, &config, SR)];
        decks[0].load_track(track(&reclaimer, 120.0, TrackKind::Loop));
        decks[1].load_track(track(&reclaimer, 120.0, TrackKind::Stream));
        let mut bus = LoopEventBus::new();
        let mut sync = engine();

        assert_eq!(
            sync.enable(DeckId::A, &mut decks, &mut bus),
            Err(SyncError::IncompatibleSource(DeckId::B))
        );
    }

    #[test]
    fn test_relationship_changes_rejected_while_playing() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut decks = decks_with(&reclaimer, 120.0, 100.0);
        let mut bus = LoopEventBus::new();
        let mut sync = engine();

        decks[0].play();
        assert_eq!(sync.enable(DeckId::A, &mut decks, &mut bus), Err(SyncError::PlaybackActive));
        decks[0].pause();

        sync.enable(DeckId::A, &mut decks, &mut bus).unwrap();
        decks[1].play();
        assert_eq!(
            sync.switch_master(DeckId::B, &mut decks, &mut bus),
            Err(SyncError::PlaybackActive)
        );
        assert_eq!(sync.disable(&mut decks, &mut bus), Err(SyncError::PlaybackActive));
        assert_eq!(sync.master(), Some(DeckId::A));
    }

    #[test]
    fn test_switch_master_restretches() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut decks = decks_with(&reclaimer, 120.0, 100.0);
        let mut bus = LoopEventBus::new();
        let mut sync = engine();
        sync.enable(DeckId::A, &mut decks, &mut bus).unwrap();

        let relationship = sync.switch_master(DeckId::B, &mut decks, &mut bus).unwrap();
        assert_eq!(relationship.master, DeckId::B);
        assert_eq!(decks[1].playback_rate(), 1.0);
        assert!((decks[0].playback_rate() - 100.0 / 120.0).abs() < 1e-9);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_teardown_restores_rate() {
        let reclaimer = Reclaimer::start().unwrap();
        let mut decks = decks_with(&reclaimer, 120.0, 100.0);
        let mut bus = LoopEventBus::new();
        let mut sync = engine();
        sync.enable(DeckId::A, &mut decks, &mut bus).unwrap();
        decks[1].play();

        sync.teardown(&mut decks, &mut bus);
        assert!(!sync.is_active());
        assert_eq!(decks[1].playback_rate(), 1.0);
    }

    #[test]
    fn test_common_period() {
        assert_eq!(common_period(4.0, 2.0), Some(2.0));
        assert_eq!(common_period(1.0, 8.0), Some(1.0));
        assert_eq!(common_period(3.0, 2.0), None);
        assert_eq!(common_period(0.0, 2.0), None);
    }
}
