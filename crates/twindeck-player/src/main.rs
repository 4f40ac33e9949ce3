//! Twindeck Player - headless two-deck loop player
//!
//! Loads two loop WAVs, loops and syncs them (deck A is master), then
//! records a bar-aligned capture of the master output to a WAV file.
//!
//! Set RUST_LOG=debug for per-boundary detail.

mod args;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use crossbeam::channel::select;

use twindeck_core::audio::{start_audio_system, start_headless, AudioSystemResult};
use twindeck_core::config::{default_capture_dir, default_config_path, load_config, EngineConfig};
use twindeck_core::controller::MixerController;
use twindeck_core::engine::{EngineEvent, RecordingEvent};
use twindeck_core::track::{load_wav, TrackKind};
use twindeck_core::DeckId;

use args::{Options, USAGE};

/// How long to wait for the audio thread to apply setup commands
const APPLY_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let options = match Options::parse(std::env::args().skip(1)) {
        Ok(options) => options,
        Err(e) => {
            eprintln!("{:#}\n\n{}", e, USAGE);
            std::process::exit(2);
        }
    };

    if let Err(e) = run(options) {
        log::error!("{:#}", e);
        std::process::exit(1);
    }
}

fn run(options: Options) -> Result<()> {
    log::info!("twindeck-player starting up");

    let config_path = options.config.clone().unwrap_or_else(default_config_path);
    let config: EngineConfig = load_config(&config_path);

    let mut system = start(&config, options.offline)?;
    log::info!(
        "Audio running at {} Hz, {} frames per tick (~{:.1}ms)",
        system.sample_rate,
        system.buffer_size,
        system.latency_ms
    );

    for (deck, source) in DeckId::ALL.into_iter().zip(&options.decks) {
        let data = load_wav(&source.path, source.bpm, TrackKind::Loop)
            .with_context(|| format!("Failed to load {:?} for deck {}", source.path, deck))?;
        system.controller.load_track(deck, data)?;
    }
    wait_for(&system.controller, "tracks to load", |c| {
        DeckId::ALL.iter().all(|&d| c.deck(d).is_loaded())
    })?;

    let controller = &mut system.controller;
    for deck in DeckId::ALL {
        controller.set_loop(deck, 0.0, options.loop_bars)?;
        controller.set_loop_enabled(deck, true)?;
    }
    controller.set_crossfader(options.crossfader)?;

    let master_bpm = options.decks[0].bpm;
    match controller.enable_sync(DeckId::A) {
        Ok(()) => {
            wait_for(controller, "sync to engage", |c| c.is_sync_active())?;
        }
        Err(e) => log::warn!("Playing unsynced: {}", e),
    }

    if let Some(pattern) = options.gate {
        controller.gate_start(DeckId::B, pattern, master_bpm)?;
    }

    controller.arm_recording_bars(master_bpm, options.bars)?;
    for deck in DeckId::ALL {
        controller.play(deck)?;
    }
    drain_engine_events(&system);

    let out = match &options.out {
        Some(path) => path.clone(),
        None => default_output_path()?,
    };
    let max_bars = options.bars.unwrap_or(config.recording.max_bars) as f64;
    // Rehearsal and count-in cycles, plus slack for the ticker
    let budget_bars = max_bars
        + options.loop_bars * (2 + config.recording.count_in_cycles) as f64
        + 4.0;
    let deadline = Instant::now() + Duration::from_secs_f64(budget_bars * 240.0 / master_bpm);

    let result = await_capture(&system, &out, deadline);

    for deck in DeckId::ALL {
        system.controller.pause(deck)?;
    }
    drain_engine_events(&system);
    result
}

fn start(config: &EngineConfig, offline: bool) -> Result<AudioSystemResult> {
    if offline {
        return start_headless(config).context("Failed to start headless audio");
    }
    match start_audio_system(config) {
        Ok(system) => Ok(system),
        Err(e) => {
            log::warn!("Could not open audio output ({}), falling back to headless ticker", e);
            start_headless(config).context("Failed to start headless audio")
        }
    }
}

/// Wait for the capture itself; recorder notifications are only logged
fn await_capture(system: &AudioSystemResult, out: &Path, deadline: Instant) -> Result<()> {
    loop {
        let timeout = deadline.saturating_duration_since(Instant::now());
        select! {
            recv(system.captures) -> capture => {
                let capture = capture.context("Audio engine stopped unexpectedly")?;
                capture
                    .write_wav(out)
                    .with_context(|| format!("Failed to write capture to {:?}", out))?;
                println!("{}", out.display());
                return Ok(());
            }
            recv(system.recording_events) -> event => {
                match event.context("Audio engine stopped unexpectedly")? {
                    RecordingEvent::StateChanged(state) => log::info!("Recorder: {}", state),
                    RecordingEvent::Progress { bars, target_bars } => {
                        log::info!("Recorded {}/{} bars", bars, target_bars);
                    }
                    RecordingEvent::Finished { bars_recorded, .. } => {
                        log::debug!("Capture of {:.2} bars queued", bars_recorded);
                    }
                    RecordingEvent::Failed { reason } => bail!("Recording failed: {}", reason),
                    RecordingEvent::Cancelled => bail!("Recording was cancelled"),
                }
            }
            default(timeout) => bail!("Timed out waiting for the recording to finish"),
        }
    }
}

fn wait_for(
    controller: &MixerController,
    what: &str,
    done: impl Fn(&MixerController) -> bool,
) -> Result<()> {
    let started = Instant::now();
    while !done(controller) {
        if started.elapsed() > APPLY_TIMEOUT {
            bail!("Timed out waiting for {}", what);
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    Ok(())
}

fn drain_engine_events(system: &AudioSystemResult) {
    for event in system.engine_events.try_iter() {
        match event {
            EngineEvent::Rejected { command, reason } => {
                log::warn!("Engine rejected {}: {}", command, reason);
            }
            other => log::debug!("Engine event: {:?}", other),
        }
    }
}

fn default_output_path() -> Result<PathBuf> {
    let dir = default_capture_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create capture directory: {:?}", dir))?;
    Ok(dir.join("twindeck-capture.wav"))
}
