//! Headless audio thread
//!
//! Drives the engine from a plain thread instead of a device callback, one
//! block per tick on a sleep-until-deadline schedule. Used when no output
//! device is wanted (servers, CI, offline capture) or the crate is built
//! without the CPAL backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::{AudioEngine, EngineCommand};
use crate::types::StereoBuffer;

use super::config::MAX_BUFFER_SIZE;
use super::error::AudioResult;

/// Handle to a running ticker thread; dropping it stops the engine
pub struct Ticker {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
    block: usize,
}

impl Ticker {
    /// Move `engine` onto a new thread and start ticking in blocks of `block` frames
    pub fn spawn(
        mut engine: AudioEngine,
        mut commands: rtrb::Consumer<EngineCommand>,
        block: usize,
    ) -> AudioResult<Self> {
        let block = block.clamp(1, MAX_BUFFER_SIZE);
        let sample_rate = engine.sample_rate();
        let period = Duration::from_secs_f64(block as f64 / sample_rate as f64);
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("audio-ticker".to_string())
            .spawn(move || {
                let mut master = StereoBuffer::with_capacity(block);
                let mut deadline = Instant::now();
                log::info!("Headless audio thread started ({} frames per tick)", block);

                while thread_running.load(Ordering::Acquire) {
                    master.set_len_from_capacity(block);
                    engine.process_commands(&mut commands);
                    engine.process(&mut master);

                    deadline += period;
                    let now = Instant::now();
                    if deadline > now {
                        thread::sleep(deadline - now);
                    } else if now - deadline > period * 4 {
                        log::warn!("Audio ticker fell behind by {:?}, resetting schedule", now - deadline);
                        deadline = now;
                    }
                }

                engine.shutdown();
                log::info!("Headless audio thread stopped");
            })?;

        Ok(Self {
            running,
            thread: Some(thread),
            sample_rate,
            block,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn buffer_size(&self) -> u32 {
        self.block as u32
    }

    pub fn latency_ms(&self) -> f32 {
        (self.block as f32 / self.sample_rate as f32) * 1000.0
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop ticking and wait for the engine to shut down
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.running.store(false, Ordering::Release);
            if thread.join().is_err() {
                log::error!("Audio ticker thread panicked");
            }
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
