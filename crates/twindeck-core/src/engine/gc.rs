//! RT-safe deferred deallocation for track buffers
//!
//! Decoded tracks are wrapped in `basedrop::Shared`. When the audio thread
//! drops the last reference (a deck is reloaded or unloaded), the pointer is
//! only enqueued; the memory is freed later by the reclaimer thread, so a
//! multi-megabyte `free` never lands inside an audio callback.
//!
//! The collector is owned by an explicit [`Reclaimer`] value rather than a
//! process-wide static, so each engine instance constructs and tears down its
//! own collection thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use basedrop::{Collector, Handle};

/// How often the collector thread sweeps deferred drops
const COLLECT_INTERVAL: Duration = Duration::from_millis(100);

/// Owner of the basedrop collector thread
pub struct Reclaimer {
    handle: Handle,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Reclaimer {
    /// Spawn the collector thread and wait for its handle
    pub fn start() -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name("audio-gc".to_string())
            .spawn(move || {
                // Collector is !Sync, so it lives and dies on this thread
                let mut collector = Collector::new();
                if tx.send(collector.handle()).is_err() {
                    return;
                }
                log::info!("Audio reclaimer thread started");

                while thread_running.load(Ordering::Acquire) {
                    collector.collect();
                    thread::park_timeout(COLLECT_INTERVAL);
                }

                collector.collect();
                log::info!("Audio reclaimer thread stopped");
            })?;

        let handle = rx.recv().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                "reclaimer thread exited before handing out its handle",
            )
        })?;

        Ok(Self {
            handle,
            running,
            thread: Some(thread),
        })
    }

    /// Handle for wrapping values in `basedrop::Shared`
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Stop the collector thread after one final sweep
    pub fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            self.running.store(false, Ordering::Release);
            thread.thread().unpark();
            if thread.join().is_err() {
                log::warn!("Audio reclaimer thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
