//! Cooperative stop and pause flags shared between a run and its controller.
//!
//! Cancellation is coarse: the pipeline checks the flags once per file, while
//! waiting in pause, and during the delay between files. A request in flight
//! always completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// How often a paused run re-checks its flags.
pub const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(500);

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Cloneable handle to the flags of one run.
#[derive(Debug, Clone)]
pub struct RunControl {
    running: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    /// Creates flags for a run that is running and not paused.
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            paused: Arc::new(AtomicBool::new(false)),
            poll_interval: PAUSE_POLL_INTERVAL,
        }
    }

    /// Overrides the pause polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Requests the run to stop before its next file.
    pub fn stop(&self) {
        debug!("Stop requested");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Suspends the run before its next file.
    pub fn pause(&self) {
        self.set_paused(true);
    }

    /// Resumes a paused run.
    pub fn resume(&self) {
        self.set_paused(false);
    }

    /// Sets the pause flag.
    pub fn set_paused(&self, paused: bool) {
        debug!(paused, "Pause flag changed");
        self.paused.store(paused, Ordering::SeqCst);
    }

    /// Returns false once a stop was requested.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns true while paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Blocks while paused. Returns false if a stop arrives, before or during the pause.
    #[must_use]
    pub fn wait_while_paused(&self) -> bool {
        while self.is_paused() {
            if !self.is_running() {
                return false;
            }
            thread::sleep(self.poll_interval);
        }
        self.is_running()
    }

    /// Sleeps for `duration` in short slices. Returns false early on stop.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> bool {
        // An unrepresentable deadline waits until stopped.
        let deadline = Instant::now().checked_add(duration);
        loop {
            if !self.is_running() {
                return false;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    SLEEP_SLICE.min(deadline - now)
                }
                None => SLEEP_SLICE,
            };
            thread::sleep(slice);
        }
    }
}
