//! In-process auto-close timers.
//!
//! At most one pending wake-up per round id. Timers are not persisted;
//! the engine rebuilds them from the round store at startup.

use parking_lot::Mutex; // short critical sections, no await while held
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Clone, Default)]
pub struct TimerScheduler {
    timers: Arc<Mutex<HashMap<i64, JoinHandle<()>>>>,
}

impl TimerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `on_elapsed` to run after `delay`, replacing any timer
    /// already armed for this round id.
    pub fn arm<F>(&self, round_id: i64, delay: Duration, on_elapsed: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let timers = Arc::clone(&self.timers);
        // Hold the map lock across spawn + insert: a near-zero delay could
        // otherwise fire and self-remove before its handle is in the map,
        // leaving a finished handle behind.
        let mut guard = self.timers.lock();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Drop our own handle first so a disarm racing the callback
            // cannot abort it mid-flight.
            timers.lock().remove(&round_id);
            on_elapsed.await;
        });

        if let Some(prev) = guard.insert(round_id, handle) {
            prev.abort();
            debug!(round_id, "replaced existing auto-close timer");
        }
    }

    /// Cancel a pending timer if present; no-op if absent or already fired.
    pub fn disarm(&self, round_id: i64) {
        if let Some(handle) = self.timers.lock().remove(&round_id) {
            handle.abort();
            debug!(round_id, "disarmed auto-close timer");
        }
    }

    pub fn armed_count(&self) -> usize {
        self.timers.lock().len()
    }
}
