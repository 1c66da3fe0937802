//! Named one-shot timers on the engine runtime.
//!
//! Starting a timer under a key that is already armed replaces it. Each timer owns a
//! child of the service's cancellation token so [`TimerService::shutdown`] disarms
//! everything at once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Key of the control channel keep-alive response timer.
pub const CONTROL_KEEP_ALIVE: &str = "control-keep-alive";

struct Armed {
    generation: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Timers {
    next_generation: u64,
    armed: HashMap<&'static str, Armed>,
}

/// One-shot timer registry shared by the engine components.
#[derive(Clone)]
pub struct TimerService {
    handle: Handle,
    root: CancellationToken,
    timers: Arc<Mutex<Timers>>,
}

impl TimerService {
    pub fn new(handle: Handle) -> Self {
        Self { handle, root: CancellationToken::new(), timers: Arc::new(Mutex::new(Timers::default())) }
    }

    /// Arms `key`, replacing any timer already armed under it.
    ///
    /// `on_timeout` runs on a runtime worker once `delay` elapses, unless the timer
    /// is cancelled or replaced first.
    pub fn start<F>(&self, key: &'static str, delay: Duration, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = self.root.child_token();
        let generation = {
            let mut timers = self.timers.lock();
            timers.next_generation += 1;
            let generation = timers.next_generation;
            if let Some(previous) = timers.armed.insert(key, Armed { generation, cancel: cancel.clone() }) {
                previous.cancel.cancel();
            }
            generation
        };
        debug!(key, ?delay, "Timer started");

        let timers = Arc::clone(&self.timers);
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!(key, "Timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    let fired = {
                        let mut timers = timers.lock();
                        match timers.armed.get(key) {
                            Some(armed) if armed.generation == generation => {
                                timers.armed.remove(key);
                                true
                            }
                            _ => false,
                        }
                    };
                    if fired {
                        debug!(key, "Timer expired");
                        on_timeout();
                    }
                }
            }
        });
    }

    /// Disarms `key`. Returns whether a timer was armed.
    pub fn cancel(&self, key: &str) -> bool {
        match self.timers.lock().armed.remove(key) {
            Some(armed) => {
                armed.cancel.cancel();
                debug!(key, "Timer stopped");
                true
            }
            None => {
                trace!(key, "No timer to stop");
                false
            }
        }
    }

    pub fn is_armed(&self, key: &str) -> bool {
        self.timers.lock().armed.contains_key(key)
    }

    /// Disarms every timer.
    pub fn shutdown(&self) {
        self.root.cancel();
        self.timers.lock().armed.clear();
    }
}

impl std::fmt::Debug for TimerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&'static str> = self.timers.lock().armed.keys().copied().collect();
        f.debug_struct("TimerService").field("armed", &keys).finish()
    }
}
