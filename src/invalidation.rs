//! Cache-bus invalidation listener.
//!
//! Storage writes for a bot's actions arrive in bursts (multi-file sync),
//! so cache clearing is debounced on the leading edge: the first event of
//! a burst clears immediately, everything else inside the window is
//! dropped, and a new window only opens after the bus has been quiet for
//! the whole window. Any read after the leading clear is guaranteed fresh,
//! so a trailing clear would just repeat the same effect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::service::ActionService;

/// Suppression window after a leading-edge fire.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_secs(2);

/// Substring marking a cache-bus key as action-related (case-insensitive).
pub const INVALIDATION_KEY_MARKER: &str = "/actions";

/// Leading-edge debouncer.
///
/// Tracks the instant of the last observed event. An event fires iff the
/// bus has been quiet for at least the window; every event (fired or
/// suppressed) restarts the quiet period.
pub struct Debounce {
    window: Duration,
    last_event: Option<Instant>,
}

impl Debounce {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_event: None,
        }
    }

    /// Records an event at `now` and reports whether it fires.
    pub fn should_fire_at(&mut self, now: Instant) -> bool {
        let fire = match self.last_event {
            None => true,
            Some(previous) => now.duration_since(previous) >= self.window,
        };
        self.last_event = Some(now);
        fire
    }

    pub fn should_fire(&mut self) -> bool {
        self.should_fire_at(Instant::now())
    }
}

pub fn is_invalidation_key(key: &str) -> bool {
    key.to_lowercase().contains(INVALIDATION_KEY_MARKER)
}

/// Subscribes to the cache-bus invalidation channel and clears every bot
/// scope when an action-related key fires through the debouncer.
pub struct InvalidationListener;

impl InvalidationListener {
    pub fn spawn(
        service: Arc<ActionService>,
        mut events: broadcast::Receiver<String>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut debounce = Debounce::new(DEBOUNCE_WINDOW);
            loop {
                match events.recv().await {
                    Ok(key) => {
                        if !is_invalidation_key(&key) {
                            continue;
                        }
                        if debounce.should_fire() {
                            info!("Clearing action caches (key: {key})");
                            service.clear_all_scopes();
                        }
                    }
                    // Dropped events are at worst dropped clears within a
                    // burst; the leading clear already happened
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Invalidation listener lagged, {missed} events skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}
