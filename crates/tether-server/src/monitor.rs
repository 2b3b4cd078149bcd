//! Runtime lag watchdog.
//!
//! Sleeps for a fixed tick and compares wall clock against the deadline; a
//! starved runtime overshoots. Spawned at most once per process.

use std::sync::Once;
use std::time::{Duration, Instant};

use tracing::warn;

const TICK: Duration = Duration::from_millis(500);
const WARN_THRESHOLD: Duration = Duration::from_millis(100);

static MONITOR: Once = Once::new();

pub(crate) fn spawn_event_loop_monitor() {
    MONITOR.call_once(|| {
        tokio::spawn(async {
            loop {
                let before = Instant::now();
                tokio::time::sleep(TICK).await;
                let lag = before.elapsed().saturating_sub(TICK);
                if lag > WARN_THRESHOLD {
                    warn!(lag_ms = lag.as_millis() as u64, "event loop is lagging");
                }
            }
        });
    });
}
