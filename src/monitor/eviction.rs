//! Background sweep of the dedup window.
//!
//! Every `(address, activity)` pair ever seen leaves a timestamp behind. Once
//! an entry is older than the longest cooldown it can no longer suppress
//! anything, so a dedicated thread wakes on a configurable interval and drops
//! those entries while the capture thread keeps processing packets.

use crate::monitor::engine::Engine;
use crate::monitor::types::ShutdownFlag;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Spawns the background eviction thread.
///
/// The thread wakes every `interval` seconds, sweeps the dedup map and goes
/// back to sleep. It exits when `shutdown` is set to `true`.
pub fn spawn_eviction_thread(
    engine:   Arc<Engine>,
    interval: u64,
    shutdown: ShutdownFlag,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let sleep_dur = Duration::from_secs(interval.max(1));

        loop {
            // Sleep in short increments so shutdown is noticed promptly
            // rather than after the full interval.
            let mut slept = Duration::ZERO;
            while slept < sleep_dur {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                thread::sleep(Duration::from_millis(200));
                slept += Duration::from_millis(200);
            }

            engine.evict_stale(Instant::now());
        }
    })
}
