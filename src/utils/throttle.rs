//! Log throttling for hot audio paths
//!
//! The audio callback fires many times per second. When chunks are dropped
//! (session not connected, transport queue full) the same message would be
//! logged on every callback; the throttler lets one through per interval and
//! counts the rest.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Entry {
    last_logged: Instant,
    suppressed: u64,
}

/// Limits how often the same message kind is logged
pub struct LogThrottler {
    entries: Mutex<HashMap<&'static str, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `Some(suppressed)` when the message for `key` should be logged now,
    /// where `suppressed` is how many occurrences were swallowed since the last one.
    pub fn check(&self, key: &'static str) -> Option<u64> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last_logged) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                entry.last_logged = now;
                entry.suppressed = 0;
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}
