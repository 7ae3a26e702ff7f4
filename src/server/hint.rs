use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Deserialize;

/// When the server should shed idle pooled memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryHintOptions {
    /// Live connection count at which the hint fires; 0 disables it.
    pub threshold: usize,
    /// Minimum time between two hints, in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for MemoryHintOptions {
    fn default() -> Self {
        Self {
            threshold: 1000,
            cooldown_ms: 30_000,
        }
    }
}

/// Debounced advisory signal that the live set is large.
///
/// Fires at most once per cooldown window. Correctness never depends on it.
#[derive(Debug)]
pub struct MemoryHint {
    threshold: usize,
    cooldown: Duration,
    last_fired: Mutex<Option<Instant>>,
}

impl MemoryHint {
    pub fn new(options: MemoryHintOptions) -> Self {
        Self {
            threshold: options.threshold,
            cooldown: Duration::from_millis(options.cooldown_ms),
            last_fired: Mutex::new(None),
        }
    }

    /// Returns `true` if the hint should fire for `live` connections now.
    pub fn should_fire(&self, live: usize) -> bool {
        if self.threshold == 0 || live < self.threshold {
            return false;
        }

        let mut last = self.last_fired.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.cooldown => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_per_cooldown() {
        let hint = MemoryHint::new(MemoryHintOptions {
            threshold: 2,
            cooldown_ms: 60_000,
        });

        assert!(!hint.should_fire(1));
        assert!(hint.should_fire(2));
        assert!(!hint.should_fire(10));
    }

    #[test]
    fn zero_threshold_disables() {
        let hint = MemoryHint::new(MemoryHintOptions {
            threshold: 0,
            cooldown_ms: 0,
        });
        assert!(!hint.should_fire(usize::MAX));
    }

    #[test]
    fn zero_cooldown_always_fires() {
        let hint = MemoryHint::new(MemoryHintOptions {
            threshold: 1,
            cooldown_ms: 0,
        });
        assert!(hint.should_fire(1));
        assert!(hint.should_fire(1));
    }
}
