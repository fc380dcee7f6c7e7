//! Debounced pulse counting for a single signal line.
//!
//! A [`PulseCounter`] is written from the line's callback context and read
//! by the polling loop, so every field sits behind one mutex and is updated
//! together.

use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Minimum spacing between counted transitions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Debounce {
    min_interval: Duration,
}

impl Debounce {
    /// 1 ms, enough to reject contact bounce on hall-effect meters
    pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(1);

    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval }
    }

    /// Derive the interval from the meter's maximum rated pulse frequency.
    ///
    /// `margin` > 1 leaves headroom above the rated frequency, so the
    /// interval is `1 / (max_hz * margin)`.
    pub fn from_max_frequency(max_hz: f64, margin: f64) -> Result<Self> {
        if !(max_hz.is_finite() && max_hz > 0.0) {
            return Err(Error::Config(format!(
                "max pulse frequency must be positive, got {}",
                max_hz
            )));
        }
        if !(margin.is_finite() && margin >= 1.0) {
            return Err(Error::Config(format!(
                "debounce margin must be >= 1.0, got {}",
                margin
            )));
        }
        Ok(Self::new(Duration::from_secs_f64(1.0 / (max_hz * margin))))
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MIN_INTERVAL)
    }
}

/// Point-in-time copy of a counter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PulseSnapshot {
    pub count: u64,
    pub last_pulse: Option<Instant>,
}

#[derive(Debug, Default)]
struct CounterState {
    count: u64,
    last_accepted: Option<Instant>,
    /// Accepted pulse times no older than `retention`
    recent: VecDeque<Instant>,
}

/// Monotonic, debounced pulse counter for one line
#[derive(Debug)]
pub struct PulseCounter {
    debounce: Debounce,
    retention: Duration,
    state: Mutex<CounterState>,
}

impl PulseCounter {
    /// Create a counter that keeps accepted pulse times for `retention`
    /// (the longest rate window any reader will ask about).
    pub fn new(debounce: Debounce, retention: Duration) -> Self {
        Self {
            debounce,
            retention,
            state: Mutex::new(CounterState::default()),
        }
    }

    // The state is only ever replaced field by field under the lock, so a
    // panic elsewhere cannot leave it inconsistent.
    fn lock(&self) -> MutexGuard<'_, CounterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a raw transition observed now
    pub fn on_transition(&self) -> bool {
        self.on_transition_at(Instant::now())
    }

    /// Record a raw transition observed at `at`.
    ///
    /// Returns whether the transition was counted. Transitions closer than
    /// the debounce interval to the last counted one are discarded.
    pub fn on_transition_at(&self, at: Instant) -> bool {
        let mut state = self.lock();

        if let Some(last) = state.last_accepted {
            // An earlier timestamp saturates to zero and is dropped as bounce
            if at.saturating_duration_since(last) < self.debounce.min_interval() {
                return false;
            }
        }

        state.count += 1;
        state.last_accepted = Some(at);
        state.recent.push_back(at);

        if let Some(cutoff) = at.checked_sub(self.retention) {
            while state.recent.front().is_some_and(|t| *t <= cutoff) {
                state.recent.pop_front();
            }
        }

        true
    }

    /// Total accepted pulses
    pub fn count(&self) -> u64 {
        self.lock().count
    }

    /// Timestamp of the last accepted pulse
    pub fn last_pulse(&self) -> Option<Instant> {
        self.lock().last_accepted
    }

    pub fn snapshot(&self) -> PulseSnapshot {
        let state = self.lock();
        PulseSnapshot {
            count: state.count,
            last_pulse: state.last_accepted,
        }
    }

    /// Accepted pulses in the half-open window `(now - window, now]`
    pub fn pulses_within(&self, window: Duration, now: Instant) -> u64 {
        let state = self.lock();
        let cutoff = now.checked_sub(window);
        state
            .recent
            .iter()
            .filter(|t| **t <= now && cutoff.map_or(true, |c| **t > c))
            .count() as u64
    }

    /// Zero the counter. Only used on an explicit monitoring restart.
    pub fn reset(&self) {
        *self.lock() = CounterState::default();
    }

    pub fn debounce(&self) -> Debounce {
        self.debounce
    }
}
