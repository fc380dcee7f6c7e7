//! Per-tap pour segmentation.
//!
//! ```text
//!            rate > threshold
//!   Idle ─────────────────────▶ Pouring ──┐ rate > threshold: refresh,
//!    ▲                            │  ▲    │ cancel any dip
//!    │  dip lasted >= grace       │  └────┘
//!    └────────────────────────────┘   rate <= threshold: start dip timer
//! ```
//!
//! The segment's start reading is the pulse count where the previous
//! segment closed (or where monitoring began), so pulses landing between
//! the last idle poll and the poll that sees the rising rate still belong
//! to the pour.

use crate::TapId;
use std::time::{Duration, Instant};

/// Thresholds for segmentation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SegmentSettings {
    /// Flow rate (L/min) that must be exceeded to count as flowing
    pub rate_threshold: f64,
    /// How long the rate may stay at or below threshold before the pour
    /// is closed
    pub grace_interval: Duration,
}

impl Default for SegmentSettings {
    fn default() -> Self {
        Self {
            rate_threshold: 0.0,
            grace_interval: Duration::from_secs(4),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OpenSegment {
    start_pulses: u64,
    started_at: Instant,
    last_flowing: Instant,
    dip_started: Option<Instant>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SegmentState {
    Idle,
    Pouring(OpenSegment),
}

/// A finished pour, in pulses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClosedSegment {
    pub tap: TapId,
    pub start_pulses: u64,
    pub end_pulses: u64,
    pub started_at: Instant,
    pub last_flowing: Instant,
    pub closed_at: Instant,
}

impl ClosedSegment {
    /// Pulses accumulated during the segment
    pub fn pulses(&self) -> u64 {
        self.end_pulses.saturating_sub(self.start_pulses)
    }

    pub fn is_empty(&self) -> bool {
        self.pulses() == 0
    }
}

/// Idle/Pouring state machine for one tap
#[derive(Debug)]
pub struct PourSegmenter {
    tap: TapId,
    settings: SegmentSettings,
    state: SegmentState,
    /// Pulse count at which the last segment closed
    baseline: u64,
}

impl PourSegmenter {
    pub fn new(tap: TapId, settings: SegmentSettings, baseline: u64) -> Self {
        Self {
            tap,
            settings,
            state: SegmentState::Idle,
            baseline,
        }
    }

    pub fn tap(&self) -> TapId {
        self.tap
    }

    pub fn is_pouring(&self) -> bool {
        matches!(self.state, SegmentState::Pouring(_))
    }

    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Restart from Idle at `baseline` (after a counter restart)
    pub fn rebase(&mut self, baseline: u64) {
        self.state = SegmentState::Idle;
        self.baseline = baseline;
    }

    /// Feed one poll sample. Returns the segment if this sample closed it.
    pub fn observe(&mut self, now: Instant, pulse_count: u64, flow_rate: f64) -> Option<ClosedSegment> {
        let flowing = flow_rate > self.settings.rate_threshold;

        match &mut self.state {
            SegmentState::Idle => {
                if flowing {
                    self.state = SegmentState::Pouring(OpenSegment {
                        start_pulses: self.baseline,
                        started_at: now,
                        last_flowing: now,
                        dip_started: None,
                    });
                    tracing::info!("Pour started on tap {} ({:.2} L/min)", self.tap, flow_rate);
                }
                None
            }
            SegmentState::Pouring(open) => {
                if flowing {
                    if open.dip_started.take().is_some() {
                        tracing::debug!("Flow resumed on tap {} within grace", self.tap);
                    }
                    open.last_flowing = now;
                    return None;
                }

                let dip_started = *open.dip_started.get_or_insert(now);
                if now.saturating_duration_since(dip_started) >= self.settings.grace_interval {
                    return Some(self.close(now, pulse_count));
                }
                None
            }
        }
    }

    /// Close an open segment regardless of flow (shutdown)
    pub fn force_close(&mut self, now: Instant, pulse_count: u64) -> Option<ClosedSegment> {
        if self.is_pouring() {
            tracing::info!("Force-closing pour on tap {}", self.tap);
            Some(self.close(now, pulse_count))
        } else {
            None
        }
    }

    fn close(&mut self, now: Instant, pulse_count: u64) -> ClosedSegment {
        let open = match std::mem::replace(&mut self.state, SegmentState::Idle) {
            SegmentState::Pouring(open) => open,
            SegmentState::Idle => OpenSegment {
                start_pulses: self.baseline,
                started_at: now,
                last_flowing: now,
                dip_started: None,
            },
        };
        // The count is monotonic, but never let a stale sample move the
        // baseline backwards.
        let end_pulses = pulse_count.max(open.start_pulses);
        self.baseline = end_pulses;

        ClosedSegment {
            tap: self.tap,
            start_pulses: open.start_pulses,
            end_pulses,
            started_at: open.started_at,
            last_flowing: open.last_flowing,
            closed_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter() -> PourSegmenter {
        PourSegmenter::new(
            1,
            SegmentSettings {
                rate_threshold: 0.0,
                grace_interval: Duration::from_secs(2),
            },
            0,
        )
    }

    fn at(base: Instant, ms: u64) -> Instant {
        base + Duration::from_millis(ms)
    }

    #[test]
    fn test_idle_stays_idle_without_flow() {
        let mut seg = segmenter();
        let base = Instant::now();
        for i in 0..10 {
            assert!(seg.observe(at(base, i * 250), 0, 0.0).is_none());
        }
        assert!(!seg.is_pouring());
    }

    #[test]
    fn test_single_pour_closes_after_grace() {
        let mut seg = segmenter();
        let base = Instant::now();

        assert!(seg.observe(at(base, 0), 100, 6.0).is_none());
        assert!(seg.is_pouring());
        assert!(seg.observe(at(base, 500), 400, 6.0).is_none());
        assert!(seg.observe(at(base, 1000), 900, 0.0).is_none());
        assert!(seg.observe(at(base, 2500), 900, 0.0).is_none());

        let closed = seg.observe(at(base, 3000), 900, 0.0).unwrap();
        assert_eq!(closed.start_pulses, 0);
        assert_eq!(closed.end_pulses, 900);
        assert_eq!(closed.pulses(), 900);
        assert_eq!(closed.last_flowing, at(base, 500));
        assert!(!seg.is_pouring());
        assert_eq!(seg.baseline(), 900);
    }

    #[test]
    fn test_dip_within_grace_keeps_one_segment() {
        let mut seg = segmenter();
        let base = Instant::now();

        seg.observe(at(base, 0), 50, 5.0);
        seg.observe(at(base, 1000), 300, 0.0);
        // resumes 1.5s into the dip
        assert!(seg.observe(at(base, 2500), 320, 4.0).is_none());
        seg.observe(at(base, 3000), 600, 5.0);
        seg.observe(at(base, 3500), 600, 0.0);
        // 1.9s of dip is not enough
        assert!(seg.observe(at(base, 5400), 600, 0.0).is_none());

        let closed = seg.observe(at(base, 5500), 600, 0.0).unwrap();
        assert_eq!(closed.pulses(), 600);
    }

    #[test]
    fn test_zero_pulse_blip_yields_empty_segment() {
        let mut seg = PourSegmenter::new(2, SegmentSettings::default(), 42);
        let base = Instant::now();
        seg.observe(at(base, 0), 42, 0.5);
        let closed = seg.observe(at(base, 4000), 42, 0.0);
        assert!(closed.is_none());
        let closed = seg.observe(at(base, 8000), 42, 0.0).unwrap();
        assert!(closed.is_empty());
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut seg = PourSegmenter::new(
            1,
            SegmentSettings {
                rate_threshold: 0.5,
                grace_interval: Duration::from_secs(1),
            },
            0,
        );
        assert!(seg.observe(Instant::now(), 10, 0.5).is_none());
        assert!(!seg.is_pouring());
    }

    #[test]
    fn test_force_close() {
        let mut seg = segmenter();
        let base = Instant::now();
        assert!(seg.force_close(base, 0).is_none());

        seg.observe(base, 100, 6.0);
        let closed = seg.force_close(at(base, 100), 100).unwrap();
        assert_eq!(closed.pulses(), 100);
        assert!(!seg.is_pouring());
        assert!(seg.force_close(at(base, 200), 100).is_none());
    }

    #[test]
    fn test_consecutive_pours_do_not_overlap() {
        let mut seg = segmenter();
        let base = Instant::now();

        seg.observe(at(base, 0), 10, 3.0);
        seg.observe(at(base, 1000), 200, 0.0);
        let first = seg.observe(at(base, 3000), 200, 0.0).unwrap();

        seg.observe(at(base, 4000), 260, 3.0);
        seg.observe(at(base, 5000), 500, 0.0);
        let second = seg.observe(at(base, 7000), 500, 0.0).unwrap();

        assert_eq!(first.pulses(), 200);
        assert_eq!(second.start_pulses, 200);
        assert_eq!(second.pulses(), 300);
    }
}
