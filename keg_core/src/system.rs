//! Multi-tap monitoring.
//!
//! [`MultiTapFlowSystem`] owns one [`FlowMeter`] and one [`PourSegmenter`]
//! per configured tap. A poller thread samples every meter at a fixed
//! interval, feeds the segmenters, and hands each closed, non-empty segment
//! to the [`ReportDispatcher`] as one [`PourReport`]. Meter readings are
//! never rolled back when delivery fails.
//!
//! Tests drive time by hand through [`MultiTapFlowSystem::poll_at`] and
//! [`MultiTapFlowSystem::stop_all_at`] with background polling disabled.

use crate::calibration::CalibrationStore;
use crate::delivery::{DeliveryCounts, DeliveryStats, PourLedger, ReportDispatcher, RetryPolicy};
use crate::journal::Journal;
use crate::line::LineProvider;
use crate::meter::{FlowMeter, FlowMeterSettings};
use crate::segment::{ClosedSegment, PourSegmenter, SegmentSettings};
use crate::{Error, PourReport, Result, TapId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One `[[taps]]` entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TapConfig {
    pub id: TapId,
    /// Line identifier, e.g. `gpio:4` or `sim`
    pub line: String,
    /// Fixed constant; when absent the stored calibration is used
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pulses_per_unit: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SystemSettings {
    pub poll_interval: Duration,
    pub meter: FlowMeterSettings,
    pub segment: SegmentSettings,
    pub retry: RetryPolicy,
    /// Spawn the poller thread on `start_all`. Disabled in tests that call
    /// `poll_at` themselves.
    pub background_polling: bool,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            meter: FlowMeterSettings::default(),
            segment: SegmentSettings::default(),
            retry: RetryPolicy::default(),
            background_polling: true,
        }
    }
}

/// A tap left out of monitoring because its line could not be bound
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExcludedTap {
    pub tap: TapId,
    pub line: String,
    pub reason: String,
}

/// Per-tap diagnostic reading
#[derive(Clone, Debug, PartialEq)]
pub struct TapStatus {
    pub tap: TapId,
    pub line: String,
    pub pulses_per_unit: f64,
    pub pulse_count: u64,
    /// Litres since monitoring started
    pub volume: f64,
    /// Litres per minute
    pub flow_rate: f64,
    pub pouring: bool,
    pub monitoring: bool,
}

/// Maps poll instants to wall-clock time for reports
#[derive(Clone, Copy, Debug)]
struct WallClock {
    instant: Instant,
    wall: DateTime<Utc>,
}

impl WallClock {
    fn now() -> Self {
        Self {
            instant: Instant::now(),
            wall: Utc::now(),
        }
    }

    fn at(&self, at: Instant) -> DateTime<Utc> {
        let to_chrono = |d: Duration| chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero());
        match at.checked_duration_since(self.instant) {
            Some(ahead) => self.wall + to_chrono(ahead),
            None => self.wall - to_chrono(self.instant.saturating_duration_since(at)),
        }
    }
}

struct TapChannel {
    meter: FlowMeter,
    segmenter: PourSegmenter,
}

impl TapChannel {
    fn status_at(&self, now: Instant) -> TapStatus {
        let reading = self.meter.reading_at(now);
        TapStatus {
            tap: reading.tap,
            line: self.meter.line_id().to_string(),
            pulses_per_unit: self.meter.pulses_per_unit(),
            pulse_count: reading.pulse_count,
            volume: reading.volume,
            flow_rate: reading.flow_rate,
            pouring: self.segmenter.is_pouring(),
            monitoring: reading.monitoring,
        }
    }
}

/// Everything the poller touches
struct SystemState {
    channels: Vec<TapChannel>,
    dispatcher: Option<ReportDispatcher>,
    clock: WallClock,
}

impl SystemState {
    fn poll(&mut self, now: Instant) -> Vec<PourReport> {
        let clock = self.clock;
        let mut reports = Vec::new();
        for channel in &mut self.channels {
            let count = channel.meter.pulse_count();
            let rate = channel.meter.flow_rate_at(now);
            if let Some(segment) = channel.segmenter.observe(now, count, rate) {
                reports.extend(build_report(&channel.meter, &segment, &clock));
            }
        }

        match &self.dispatcher {
            Some(dispatcher) => {
                for report in &reports {
                    dispatcher.dispatch(report.clone());
                }
            }
            None if !reports.is_empty() => {
                tracing::warn!("{} pours closed while not running", reports.len());
            }
            None => {}
        }
        reports
    }
}

fn build_report(meter: &FlowMeter, segment: &ClosedSegment, clock: &WallClock) -> Option<PourReport> {
    if segment.is_empty() {
        tracing::debug!("Discarding empty segment on tap {}", segment.tap);
        return None;
    }
    let report = PourReport {
        id: Uuid::new_v4(),
        tap: segment.tap,
        volume: meter.pulses_to_volume(segment.pulses()),
        pulses: segment.pulses(),
        started_at: clock.at(segment.started_at),
        ended_at: clock.at(segment.last_flowing),
    };
    tracing::info!(
        "Pour finished on tap {}: {} pulses, {:.1}ml",
        report.tap,
        report.pulses,
        report.volume * 1000.0
    );
    Some(report)
}

fn lock(state: &Mutex<SystemState>) -> MutexGuard<'_, SystemState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Poller {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Poller {
    fn spawn(state: Arc<Mutex<SystemState>>, interval: Duration) -> Result<Self> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("tap-poller".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        lock(&state).poll(Instant::now());
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::error!("Tap poller panicked");
        }
    }
}

/// Coordinates every tap's meter, segmentation and reporting
pub struct MultiTapFlowSystem {
    state: Arc<Mutex<SystemState>>,
    settings: SystemSettings,
    ledger: Arc<dyn PourLedger>,
    undelivered: Option<Journal>,
    stats: Arc<DeliveryStats>,
    excluded: Vec<ExcludedTap>,
    poller: Option<Poller>,
    running: bool,
}

impl MultiTapFlowSystem {
    /// Build meters for every configured tap.
    ///
    /// A tap with neither a `pulses_per_unit` override nor a stored
    /// calibration, or an invalid tap list, is a fatal `Config` error. A tap
    /// whose line is unavailable is excluded and the rest continue.
    pub fn new(
        taps: &[TapConfig],
        calibration: Option<&CalibrationStore>,
        lines: &dyn LineProvider,
        ledger: Arc<dyn PourLedger>,
        settings: SystemSettings,
    ) -> Result<Self> {
        if settings.poll_interval.is_zero() {
            return Err(Error::Config("poll interval must be non-zero".into()));
        }

        let mut ids = HashSet::new();
        let mut line_ids = HashSet::new();
        for tap in taps {
            if !ids.insert(tap.id) {
                return Err(Error::Config(format!("tap {} configured twice", tap.id)));
            }
            if !line_ids.insert(tap.line.trim()) {
                return Err(Error::Config(format!(
                    "line '{}' assigned to more than one tap",
                    tap.line
                )));
            }
        }

        let mut channels = Vec::new();
        let mut excluded = Vec::new();
        for tap in taps {
            let pulses_per_unit = resolve_constant(tap, calibration)?;
            let line = match lines.open(tap.id, &tap.line) {
                Ok(line) => line,
                Err(Error::HardwareUnavailable { tap, line, reason }) => {
                    tracing::warn!("Excluding tap {} (line '{}'): {}", tap, line, reason);
                    excluded.push(ExcludedTap { tap, line, reason });
                    continue;
                }
                Err(e) => return Err(e),
            };
            let meter = FlowMeter::new(tap.id, line, pulses_per_unit, settings.meter)?;
            channels.push(TapChannel {
                meter,
                segmenter: PourSegmenter::new(tap.id, settings.segment, 0),
            });
        }

        tracing::info!(
            "Configured {} taps ({} excluded)",
            channels.len(),
            excluded.len()
        );

        Ok(Self {
            state: Arc::new(Mutex::new(SystemState {
                channels,
                dispatcher: None,
                clock: WallClock::now(),
            })),
            settings,
            ledger,
            undelivered: None,
            stats: Arc::new(DeliveryStats::default()),
            excluded,
            poller: None,
            running: false,
        })
    }

    /// Journal reports that exhaust their delivery attempts
    pub fn with_undelivered_journal(mut self, journal: Journal) -> Self {
        self.undelivered = Some(journal);
        self
    }

    pub fn settings(&self) -> &SystemSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Taps being monitored, in configuration order
    pub fn taps(&self) -> Vec<TapId> {
        lock(&self.state)
            .channels
            .iter()
            .map(|c| c.meter.tap())
            .collect()
    }

    pub fn excluded_taps(&self) -> &[ExcludedTap] {
        &self.excluded
    }

    pub fn delivery_stats(&self) -> DeliveryCounts {
        self.stats.counts()
    }

    /// Start every meter, the delivery worker and (unless disabled) the
    /// poller. No-op when already running.
    pub fn start_all(&mut self) -> Result<()> {
        if self.running {
            tracing::debug!("Flow system already running");
            return Ok(());
        }

        let dispatcher = ReportDispatcher::spawn(
            self.ledger.clone(),
            self.settings.retry,
            self.undelivered.clone(),
            self.stats.clone(),
        )?;

        let mut newly_excluded = Vec::new();
        let monitoring = {
            let mut state = lock(&self.state);
            state.channels.retain_mut(|channel| {
                let tap = channel.meter.tap();
                match channel.meter.start_monitoring() {
                    Ok(()) => {
                        // The pour baseline is wherever monitoring (re)starts
                        channel.segmenter.rebase(channel.meter.pulse_count());
                        true
                    }
                    Err(e) => {
                        tracing::warn!("Excluding tap {}: {}", tap, e);
                        newly_excluded.push(ExcludedTap {
                            tap,
                            line: channel.meter.line_id().to_string(),
                            reason: e.to_string(),
                        });
                        false
                    }
                }
            });
            state.dispatcher = Some(dispatcher);
            state.channels.len()
        };
        self.excluded.extend(newly_excluded);

        if monitoring == 0 {
            tracing::warn!("No taps available to monitor");
        }

        if self.settings.background_polling {
            self.poller = Some(Poller::spawn(self.state.clone(), self.settings.poll_interval)?);
        }
        self.running = true;
        tracing::info!(
            "Monitoring {} taps every {:?}",
            monitoring,
            self.settings.poll_interval
        );
        Ok(())
    }

    /// Run one poll as of `now`. Closed pours are dispatched and returned.
    pub fn poll_at(&self, now: Instant) -> Vec<PourReport> {
        lock(&self.state).poll(now)
    }

    pub fn stop_all(&mut self) -> Vec<PourReport> {
        self.stop_all_at(Instant::now())
    }

    /// Stop polling and counting, close every open pour as of `now`, and
    /// wait until the final reports have been delivered or journalled.
    /// No-op when not running.
    pub fn stop_all_at(&mut self, now: Instant) -> Vec<PourReport> {
        if !self.running {
            return Vec::new();
        }
        if let Some(poller) = self.poller.take() {
            poller.stop();
        }

        let (reports, dispatcher) = {
            let mut state = lock(&self.state);
            let clock = state.clock;
            let mut reports = Vec::new();
            for channel in &mut state.channels {
                channel.meter.stop_monitoring();
                let count = channel.meter.pulse_count();
                let rate = channel.meter.flow_rate_at(now);
                let closed = channel
                    .segmenter
                    .observe(now, count, rate)
                    .or_else(|| channel.segmenter.force_close(now, count));
                if let Some(segment) = closed {
                    reports.extend(build_report(&channel.meter, &segment, &clock));
                }
            }
            (reports, state.dispatcher.take())
        };

        if let Some(mut dispatcher) = dispatcher {
            for report in &reports {
                dispatcher.dispatch(report.clone());
            }
            dispatcher.shutdown();
        }

        self.running = false;
        let counts = self.stats.counts();
        tracing::info!(
            "Flow system stopped ({} delivered, {} retries, {} dropped)",
            counts.delivered,
            counts.retries,
            counts.dropped
        );
        reports
    }

    pub fn status(&self) -> Vec<TapStatus> {
        let now = Instant::now();
        lock(&self.state)
            .channels
            .iter()
            .map(|c| c.status_at(now))
            .collect()
    }

    pub fn tap_status(&self, tap: TapId) -> Option<TapStatus> {
        let now = Instant::now();
        lock(&self.state)
            .channels
            .iter()
            .find(|c| c.meter.tap() == tap)
            .map(|c| c.status_at(now))
    }
}

impl Drop for MultiTapFlowSystem {
    fn drop(&mut self) {
        self.stop_all();
    }
}

fn resolve_constant(tap: &TapConfig, calibration: Option<&CalibrationStore>) -> Result<f64> {
    if let Some(pulses_per_unit) = tap.pulses_per_unit {
        return Ok(pulses_per_unit);
    }
    let profile = match calibration {
        Some(store) => store.load(tap.id)?,
        None => None,
    };
    profile.map(|p| p.pulses_per_unit).ok_or_else(|| {
        Error::Config(format!(
            "tap {} has no calibration; run `kegflow calibrate --tap {}` or set pulses_per_unit",
            tap.id, tap.id
        ))
    })
}
