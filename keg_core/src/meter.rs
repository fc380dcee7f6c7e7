//! Flow meter: pulse counting plus pulse-to-volume conversion.

use crate::line::{PulseLine, PulseNotify};
use crate::pulse::{Debounce, PulseCounter};
use crate::{CalibrationProfile, Error, Result, TapId};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Tuning shared by every meter in a system
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlowMeterSettings {
    pub debounce: Debounce,
    /// Trailing window used for the flow rate
    pub rate_window: Duration,
}

impl Default for FlowMeterSettings {
    fn default() -> Self {
        Self {
            debounce: Debounce::default(),
            rate_window: Duration::from_secs(1),
        }
    }
}

/// Convert a pulse count to litres
pub fn pulses_to_volume(pulses: u64, pulses_per_unit: f64) -> Result<f64> {
    validate_constant(pulses_per_unit)?;
    Ok(pulses as f64 / pulses_per_unit)
}

fn validate_constant(pulses_per_unit: f64) -> Result<()> {
    if pulses_per_unit.is_finite() && pulses_per_unit > 0.0 {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "calibration constant must be positive, got {}",
            pulses_per_unit
        )))
    }
}

/// Diagnostic reading of one meter
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MeterReading {
    pub tap: TapId,
    pub pulse_count: u64,
    /// Litres since monitoring started
    pub volume: f64,
    /// Litres per minute over the trailing window
    pub flow_rate: f64,
    pub last_pulse: Option<Instant>,
    pub monitoring: bool,
}

/// One tap's meter
pub struct FlowMeter {
    tap: TapId,
    pulses_per_unit: f64,
    rate_window: Duration,
    counter: Arc<PulseCounter>,
    line: Box<dyn PulseLine>,
    monitoring: bool,
    released: bool,
}

impl FlowMeter {
    /// Build a meter with a fixed calibration constant (pulses per litre)
    pub fn new(
        tap: TapId,
        line: Box<dyn PulseLine>,
        pulses_per_unit: f64,
        settings: FlowMeterSettings,
    ) -> Result<Self> {
        validate_constant(pulses_per_unit)?;
        if settings.rate_window.is_zero() {
            return Err(Error::Config("flow rate window must be non-zero".into()));
        }
        Ok(Self {
            tap,
            pulses_per_unit,
            rate_window: settings.rate_window,
            counter: Arc::new(PulseCounter::new(settings.debounce, settings.rate_window)),
            line,
            monitoring: false,
            released: false,
        })
    }

    /// Build a meter from a stored calibration profile
    pub fn from_profile(
        profile: &CalibrationProfile,
        line: Box<dyn PulseLine>,
        settings: FlowMeterSettings,
    ) -> Result<Self> {
        Self::new(profile.tap, line, profile.pulses_per_unit, settings)
    }

    pub fn tap(&self) -> TapId {
        self.tap
    }

    pub fn line_id(&self) -> &str {
        self.line.line_id()
    }

    pub fn pulses_per_unit(&self) -> f64 {
        self.pulses_per_unit
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    /// Bind the line and start counting. No-op when already monitoring.
    pub fn start_monitoring(&mut self) -> Result<()> {
        if self.monitoring {
            tracing::debug!("Tap {} already monitoring", self.tap);
            return Ok(());
        }
        if self.released {
            return Err(Error::HardwareUnavailable {
                tap: self.tap,
                line: self.line.line_id().to_string(),
                reason: "line already released".into(),
            });
        }

        let counter = self.counter.clone();
        let notify: PulseNotify = Arc::new(move |at| {
            counter.on_transition_at(at);
        });
        self.line.bind(notify)?;
        self.monitoring = true;

        tracing::info!(
            "Started monitoring tap {} on line {} ({:.1} pulses/L)",
            self.tap,
            self.line.line_id(),
            self.pulses_per_unit
        );
        Ok(())
    }

    /// Detach from the line; later transitions are not counted
    pub fn stop_monitoring(&mut self) {
        if !self.monitoring {
            return;
        }
        self.line.unbind();
        self.monitoring = false;
        tracing::info!("Stopped monitoring tap {}", self.tap);
    }

    /// Zero the counter and start again
    pub fn restart_monitoring(&mut self) -> Result<()> {
        self.stop_monitoring();
        self.counter.reset();
        tracing::info!("Reset counter for tap {}", self.tap);
        self.start_monitoring()
    }

    /// Release the line. Safe to call repeatedly and after stop.
    pub fn cleanup(&mut self) {
        self.stop_monitoring();
        if !self.released {
            self.line.release();
            self.released = true;
            tracing::debug!("Released line for tap {}", self.tap);
        }
    }

    pub fn pulse_count(&self) -> u64 {
        self.counter.count()
    }

    /// Litres since monitoring started
    pub fn volume(&self) -> f64 {
        self.pulses_to_volume(self.counter.count())
    }

    /// Convert with this meter's constant (validated at construction)
    pub fn pulses_to_volume(&self, pulses: u64) -> f64 {
        pulses as f64 / self.pulses_per_unit
    }

    pub fn flow_rate(&self) -> f64 {
        self.flow_rate_at(Instant::now())
    }

    /// Litres per minute over `(now - window, now]`; zero when idle
    pub fn flow_rate_at(&self, now: Instant) -> f64 {
        let pulses = self.counter.pulses_within(self.rate_window, now);
        if pulses == 0 {
            return 0.0;
        }
        pulses as f64 / self.rate_window.as_secs_f64() / self.pulses_per_unit * 60.0
    }

    pub fn reading_at(&self, now: Instant) -> MeterReading {
        let snapshot = self.counter.snapshot();
        MeterReading {
            tap: self.tap,
            pulse_count: snapshot.count,
            volume: self.pulses_to_volume(snapshot.count),
            flow_rate: self.flow_rate_at(now),
            last_pulse: snapshot.last_pulse,
            monitoring: self.monitoring,
        }
    }

    pub fn counter(&self) -> &Arc<PulseCounter> {
        &self.counter
    }
}

impl Drop for FlowMeter {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for FlowMeter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowMeter")
            .field("tap", &self.tap)
            .field("line", &self.line.line_id())
            .field("pulses_per_unit", &self.pulses_per_unit)
            .field("monitoring", &self.monitoring)
            .finish()
    }
}
