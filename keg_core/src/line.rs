//! Signal line bindings ("notify on pulse").
//!
//! A [`PulseLine`] calls a notifier once per raw transition. The flow meter
//! neither knows nor cares whether the transitions come from a GPIO pin, a
//! simulation thread or a test.
//!
//! Line identifiers accepted by [`DefaultLineProvider`]:
//! - `gpio:<n>` or `<n>`: Linux sysfs GPIO pin, sampled for rising edges
//! - `sim`: free-running simulation, 10 Hz for 2 s of every 5 s
//! - `sim:<hz>:<on_ms>:<period_ms>`: custom simulation pattern

use crate::{Error, Result, TapId};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Callback invoked once per raw transition
pub type PulseNotify = Arc<dyn Fn(Instant) + Send + Sync>;

/// A bindable source of transitions
pub trait PulseLine: Send {
    fn line_id(&self) -> &str;

    /// Start delivering transitions to `notify`
    fn bind(&mut self, notify: PulseNotify) -> Result<()>;

    /// Stop delivering transitions. Safe to call when unbound.
    fn unbind(&mut self);

    /// Release any underlying resource. Safe to call repeatedly.
    fn release(&mut self) {
        self.unbind();
    }
}

/// Opens lines by identifier for a given tap
pub trait LineProvider {
    fn open(&self, tap: TapId, line: &str) -> Result<Box<dyn PulseLine>>;
}

fn unavailable(tap: TapId, line: &str, reason: impl Into<String>) -> Error {
    Error::HardwareUnavailable {
        tap,
        line: line.to_string(),
        reason: reason.into(),
    }
}

// ============================================================================
// Test-driven simulated line
// ============================================================================

type SharedNotify = Arc<Mutex<Option<PulseNotify>>>;

/// Line driven by a [`SimulatedTrigger`]
pub struct SimulatedLine {
    id: String,
    notify: SharedNotify,
}

/// Handle that injects transitions into a [`SimulatedLine`].
///
/// Transitions injected while the line is unbound are lost, like a real
/// pin with no interrupt handler attached.
#[derive(Clone)]
pub struct SimulatedTrigger {
    notify: SharedNotify,
}

impl SimulatedLine {
    pub fn new(id: impl Into<String>) -> (Self, SimulatedTrigger) {
        let notify: SharedNotify = Arc::new(Mutex::new(None));
        (
            Self {
                id: id.into(),
                notify: notify.clone(),
            },
            SimulatedTrigger { notify },
        )
    }
}

impl PulseLine for SimulatedLine {
    fn line_id(&self) -> &str {
        &self.id
    }

    fn bind(&mut self, notify: PulseNotify) -> Result<()> {
        *self.notify.lock().unwrap_or_else(PoisonError::into_inner) = Some(notify);
        Ok(())
    }

    fn unbind(&mut self) {
        *self.notify.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl SimulatedTrigger {
    /// Inject one transition at `at`
    pub fn pulse_at(&self, at: Instant) {
        let notify = self
            .notify
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(notify) = notify {
            notify(at);
        }
    }

    pub fn pulse(&self) {
        self.pulse_at(Instant::now());
    }

    /// Inject `count` transitions starting at `start`, `spacing` apart.
    /// Returns the time of the last one.
    pub fn burst(&self, count: u64, start: Instant, spacing: Duration) -> Instant {
        let mut at = start;
        for i in 0..count {
            at = start + spacing * i as u32;
            self.pulse_at(at);
        }
        at
    }

    pub fn is_bound(&self) -> bool {
        self.notify
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Provider handing out [`SimulatedLine`]s and keeping their triggers.
#[derive(Default)]
pub struct SimulatedLines {
    triggers: Mutex<HashMap<String, SimulatedTrigger>>,
    unavailable: HashSet<String>,
}

impl SimulatedLines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make opening `line` fail with `HardwareUnavailable`
    pub fn with_unavailable(mut self, line: impl Into<String>) -> Self {
        self.unavailable.insert(line.into());
        self
    }

    /// Trigger for a previously opened line
    pub fn trigger(&self, line: &str) -> Option<SimulatedTrigger> {
        self.triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(line)
            .cloned()
    }
}

impl LineProvider for SimulatedLines {
    fn open(&self, tap: TapId, line: &str) -> Result<Box<dyn PulseLine>> {
        if self.unavailable.contains(line) {
            return Err(unavailable(tap, line, "line marked unavailable"));
        }
        let (sim, trigger) = SimulatedLine::new(line);
        self.triggers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(line.to_string(), trigger);
        Ok(Box::new(sim))
    }
}

// ============================================================================
// Background-thread lines
// ============================================================================

/// A running sampler or generator thread
struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl Worker {
    fn spawn(name: String, body: impl FnOnce(Arc<AtomicBool>) + Send + 'static) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new().name(name).spawn(move || body(flag))?;
        Ok(Self { stop, handle })
    }

    fn halt(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            tracing::warn!("Line worker thread panicked");
        }
    }
}

/// Pulse pattern for a generated line
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FlowPattern {
    pub frequency_hz: f64,
    pub on: Duration,
    pub period: Duration,
}

impl Default for FlowPattern {
    fn default() -> Self {
        Self {
            frequency_hz: 10.0,
            on: Duration::from_secs(2),
            period: Duration::from_secs(5),
        }
    }
}

/// Simulation mode line: emits pulses at `frequency_hz` during the first
/// `on` of every `period`.
pub struct GeneratedLine {
    id: String,
    pattern: FlowPattern,
    worker: Option<Worker>,
}

impl GeneratedLine {
    pub fn new(id: impl Into<String>, pattern: FlowPattern) -> Self {
        Self {
            id: id.into(),
            pattern,
            worker: None,
        }
    }
}

impl PulseLine for GeneratedLine {
    fn line_id(&self) -> &str {
        &self.id
    }

    fn bind(&mut self, notify: PulseNotify) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let pattern = self.pattern;
        let tick = Duration::from_secs_f64(1.0 / pattern.frequency_hz);
        self.worker = Some(Worker::spawn(format!("sim-{}", self.id), move |stop| {
            let origin = Instant::now();
            while !stop.load(Ordering::Relaxed) {
                let now = Instant::now();
                let phase = now.duration_since(origin).as_nanos() % pattern.period.as_nanos();
                if phase < pattern.on.as_nanos() {
                    notify(now);
                }
                thread::sleep(tick);
            }
        })?);
        tracing::info!("Started flow simulation on line {}", self.id);
        Ok(())
    }

    fn unbind(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.halt();
            tracing::info!("Stopped flow simulation on line {}", self.id);
        }
    }
}

impl Drop for GeneratedLine {
    fn drop(&mut self) {
        self.unbind();
    }
}

/// Linux sysfs GPIO input, sampled for rising edges.
///
/// The pin must already be exported (`/sys/class/gpio/gpio<n>/value`
/// readable); binding fails with `HardwareUnavailable` otherwise.
pub struct SysfsLine {
    id: String,
    tap: TapId,
    value_path: PathBuf,
    sample_interval: Duration,
    worker: Option<Worker>,
}

impl SysfsLine {
    pub fn new(
        tap: TapId,
        id: impl Into<String>,
        gpio_root: &std::path::Path,
        pin: u32,
        sample_interval: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            tap,
            value_path: gpio_root.join(format!("gpio{}", pin)).join("value"),
            sample_interval,
            worker: None,
        }
    }
}

fn read_level(path: &std::path::Path) -> std::io::Result<bool> {
    let raw = std::fs::read_to_string(path)?;
    Ok(raw.trim() == "1")
}

impl PulseLine for SysfsLine {
    fn line_id(&self) -> &str {
        &self.id
    }

    fn bind(&mut self, notify: PulseNotify) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let initial = read_level(&self.value_path).map_err(|e| {
            unavailable(
                self.tap,
                &self.id,
                format!("cannot read {}: {}", self.value_path.display(), e),
            )
        })?;

        let path = self.value_path.clone();
        let interval = self.sample_interval;
        let id = self.id.clone();
        self.worker = Some(Worker::spawn(format!("gpio-{}", self.id), move |stop| {
            let mut previous = initial;
            while !stop.load(Ordering::Relaxed) {
                match read_level(&path) {
                    Ok(level) => {
                        if level && !previous {
                            notify(Instant::now());
                        }
                        previous = level;
                    }
                    Err(e) => {
                        tracing::warn!("Lost GPIO line {}: {}", id, e);
                        break;
                    }
                }
                thread::sleep(interval);
            }
        })?);
        tracing::info!("GPIO line {} bound ({:?})", self.id, self.value_path);
        Ok(())
    }

    fn unbind(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.halt();
            tracing::info!("GPIO line {} unbound", self.id);
        }
    }
}

impl Drop for SysfsLine {
    fn drop(&mut self) {
        self.unbind();
    }
}

// ============================================================================
// Line identifiers
// ============================================================================

/// Parsed form of a configured line identifier
#[derive(Clone, Debug, PartialEq)]
pub enum LineSpec {
    Gpio(u32),
    Simulated(FlowPattern),
}

impl LineSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let bad = |why: &str| Error::Config(format!("invalid line '{}': {}", raw, why));

        if let Some(pin) = raw.strip_prefix("gpio:") {
            return pin
                .parse()
                .map(LineSpec::Gpio)
                .map_err(|_| bad("expected gpio:<pin>"));
        }
        if let Ok(pin) = raw.parse::<u32>() {
            return Ok(LineSpec::Gpio(pin));
        }
        if raw == "sim" {
            return Ok(LineSpec::Simulated(FlowPattern::default()));
        }
        if let Some(rest) = raw.strip_prefix("sim:") {
            let parts: Vec<&str> = rest.split(':').collect();
            if parts.len() != 3 {
                return Err(bad("expected sim:<hz>:<on_ms>:<period_ms>"));
            }
            let frequency_hz: f64 = parts[0].parse().map_err(|_| bad("bad frequency"))?;
            let on_ms: u64 = parts[1].parse().map_err(|_| bad("bad on time"))?;
            let period_ms: u64 = parts[2].parse().map_err(|_| bad("bad period"))?;
            if !(frequency_hz.is_finite() && frequency_hz > 0.0) || period_ms == 0 || on_ms > period_ms
            {
                return Err(bad("need hz > 0 and 0 <= on_ms <= period_ms, period_ms > 0"));
            }
            return Ok(LineSpec::Simulated(FlowPattern {
                frequency_hz,
                on: Duration::from_millis(on_ms),
                period: Duration::from_millis(period_ms),
            }));
        }
        Err(bad("unknown line kind"))
    }
}

/// Provider used by the host process: sysfs GPIO or simulation
pub struct DefaultLineProvider {
    gpio_root: PathBuf,
    sample_interval: Duration,
}

impl DefaultLineProvider {
    pub fn new(gpio_root: impl Into<PathBuf>, sample_interval: Duration) -> Self {
        Self {
            gpio_root: gpio_root.into(),
            sample_interval,
        }
    }
}

impl LineProvider for DefaultLineProvider {
    fn open(&self, tap: TapId, line: &str) -> Result<Box<dyn PulseLine>> {
        match LineSpec::parse(line)? {
            LineSpec::Gpio(pin) => {
                let line = SysfsLine::new(tap, line, &self.gpio_root, pin, self.sample_interval);
                if !line.value_path.exists() {
                    return Err(unavailable(
                        tap,
                        &line.id,
                        format!("{} not found (pin not exported?)", line.value_path.display()),
                    ));
                }
                Ok(Box::new(line))
            }
            LineSpec::Simulated(pattern) => Ok(Box::new(GeneratedLine::new(line, pattern))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn counting_notify() -> (PulseNotify, Arc<AtomicU64>) {
        let hits = Arc::new(AtomicU64::new(0));
        let counter = hits.clone();
        let notify: PulseNotify = Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (notify, hits)
    }

    #[test]
    fn test_parse_line_specs() {
        assert_eq!(LineSpec::parse("gpio:17").unwrap(), LineSpec::Gpio(17));
        assert_eq!(LineSpec::parse("4").unwrap(), LineSpec::Gpio(4));
        assert_eq!(
            LineSpec::parse("sim").unwrap(),
            LineSpec::Simulated(FlowPattern::default())
        );
        assert_eq!(
            LineSpec::parse("sim:50:1000:1000").unwrap(),
            LineSpec::Simulated(FlowPattern {
                frequency_hz: 50.0,
                on: Duration::from_secs(1),
                period: Duration::from_secs(1),
            })
        );
        assert!(matches!(LineSpec::parse("gpio:x"), Err(Error::Config(_))));
        assert!(matches!(LineSpec::parse("sim:0:1:1"), Err(Error::Config(_))));
        assert!(matches!(LineSpec::parse("serial0"), Err(Error::Config(_))));
    }

    #[test]
    fn test_simulated_trigger_only_fires_when_bound() {
        let (mut line, trigger) = SimulatedLine::new("t1");
        let (notify, hits) = counting_notify();

        trigger.pulse();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        line.bind(notify).unwrap();
        assert!(trigger.is_bound());
        trigger.burst(3, Instant::now(), Duration::from_millis(2));
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        line.unbind();
        trigger.pulse();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_provider_marks_unavailable_lines() {
        let lines = SimulatedLines::new().with_unavailable("gpio:17");
        assert!(lines.open(1, "gpio:4").is_ok());
        assert!(lines.trigger("gpio:4").is_some());
        let err = lines.open(2, "gpio:17").err().unwrap();
        assert!(err.is_hardware_unavailable());
    }

    #[test]
    fn test_missing_gpio_is_unavailable() {
        let temp_dir = tempfile::tempdir().unwrap();
        let provider = DefaultLineProvider::new(temp_dir.path(), Duration::from_micros(250));
        let err = provider.open(3, "gpio:27").err().unwrap();
        assert!(err.is_hardware_unavailable());
    }

    #[test]
    fn test_sysfs_line_detects_rising_edges() {
        let temp_dir = tempfile::tempdir().unwrap();
        let pin_dir = temp_dir.path().join("gpio22");
        std::fs::create_dir_all(&pin_dir).unwrap();
        let value = pin_dir.join("value");
        // rename so the sampler never sees a half-written file
        let set_level = |level: &str| {
            let staged = pin_dir.join("value.next");
            std::fs::write(&staged, level).unwrap();
            std::fs::rename(&staged, &value).unwrap();
        };
        set_level("0\n");

        let provider = DefaultLineProvider::new(temp_dir.path(), Duration::from_millis(1));
        let mut line = provider.open(4, "gpio:22").unwrap();
        let (notify, hits) = counting_notify();
        line.bind(notify).unwrap();

        for _ in 0..3 {
            set_level("1\n");
            thread::sleep(Duration::from_millis(40));
            set_level("0\n");
            thread::sleep(Duration::from_millis(40));
        }
        line.release();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_generated_line_emits_pulses() {
        let mut line = GeneratedLine::new(
            "sim",
            FlowPattern {
                frequency_hz: 200.0,
                on: Duration::from_secs(1),
                period: Duration::from_secs(1),
            },
        );
        let (notify, hits) = counting_notify();
        line.bind(notify).unwrap();
        thread::sleep(Duration::from_millis(100));
        line.release();
        let seen = hits.load(Ordering::SeqCst);
        assert!(seen > 0);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), seen);
    }
}
