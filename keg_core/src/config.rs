//! Configuration file support for kegflow.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/kegflow/config.toml`.
//! Every field has a default, so a partial file (or none at all) is fine.
//!
//! ```toml
//! [data]
//! data_dir = "/var/lib/kegflow"
//!
//! [monitor]
//! poll_interval_ms = 250
//! grace_interval_ms = 4000
//!
//! [[taps]]
//! id = 1
//! line = "gpio:4"
//!
//! [[taps]]
//! id = 2
//! line = "sim"
//! pulses_per_unit = 450.0
//! ```

use crate::calibration::CalibrationStore;
use crate::delivery::RetryPolicy;
use crate::journal::Journal;
use crate::ledger::FileLedger;
use crate::meter::FlowMeterSettings;
use crate::pulse::Debounce;
use crate::segment::SegmentSettings;
use crate::system::{SystemSettings, TapConfig};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub delivery: DeliveryConfig,

    #[serde(default)]
    pub hardware: HardwareConfig,

    #[serde(default = "default_taps")]
    pub taps: Vec<TapConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            monitor: MonitorConfig::default(),
            delivery: DeliveryConfig::default(),
            hardware: HardwareConfig::default(),
            taps: default_taps(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

/// Polling, rate and segmentation parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,

    #[serde(default = "default_grace_interval_ms")]
    pub grace_interval_ms: u64,

    /// Litres per minute that must be exceeded to count as a pour
    #[serde(default)]
    pub rate_threshold: f64,

    #[serde(default = "default_debounce_us")]
    pub debounce_us: u64,

    /// When set, the debounce interval is derived from the meter's rated
    /// maximum pulse frequency instead of `debounce_us`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pulse_hz: Option<f64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            rate_window_ms: default_rate_window_ms(),
            grace_interval_ms: default_grace_interval_ms(),
            rate_threshold: 0.0,
            debounce_us: default_debounce_us(),
            max_pulse_hz: None,
        }
    }
}

/// Ledger delivery retry parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// GPIO access
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,

    /// How often sysfs lines are sampled for edges
    #[serde(default = "default_sample_interval_us")]
    pub sample_interval_us: u64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            gpio_root: default_gpio_root(),
            sample_interval_us: default_sample_interval_us(),
        }
    }
}

// Default value functions
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kegflow")
}

fn default_taps() -> Vec<TapConfig> {
    // BCM pins used by the reference wiring for taps 1-4
    [(1, 4), (2, 17), (3, 27), (4, 22)]
        .into_iter()
        .map(|(id, pin)| TapConfig {
            id,
            line: format!("gpio:{}", pin),
            pulses_per_unit: None,
        })
        .collect()
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_rate_window_ms() -> u64 {
    1000
}

fn default_grace_interval_ms() -> u64 {
    4000
}

fn default_debounce_us() -> u64 {
    1000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_gpio_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

fn default_sample_interval_us() -> u64 {
    500
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kegflow")
            .join("config.toml")
    }

    /// Save the current configuration to the default path
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_config_path())
    }

    /// Save the current configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject configurations that cannot be monitored
    pub fn validate(&self) -> Result<()> {
        if self.monitor.poll_interval_ms == 0 {
            return Err(Error::Config("poll_interval_ms must be non-zero".into()));
        }
        if self.monitor.rate_window_ms == 0 {
            return Err(Error::Config("rate_window_ms must be non-zero".into()));
        }
        if !(self.monitor.rate_threshold.is_finite() && self.monitor.rate_threshold >= 0.0) {
            return Err(Error::Config(format!(
                "rate_threshold must be >= 0, got {}",
                self.monitor.rate_threshold
            )));
        }
        if self.hardware.sample_interval_us == 0 {
            return Err(Error::Config("sample_interval_us must be non-zero".into()));
        }

        let mut ids = HashSet::new();
        let mut lines = HashSet::new();
        for tap in &self.taps {
            if !ids.insert(tap.id) {
                return Err(Error::Config(format!("tap {} configured twice", tap.id)));
            }
            if !lines.insert(tap.line.trim()) {
                return Err(Error::Config(format!(
                    "line '{}' assigned to more than one tap",
                    tap.line
                )));
            }
            if let Some(ppu) = tap.pulses_per_unit {
                if !(ppu.is_finite() && ppu > 0.0) {
                    return Err(Error::Config(format!(
                        "tap {} pulses_per_unit must be positive, got {}",
                        tap.id, ppu
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a configured tap
    pub fn tap(&self, id: u32) -> Result<&TapConfig> {
        self.taps
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| Error::Config(format!("tap {} is not configured", id)))
    }

    pub fn paths(&self) -> DataPaths {
        DataPaths::new(&self.data.data_dir)
    }

    pub fn debounce(&self) -> Result<Debounce> {
        match self.monitor.max_pulse_hz {
            Some(hz) => Debounce::from_max_frequency(hz, 2.0),
            None => Ok(Debounce::new(Duration::from_micros(self.monitor.debounce_us))),
        }
    }

    pub fn meter_settings(&self) -> Result<FlowMeterSettings> {
        Ok(FlowMeterSettings {
            debounce: self.debounce()?,
            rate_window: Duration::from_millis(self.monitor.rate_window_ms),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.delivery.max_attempts,
            initial_backoff: Duration::from_millis(self.delivery.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.delivery.max_backoff_ms),
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_micros(self.hardware.sample_interval_us)
    }

    /// Settings for a background-polling [`crate::MultiTapFlowSystem`]
    pub fn system_settings(&self) -> Result<SystemSettings> {
        Ok(SystemSettings {
            poll_interval: Duration::from_millis(self.monitor.poll_interval_ms),
            meter: self.meter_settings()?,
            segment: SegmentSettings {
                rate_threshold: self.monitor.rate_threshold,
                grace_interval: Duration::from_millis(self.monitor.grace_interval_ms),
            },
            retry: self.retry_policy(),
            background_polling: true,
        })
    }
}

/// Locations of everything kept under the data directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn calibration_dir(&self) -> PathBuf {
        self.root.join("calibration")
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.root.join("ledger")
    }

    pub fn undelivered_path(&self) -> PathBuf {
        self.root.join("undelivered.jsonl")
    }

    pub fn calibration_store(&self) -> CalibrationStore {
        CalibrationStore::new(self.calibration_dir())
    }

    pub fn ledger(&self) -> FileLedger {
        FileLedger::new(self.ledger_dir())
    }

    pub fn undelivered_journal(&self) -> Journal {
        Journal::new(self.undelivered_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.taps.len(), 4);
        assert_eq!(config.taps[1].line, "gpio:17");
        assert_eq!(config.monitor.poll_interval_ms, 250);
        assert_eq!(config.monitor.grace_interval_ms, 4000);
        assert_eq!(config.delivery.max_attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let mut config = Config::default();
        config.taps[0].pulses_per_unit = Some(450.0);
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.taps, config.taps);
        assert_eq!(parsed.monitor.rate_window_ms, config.monitor.rate_window_ms);
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
[monitor]
grace_interval_ms = 2500

[[taps]]
id = 1
line = "sim"
pulses_per_unit = 450.0
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.monitor.grace_interval_ms, 2500);
        assert_eq!(config.monitor.poll_interval_ms, 250); // default
        assert_eq!(config.taps.len(), 1);
        assert_eq!(config.taps[0].pulses_per_unit, Some(450.0));

        let settings = config.system_settings().unwrap();
        assert_eq!(settings.segment.grace_interval, Duration::from_millis(2500));
        assert_eq!(settings.meter.debounce.min_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut config = Config::default();
        config.taps[1].id = 1;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = Config::default();
        config.taps[2].line = "gpio:4".into();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_constant() {
        let mut config = Config::default();
        config.taps[0].pulses_per_unit = Some(0.0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_max_pulse_hz_overrides_debounce() {
        let mut config = Config::default();
        config.monitor.max_pulse_hz = Some(100.0);
        // 100 Hz with a 2x margin -> 5ms
        assert_eq!(config.debounce().unwrap().min_interval(), Duration::from_millis(5));
    }

    #[test]
    fn test_data_paths() {
        let paths = DataPaths::new("/data");
        assert_eq!(paths.calibration_dir(), PathBuf::from("/data/calibration"));
        assert_eq!(paths.ledger_dir(), PathBuf::from("/data/ledger"));
        assert_eq!(paths.undelivered_path(), PathBuf::from("/data/undelivered.jsonl"));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.data.data_dir = temp_dir.path().join("data");
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.data.data_dir, config.data.data_dir);
    }
}
