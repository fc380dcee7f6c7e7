//! Meter calibration: measuring pulses for a known volume and persisting
//! the resulting constant per tap.
//!
//! Profiles live at `<dir>/tap_<id>.json`. A new calibration replaces the
//! stored profile wholesale with the next version number.

use crate::meter::FlowMeter;
use crate::store::{load_json, save_json};
use crate::{CalibrationProfile, Error, Result, TapId};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Compute pulses per litre from a measurement
pub fn compute_pulses_per_unit(pulses: u64, reference_volume: f64) -> Result<f64> {
    if !(reference_volume.is_finite() && reference_volume > 0.0) {
        return Err(Error::Calibration(format!(
            "reference volume must be positive, got {}",
            reference_volume
        )));
    }
    if pulses == 0 {
        return Err(Error::Calibration(
            "no pulses counted; check the meter is connected and liquid flowed".into(),
        ));
    }
    Ok(pulses as f64 / reference_volume)
}

/// Per-tap profile storage
#[derive(Clone, Debug)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tap: TapId) -> PathBuf {
        self.dir.join(format!("tap_{}.json", tap))
    }

    /// Load the profile for a tap, if one was ever saved
    pub fn load(&self, tap: TapId) -> Result<Option<CalibrationProfile>> {
        let path = self.path_for(tap);
        let profile: Option<CalibrationProfile> = load_json(&path)?;
        match profile {
            Some(profile) => {
                if profile.tap != tap {
                    return Err(Error::Config(format!(
                        "{:?} holds a profile for tap {}, expected tap {}",
                        path, profile.tap, tap
                    )));
                }
                if !(profile.pulses_per_unit.is_finite() && profile.pulses_per_unit > 0.0) {
                    return Err(Error::Config(format!(
                        "stored calibration for tap {} is not positive: {}",
                        tap, profile.pulses_per_unit
                    )));
                }
                tracing::info!(
                    "Loaded calibration v{} for tap {}: {:.2} pulses/L",
                    profile.version,
                    tap,
                    profile.pulses_per_unit
                );
                Ok(Some(profile))
            }
            None => {
                tracing::debug!("No calibration stored for tap {}", tap);
                Ok(None)
            }
        }
    }

    /// Persist a profile, replacing any previous one for the tap
    pub fn save(&self, profile: &CalibrationProfile) -> Result<()> {
        save_json(&self.path_for(profile.tap), profile)?;
        tracing::info!(
            "Saved calibration v{} for tap {} ({:.2} pulses/L)",
            profile.version,
            profile.tap,
            profile.pulses_per_unit
        );
        Ok(())
    }

    /// All stored profiles, ordered by tap
    pub fn list(&self) -> Result<Vec<CalibrationProfile>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut profiles = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let is_profile = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("tap_") && n.ends_with(".json"));
            if !is_profile {
                continue;
            }
            match load_json::<CalibrationProfile>(&path) {
                Ok(Some(profile)) => profiles.push(profile),
                Ok(None) => {}
                Err(e) => tracing::warn!("Skipping unreadable profile {:?}: {}", path, e),
            }
        }
        profiles.sort_by_key(|p| p.tap);
        Ok(profiles)
    }

    /// Build the next profile version for a tap from a measurement
    pub fn next_profile(
        &self,
        tap: TapId,
        pulses: u64,
        reference_volume: f64,
        captured_at: DateTime<Utc>,
    ) -> Result<CalibrationProfile> {
        let pulses_per_unit = compute_pulses_per_unit(pulses, reference_volume)?;
        // An unreadable previous profile does not block recalibration
        let version = match self.load(tap) {
            Ok(Some(previous)) => previous.version + 1,
            Ok(None) => 1,
            Err(e) => {
                tracing::warn!("Replacing unreadable calibration for tap {}: {}", tap, e);
                1
            }
        };
        Ok(CalibrationProfile {
            tap,
            pulses_per_unit,
            captured_at,
            version,
            pulses_counted: pulses,
            reference_volume,
        })
    }
}

/// Runs measurement sessions and persists the results
#[derive(Clone, Debug)]
pub struct CalibrationTool {
    store: CalibrationStore,
}

impl CalibrationTool {
    pub fn new(store: CalibrationStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CalibrationStore {
        &self.store
    }

    /// Start counting on `meter`. The operator then pours the reference
    /// volume and calls [`CalibrationSession::finish`].
    pub fn begin<'a>(&'a self, meter: &'a mut FlowMeter) -> Result<CalibrationSession<'a>> {
        meter.start_monitoring()?;
        let start_pulses = meter.pulse_count();
        tracing::info!(
            "Calibration started for tap {} at {} pulses",
            meter.tap(),
            start_pulses
        );
        Ok(CalibrationSession {
            tool: self,
            meter,
            start_pulses,
        })
    }
}

/// One in-progress measurement
pub struct CalibrationSession<'a> {
    tool: &'a CalibrationTool,
    meter: &'a mut FlowMeter,
    start_pulses: u64,
}

impl CalibrationSession<'_> {
    /// Pulses counted since the session began
    pub fn pulses(&self) -> u64 {
        self.meter.pulse_count().saturating_sub(self.start_pulses)
    }

    /// Stop counting, compute the constant and persist it.
    /// Nothing is written when this fails.
    pub fn finish(self, reference_volume: f64) -> Result<CalibrationProfile> {
        self.meter.stop_monitoring();
        let pulses = self.pulses();
        let tap = self.meter.tap();

        let profile = self
            .tool
            .store
            .next_profile(tap, pulses, reference_volume, Utc::now())
            .map_err(|e| {
                tracing::warn!("Calibration for tap {} failed: {}", tap, e);
                e
            })?;
        self.tool.store.save(&profile)?;
        Ok(profile)
    }

    /// Stop counting without saving anything
    pub fn abort(self) {
        self.meter.stop_monitoring();
        tracing::info!("Calibration for tap {} aborted", self.meter.tap());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::{SimulatedLine, SimulatedTrigger};
    use crate::meter::FlowMeterSettings;
    use std::time::{Duration, Instant};

    fn meter(tap: TapId, pulses_per_unit: f64) -> (FlowMeter, SimulatedTrigger) {
        let (line, trigger) = SimulatedLine::new(format!("sim-{}", tap));
        let meter = FlowMeter::new(
            tap,
            Box::new(line),
            pulses_per_unit,
            FlowMeterSettings::default(),
        )
        .unwrap();
        (meter, trigger)
    }

    #[test]
    fn test_compute_constant() {
        assert_eq!(compute_pulses_per_unit(225, 0.5).unwrap(), 450.0);
        assert!(matches!(
            compute_pulses_per_unit(0, 0.5),
            Err(Error::Calibration(_))
        ));
        assert!(matches!(
            compute_pulses_per_unit(100, 0.0),
            Err(Error::Calibration(_))
        ));
        assert!(matches!(
            compute_pulses_per_unit(100, -1.0),
            Err(Error::Calibration(_))
        ));
    }

    #[test]
    fn test_session_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tool = CalibrationTool::new(CalibrationStore::new(temp_dir.path()));

        // Provisional constant only matters for display during calibration
        let (mut provisional, trigger) = meter(1, 1.0);
        let session = tool.begin(&mut provisional).unwrap();
        trigger.burst(240, Instant::now(), Duration::from_millis(3));
        assert_eq!(session.pulses(), 240);
        let profile = session.finish(0.5).unwrap();

        assert_eq!(profile.pulses_per_unit, 480.0);
        assert_eq!(profile.version, 1);
        assert_eq!(tool.store().load(1).unwrap(), Some(profile.clone()));

        // Feeding the same pulse count through a meter built from the
        // profile reports the reference volume.
        let (line, trigger) = SimulatedLine::new("sim-check");
        let mut calibrated =
            FlowMeter::from_profile(&profile, Box::new(line), FlowMeterSettings::default())
                .unwrap();
        calibrated.start_monitoring().unwrap();
        trigger.burst(240, Instant::now(), Duration::from_millis(3));
        assert!((calibrated.volume() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_zero_pulses_persists_nothing() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tool = CalibrationTool::new(CalibrationStore::new(temp_dir.path()));
        let (mut provisional, _trigger) = meter(2, 1.0);

        let session = tool.begin(&mut provisional).unwrap();
        let err = session.finish(0.5).unwrap_err();
        assert!(matches!(err, Error::Calibration(_)));
        assert!(!tool.store().path_for(2).exists());
        assert!(!provisional.is_monitoring());
    }

    #[test]
    fn test_bad_reference_volume_keeps_previous_profile() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(temp_dir.path());
        let first = store.next_profile(3, 450, 1.0, Utc::now()).unwrap();
        store.save(&first).unwrap();

        let tool = CalibrationTool::new(store);
        let (mut provisional, trigger) = meter(3, 1.0);
        let session = tool.begin(&mut provisional).unwrap();
        trigger.burst(100, Instant::now(), Duration::from_millis(3));
        assert!(session.finish(0.0).is_err());

        assert_eq!(tool.store().load(3).unwrap(), Some(first));
    }

    #[test]
    fn test_recalibration_replaces_with_new_version() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(temp_dir.path());

        let first = store.next_profile(1, 450, 1.0, Utc::now()).unwrap();
        store.save(&first).unwrap();
        let second = store.next_profile(1, 500, 1.0, Utc::now()).unwrap();
        store.save(&second).unwrap();

        let loaded = store.load(1).unwrap().unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.pulses_per_unit, 500.0);
    }

    #[test]
    fn test_list_profiles_sorted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(temp_dir.path());
        for tap in [3, 1, 2] {
            let profile = store.next_profile(tap, 450, 1.0, Utc::now()).unwrap();
            store.save(&profile).unwrap();
        }
        std::fs::write(temp_dir.path().join("notes.txt"), "ignore me").unwrap();

        let taps: Vec<TapId> = store.list().unwrap().iter().map(|p| p.tap).collect();
        assert_eq!(taps, vec![1, 2, 3]);
    }

    #[test]
    fn test_stored_non_positive_constant_is_config_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CalibrationStore::new(temp_dir.path());
        std::fs::write(
            store.path_for(4),
            r#"{"tap":4,"pulses_per_unit":0.0,"captured_at":"2024-05-01T12:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(store.load(4), Err(Error::Config(_))));
    }
}
