//! Core domain types for the kegflow system.
//!
//! This module defines the value types shared across the crate:
//! - Calibration profiles
//! - Pour reports handed to the ledger
//! - Kegs and pour history entries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tap position identifier (1-based, as printed on the tap handle)
pub type TapId = u32;

// ============================================================================
// Calibration
// ============================================================================

/// Calibration constant for one tap's meter.
///
/// Profiles are never mutated: a new calibration run produces a new profile
/// with a higher `version` that replaces the stored one.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CalibrationProfile {
    pub tap: TapId,
    /// Pulses produced per litre
    pub pulses_per_unit: f64,
    pub captured_at: DateTime<Utc>,
    #[serde(default = "default_profile_version")]
    pub version: u32,
    /// Raw measurement the constant was derived from
    #[serde(default)]
    pub pulses_counted: u64,
    #[serde(default)]
    pub reference_volume: f64,
}

fn default_profile_version() -> u32 {
    1
}

// ============================================================================
// Pour reporting
// ============================================================================

/// One closed pour segment, as delivered to the ledger.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PourReport {
    /// Stable across delivery attempts; the ledger books each id once
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub tap: TapId,
    /// Net volume in litres, always > 0 for emitted reports
    pub volume: f64,
    pub pulses: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

/// Ledger acknowledgement of a recorded pour
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PourReceipt {
    pub keg_id: u32,
    pub volume_remaining: f64,
}

/// A report that exhausted its delivery attempts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UndeliveredPour {
    pub report: PourReport,
    pub attempts: u32,
    pub last_error: String,
    pub dropped_at: DateTime<Utc>,
}

// ============================================================================
// Kegs and pour history
// ============================================================================

/// Lifecycle of a keg
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KegStatus {
    Untapped,
    Tapped,
    OffTap,
}

impl KegStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KegStatus::Untapped => "untapped",
            KegStatus::Tapped => "tapped",
            KegStatus::OffTap => "off_tap",
        }
    }
}

/// A keg tracked by the ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Keg {
    pub id: u32,
    pub name: String,
    pub style: String,
    pub abv: f64,
    /// Litres left
    pub volume_remaining: f64,
    pub original_volume: f64,
    pub status: KegStatus,
    pub tap_position: Option<TapId>,
    pub date_created: DateTime<Utc>,
    pub date_last_tapped: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
}

impl Keg {
    /// Below 10% of the starting volume
    pub fn is_low(&self) -> bool {
        self.original_volume > 0.0 && self.volume_remaining < 0.1 * self.original_volume
    }
}

/// Input for adding a keg
#[derive(Clone, Debug)]
pub struct NewKeg {
    pub name: String,
    pub style: String,
    pub abv: f64,
    pub volume: f64,
}

/// Where a pour entry came from
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PourSource {
    FlowMeter,
    Manual,
}

/// One line of pour history
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PourEvent {
    pub id: Uuid,
    pub keg_id: u32,
    pub tap: Option<TapId>,
    pub volume: f64,
    pub poured_at: DateTime<Utc>,
    pub source: PourSource,
}

/// Litres to US fluid ounces, used for display only
pub fn litres_to_ounces(litres: f64) -> f64 {
    litres * 33.814
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_defaults_for_older_files() {
        let json = r#"{"tap":2,"pulses_per_unit":450.0,"captured_at":"2024-05-01T12:00:00Z"}"#;
        let profile: CalibrationProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.tap, 2);
        assert_eq!(profile.version, 1);
        assert_eq!(profile.pulses_counted, 0);
    }

    #[test]
    fn test_low_volume_flag() {
        let mut keg = Keg {
            id: 1,
            name: "Pils".into(),
            style: "Pilsner".into(),
            abv: 4.8,
            volume_remaining: 19.0,
            original_volume: 19.0,
            status: KegStatus::Tapped,
            tap_position: Some(1),
            date_created: Utc::now(),
            date_last_tapped: None,
            date_finished: None,
        };
        assert!(!keg.is_low());
        keg.volume_remaining = 1.5;
        assert!(keg.is_low());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&KegStatus::OffTap).unwrap();
        assert_eq!(json, "\"off_tap\"");
    }
}
