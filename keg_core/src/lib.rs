#![forbid(unsafe_code)]

//! Core library for kegflow: flow-meter pulse counting, calibration, pour
//! segmentation and delivery of pours to the keg ledger.
//!
//! This crate provides:
//! - Debounced pulse counting and signal line bindings
//! - Flow meters (pulses to litres, flow rate)
//! - Calibration sessions and per-tap profile storage
//! - Multi-tap monitoring with per-tap pour segmentation
//! - Report delivery with retry and an undelivered journal
//! - A file-backed keg ledger with pour history and CSV export

pub mod types;
pub mod error;
pub mod config;
pub mod logging;
pub mod journal;
pub mod store;
pub mod pulse;
pub mod line;
pub mod meter;
pub mod calibration;
pub mod segment;
pub mod delivery;
pub mod system;
pub mod ledger;
pub mod export;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use config::{Config, DataPaths};
pub use calibration::{CalibrationSession, CalibrationStore, CalibrationTool};
pub use delivery::{PourLedger, ReportDispatcher, RetryPolicy};
pub use ledger::FileLedger;
pub use line::{DefaultLineProvider, LineProvider, PulseLine, SimulatedLines};
pub use meter::{FlowMeter, FlowMeterSettings};
pub use pulse::{Debounce, PulseCounter};
pub use system::{MultiTapFlowSystem, SystemSettings, TapConfig, TapStatus};
