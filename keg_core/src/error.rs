//! Error types for the keg_core library.

use crate::TapId;
use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for keg_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Invalid or missing calibration constant, bad tap/line mapping.
    /// Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Calibration run could not produce a usable constant
    #[error("Calibration error: {0}")]
    Calibration(String),

    /// The physical line for a tap could not be bound
    #[error("Hardware unavailable for tap {tap} on line '{line}': {reason}")]
    HardwareUnavailable {
        tap: TapId,
        line: String,
        reason: String,
    },

    /// A pour report was rejected by the ledger or the ledger was unreachable
    #[error("Ledger delivery error: {0}")]
    LedgerDelivery(String),

    /// Invalid keg operation against the file ledger
    #[error("Ledger error: {0}")]
    Ledger(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error only affects a single tap's hardware binding
    pub fn is_hardware_unavailable(&self) -> bool {
        matches!(self, Error::HardwareUnavailable { .. })
    }
}
