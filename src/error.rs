use thiserror::Error;

use crate::types::Channel;

/// PDR core error types
#[derive(Error, Debug)]
pub enum PdrError {
    /// Intake cannot produce unified samples; the session halts.
    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Stale sensor: {channel} silent for {silent_ms} ms")]
    StaleSensor { channel: Channel, silent_ms: u64 },

    #[error("Calibration failed: {steps} steps detected in window (need {required})")]
    CalibrationInsufficientMotion { steps: usize, required: usize },

    #[error("Numerical instability: {0}")]
    NumericalInstability(String),

    #[error("Late sample: t={t_ns} precedes last consumed t={last_ns}")]
    LateSample { t_ns: u64, last_ns: u64 },

    #[error("Duplicate platform step: total_steps={total_steps} after {last_total}")]
    PlatformStepDuplicate { total_steps: u64, last_total: u64 },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Corrupt calibration record: {0}")]
    CorruptCalibration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PdrError {
    /// Structural errors bubble to the caller; everything else is absorbed by the core.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            PdrError::SensorUnavailable(_)
                | PdrError::StaleSensor { .. }
                | PdrError::ConfigInvalid(_)
                | PdrError::InvalidState(_)
                | PdrError::Io(_)
                | PdrError::Json(_)
        )
    }
}

/// Result type for core operations
pub type PdrResult<T> = Result<T, PdrError>;
